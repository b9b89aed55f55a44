//! Signature orchestration: lenient hex intake, the version-gated
//! path-signing variants, and canonical 65-byte output.

use coins_bip32::path::DerivationPath;
use tracing::{debug, info};

use crate::commands;
use crate::constants::CASH_AID;
use crate::error::{Error, Result};
use crate::pairing::PairingStore;
use crate::session::{open_secure_channel, select_applet};
use crate::transport::{CardChannel, exchange};
use crate::types::{CardSignature, RecoverableSignature, SignScheme};

/// Decode a message hash from hex. A `0x` prefix is accepted and a trailing
/// unpaired nibble is dropped; these are defined behavior, not errors.
/// Anything that is not a hex digit is a configuration error.
pub fn decode_message_hash(input: &str) -> Result<Vec<u8>> {
    let digits = input
        .strip_prefix("0x")
        .or_else(|| input.strip_prefix("0X"))
        .unwrap_or(input);
    if !digits.is_ascii() {
        return Err(Error::InvalidHex("message hash is not hex"));
    }
    let even = &digits[..digits.len() - digits.len() % 2];
    hex::decode(even).map_err(|_| Error::InvalidHex("message hash is not hex"))
}

/// Decode the hash, run the supplied signing operation, and serialize the
/// result as `r || s || recovery id` in hex.
pub fn process_signature<F>(message_hash_hex: &str, sign_operation: F) -> Result<String>
where
    F: FnOnce(&[u8]) -> Result<CardSignature>,
{
    let hash = decode_message_hash(message_hash_hex)?;
    let card_signature = sign_operation(&hash)?;
    let recoverable = RecoverableSignature::from_card_signature(&hash, &card_signature)?;

    let signature = recoverable.to_hex();
    info!(hash = %hex::encode(&hash), signature = %signature, "signed hash");
    Ok(signature)
}

/// Sign with the card's current key (PIN-authenticated).
pub fn sign(
    channel: &mut dyn CardChannel,
    pairings: &PairingStore,
    pin: &str,
    message_hash_hex: &str,
) -> Result<String> {
    let identity = select_applet(channel)?;
    let session = open_secure_channel(channel, identity, pairings)?;
    let mut session = session.authenticate(pin)?;
    process_signature(message_hash_hex, |hash| session.sign_hash(hash))
}

/// Sign with the key at `path`.
///
/// Firmware below the sign-with-path threshold takes the derive-then-sign
/// route: two separate round trips, so a failure in between leaves the
/// card's current path changed. Newer firmware signs in one command without
/// touching the current path.
pub fn sign_with_path(
    channel: &mut dyn CardChannel,
    pairings: &PairingStore,
    pin: &str,
    path: &DerivationPath,
    message_hash_hex: &str,
) -> Result<String> {
    let identity = select_applet(channel)?;
    let session = open_secure_channel(channel, identity, pairings)?;
    let mut session = session.authenticate(pin)?;

    match session.profile().sign {
        SignScheme::DeriveThenSign => {
            let current = session.current_key_path()?;
            if !current.iter().eq(path.iter()) {
                debug!(path = %path.derivation_string(), "deriving before sign");
                session.derive_key(path)?;
            }
            process_signature(message_hash_hex, |hash| session.sign_hash(hash))
        }
        SignScheme::WithPath => {
            process_signature(message_hash_hex, |hash| {
                session.sign_hash_with_path(hash, path)
            })
        }
    }
}

/// Sign through the PIN-less applet: plain select, plain sign, no secure
/// channel and no PIN.
pub fn sign_pinless(channel: &mut dyn CardChannel, message_hash_hex: &str) -> Result<String> {
    let response = exchange(channel, &commands::select(CASH_AID))?;
    if !response.is_success() {
        return Err(Error::CardUnresponsive {
            sw: response.status(),
        });
    }

    process_signature(message_hash_hex, |hash| {
        let response = exchange(channel, &commands::card::sign(hash))?;
        if !response.is_success() {
            return Err(Error::from_status("SIGN", response.status()));
        }
        CardSignature::try_from(response.data())
    })
}
