//! Session establishment and the typed session state machine.
//!
//! A session moves `Unselected -> Selected -> SecureChannelOpen ->
//! Authenticated`, one way only: selection yields a [`CardIdentity`],
//! [`open_secure_channel`] turns it into a [`SecureSession`], and
//! [`SecureSession::authenticate`] consumes that into an
//! [`AuthenticatedSession`]. A failed transition drops the session; callers
//! restart from selection, there is no rollback.

use std::fmt;
use std::ops::{Deref, DerefMut};

use bytes::{Bytes, BytesMut};
use cipher::{Iv, Key};
use coins_bip32::path::DerivationPath;
use coins_bip39::{English, Wordlist};
use k256::SecretKey;
use rand::RngCore;
use tracing::{debug, warn};
use zeroize::Zeroize;

use crate::commands::{self, ExportOption};
use crate::constants::KEYCARD_AID;
use crate::crypto::{
    ApduMeta, CardScp, Challenge, apdu_mac, decrypt_apdu, ecdh_shared_secret, encrypt_apdu,
    session_keys,
};
use crate::error::{Error, Result};
use crate::pairing::{Pairing, PairingStore};
use crate::transport::{CardChannel, CardCommand, CardResponse, exchange};
use crate::types::{AppStatus, CardIdentity, CardSignature, Keypair, ProtocolProfile};

/// Select the primary applet and read the card identity. The identity is
/// always read fresh; a non-success status means the card is unresponsive.
pub fn select_applet(channel: &mut dyn CardChannel) -> Result<CardIdentity> {
    let response = exchange(channel, &commands::select(KEYCARD_AID))?;
    if !response.is_success() {
        return Err(Error::CardUnresponsive {
            sw: response.status(),
        });
    }

    let identity = CardIdentity::try_from(response.data())?;
    debug!(
        instance_uid = %identity.instance_uid_hex(),
        version = %identity.version,
        "applet selected"
    );
    Ok(identity)
}

/// Pair with a selected card using the pairing password: a two-stage
/// challenge/cryptogram exchange that ends with the card assigning a slot.
pub fn pair(channel: &mut dyn CardChannel, password: &str) -> Result<Pairing> {
    use sha2::{Digest, Sha256};

    debug!("starting pairing");
    let token = crate::crypto::pairing_token(password);

    let mut challenge = Challenge::default();
    rand::thread_rng().fill_bytes(&mut challenge);

    let response = exchange(channel, &commands::card::pair_first_stage(&challenge))?;
    if !response.is_success() {
        return Err(match response.status() {
            crate::constants::status::FILE_FULL => Error::NoPairingSlots,
            crate::constants::status::SECURITY_STATUS_NOT_SATISFIED => Error::PairingFailed,
            sw => Error::Status {
                command: "PAIR",
                sw,
            },
        });
    }
    let payload = response.data();
    if payload.len() != 64 {
        return Err(Error::InvalidData("PAIR first stage response length"));
    }

    let card_cryptogram = &payload[..32];
    let card_challenge = Challenge::from_slice(&payload[32..]);
    if card_cryptogram != crate::crypto::cryptogram(&token, &challenge).as_slice() {
        return Err(Error::PairingFailed);
    }

    let client_cryptogram = crate::crypto::cryptogram(&token, card_challenge);
    let response = exchange(channel, &commands::card::pair_final_stage(&client_cryptogram))?;
    if !response.is_success() {
        return Err(Error::PairingFailed);
    }
    let payload = response.data();
    if payload.len() != 33 {
        return Err(Error::InvalidData("PAIR final stage response length"));
    }

    let index = payload[0];
    let key: [u8; 32] = {
        let mut hasher = Sha256::new();
        hasher.update(token);
        hasher.update(&payload[1..]);
        hasher.finalize().into()
    };

    debug!(index, "pairing successful");
    Ok(Pairing { key, index })
}

#[derive(Zeroize)]
#[zeroize(drop)]
struct SessionKeys {
    enc: [u8; 32],
    mac: [u8; 32],
}

/// An open, mutually authenticated secure channel to the card. Commands sent
/// through it are AES-CBC encrypted and MAC-chained.
pub struct SecureSession<'c> {
    channel: &'c mut dyn CardChannel,
    identity: CardIdentity,
    profile: ProtocolProfile,
    keys: SessionKeys,
    iv: [u8; 16],
}

/// Open the secure channel for a previously selected card: look up and
/// decode the pairing, run the ECDH handshake and mutually authenticate.
pub fn open_secure_channel<'c>(
    channel: &'c mut dyn CardChannel,
    identity: CardIdentity,
    pairings: &PairingStore,
) -> Result<SecureSession<'c>> {
    let pairing = pairings.pairing_for(&identity.instance_uid_hex())?;
    let card_public = identity
        .public_key
        .ok_or(Error::InvalidData("Card has no secure channel key"))?;

    let host_secret = SecretKey::random(&mut rand::thread_rng());
    let open = commands::card::open_secure_channel(pairing.index, &host_secret.public_key());
    let response = exchange(channel, &open)?;
    if !response.is_success() {
        warn!(sw = %response.status(), "OPEN SECURE CHANNEL rejected");
        return Err(Error::AuthenticationFailed);
    }

    let payload = response.data();
    if payload.len() != 48 {
        return Err(Error::AuthenticationFailed);
    }

    let shared = ecdh_shared_secret(&host_secret, &card_public);
    let challenge = Challenge::from_slice(&payload[..32]);
    let (enc, mac) = session_keys(&shared, pairing.scp_key(), challenge);

    let profile = ProtocolProfile::from(identity.version);
    let mut session = SecureSession {
        channel,
        identity,
        profile,
        keys: SessionKeys {
            enc: enc.into(),
            mac: mac.into(),
        },
        iv: payload[32..48].try_into().expect("length checked"),
    };
    session.mutually_authenticate()?;
    Ok(session)
}

impl<'c> SecureSession<'c> {
    pub fn identity(&self) -> &CardIdentity {
        &self.identity
    }

    pub const fn profile(&self) -> ProtocolProfile {
        self.profile
    }

    fn mutually_authenticate(&mut self) -> Result<()> {
        let mut challenge = Challenge::default();
        rand::thread_rng().fill_bytes(&mut challenge);

        let response = self.transmit(&commands::card::mutually_authenticate(&challenge))?;
        if !response.is_success() || response.data().len() != 32 {
            return Err(Error::AuthenticationFailed);
        }
        debug!("mutual authentication successful");
        Ok(())
    }

    /// Encrypt and MAC a command, send it, and unwrap the protected
    /// response. Error statuses arrive unprotected and are passed through.
    pub(crate) fn transmit(&mut self, command: &CardCommand) -> Result<CardResponse> {
        let protected = self.protect(command);
        let raw = self.channel.transmit(&protected.to_bytes())?;
        let outer = CardResponse::from_bytes(&raw)?;
        if !outer.is_success() || outer.data().is_empty() {
            return Ok(outer);
        }
        self.unwrap_response(&outer)
    }

    /// Run `command`, mapping any non-success status into an error.
    pub(crate) fn execute(&mut self, name: &'static str, command: &CardCommand) -> Result<Bytes> {
        let response = self.transmit(command)?;
        if response.is_success() {
            Ok(Bytes::copy_from_slice(response.data()))
        } else {
            Err(Error::from_status(name, response.status()))
        }
    }

    fn protect(&mut self, command: &CardCommand) -> CardCommand {
        let payload = command.data().unwrap_or(&[]);
        let mut to_encrypt = BytesMut::from(payload);
        let encrypted = encrypt_apdu(
            &mut to_encrypt,
            Key::<CardScp>::from_slice(&self.keys.enc),
            Iv::<CardScp>::from_slice(&self.iv),
        );

        let mut meta = ApduMeta::default();
        meta[0] = command.class();
        meta[1] = command.instruction();
        meta[2] = command.p1();
        meta[3] = command.p2();
        meta[4] = (encrypted.len() + 16) as u8;
        self.chain_mac(&meta, &encrypted);

        let mut data = BytesMut::with_capacity(16 + encrypted.len());
        data.extend_from_slice(&self.iv);
        data.extend_from_slice(&encrypted);

        let mut protected = CardCommand::new(
            command.class(),
            command.instruction(),
            command.p1(),
            command.p2(),
        )
        .with_data(data.freeze());
        if let Some(le) = command.le() {
            protected = protected.with_le(le);
        }
        protected
    }

    fn unwrap_response(&mut self, outer: &CardResponse) -> Result<CardResponse> {
        let payload = outer.data();
        if payload.len() < 32 {
            return Err(Error::AuthenticationFailed);
        }

        let (rmac, rdata) = payload.split_at(16);
        let rdata = Bytes::copy_from_slice(rdata);

        let mut to_decrypt = BytesMut::from(rdata.as_ref());
        let plain = decrypt_apdu(
            &mut to_decrypt,
            Key::<CardScp>::from_slice(&self.keys.enc),
            Iv::<CardScp>::from_slice(&self.iv),
        )?;

        let mut meta = ApduMeta::default();
        meta[0] = payload.len() as u8;
        self.chain_mac(&meta, &rdata);

        if rmac != self.iv.as_slice() {
            warn!("response MAC verification failed");
            return Err(Error::AuthenticationFailed);
        }

        Ok(CardResponse::from_bytes(&plain)?)
    }

    fn chain_mac(&mut self, meta: &ApduMeta, data: &Bytes) {
        self.iv = apdu_mac(meta, data, Key::<CardScp>::from_slice(&self.keys.mac)).into();
    }

    /// Verify the PIN, upgrading this session to an authenticated one. The
    /// card decrements its retry counter on a wrong PIN; a failed attempt
    /// consumes the session.
    pub fn authenticate(mut self, pin: &str) -> Result<AuthenticatedSession<'c>> {
        let response = self.transmit(&commands::card::verify_pin(pin))?;
        if !response.is_success() {
            return Err(Error::from_status("VERIFY PIN", response.status()));
        }
        debug!("PIN verified");
        Ok(AuthenticatedSession { session: self })
    }

    /// Application status (retry counters, key presence).
    pub fn app_status(&mut self) -> Result<AppStatus> {
        let data = self.execute("GET STATUS", &commands::card::get_application_status())?;
        AppStatus::try_from(data.as_ref())
    }

    /// The card's current derivation path, read fresh.
    pub fn current_key_path(&mut self) -> Result<DerivationPath> {
        let data = self.execute("GET STATUS", &commands::card::get_key_path())?;
        crate::types::parse_key_path(&data)
    }

    /// Unblock a blocked PIN with the PUK, setting a new PIN.
    pub fn unblock_pin(&mut self, puk: &str, new_pin: &str) -> Result<()> {
        let response = self.transmit(&commands::card::unblock_pin(puk, new_pin))?;
        match response.status().remaining_attempts() {
            _ if response.is_success() => Ok(()),
            Some(0) => Err(Error::PukBlocked),
            Some(remaining) => Err(Error::WrongPuk { remaining }),
            None => Err(Error::Status {
                command: "UNBLOCK PIN",
                sw: response.status(),
            }),
        }
    }

    /// Ask the card for mnemonic entropy and render it as a BIP39 phrase.
    pub fn generate_mnemonic(&mut self, words: u8) -> Result<String> {
        if !matches!(words, 12 | 15 | 18 | 21 | 24) {
            return Err(Error::InvalidData("Mnemonic length must be 12..=24 words"));
        }
        let data = self.execute("GENERATE MNEMONIC", &commands::card::generate_mnemonic(words))?;

        let mut phrase_words = Vec::with_capacity(words as usize);
        for chunk in data.chunks_exact(2) {
            let index = u16::from_be_bytes([chunk[0], chunk[1]]) as usize;
            phrase_words.push(English::get(index)?);
        }
        Ok(phrase_words.join(" "))
    }
}

/// A secure session whose PIN has been verified. Derefs to [`SecureSession`]
/// for the operations that do not need PIN authentication.
pub struct AuthenticatedSession<'c> {
    session: SecureSession<'c>,
}

impl fmt::Debug for AuthenticatedSession<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticatedSession").finish_non_exhaustive()
    }
}

impl<'c> Deref for AuthenticatedSession<'c> {
    type Target = SecureSession<'c>;

    fn deref(&self) -> &Self::Target {
        &self.session
    }
}

impl DerefMut for AuthenticatedSession<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.session
    }
}

impl AuthenticatedSession<'_> {
    /// DERIVE KEY, making `path` the card's current path.
    pub fn derive_key(&mut self, path: &DerivationPath) -> Result<()> {
        self.session
            .execute("DERIVE KEY", &commands::card::derive_key(path))?;
        debug!(path = %path.derivation_string(), "derived key");
        Ok(())
    }

    /// EXPORT KEY at `path` (derived from master, current path untouched).
    pub fn export_key(&mut self, what: ExportOption, path: &DerivationPath) -> Result<Keypair> {
        let data = self
            .session
            .execute("EXPORT KEY", &commands::card::export_key(what, path))?;
        Keypair::try_from(data.as_ref())
    }

    /// EXPORT KEY for the card's current path.
    pub fn export_current_key(&mut self, what: ExportOption) -> Result<Keypair> {
        let data = self
            .session
            .execute("EXPORT KEY", &commands::card::export_current_key(what))?;
        Keypair::try_from(data.as_ref())
    }

    /// LOAD KEY, irreversibly replacing any key on the card. Returns the new
    /// key UID.
    pub fn load_master_key(&mut self, keypair: &Keypair) -> Result<[u8; 32]> {
        let template = keypair.to_tlv_bytes()?;
        let data = self.session.execute(
            "LOAD KEY",
            &commands::card::load_key(template, keypair.is_extended()),
        )?;
        data.as_ref()
            .try_into()
            .map_err(|_| Error::InvalidData("Key UID was not 32 bytes"))
    }

    /// GENERATE KEY on-card; returns the new key UID.
    pub fn generate_key(&mut self) -> Result<[u8; 32]> {
        let data = self
            .session
            .execute("GENERATE KEY", &commands::card::generate_key())?;
        data.as_ref()
            .try_into()
            .map_err(|_| Error::InvalidData("Key UID was not 32 bytes"))
    }

    /// REMOVE KEY from the card.
    pub fn remove_key(&mut self) -> Result<()> {
        self.session
            .execute("REMOVE KEY", &commands::card::remove_key())?;
        Ok(())
    }

    /// SIGN a 32-byte hash with the current key.
    pub fn sign_hash(&mut self, hash: &[u8]) -> Result<CardSignature> {
        let data = self.session.execute("SIGN", &commands::card::sign(hash))?;
        CardSignature::try_from(data.as_ref())
    }

    /// SIGN with an inline path; only valid on firmware that supports it.
    pub fn sign_hash_with_path(
        &mut self,
        hash: &[u8],
        path: &DerivationPath,
    ) -> Result<CardSignature> {
        let data = self
            .session
            .execute("SIGN", &commands::card::sign_with_path(hash, path))?;
        CardSignature::try_from(data.as_ref())
    }

    pub fn change_pin(&mut self, new_pin: &str) -> Result<()> {
        self.session
            .execute("CHANGE PIN", &commands::card::change_pin(new_pin))?;
        Ok(())
    }

    pub fn change_puk(&mut self, new_puk: &str) -> Result<()> {
        self.session
            .execute("CHANGE PUK", &commands::card::change_puk(new_puk))?;
        Ok(())
    }

    /// Change the pairing password; the card stores the derived token.
    pub fn change_pairing_secret(&mut self, token: &[u8]) -> Result<()> {
        self.session.execute(
            "CHANGE PAIRING SECRET",
            &commands::card::change_pairing_secret(token),
        )?;
        Ok(())
    }

    /// UNPAIR the given slot.
    pub fn unpair(&mut self, index: u8) -> Result<()> {
        self.session
            .execute("UNPAIR", &commands::card::unpair(index))?;
        Ok(())
    }
}
