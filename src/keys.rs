//! Multi-path key derivation and export at the five canonical paths.
//!
//! Every operation here builds its own session from scratch (select, open,
//! verify PIN) and runs as a sequence of blocking round trips; a failure
//! partway through surfaces as-is and the caller restarts from session
//! establishment.

use coins_bip32::path::DerivationPath;
use coins_bip39::{English, Mnemonic};
use hmac::{Hmac, Mac};
use k256::SecretKey;
use serde::Serialize;
use sha2::Sha512;
use tracing::{debug, info};

use crate::commands::ExportOption;
use crate::constants::paths;
use crate::error::{Error, Result};
use crate::pairing::PairingStore;
use crate::session::{AuthenticatedSession, open_secure_channel, select_applet};
use crate::transport::CardChannel;
use crate::types::{ExportScheme, Keypair};

/// The five canonical derivation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerivationTarget {
    Master,
    WalletRoot,
    Wallet,
    Messaging,
    Encryption,
}

impl DerivationTarget {
    pub const fn components(self) -> &'static [u32] {
        match self {
            Self::Master => paths::MASTER,
            Self::WalletRoot => paths::WALLET_ROOT,
            Self::Wallet => paths::WALLET,
            Self::Messaging => paths::MESSAGING,
            Self::Encryption => paths::ENCRYPTION,
        }
    }

    pub fn path(self) -> DerivationPath {
        DerivationPath::from_iter(self.components().iter().copied())
    }
}

/// Key material exported after loading or importing a master key. Field
/// names are the host result contract.
#[derive(Debug, Clone, Default, Serialize)]
pub struct KeyExportBundle {
    pub address: String,
    #[serde(rename = "public-key")]
    pub public_key: String,
    #[serde(rename = "wallet-root-address")]
    pub wallet_root_address: String,
    #[serde(rename = "wallet-root-public-key")]
    pub wallet_root_public_key: String,
    #[serde(rename = "wallet-root-chain-code", skip_serializing_if = "Option::is_none")]
    pub wallet_root_chain_code: Option<String>,
    #[serde(rename = "wallet-address", skip_serializing_if = "Option::is_none")]
    pub wallet_address: Option<String>,
    #[serde(rename = "wallet-public-key", skip_serializing_if = "Option::is_none")]
    pub wallet_public_key: Option<String>,
    #[serde(rename = "whisper-address")]
    pub whisper_address: String,
    #[serde(rename = "whisper-public-key")]
    pub whisper_public_key: String,
    #[serde(rename = "whisper-private-key")]
    pub whisper_private_key: String,
    #[serde(rename = "encryption-public-key")]
    pub encryption_public_key: String,
    #[serde(rename = "instance-uid")]
    pub instance_uid: String,
    #[serde(rename = "key-uid")]
    pub key_uid: String,
}

/// Read-only export of the messaging and encryption keys.
#[derive(Debug, Clone, Serialize)]
pub struct KeysBundle {
    #[serde(rename = "whisper-address")]
    pub whisper_address: String,
    #[serde(rename = "whisper-public-key")]
    pub whisper_public_key: String,
    #[serde(rename = "whisper-private-key")]
    pub whisper_private_key: String,
    #[serde(rename = "encryption-public-key")]
    pub encryption_public_key: String,
    #[serde(rename = "instance-uid")]
    pub instance_uid: String,
    #[serde(rename = "key-uid")]
    pub key_uid: String,
}

/// Convert a BIP39 phrase to its 64-byte seed (empty passphrase).
pub fn mnemonic_to_seed(phrase: &str) -> Result<[u8; 64]> {
    let mnemonic = Mnemonic::<English>::new_from_phrase(phrase)?;
    Ok(mnemonic.to_seed(None)?)
}

/// Derive the BIP32 master keypair (key and chain code) from a seed.
pub fn master_keypair_from_seed(seed: &[u8; 64]) -> Result<Keypair> {
    let mut mac =
        Hmac::<Sha512>::new_from_slice(b"Bitcoin seed").expect("HMAC accepts any key length");
    mac.update(seed);
    let digest = mac.finalize().into_bytes();

    let private_key = SecretKey::from_slice(&digest[..32])?;
    let chain_code: [u8; 32] = digest[32..].try_into().expect("SHA-512 splits 32/32");
    Ok(Keypair::extended(
        private_key.public_key(),
        private_key,
        chain_code,
    ))
}

/// Make `path` the card's current derivation path. The current path is read
/// fresh every time and the derive command is only issued when it differs,
/// so repeated calls are idempotent and external path changes are picked up.
pub fn derive_key(
    channel: &mut dyn CardChannel,
    pairings: &PairingStore,
    pin: &str,
    path: &DerivationPath,
) -> Result<()> {
    let identity = select_applet(channel)?;
    let session = open_secure_channel(channel, identity, pairings)?;
    let mut session = session.authenticate(pin)?;

    let current = session.current_key_path()?;
    if current.iter().eq(path.iter()) {
        debug!(path = %path.derivation_string(), "path already current, skipping derive");
        return Ok(());
    }
    session.derive_key(path)
}

/// Load a key generated from `mnemonic` and export the canonical key set.
///
/// The master keypair irreversibly replaces whatever key the card held. The
/// identity in the returned bundle comes from a fresh re-select, since the
/// key UID changes with the key material.
pub fn generate_and_load_key(
    channel: &mut dyn CardChannel,
    pairings: &PairingStore,
    pin: &str,
    mnemonic: &str,
) -> Result<KeyExportBundle> {
    let seed = mnemonic_to_seed(mnemonic)?;
    let master = master_keypair_from_seed(&seed)?;

    let identity = select_applet(channel)?;
    let session = open_secure_channel(channel, identity, pairings)?;
    let mut session = session.authenticate(pin)?;

    session.load_master_key(&master)?;
    info!("keypair loaded to card");

    let mut bundle = export_canonical_set(&mut session, &master)?;
    drop(session);

    // The key UID changed with the load; re-read the identity.
    let identity = select_applet(channel)?;
    bundle.instance_uid = identity.instance_uid_hex();
    bundle.key_uid = identity.key_uid.map(hex::encode).unwrap_or_default();
    Ok(bundle)
}

/// Export the canonical key set for a card that already holds a master key.
pub fn import_keys(
    channel: &mut dyn CardChannel,
    pairings: &PairingStore,
    pin: &str,
) -> Result<KeyExportBundle> {
    let identity = select_applet(channel)?;
    if !identity.has_master_key() {
        return Err(Error::NoMasterKey);
    }

    let instance_uid = identity.instance_uid_hex();
    let key_uid = identity.key_uid.map(hex::encode).unwrap_or_default();

    let session = open_secure_channel(channel, identity, pairings)?;
    let mut session = session.authenticate(pin)?;

    let master = session.export_key(ExportOption::PublicKeyOnly, &DerivationTarget::Master.path())?;
    let mut bundle = export_canonical_set(&mut session, &master)?;
    bundle.instance_uid = instance_uid;
    bundle.key_uid = key_uid;
    Ok(bundle)
}

/// Read-only export of the messaging and encryption keys.
pub fn get_keys(
    channel: &mut dyn CardChannel,
    pairings: &PairingStore,
    pin: &str,
) -> Result<KeysBundle> {
    let identity = select_applet(channel)?;
    if !identity.has_master_key() {
        return Err(Error::NoMasterKey);
    }

    let instance_uid = identity.instance_uid_hex();
    let key_uid = identity.key_uid.map(hex::encode).unwrap_or_default();

    let session = open_secure_channel(channel, identity, pairings)?;
    let mut session = session.authenticate(pin)?;

    let whisper = session.export_key(
        ExportOption::PrivateAndPublic,
        &DerivationTarget::Messaging.path(),
    )?;
    let encryption = session.export_key(
        ExportOption::PrivateAndPublic,
        &DerivationTarget::Encryption.path(),
    )?;

    Ok(KeysBundle {
        whisper_address: address_hex(&whisper)?,
        whisper_public_key: public_key_hex(&whisper)?,
        whisper_private_key: private_key_hex(&whisper)?,
        encryption_public_key: public_key_hex(&encryption)?,
        instance_uid,
        key_uid,
    })
}

/// Export everything below the master key: the wallet root (extended where
/// the firmware allows), the messaging and encryption keys, and on
/// non-extended firmware the wallet key as a separate compatibility export.
fn export_canonical_set(
    session: &mut AuthenticatedSession<'_>,
    master: &Keypair,
) -> Result<KeyExportBundle> {
    let root_option = match session.profile().export {
        ExportScheme::Extended => ExportOption::ExtendedPublicKey,
        ExportScheme::PublicOnly => ExportOption::PublicKeyOnly,
    };

    let root = session.export_key(root_option, &DerivationTarget::WalletRoot.path())?;
    debug!(path = %DerivationTarget::WalletRoot.path().derivation_string(), "exported wallet root");

    let mut bundle = KeyExportBundle {
        address: address_hex(master)?,
        public_key: public_key_hex(master)?,
        wallet_root_address: address_hex(&root)?,
        wallet_root_public_key: public_key_hex(&root)?,
        wallet_root_chain_code: root.chain_code.map(hex::encode),
        ..Default::default()
    };

    if !root.is_extended() {
        // Without a chain code the host cannot derive the wallet key itself;
        // export it separately for compatibility.
        let wallet = session.export_key(
            ExportOption::PublicKeyOnly,
            &DerivationTarget::Wallet.path(),
        )?;
        bundle.wallet_address = Some(address_hex(&wallet)?);
        bundle.wallet_public_key = Some(public_key_hex(&wallet)?);
    }

    let whisper = session.export_key(
        ExportOption::PrivateAndPublic,
        &DerivationTarget::Messaging.path(),
    )?;
    let encryption = session.export_key(
        ExportOption::PrivateAndPublic,
        &DerivationTarget::Encryption.path(),
    )?;

    bundle.whisper_address = address_hex(&whisper)?;
    bundle.whisper_public_key = public_key_hex(&whisper)?;
    bundle.whisper_private_key = private_key_hex(&whisper)?;
    bundle.encryption_public_key = public_key_hex(&encryption)?;
    Ok(bundle)
}

fn address_hex(keypair: &Keypair) -> Result<String> {
    keypair
        .address()
        .map(hex::encode)
        .ok_or(Error::InvalidData("Exported key has no public component"))
}

fn public_key_hex(keypair: &Keypair) -> Result<String> {
    keypair
        .public_key_bytes()
        .map(hex::encode)
        .ok_or(Error::InvalidData("Exported key has no public component"))
}

fn private_key_hex(keypair: &Keypair) -> Result<String> {
    keypair
        .private_key
        .as_ref()
        .map(|sk| hex::encode(sk.to_bytes()))
        .ok_or(Error::InvalidData("Exported key has no private component"))
}

/// Export the current key's public component.
pub fn export_current_public_key(
    channel: &mut dyn CardChannel,
    pairings: &PairingStore,
    pin: &str,
) -> Result<String> {
    let identity = select_applet(channel)?;
    let session = open_secure_channel(channel, identity, pairings)?;
    let mut session = session.authenticate(pin)?;
    let keypair = session.export_current_key(ExportOption::PublicKeyOnly)?;
    public_key_hex(&keypair)
}

/// Export the public component of the key at `path`.
pub fn export_public_key_at(
    channel: &mut dyn CardChannel,
    pairings: &PairingStore,
    pin: &str,
    path: &DerivationPath,
) -> Result<String> {
    let identity = select_applet(channel)?;
    let session = open_secure_channel(channel, identity, pairings)?;
    let mut session = session.authenticate(pin)?;
    let keypair = session.export_key(ExportOption::PublicKeyOnly, path)?;
    public_key_hex(&keypair)
}
