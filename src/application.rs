//! Host facade over the card: owns the pairing table and trust set and
//! exposes the operation set of the host bridge (card info, pairing, key
//! management, signing, credentials, factory reset).
//!
//! Every operation takes the channel explicitly; obtaining and serializing
//! access to the channel is the caller's concern.

use std::collections::HashMap;

use bytes::BytesMut;
use k256::SecretKey;
use serde::Serialize;
use tracing::{debug, info};

use crate::commands;
use crate::constants::{DEFAULT_PAIRING_PASSWORD, KEYCARD_AID};
use crate::crypto::{ecdh_shared_secret, one_shot_encrypt, pairing_token};
use crate::error::{Error, Result};
use crate::keys::{self, KeyExportBundle, KeysBundle};
use crate::pairing::PairingStore;
use crate::reset::{self, ResetReport};
use crate::session::{self, open_secure_channel, select_applet};
use crate::sign;
use crate::transport::{CardChannel, exchange};
use crate::trust::{AuthorityTrustStore, verify_authenticity};
use crate::secrets::Secrets;
use crate::types::{AppStatus, CardIdentity};

/// Card summary returned by [`Keyward::get_application_info`]. Field names
/// are the host result contract; everything beyond `initialized?` is only
/// present for initialized cards.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CardInfo {
    #[serde(rename = "initialized?")]
    pub initialized: bool,
    #[serde(rename = "instance-uid", skip_serializing_if = "Option::is_none")]
    pub instance_uid: Option<String>,
    #[serde(rename = "key-uid", skip_serializing_if = "Option::is_none")]
    pub key_uid: Option<String>,
    #[serde(rename = "secure-channel-pub-key", skip_serializing_if = "Option::is_none")]
    pub secure_channel_pub_key: Option<String>,
    #[serde(rename = "app-version", skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    #[serde(rename = "free-pairing-slots", skip_serializing_if = "Option::is_none")]
    pub free_pairing_slots: Option<u8>,
    #[serde(rename = "has-master-key?", skip_serializing_if = "Option::is_none")]
    pub has_master_key: Option<bool>,
    #[serde(rename = "paired?", skip_serializing_if = "Option::is_none")]
    pub paired: Option<bool>,
    #[serde(rename = "authentic?", skip_serializing_if = "Option::is_none")]
    pub authentic: Option<bool>,
    #[serde(rename = "pin-retry-counter", skip_serializing_if = "Option::is_none")]
    pub pin_retry_counter: Option<u8>,
    #[serde(rename = "puk-retry-counter", skip_serializing_if = "Option::is_none")]
    pub puk_retry_counter: Option<u8>,
    #[serde(rename = "new-pairing", skip_serializing_if = "Option::is_none")]
    pub new_pairing: Option<String>,
}

/// Result of an explicit challenge verification.
#[derive(Debug, Clone, Serialize)]
pub struct CardVerification {
    #[serde(rename = "ca-public-key", skip_serializing_if = "Option::is_none")]
    pub ca_public_key: Option<String>,
    #[serde(rename = "tlv-data")]
    pub tlv_data: String,
}

/// The host-side card manager.
#[derive(Debug, Default)]
pub struct Keyward {
    pairings: PairingStore,
    trust: AuthorityTrustStore,
}

impl Keyward {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pairings(&self) -> &PairingStore {
        &self.pairings
    }

    /// Replace the pairing table wholesale.
    pub fn set_pairings(&mut self, pairings: HashMap<String, String>) {
        self.pairings.replace_all(pairings);
    }

    /// Replace the trusted-authority key list wholesale.
    pub fn set_trusted_authorities(&mut self, keys: &[String]) {
        self.trust.replace_authorities(keys);
    }

    /// Arm the one-time verification skip for a card instance.
    pub fn set_verification_skip(&mut self, instance_uid_hex: String) {
        self.trust.set_skip_token(instance_uid_hex);
    }

    /// Initialize a factory-fresh card with generated credentials. The PIN,
    /// PUK and pairing password travel under a one-shot ECDH encryption
    /// against the card's secure-channel key.
    pub fn init(&self, channel: &mut dyn CardChannel, user_pin: &str) -> Result<Secrets> {
        let response = exchange(channel, &commands::select(KEYCARD_AID))?;
        if !response.is_success() {
            return Err(Error::CardUnresponsive {
                sw: response.status(),
            });
        }
        let identity = CardIdentity::try_from(response.data())?;
        let card_public = identity
            .public_key
            .ok_or(Error::InvalidData("Card has no secure channel key"))?;

        let secrets = Secrets::generate(user_pin);
        let token = pairing_token(secrets.pairing_password());

        let mut data = BytesMut::with_capacity(6 + 12 + token.len());
        data.extend_from_slice(secrets.pin().as_bytes());
        data.extend_from_slice(secrets.puk().as_bytes());
        data.extend_from_slice(&token);

        let host_secret = SecretKey::random(&mut rand::thread_rng());
        let shared = ecdh_shared_secret(&host_secret, &card_public);
        let payload = one_shot_encrypt(&host_secret.public_key(), &shared, &mut data);

        let response = exchange(channel, &commands::card::init(payload))?;
        if !response.is_success() {
            return Err(Error::Status {
                command: "INIT",
                sw: response.status(),
            });
        }
        info!("card initialized");
        Ok(secrets)
    }

    /// Pair with the card using a pairing password and remember the pairing.
    pub fn pair(&mut self, channel: &mut dyn CardChannel, pairing_password: &str) -> Result<String> {
        let identity = select_applet(channel)?;
        info!(
            instance_uid = %identity.instance_uid_hex(),
            free_slots = identity.free_pairing_slots,
            "pairing with card"
        );

        let pairing = session::pair(channel, pairing_password)?;
        let encoded = pairing.to_base64();
        self.pairings.insert(identity.instance_uid_hex(), &pairing);
        Ok(encoded)
    }

    /// Drop the card-side pairing slot and forget the host-side entry.
    pub fn unpair(&mut self, channel: &mut dyn CardChannel, pin: &str) -> Result<()> {
        let identity = select_applet(channel)?;
        let instance_uid = identity.instance_uid_hex();
        let pairing = self.pairings.pairing_for(&instance_uid)?;

        let session = open_secure_channel(channel, identity, &self.pairings)?;
        let mut session = session.authenticate(pin)?;
        session.unpair(pairing.index)?;
        info!("card unpaired");

        self.pairings.remove(&instance_uid);
        Ok(())
    }

    /// Select the card and report everything the host UI needs: identity,
    /// pairing state, authenticity, and retry counters when reachable.
    ///
    /// For authentic-but-unpaired cards this opportunistically pairs with
    /// the well-known default password; any failure there is swallowed and
    /// reported as "not paired".
    pub fn get_application_info(&mut self, channel: &mut dyn CardChannel) -> Result<CardInfo> {
        let identity = select_applet(channel)?;

        let mut info = CardInfo {
            initialized: identity.initialized,
            ..Default::default()
        };
        if !identity.initialized {
            return Ok(info);
        }

        let instance_uid = identity.instance_uid_hex();
        info.instance_uid = Some(instance_uid.clone());
        info.key_uid = Some(identity.key_uid.map(hex::encode).unwrap_or_default());
        info.secure_channel_pub_key = Some(
            identity
                .public_key
                .map(|pk| {
                    use k256::elliptic_curve::sec1::ToEncodedPoint;
                    hex::encode(pk.to_encoded_point(false).as_bytes())
                })
                .unwrap_or_default(),
        );
        info.app_version = Some(identity.version.to_string());
        info.free_pairing_slots = Some(identity.free_pairing_slots);
        info.has_master_key = Some(identity.has_master_key());

        let mut paired = false;
        let mut authentic = false;
        let mut status: Option<AppStatus> = None;

        if !self.pairings.contains(&instance_uid) {
            authentic = verify_authenticity(channel, &instance_uid, &mut self.trust).is_authentic();
            if authentic {
                (paired, status) = self.default_pair_and_open(channel, &identity, &mut info)?;
            }
        } else {
            match open_secure_channel(channel, identity.clone(), &self.pairings) {
                Ok(mut session) => {
                    paired = true;
                    authentic = true;
                    status = Some(session.app_status()?);
                }
                Err(Error::Transport(e)) => return Err(e.into()),
                Err(e) => {
                    debug!(error = %e, "stored pairing did not open a channel");
                    authentic =
                        verify_authenticity(channel, &instance_uid, &mut self.trust).is_authentic();
                    if authentic {
                        (paired, status) =
                            self.default_pair_and_open(channel, &identity, &mut info)?;
                    }
                }
            }
        }

        if let Some(status) = status {
            info.pin_retry_counter = Some(status.pin_retry_count);
            info.puk_retry_counter = Some(status.puk_retry_count);
        }
        info.paired = Some(paired);
        info.authentic = Some(authentic);
        Ok(info)
    }

    /// Opportunistic default pairing. Card-level failures come back as
    /// `(false, None)`; only transport failures surface.
    fn default_pair_and_open(
        &mut self,
        channel: &mut dyn CardChannel,
        identity: &CardIdentity,
        info: &mut CardInfo,
    ) -> Result<(bool, Option<AppStatus>)> {
        let pairing = match session::pair(channel, DEFAULT_PAIRING_PASSWORD) {
            Ok(pairing) => pairing,
            Err(Error::Transport(e)) => return Err(e.into()),
            Err(e) => {
                debug!(error = %e, "default pairing refused");
                return Ok((false, None));
            }
        };

        let instance_uid = identity.instance_uid_hex();
        self.pairings.insert(instance_uid, &pairing);
        info.new_pairing = Some(pairing.to_base64());

        match open_secure_channel(channel, identity.clone(), &self.pairings) {
            Ok(mut session) => {
                let status = session.app_status()?;
                Ok((true, Some(status)))
            }
            Err(Error::Transport(e)) => Err(e.into()),
            Err(e) => {
                debug!(error = %e, "channel open after default pairing failed");
                Ok((false, None))
            }
        }
    }

    /// Generate a mnemonic phrase from card-supplied entropy.
    pub fn generate_mnemonic(&self, channel: &mut dyn CardChannel, words: u8) -> Result<String> {
        let identity = select_applet(channel)?;
        let mut session = open_secure_channel(channel, identity, &self.pairings)?;
        session.generate_mnemonic(words)
    }

    /// Load the master key derived from `mnemonic` without exporting
    /// anything.
    pub fn save_mnemonic(
        &self,
        channel: &mut dyn CardChannel,
        mnemonic: &str,
        pin: &str,
    ) -> Result<()> {
        let seed = keys::mnemonic_to_seed(mnemonic)?;
        let master = keys::master_keypair_from_seed(&seed)?;

        let identity = select_applet(channel)?;
        let session = open_secure_channel(channel, identity, &self.pairings)?;
        let mut session = session.authenticate(pin)?;
        session.load_master_key(&master)?;
        info!("seed loaded to card");
        Ok(())
    }

    /// Load a key from `mnemonic` and export the canonical key set.
    pub fn generate_and_load_key(
        &self,
        channel: &mut dyn CardChannel,
        mnemonic: &str,
        pin: &str,
    ) -> Result<KeyExportBundle> {
        keys::generate_and_load_key(channel, &self.pairings, pin, mnemonic)
    }

    /// Export the canonical key set of an existing on-card key.
    pub fn import_keys(&self, channel: &mut dyn CardChannel, pin: &str) -> Result<KeyExportBundle> {
        keys::import_keys(channel, &self.pairings, pin)
    }

    /// Export the messaging and encryption keys of an existing on-card key.
    pub fn get_keys(&self, channel: &mut dyn CardChannel, pin: &str) -> Result<KeysBundle> {
        keys::get_keys(channel, &self.pairings, pin)
    }

    /// Make `path` the card's current derivation path.
    pub fn derive_key(&self, channel: &mut dyn CardChannel, path: &str, pin: &str) -> Result<()> {
        let path = path.parse()?;
        keys::derive_key(channel, &self.pairings, pin, &path)
    }

    /// Export the current key's public component.
    pub fn export_key(&self, channel: &mut dyn CardChannel, pin: &str) -> Result<String> {
        keys::export_current_public_key(channel, &self.pairings, pin)
    }

    /// Export the public component of the key at `path`.
    pub fn export_key_with_path(
        &self,
        channel: &mut dyn CardChannel,
        pin: &str,
        path: &str,
    ) -> Result<String> {
        let path = path.parse()?;
        keys::export_public_key_at(channel, &self.pairings, pin, &path)
    }

    /// Verify the PIN; returns the (reset) retry counter on success.
    pub fn verify_pin(&self, channel: &mut dyn CardChannel, pin: &str) -> Result<u8> {
        let identity = select_applet(channel)?;
        let session = open_secure_channel(channel, identity, &self.pairings)?;
        let mut session = session.authenticate(pin)?;
        Ok(session.app_status()?.pin_retry_count)
    }

    pub fn change_pin(
        &self,
        channel: &mut dyn CardChannel,
        current_pin: &str,
        new_pin: &str,
    ) -> Result<()> {
        let identity = select_applet(channel)?;
        let session = open_secure_channel(channel, identity, &self.pairings)?;
        let mut session = session.authenticate(current_pin)?;
        session.change_pin(new_pin)?;
        info!("pin changed");
        Ok(())
    }

    pub fn change_puk(&self, channel: &mut dyn CardChannel, pin: &str, puk: &str) -> Result<()> {
        let identity = select_applet(channel)?;
        let session = open_secure_channel(channel, identity, &self.pairings)?;
        let mut session = session.authenticate(pin)?;
        session.change_puk(puk)?;
        info!("puk changed");
        Ok(())
    }

    /// Change the pairing password. Existing pairings (including this
    /// host's) stay valid; only future pairings use the new password.
    pub fn change_pairing_password(
        &self,
        channel: &mut dyn CardChannel,
        pin: &str,
        pairing_password: &str,
    ) -> Result<()> {
        let identity = select_applet(channel)?;
        let session = open_secure_channel(channel, identity, &self.pairings)?;
        let mut session = session.authenticate(pin)?;
        session.change_pairing_secret(&pairing_token(pairing_password))?;
        info!("pairing password changed");
        Ok(())
    }

    /// Unblock a blocked PIN using the PUK.
    pub fn unblock_pin(
        &self,
        channel: &mut dyn CardChannel,
        puk: &str,
        new_pin: &str,
    ) -> Result<()> {
        let identity = select_applet(channel)?;
        let mut session = open_secure_channel(channel, identity, &self.pairings)?;
        session.unblock_pin(puk, new_pin)?;
        info!("pin unblocked");
        Ok(())
    }

    /// Remove the master key from the card.
    pub fn remove_key(&self, channel: &mut dyn CardChannel, pin: &str) -> Result<()> {
        let identity = select_applet(channel)?;
        let session = open_secure_channel(channel, identity, &self.pairings)?;
        let mut session = session.authenticate(pin)?;
        session.remove_key()?;
        info!("key removed");
        Ok(())
    }

    /// Remove the master key and every pairing, ours included.
    pub fn remove_key_with_unpair(&mut self, channel: &mut dyn CardChannel, pin: &str) -> Result<()> {
        let identity = select_applet(channel)?;
        let instance_uid = identity.instance_uid_hex();
        let own = self.pairings.pairing_for(&instance_uid)?;

        let session = open_secure_channel(channel, identity, &self.pairings)?;
        let mut session = session.authenticate(pin)?;
        session.remove_key()?;
        info!("key removed");

        for index in 0..5 {
            if index != own.index {
                session.unpair(index)?;
            }
        }
        session.unpair(own.index)?;
        info!("card unpaired");

        self.pairings.remove(&instance_uid);
        Ok(())
    }

    /// Sign a hex message hash with the current key.
    pub fn sign(
        &self,
        channel: &mut dyn CardChannel,
        pin: &str,
        message_hash_hex: &str,
    ) -> Result<String> {
        sign::sign(channel, &self.pairings, pin, message_hash_hex)
    }

    /// Sign a hex message hash with the key at `path`.
    pub fn sign_with_path(
        &self,
        channel: &mut dyn CardChannel,
        pin: &str,
        path: &str,
        message_hash_hex: &str,
    ) -> Result<String> {
        let path = path.parse()?;
        sign::sign_with_path(channel, &self.pairings, pin, &path, message_hash_hex)
    }

    /// Sign a hex message hash through the PIN-less applet.
    pub fn sign_pinless(
        &self,
        channel: &mut dyn CardChannel,
        message_hash_hex: &str,
    ) -> Result<String> {
        sign::sign_pinless(channel, message_hash_hex)
    }

    /// Run the factory reset state machine.
    pub fn factory_reset(&self, channel: &mut dyn CardChannel) -> Result<ResetReport> {
        reset::factory_reset(channel)
    }

    /// Explicit authenticity probe with a host-supplied challenge. Unlike
    /// the implicit check in `get_application_info`, errors here surface.
    pub fn verify_card(
        &self,
        channel: &mut dyn CardChannel,
        challenge_hex: &str,
    ) -> Result<CardVerification> {
        let challenge: [u8; 32] = sign::decode_message_hash(challenge_hex)?
            .try_into()
            .map_err(|_| Error::InvalidHex("challenge must be 32 bytes"))?;

        select_applet(channel)?;
        let (tlv_data, ca_public_key) = crate::trust::identify_card(channel, &challenge)?;
        Ok(CardVerification {
            ca_public_key,
            tlv_data: hex::encode(tlv_data),
        })
    }
}
