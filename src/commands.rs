//! Typed command builders for the two applets this crate drives: the primary
//! key-management applet and the issuer security domain used by the factory
//! reset fallback. Builders return plain [`CardCommand`]s; status handling
//! and payload parsing stay with the callers.

use bytes::{BufMut, Bytes, BytesMut};
use coins_bip32::path::DerivationPath;
use k256::PublicKey;
use k256::elliptic_curve::sec1::ToEncodedPoint;

use crate::crypto::{Challenge, Cryptogram};
use crate::transport::CardCommand;

pub const CLA_ISO7816: u8 = 0x00;
pub const CLA_GP: u8 = 0x80;

/// P1 telling the applet to derive starting from the master key.
pub const DERIVE_FROM_MASTER: u8 = 0x01;

/// EXPORT KEY P2 values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportOption {
    PrivateAndPublic = 0x00,
    PublicKeyOnly = 0x01,
    ExtendedPublicKey = 0x02,
}

pub(crate) fn derivation_path_to_bytes(path: &DerivationPath) -> Bytes {
    path.iter()
        .fold(BytesMut::new(), |mut bytes, component| {
            bytes.extend_from_slice(&component.to_be_bytes());
            bytes
        })
        .freeze()
}

/// SELECT by AID.
pub fn select(aid: &[u8]) -> CardCommand {
    CardCommand::new(CLA_ISO7816, 0xA4, 0x04, 0x00).with_data(Bytes::copy_from_slice(aid))
}

/// Commands of the primary key-management applet.
pub mod card {
    use super::*;

    /// INIT: install PIN, PUK and pairing token on a factory-fresh card.
    /// `payload` is the one-shot encrypted secret block.
    pub fn init(payload: Bytes) -> CardCommand {
        CardCommand::new(CLA_GP, 0xFE, 0x00, 0x00).with_data(payload)
    }

    /// PAIR, first stage: send the host challenge.
    pub fn pair_first_stage(challenge: &Challenge) -> CardCommand {
        CardCommand::new(CLA_GP, 0x12, 0x00, 0x00).with_data(challenge.to_vec())
    }

    /// PAIR, final stage: answer the card challenge.
    pub fn pair_final_stage(cryptogram: &Cryptogram) -> CardCommand {
        CardCommand::new(CLA_GP, 0x12, 0x01, 0x00).with_data(cryptogram.to_vec())
    }

    /// UNPAIR the given slot.
    pub fn unpair(index: u8) -> CardCommand {
        CardCommand::new(CLA_GP, 0x13, index, 0x00)
    }

    /// OPEN SECURE CHANNEL with the pairing index and host ephemeral key.
    pub fn open_secure_channel(pairing_index: u8, host_public: &PublicKey) -> CardCommand {
        CardCommand::new(CLA_GP, 0x10, pairing_index, 0x00)
            .with_data(host_public.to_encoded_point(false).to_bytes().to_vec())
            .with_le(0)
    }

    /// MUTUALLY AUTHENTICATE with a fresh host challenge.
    pub fn mutually_authenticate(challenge: &Challenge) -> CardCommand {
        CardCommand::new(CLA_GP, 0x11, 0x00, 0x00)
            .with_data(challenge.to_vec())
            .with_le(0)
    }

    /// VERIFY PIN.
    pub fn verify_pin(pin: &str) -> CardCommand {
        CardCommand::new(CLA_GP, 0x20, 0x00, 0x00)
            .with_data(Bytes::copy_from_slice(pin.as_bytes()))
    }

    /// CHANGE PIN (P1=0x00).
    pub fn change_pin(pin: &str) -> CardCommand {
        CardCommand::new(CLA_GP, 0x21, 0x00, 0x00)
            .with_data(Bytes::copy_from_slice(pin.as_bytes()))
    }

    /// CHANGE PUK (P1=0x01).
    pub fn change_puk(puk: &str) -> CardCommand {
        CardCommand::new(CLA_GP, 0x21, 0x01, 0x00)
            .with_data(Bytes::copy_from_slice(puk.as_bytes()))
    }

    /// CHANGE pairing secret (P1=0x02); carries the derived pairing token.
    pub fn change_pairing_secret(token: &[u8]) -> CardCommand {
        CardCommand::new(CLA_GP, 0x21, 0x02, 0x00).with_data(Bytes::copy_from_slice(token))
    }

    /// UNBLOCK PIN: PUK concatenated with the replacement PIN.
    pub fn unblock_pin(puk: &str, new_pin: &str) -> CardCommand {
        let mut buf = BytesMut::with_capacity(puk.len() + new_pin.len());
        buf.put_slice(puk.as_bytes());
        buf.put_slice(new_pin.as_bytes());
        CardCommand::new(CLA_GP, 0x22, 0x00, 0x00).with_data(buf.freeze())
    }

    /// GET STATUS for the application template.
    pub fn get_application_status() -> CardCommand {
        CardCommand::new(CLA_GP, 0xF2, 0x00, 0x00).with_le(0)
    }

    /// GET STATUS for the current key path.
    pub fn get_key_path() -> CardCommand {
        CardCommand::new(CLA_GP, 0xF2, 0x01, 0x00).with_le(0)
    }

    /// DERIVE KEY from master along `path`, making it current.
    pub fn derive_key(path: &DerivationPath) -> CardCommand {
        CardCommand::new(CLA_GP, 0xD1, DERIVE_FROM_MASTER, 0x00)
            .with_data(derivation_path_to_bytes(path))
            .with_le(0)
    }

    /// EXPORT KEY derived from master along `path` without making it
    /// current.
    pub fn export_key(what: ExportOption, path: &DerivationPath) -> CardCommand {
        CardCommand::new(CLA_GP, 0xC2, DERIVE_FROM_MASTER, what as u8)
            .with_data(derivation_path_to_bytes(path))
            .with_le(0)
    }

    /// EXPORT KEY for the card's current path.
    pub fn export_current_key(what: ExportOption) -> CardCommand {
        CardCommand::new(CLA_GP, 0xC2, 0x00, what as u8).with_le(0)
    }

    /// LOAD KEY from a keypair template; extended templates use P1=0x02.
    pub fn load_key(template: Vec<u8>, extended: bool) -> CardCommand {
        let p1 = if extended { 0x02 } else { 0x01 };
        CardCommand::new(CLA_GP, 0xD0, p1, 0x00)
            .with_data(template)
            .with_le(0)
    }

    /// GENERATE KEY on-card.
    pub fn generate_key() -> CardCommand {
        CardCommand::new(CLA_GP, 0xD4, 0x00, 0x00)
    }

    /// REMOVE KEY from the card.
    pub fn remove_key() -> CardCommand {
        CardCommand::new(CLA_GP, 0xD3, 0x00, 0x00)
    }

    /// GENERATE MNEMONIC entropy; `words` must be a multiple of 3 between 12
    /// and 24, encoded as the checksum size.
    pub fn generate_mnemonic(words: u8) -> CardCommand {
        CardCommand::new(CLA_GP, 0xD2, words / 3, 0x00).with_le(0)
    }

    /// SIGN the 32-byte hash with the current key.
    pub fn sign(hash: &[u8]) -> CardCommand {
        CardCommand::new(CLA_GP, 0xC0, 0x00, 0x00)
            .with_data(Bytes::copy_from_slice(hash))
            .with_le(0)
    }

    /// SIGN with an inline derivation path (applet >= 2.2); the current path
    /// is not changed.
    pub fn sign_with_path(hash: &[u8], path: &DerivationPath) -> CardCommand {
        let path_data = derivation_path_to_bytes(path);
        let mut buf = BytesMut::with_capacity(hash.len() + path_data.len());
        buf.put_slice(hash);
        buf.put_slice(&path_data);
        CardCommand::new(CLA_GP, 0xC0, DERIVE_FROM_MASTER, 0x00)
            .with_data(buf.freeze())
            .with_le(0)
    }

    /// IDENT: ask the card to prove its identity over a host challenge.
    pub fn ident(challenge: &[u8; 32]) -> CardCommand {
        CardCommand::new(CLA_GP, 0x14, 0x00, 0x00)
            .with_data(Bytes::copy_from_slice(challenge))
            .with_le(0)
    }

    /// FACTORY RESET. Irreversible; requires no authentication.
    pub fn factory_reset() -> CardCommand {
        CardCommand::new(CLA_GP, 0xFD, 0xAA, 0x55)
    }
}

/// Commands of the issuer security domain (GlobalPlatform subset used by the
/// reset fallback).
pub mod issuer {
    use super::*;
    use iso7816_tlv::simple::{Tag as SimpleTag, Tlv as SimpleTlv};

    /// DELETE command data is a simple-TLV wrapped AID.
    const DELETE_AID_TAG: u8 = 0x4F;

    /// INITIALIZE UPDATE with the host challenge.
    pub fn initialize_update(host_challenge: &[u8; 8]) -> CardCommand {
        CardCommand::new(CLA_GP, 0x50, 0x00, 0x00)
            .with_data(Bytes::copy_from_slice(host_challenge))
            .with_le(0)
    }

    /// EXTERNAL AUTHENTICATE carrying the host cryptogram; the retail MAC is
    /// appended by the issuer channel wrapper.
    pub fn external_authenticate(host_cryptogram: &[u8; 8]) -> CardCommand {
        CardCommand::new(CLA_GP, 0x82, 0x00, 0x00)
            .with_data(Bytes::copy_from_slice(host_cryptogram))
    }

    /// DELETE an object and its related objects.
    pub fn delete_object_and_related(aid: &[u8]) -> CardCommand {
        let tlv = SimpleTlv::new(
            SimpleTag::try_from(DELETE_AID_TAG).expect("nonzero tag"),
            aid.to_vec(),
        )
        .expect("AID fits a simple TLV");
        CardCommand::new(CLA_GP, 0xE4, 0x00, 0x80)
            .with_data(tlv.to_vec())
            .with_le(0)
    }

    /// INSTALL [for install and make selectable].
    pub fn install_for_install(
        package_aid: &[u8],
        module_aid: &[u8],
        instance_aid: &[u8],
    ) -> CardCommand {
        let mut data = BytesMut::with_capacity(package_aid.len() + module_aid.len() + instance_aid.len() + 6);
        data.put_u8(package_aid.len() as u8);
        data.put_slice(package_aid);
        data.put_u8(module_aid.len() as u8);
        data.put_slice(module_aid);
        data.put_u8(instance_aid.len() as u8);
        data.put_slice(instance_aid);
        data.put_u8(0x01); // privileges length
        data.put_u8(0x00); // no privileges
        data.put_u8(0x00); // no install parameters
        data.put_u8(0x00); // no install token
        CardCommand::new(CLA_GP, 0xE6, 0x0C, 0x00)
            .with_data(data.freeze())
            .with_le(0)
    }
}
