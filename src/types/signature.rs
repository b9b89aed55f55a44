use iso7816_tlv::ber::{Tag, Tlv, Value};
use k256::ecdsa::{self, RecoveryId, VerifyingKey};

use crate::constants::tags;

use super::{get_primitive_value, identity::parse_optional_public_key};

/// Signature material as returned by the card: the signing public key and
/// the plain (r, s) pair, without a recovery id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardSignature {
    pub public_key: k256::PublicKey,
    pub signature: ecdsa::Signature,
}

impl TryFrom<&[u8]> for CardSignature {
    type Error = crate::Error;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let tlv = Tlv::from_bytes(value)?;
        if tlv.tag() != &Tag::try_from(tags::TEMPLATE_SIGNATURE)? {
            return Err(Self::Error::InvalidData(
                "TLV tag was not signature template tag",
            ));
        }

        let tlvs = match tlv.value() {
            Value::Constructed(tlvs) if tlvs.len() >= 2 => tlvs,
            _ => {
                return Err(Self::Error::InvalidData(
                    "Expected constructed TLV for signature template",
                ));
            }
        };

        let public_key = parse_optional_public_key(&tlvs[0])?
            .ok_or(Self::Error::InvalidData("Signature without public key"))?;
        let signature = parse_ecdsa_signature(&tlvs[1])?;

        Ok(Self {
            public_key,
            signature,
        })
    }
}

pub(crate) fn parse_ecdsa_signature(tlv: &Tlv) -> Result<ecdsa::Signature, crate::Error> {
    if tlv.tag() != &Tag::try_from(tags::ECDSA_SIGNATURE)? {
        return Err(crate::Error::InvalidData("Invalid signature tag"));
    }

    match tlv.value() {
        Value::Constructed(tlvs) if tlvs.len() >= 2 => {
            let r = trailing_scalar(&get_primitive_value(&Tag::try_from(tags::OTHER)?, &tlvs[0])?)?;
            let s = trailing_scalar(&get_primitive_value(&Tag::try_from(tags::OTHER)?, &tlvs[1])?)?;
            Ok(ecdsa::Signature::from_scalars(r, s)?)
        }
        _ => Err(crate::Error::InvalidData(
            "Expected constructed TLV for ECDSA signature",
        )),
    }
}

// DER-style integers may carry a leading zero; the scalar is the last 32
// bytes.
fn trailing_scalar(raw: &[u8]) -> Result<[u8; 32], crate::Error> {
    if raw.len() < 32 {
        return Err(crate::Error::InvalidData("Scalar shorter than 32 bytes"));
    }
    raw[raw.len() - 32..]
        .try_into()
        .map_err(|_| crate::Error::InvalidData("Invalid scalar length"))
}

/// A signature in the canonical recoverable form: `r || s || recovery id`,
/// 65 bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoverableSignature {
    pub r: [u8; 32],
    pub s: [u8; 32],
    pub recovery_id: u8,
}

impl RecoverableSignature {
    /// Canonicalize a card signature over `message_hash`. The recovery id is
    /// found by trial recovery against the public key the card reported;
    /// a high `s` is normalized first so recovery is well defined.
    pub fn from_card_signature(
        message_hash: &[u8],
        card_signature: &CardSignature,
    ) -> Result<Self, crate::Error> {
        let signature = card_signature
            .signature
            .normalize_s()
            .unwrap_or(card_signature.signature);

        let verifying_key = VerifyingKey::from(&card_signature.public_key);
        let recovery_id =
            RecoveryId::trial_recovery_from_prehash(&verifying_key, message_hash, &signature)?;

        let (r, s) = signature.split_bytes();
        Ok(Self {
            r: r.into(),
            s: s.into(),
            recovery_id: recovery_id.to_byte(),
        })
    }

    /// The 65-byte canonical layout.
    pub fn to_bytes(&self) -> [u8; 65] {
        let mut out = [0u8; 65];
        out[..32].copy_from_slice(&self.r);
        out[32..64].copy_from_slice(&self.s);
        out[64] = self.recovery_id;
        out
    }

    /// Canonical wire form: 130 hex characters.
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }
}
