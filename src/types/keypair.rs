use std::fmt;

use alloy_primitives::Address;
use iso7816_tlv::ber::{Tag, Tlv, Value};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{PublicKey, SecretKey};

use crate::constants::tags;

use super::get_primitive_value;

/// Keypair template (tag 0xA1), used in both directions: parsed from EXPORT
/// KEY responses and serialized for LOAD KEY.
#[derive(Clone, Default)]
pub struct Keypair {
    /// ECC public key component (tag 0x80)
    pub public_key: Option<PublicKey>,
    /// ECC private key component (tag 0x81)
    pub private_key: Option<SecretKey>,
    /// Chain code for extended keys (tag 0x82)
    pub chain_code: Option<[u8; 32]>,
}

impl Keypair {
    /// Extended keypair for LOAD KEY P1=0x02.
    pub fn extended(public_key: PublicKey, private_key: SecretKey, chain_code: [u8; 32]) -> Self {
        Self {
            public_key: Some(public_key),
            private_key: Some(private_key),
            chain_code: Some(chain_code),
        }
    }

    pub const fn is_extended(&self) -> bool {
        self.chain_code.is_some()
    }

    /// The public key, recovering it from the private component when the
    /// card omitted it.
    pub fn public_key(&self) -> Option<PublicKey> {
        self.public_key
            .or_else(|| self.private_key.as_ref().map(SecretKey::public_key))
    }

    /// Ethereum-style address: last 20 bytes of Keccak-256 over the
    /// uncompressed public key body.
    pub fn address(&self) -> Option<Address> {
        self.public_key().map(|pk| {
            let point = pk.to_encoded_point(false);
            Address::from_raw_public_key(&point.as_bytes()[1..])
        })
    }

    /// Uncompressed SEC1 public key bytes.
    pub fn public_key_bytes(&self) -> Option<Vec<u8>> {
        self.public_key()
            .map(|pk| pk.to_encoded_point(false).as_bytes().to_vec())
    }

    /// Serialize as a keypair template for LOAD KEY.
    pub fn to_tlv_bytes(&self) -> Result<Vec<u8>, crate::Error> {
        let mut inner = Vec::new();
        if let Some(private_key) = &self.private_key {
            inner.push(Tlv::new(
                Tag::try_from(tags::ECC_PRIVATE_KEY)?,
                Value::Primitive(private_key.to_bytes().to_vec()),
            )?);
        }
        if let Some(public_key) = &self.public_key {
            inner.push(Tlv::new(
                Tag::try_from(tags::ECC_PUBLIC_KEY)?,
                Value::Primitive(public_key.to_encoded_point(false).as_bytes().to_vec()),
            )?);
        }
        if let Some(chain_code) = &self.chain_code {
            inner.push(Tlv::new(
                Tag::try_from(tags::CHAIN_CODE)?,
                Value::Primitive(chain_code.to_vec()),
            )?);
        }

        let template = Tlv::new(
            Tag::try_from(tags::TEMPLATE_KEYPAIR)?,
            Value::Constructed(inner),
        )?;
        Ok(template.to_vec())
    }
}

impl TryFrom<&[u8]> for Keypair {
    type Error = crate::Error;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let tlv = Tlv::from_bytes(value)?;
        if tlv.tag() != &Tag::try_from(tags::TEMPLATE_KEYPAIR)? {
            return Err(Self::Error::InvalidData(
                "TLV tag was not keypair template tag",
            ));
        }

        let tlvs = match tlv.value() {
            Value::Constructed(tlvs) => tlvs,
            Value::Primitive(_) => {
                return Err(Self::Error::InvalidData(
                    "Expected constructed TLV for keypair template",
                ));
            }
        };

        let mut keypair = Keypair::default();
        for tlv in tlvs {
            let tag = tlv.tag();
            if tag == &Tag::try_from(tags::ECC_PUBLIC_KEY)? {
                keypair.public_key =
                    Some(PublicKey::from_sec1_bytes(&get_primitive_value(tag, tlv)?)?);
            } else if tag == &Tag::try_from(tags::ECC_PRIVATE_KEY)? {
                keypair.private_key =
                    Some(SecretKey::from_slice(&get_primitive_value(tag, tlv)?)?);
            } else if tag == &Tag::try_from(tags::CHAIN_CODE)? {
                keypair.chain_code = Some(
                    get_primitive_value(tag, tlv)?
                        .try_into()
                        .map_err(|_| Self::Error::InvalidData("Invalid chain code length"))?,
                );
            }
        }
        Ok(keypair)
    }
}

// Never show private material in debug output.
impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &self.public_key.map(|_| "[present]"))
            .field("private_key", &self.private_key.as_ref().map(|_| "[present]"))
            .field("chain_code", &self.chain_code.map(|_| "[present]"))
            .finish()
    }
}
