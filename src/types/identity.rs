use std::fmt;

use iso7816_tlv::ber::{Tag, Tlv, Value};

use crate::constants::tags;

use super::{Capabilities, Capability, Version, get_primitive_value};

/// Card identity returned by SELECT. Read fresh on every selection and never
/// cached across sessions; the key UID changes whenever key material is
/// replaced.
#[derive(Debug, Clone)]
pub struct CardIdentity {
    /// Instance UID (16 bytes), unique per physical card
    pub instance_uid: [u8; 16],
    /// Secure-channel public key (uncompressed, or absent pre-initialization)
    pub public_key: Option<k256::PublicKey>,
    /// Applet version
    pub version: Version,
    /// Remaining pairing slots
    pub free_pairing_slots: u8,
    /// SHA-256 of the master public key, absent when no key is loaded
    pub key_uid: Option<[u8; 32]>,
    /// Advertised capabilities
    pub capabilities: Capabilities,
    /// Whether the card has been initialized with credentials
    pub initialized: bool,
}

impl CardIdentity {
    /// Hex form of the instance UID, the key used by the pairing table.
    pub fn instance_uid_hex(&self) -> String {
        hex::encode(self.instance_uid)
    }

    pub const fn has_master_key(&self) -> bool {
        self.key_uid.is_some()
    }

    /// Identity of a card still awaiting initialization; only the secure
    /// channel key (when present) is known.
    fn pre_initialized(public_key: Option<k256::PublicKey>) -> Self {
        let capabilities = if public_key.is_some() {
            Capabilities::new(&[Capability::SecureChannel, Capability::CredentialsManagement])
        } else {
            Capabilities::new(&[Capability::CredentialsManagement])
        };

        Self {
            instance_uid: [0; 16],
            public_key,
            version: Version::new(0, 0),
            free_pairing_slots: 0,
            key_uid: None,
            capabilities,
            initialized: false,
        }
    }
}

pub(crate) fn parse_optional_public_key(tlv: &Tlv) -> Result<Option<k256::PublicKey>, crate::Error> {
    let value = get_primitive_value(&Tag::try_from(tags::ECC_PUBLIC_KEY)?, tlv)?;
    match value.len() {
        0 => Ok(None),
        65 => Ok(Some(k256::PublicKey::from_sec1_bytes(&value)?)),
        _ => Err(crate::Error::InvalidData("Invalid public key length")),
    }
}

impl TryFrom<&[u8]> for CardIdentity {
    type Error = crate::Error;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let fci = Tlv::from_bytes(value)?;

        if fci.tag() == &Tag::try_from(tags::TEMPLATE_APPLICATION_INFO)? {
            Self::try_from(&fci)
        } else if fci.tag() == &Tag::try_from(tags::ECC_PUBLIC_KEY)? {
            Ok(Self::pre_initialized(parse_optional_public_key(&fci)?))
        } else {
            Err(Self::Error::InvalidData("Unexpected SELECT response tag"))
        }
    }
}

impl TryFrom<&Tlv> for CardIdentity {
    type Error = crate::Error;

    fn try_from(tlv: &Tlv) -> Result<Self, Self::Error> {
        if tlv.tag() != &Tag::try_from(tags::TEMPLATE_APPLICATION_INFO)? {
            return Err(Self::Error::InvalidData(
                "TLV tag was not application info template tag",
            ));
        }

        let tlvs = match tlv.value() {
            Value::Constructed(tlvs) if tlvs.len() >= 6 => tlvs,
            _ => return Err(Self::Error::InvalidData("TLV value was not constructed")),
        };

        let instance_uid: [u8; 16] =
            get_primitive_value(&Tag::try_from(tags::INSTANCE_UID)?, &tlvs[0])?
                .try_into()
                .map_err(|_| Self::Error::InvalidData("Invalid instance UID length"))?;
        let public_key = parse_optional_public_key(&tlvs[1])?;
        let version = Version::try_from(&tlvs[2])?;
        let free_pairing_slots = get_primitive_value(&Tag::try_from(tags::OTHER)?, &tlvs[3])?
            .first()
            .copied()
            .ok_or(Self::Error::InvalidData("Missing pairing slot count"))?;
        let key_uid = {
            let raw = get_primitive_value(&Tag::try_from(tags::KEY_UID)?, &tlvs[4])?;
            match raw.len() {
                32 => Some(raw.try_into().expect("length checked")),
                0 => None,
                _ => return Err(Self::Error::InvalidData("Invalid key UID length")),
            }
        };
        let capabilities = Capabilities::try_from(&tlvs[5])?;

        Ok(Self {
            instance_uid,
            public_key,
            version,
            free_pairing_slots,
            key_uid,
            capabilities,
            initialized: true,
        })
    }
}

impl fmt::Display for CardIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Card identity:")?;
        writeln!(f, "  Instance UID: {}", self.instance_uid_hex())?;
        writeln!(f, "  Version: {}", self.version)?;
        writeln!(f, "  Free pairing slots: {}", self.free_pairing_slots)?;
        match &self.key_uid {
            Some(key_uid) => writeln!(f, "  Key UID: {}", hex::encode(key_uid))?,
            None => writeln!(f, "  Key UID: none")?,
        }
        write!(f, "  Capabilities: {}", self.capabilities)
    }
}
