use std::fmt;

use coins_bip32::path::DerivationPath;
use iso7816_tlv::ber::{Tag, Tlv, Value};

use crate::constants::tags;

use super::get_primitive_value;

/// Application status returned by GET STATUS P1=0x00
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppStatus {
    /// PIN retry count
    pub pin_retry_count: u8,
    /// PUK retry count
    pub puk_retry_count: u8,
    /// Key initialized flag
    pub key_initialized: bool,
}

impl TryFrom<&[u8]> for AppStatus {
    type Error = crate::Error;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let tlv = Tlv::from_bytes(bytes)?;
        if tlv.tag() != &Tag::try_from(tags::TEMPLATE_APPLICATION_STATUS)? {
            return Err(Self::Error::InvalidData(
                "TLV tag was not application status template tag",
            ));
        }

        match tlv.value() {
            Value::Constructed(tlvs) if tlvs.len() >= 3 => Ok(Self {
                pin_retry_count: get_primitive_value(&Tag::try_from(tags::OTHER)?, &tlvs[0])?[0],
                puk_retry_count: get_primitive_value(&Tag::try_from(tags::OTHER)?, &tlvs[1])?[0],
                key_initialized: get_primitive_value(
                    &Tag::try_from(tags::KEY_INITIALIZED)?,
                    &tlvs[2],
                )?[0]
                    == 0xFF,
            }),
            _ => Err(Self::Error::InvalidData("TLV value was not constructed")),
        }
    }
}

impl fmt::Display for AppStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Application status:")?;
        writeln!(f, "  PIN retries remaining: {}", self.pin_retry_count)?;
        writeln!(f, "  PUK retries remaining: {}", self.puk_retry_count)?;
        write!(f, "  Key initialized: {}", self.key_initialized)
    }
}

/// Parse the GET STATUS P1=0x01 payload: the current derivation path as
/// big-endian u32 components.
pub(crate) fn parse_key_path(data: &[u8]) -> Result<DerivationPath, crate::Error> {
    if data.len() % 4 != 0 {
        return Err(crate::Error::InvalidData("Key path length not a multiple of 4"));
    }
    let components = data
        .chunks_exact(4)
        .map(|chunk| u32::from_be_bytes(chunk.try_into().expect("chunked by 4")));
    Ok(DerivationPath::from_iter(components))
}
