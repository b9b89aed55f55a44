mod capabilities;
mod identity;
mod keypair;
mod signature;
mod status;
mod version;

use iso7816_tlv::ber::{Tag, Tlv, Value};

pub use capabilities::{Capabilities, Capability};
pub use identity::CardIdentity;
pub use keypair::Keypair;
pub use signature::{CardSignature, RecoverableSignature};
pub(crate) use signature::parse_ecdsa_signature;
pub use status::AppStatus;
pub(crate) use status::parse_key_path;
pub use version::{ExportScheme, ProtocolProfile, SignScheme, Version};

use crate::Error;

pub(crate) fn get_primitive_value(tag: &Tag, tlv: &Tlv) -> Result<Vec<u8>, Error> {
    if tag != tlv.tag() {
        return Err(Error::InvalidData("Invalid tag"));
    }
    match tlv.value() {
        Value::Primitive(bytes) => Ok(bytes.to_vec()),
        _ => Err(Error::InvalidData("Invalid value type")),
    }
}
