use std::fmt;

use iso7816_tlv::ber::{Tlv, Value};

/// Capability flags advertised by the applet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    SecureChannel = 0x01,
    KeyManagement = 0x02,
    CredentialsManagement = 0x04,
    Ndef = 0x08,
    FactoryReset = 0x10,
}

/// Capability flags container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities(u8);

impl Capabilities {
    pub fn new(capabilities: &[Capability]) -> Self {
        Self(capabilities.iter().fold(0, |flags, &cap| flags | cap as u8))
    }

    pub const fn has(self, capability: Capability) -> bool {
        self.0 & capability as u8 != 0
    }

    pub const fn bits(self) -> u8 {
        self.0
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.has(Capability::SecureChannel) {
            names.push("Secure Channel");
        }
        if self.has(Capability::KeyManagement) {
            names.push("Key Management");
        }
        if self.has(Capability::CredentialsManagement) {
            names.push("Credentials Management");
        }
        if self.has(Capability::Ndef) {
            names.push("NDEF");
        }
        if self.has(Capability::FactoryReset) {
            names.push("Factory Reset");
        }
        write!(f, "{}", names.join(", "))
    }
}

impl From<u8> for Capabilities {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl TryFrom<&Tlv> for Capabilities {
    type Error = crate::Error;

    fn try_from(tlv: &Tlv) -> Result<Self, Self::Error> {
        match tlv.value() {
            Value::Primitive(data) if !data.is_empty() => Ok(data[0].into()),
            _ => Err(Self::Error::InvalidData("Invalid TLV for Capabilities")),
        }
    }
}
