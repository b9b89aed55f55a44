use derive_more::Display;
use iso7816_tlv::ber::{Tag, Tlv, Value};

use crate::constants::tags;

/// Applet version (major.minor)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display)]
#[display("{}.{}", major, minor)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    pub const fn at_least(self, major: u8, minor: u8) -> bool {
        self.major > major || (self.major == major && self.minor >= minor)
    }
}

impl TryFrom<&Tlv> for Version {
    type Error = crate::Error;

    fn try_from(tlv: &Tlv) -> Result<Self, Self::Error> {
        if tlv.tag() != &Tag::try_from(tags::OTHER)? {
            return Err(Self::Error::InvalidData("Invalid tag"));
        }

        match tlv.value() {
            Value::Primitive(bytes) if bytes.len() >= 2 => Ok(Version {
                major: bytes[0],
                minor: bytes[1],
            }),
            _ => Err(Self::Error::InvalidData("Invalid version value")),
        }
    }
}

/// Key export mode for the wallet-root path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportScheme {
    /// Public key only; the wallet path is exported separately as a
    /// compatibility fallback.
    PublicOnly,
    /// Extended export with chain code (applet >= 3.1).
    Extended,
}

/// How path-qualified signing reaches the card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignScheme {
    /// Explicit DERIVE KEY followed by SIGN; changes the card's current path.
    DeriveThenSign,
    /// Single SIGN with an inline path (applet >= 2.2); current path is left
    /// untouched.
    WithPath,
}

/// Firmware-dependent protocol choices, computed once per selection instead
/// of re-branching on the version at every call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolProfile {
    pub export: ExportScheme,
    pub sign: SignScheme,
}

impl From<Version> for ProtocolProfile {
    fn from(version: Version) -> Self {
        Self {
            export: if version.at_least(3, 1) {
                ExportScheme::Extended
            } else {
                ExportScheme::PublicOnly
            },
            sign: if version.at_least(2, 2) {
                SignScheme::WithPath
            } else {
                SignScheme::DeriveThenSign
            },
        }
    }
}
