//! Protocol constants: applet identifiers, TLV tags, status words and the
//! canonical derivation paths served by this crate.

use crate::transport::StatusWord;

/// AID of the primary key-management applet instance.
pub const KEYCARD_AID: &[u8] = b"\xA0\x00\x00\x08\x04\x00\x01\x01";
/// AID of the PIN-less signing applet instance.
pub const CASH_AID: &[u8] = b"\xA0\x00\x00\x08\x04\x00\x01\x03";
/// AID of the applet package, used when reinstalling the instance.
pub const KEYCARD_PACKAGE_AID: &[u8] = b"\xA0\x00\x00\x08\x04\x00\x01";
/// AID of the issuer security domain (card manager).
pub const ISD_AID: &[u8] = b"\xA0\x00\x00\x01\x51\x00\x00\x00";

/// Well-known password used for opportunistic pairing of factory-configured
/// cards.
pub const DEFAULT_PAIRING_PASSWORD: &str = "KeycardDefaultPairing";

/// Canonical derivation paths. Components are stored raw so building a
/// `DerivationPath` never goes through the string parser.
pub mod paths {
    const H: u32 = 0x8000_0000;

    /// `m`
    pub const MASTER: &[u32] = &[];
    /// `m/44'/60'/0'/0`
    pub const WALLET_ROOT: &[u32] = &[H | 44, H | 60, H, 0];
    /// `m/44'/60'/0'/0/0`
    pub const WALLET: &[u32] = &[H | 44, H | 60, H, 0, 0];
    /// `m/43'/60'/1581'/0'/0`
    pub const MESSAGING: &[u32] = &[H | 43, H | 60, H | 1581, H, 0];
    /// `m/43'/60'/1581'/1'/0`
    pub const ENCRYPTION: &[u32] = &[H | 43, H | 60, H | 1581, H | 1, 0];
}

pub mod tags {
    /// Signature template containing:
    /// - TAG_ECC_PUBLIC_KEY
    /// - TAG_ECDSA_SIGNATURE
    pub const TEMPLATE_SIGNATURE: u8 = 0xA0;
    /// Keypair template containing:
    /// - TAG_ECC_PRIVATE_KEY
    /// - optional TAG_CHAIN_CODE / TAG_ECC_PUBLIC_KEY
    pub const TEMPLATE_KEYPAIR: u8 = 0xA1;
    /// Application status template containing:
    /// - TAG_OTHER (for PIN and PUK retry counts)
    /// - TAG_KEY_INITIALIZED
    pub const TEMPLATE_APPLICATION_STATUS: u8 = 0xA3;
    /// Application info template containing:
    /// - TAG_INSTANCE_UID
    /// - TAG_ECC_PUBLIC_KEY
    /// - TAG_OTHER (application version and remaining pairing slots)
    /// - TAG_KEY_UID
    /// - TAG_CAPABILITIES
    pub const TEMPLATE_APPLICATION_INFO: u8 = 0xA4;

    /// Instance UID (16 bytes)
    pub const INSTANCE_UID: u8 = 0x8F;
    /// ECC public key (uncompressed, 65 bytes, or 0 bytes if not available)
    pub const ECC_PUBLIC_KEY: u8 = 0x80;
    /// ECC private key (32 bytes)
    pub const ECC_PRIVATE_KEY: u8 = 0x81;
    /// Chain code (32 bytes)
    pub const CHAIN_CODE: u8 = 0x82;
    /// Application version (2 bytes) / remaining pairing slots (1 byte)
    pub const OTHER: u8 = 0x02;
    /// Key UID (32 bytes)
    pub const KEY_UID: u8 = 0x8E;
    /// Capabilities (1 byte)
    pub const CAPABILITIES: u8 = 0x8D;
    /// Card certificate issued by a certification authority
    pub const CERTIFICATE: u8 = 0x8A;
    /// ECDSA signature (contains an array of TAG_OTHER for R and S)
    pub const ECDSA_SIGNATURE: u8 = 0x30;
    /// Key initialized flag (0xFF if a key is loaded, 0 otherwise)
    pub const KEY_INITIALIZED: u8 = 0x01;
}

pub mod status {
    use super::StatusWord;

    pub const OK: StatusWord = StatusWord::new(0x90, 0x00);
    pub const WRONG_DATA: StatusWord = StatusWord::new(0x6A, 0x80);
    pub const FILE_NOT_FOUND: StatusWord = StatusWord::new(0x6A, 0x82);
    pub const FILE_FULL: StatusWord = StatusWord::new(0x6A, 0x84);
    pub const INCORRECT_P1P2: StatusWord = StatusWord::new(0x6A, 0x86);
    pub const REFERENCED_DATA_NOT_FOUND: StatusWord = StatusWord::new(0x6A, 0x88);
    pub const CONDITIONS_NOT_SATISFIED: StatusWord = StatusWord::new(0x69, 0x85);
    pub const SECURITY_STATUS_NOT_SATISFIED: StatusWord = StatusWord::new(0x69, 0x82);
    pub const INS_NOT_SUPPORTED: StatusWord = StatusWord::new(0x6D, 0x00);
    /// Remaining-attempts counter exhausted (PIN or PUK blocked).
    pub const AUTH_BLOCKED: StatusWord = StatusWord::new(0x63, 0xC0);
}
