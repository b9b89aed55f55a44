//! Host-side library for Keycard-style hardware key tokens.
//!
//! The card stores key material and signs on-card; this crate drives it over
//! an abstract [`CardChannel`]: authenticated secure sessions over a pairing
//! secret, authenticity verification against a trusted-authority set,
//! version-adaptive key derivation and export at the canonical paths,
//! canonical recoverable signatures, and the factory-reset state machine.

mod application;
mod commands;
pub mod constants;
pub mod crypto;
mod error;
mod keys;
mod pairing;
mod reset;
pub mod scp02;
mod secrets;
mod session;
mod sign;
mod transport;
mod trust;
mod types;

pub use application::{CardInfo, CardVerification, Keyward};
pub use commands::ExportOption;
pub use constants::{DEFAULT_PAIRING_PASSWORD, KEYCARD_AID};
pub use error::{Error, Result};
pub use keys::{DerivationTarget, KeyExportBundle, KeysBundle};
pub use pairing::{Pairing, PairingStore};
pub use reset::ResetReport;
pub use secrets::Secrets;
pub use session::{AuthenticatedSession, SecureSession, open_secure_channel, select_applet};
pub use sign::{decode_message_hash, process_signature};
pub use transport::{CardChannel, CardCommand, CardResponse, StatusWord, TransportError};
pub use trust::{Authenticity, AuthorityTrustStore};
pub use types::{
    AppStatus, Capabilities, Capability, CardIdentity, CardSignature, ExportScheme, Keypair,
    ProtocolProfile, RecoverableSignature, SignScheme, Version,
};
