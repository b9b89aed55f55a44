use coins_bip39::{MnemonicError, WordlistError};
use iso7816_tlv::TlvError;

use crate::transport::{StatusWord, TransportError};

/// Result type for card operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for card operations.
///
/// Variants group into the four families the crate distinguishes: transport
/// failures (fatal), card status errors (surfaced except on best-effort
/// paths), configuration errors (malformed host input, no retry), and card
/// state errors (carry enough detail for the host to prompt the user).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Channel-level failure; the card is unreachable.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The applet did not answer selection with a success status.
    #[error("card unresponsive: applet selection returned {sw}")]
    CardUnresponsive { sw: StatusWord },

    /// A command was rejected with a non-success status word.
    #[error("{command} returned {sw}")]
    Status {
        command: &'static str,
        sw: StatusWord,
    },

    /// No pairing is stored for the card's instance UID.
    #[error("no pairing stored for card {instance_uid}")]
    NoPairing { instance_uid: String },

    /// The stored pairing secret could not be decoded.
    #[error("stored pairing for card {instance_uid} is not valid base64(index || key)")]
    InvalidPairingEncoding { instance_uid: String },

    /// The secure-channel handshake was rejected by the card, or mutual
    /// authentication failed.
    #[error("secure channel authentication failed")]
    AuthenticationFailed,

    /// The card rejected the pairing cryptogram exchange.
    #[error("pairing failed")]
    PairingFailed,

    #[error("no available pairing slots")]
    NoPairingSlots,

    #[error("wrong PIN, {remaining} attempts remaining")]
    WrongPin { remaining: u8 },

    #[error("PIN is blocked")]
    PinBlocked,

    #[error("wrong PUK, {remaining} attempts remaining")]
    WrongPuk { remaining: u8 },

    #[error("PUK is blocked")]
    PukBlocked,

    /// The card reports no master key loaded.
    #[error("no master key on card")]
    NoMasterKey,

    #[error("invalid hex input: {0}")]
    InvalidHex(&'static str),

    #[error("invalid data: {0}")]
    InvalidData(&'static str),

    #[error("TlvError: {0}")]
    Tlv(TlvError),

    #[error(transparent)]
    EllipticCurve(#[from] k256::elliptic_curve::Error),

    #[error(transparent)]
    Ecdsa(#[from] k256::ecdsa::Error),

    #[error(transparent)]
    Mnemonic(#[from] MnemonicError),

    #[error(transparent)]
    Wordlist(#[from] WordlistError),

    #[error(transparent)]
    Bip32(#[from] coins_bip32::Bip32Error),

    #[error("unpad error")]
    Unpad(#[from] cipher::block_padding::UnpadError),
}

impl From<TlvError> for Error {
    fn from(error: TlvError) -> Self {
        Error::Tlv(error)
    }
}

impl Error {
    /// Map a non-success status word for `command`, folding the shared
    /// `0x63Cn` retry-counter encoding into the PIN-state variants.
    pub(crate) fn from_status(command: &'static str, sw: StatusWord) -> Self {
        match sw.remaining_attempts() {
            Some(0) => Error::PinBlocked,
            Some(remaining) => Error::WrongPin { remaining },
            None => Error::Status { command, sw },
        }
    }
}
