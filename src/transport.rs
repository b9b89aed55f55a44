//! Abstract card channel and command/response framing.
//!
//! The physical transport (NFC, PC/SC, a simulator) is an external
//! collaborator: anything that can move a command byte sequence to the card
//! and hand back the response implements [`CardChannel`]. The framing here is
//! the ISO 7816-4 short form, which is all the applets in scope use.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Errors raised by the channel itself, as opposed to errors reported by the
/// card through a status word.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The card left the field or the reader went away.
    #[error("card channel lost")]
    ChannelLost,
    /// The transport failed to carry the exchange.
    #[error("transmit failed: {0}")]
    Transmit(String),
    /// The response was shorter than a status word.
    #[error("truncated response from card")]
    Truncated,
}

/// Half-duplex channel to a card. One command, one response, strictly in
/// order; serialization across operations is the caller's responsibility.
pub trait CardChannel {
    /// Transmit a raw command and return the raw response
    /// (payload followed by the two status bytes).
    fn transmit(&mut self, command: &[u8]) -> Result<Bytes, TransportError>;
}

impl CardChannel for &mut dyn CardChannel {
    fn transmit(&mut self, command: &[u8]) -> Result<Bytes, TransportError> {
        (**self).transmit(command)
    }
}

/// Two-byte card status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusWord {
    pub sw1: u8,
    pub sw2: u8,
}

impl StatusWord {
    pub const fn new(sw1: u8, sw2: u8) -> Self {
        Self { sw1, sw2 }
    }

    pub const fn to_u16(self) -> u16 {
        ((self.sw1 as u16) << 8) | self.sw2 as u16
    }

    pub const fn is_success(self) -> bool {
        self.to_u16() == 0x9000
    }

    /// `0x63Cn` responses carry a remaining-attempts counter in the low
    /// nibble of SW2.
    pub const fn remaining_attempts(self) -> Option<u8> {
        if self.sw1 == 0x63 && self.sw2 & 0xF0 == 0xC0 {
            Some(self.sw2 & 0x0F)
        } else {
            None
        }
    }
}

impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.to_u16())
    }
}

/// A command APDU in short form.
#[derive(Debug, Clone)]
pub struct CardCommand {
    cla: u8,
    ins: u8,
    p1: u8,
    p2: u8,
    data: Option<Bytes>,
    le: Option<u8>,
}

impl CardCommand {
    pub const fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: None,
            le: None,
        }
    }

    pub fn with_data(mut self, data: impl Into<Bytes>) -> Self {
        self.data = Some(data.into());
        self
    }

    pub const fn with_le(mut self, le: u8) -> Self {
        self.le = Some(le);
        self
    }

    pub const fn class(&self) -> u8 {
        self.cla
    }

    pub const fn instruction(&self) -> u8 {
        self.ins
    }

    pub const fn p1(&self) -> u8 {
        self.p1
    }

    pub const fn p2(&self) -> u8 {
        self.p2
    }

    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    pub const fn le(&self) -> Option<u8> {
        self.le
    }

    /// Serialize as `CLA INS P1 P2 [Lc data] [Le]`.
    pub fn to_bytes(&self) -> Bytes {
        let data_len = self.data.as_ref().map_or(0, Bytes::len);
        let mut buf = BytesMut::with_capacity(4 + 1 + data_len + 1);
        buf.put_u8(self.cla);
        buf.put_u8(self.ins);
        buf.put_u8(self.p1);
        buf.put_u8(self.p2);
        if let Some(data) = &self.data {
            buf.put_u8(data.len() as u8);
            buf.put_slice(data);
        }
        if let Some(le) = self.le {
            buf.put_u8(le);
        }
        buf.freeze()
    }

    /// Parse a serialized command. Used when re-framing a command for a
    /// secure channel wrapper.
    pub fn from_bytes(raw: &[u8]) -> Result<Self, TransportError> {
        if raw.len() < 4 {
            return Err(TransportError::Truncated);
        }
        let mut cmd = Self::new(raw[0], raw[1], raw[2], raw[3]);
        if raw.len() > 4 {
            let lc = raw[4] as usize;
            if raw.len() < 5 + lc {
                return Err(TransportError::Truncated);
            }
            if lc > 0 {
                cmd = cmd.with_data(Bytes::copy_from_slice(&raw[5..5 + lc]));
            }
            if let Some(&le) = raw.get(5 + lc) {
                cmd = cmd.with_le(le);
            }
        }
        Ok(cmd)
    }
}

/// A response APDU: payload plus status word.
#[derive(Debug, Clone)]
pub struct CardResponse {
    data: Bytes,
    sw: StatusWord,
}

impl CardResponse {
    pub fn new(data: impl Into<Bytes>, sw: StatusWord) -> Self {
        Self {
            data: data.into(),
            sw,
        }
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self, TransportError> {
        if raw.len() < 2 {
            return Err(TransportError::Truncated);
        }
        let (data, sw) = raw.split_at(raw.len() - 2);
        Ok(Self {
            data: Bytes::copy_from_slice(data),
            sw: StatusWord::new(sw[0], sw[1]),
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub const fn status(&self) -> StatusWord {
        self.sw
    }

    pub const fn is_success(&self) -> bool {
        self.sw.is_success()
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.data.len() + 2);
        buf.put_slice(&self.data);
        buf.put_u8(self.sw.sw1);
        buf.put_u8(self.sw.sw2);
        buf.freeze()
    }
}

/// One plain (unprotected) round trip.
pub fn exchange(
    channel: &mut dyn CardChannel,
    command: &CardCommand,
) -> Result<CardResponse, TransportError> {
    let raw = channel.transmit(&command.to_bytes())?;
    CardResponse::from_bytes(&raw)
}
