//! Message record - the fixed-size unit carried by the rings
//!
//! The record never aliases memory across the boundary: it is encoded into
//! the slot by value on produce and decoded out of it by value on consume.
//!
//! # Wire Layout (little endian, 24 bytes)
//! ```text
//! offset  size  field
//!   0      8    p0      64-bit payload / service id / name offset
//!   8      4    p1      32-bit payload / status / block descriptor
//!  12      2    p2      16-bit flags
//!  14      1    index   session index
//!  15      1    action  Action code
//!  16      8    rfu     written zero, ignored on read
//! ```

use crate::{IpcError, Result};

/// Size of one encoded record
pub const MESSAGE_SIZE: usize = 24;

/// `p2` flag on a CONFIG record: `p0` is the byte offset of a service name
pub const CONFIG_BY_NAME: u16 = 1 << 0;

/// Protocol action carried by a record
///
/// Code 0 is deliberately unused so a zeroed slot never decodes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Request = 1,
    Response = 2,
    Config = 3,
    ConfigAck = 4,
    Cancel = 5,
    CancelAck = 6,
    Term = 7,
    TermAck = 8,
}

impl Action {
    /// All actions, in code order
    pub const ALL: [Action; 8] = [
        Action::Request,
        Action::Response,
        Action::Config,
        Action::ConfigAck,
        Action::Cancel,
        Action::CancelAck,
        Action::Term,
        Action::TermAck,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            1 => Ok(Action::Request),
            2 => Ok(Action::Response),
            3 => Ok(Action::Config),
            4 => Ok(Action::ConfigAck),
            5 => Ok(Action::Cancel),
            6 => Ok(Action::CancelAck),
            7 => Ok(Action::Term),
            8 => Ok(Action::TermAck),
            _ => Err(IpcError::UnknownAction { code }),
        }
    }
}

/// One protocol message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message {
    pub p0: u64,
    pub p1: u32,
    pub p2: u16,
    /// Session index the message is addressed to
    pub index: u8,
    pub action: Action,
}

impl Message {
    /// Create a payload-free message
    pub fn new(index: u8, action: Action) -> Self {
        Self {
            p0: 0,
            p1: 0,
            p2: 0,
            index,
            action,
        }
    }

    /// Set the 64-bit and 32-bit payload fields
    pub fn with_payload(mut self, p0: u64, p1: u32) -> Self {
        self.p0 = p0;
        self.p1 = p1;
        self
    }

    pub fn with_flags(mut self, p2: u16) -> Self {
        self.p2 = p2;
        self
    }

    /// Encode into the 24-byte wire form
    pub fn encode(&self) -> [u8; MESSAGE_SIZE] {
        let mut raw = [0u8; MESSAGE_SIZE];
        raw[0..8].copy_from_slice(&self.p0.to_le_bytes());
        raw[8..12].copy_from_slice(&self.p1.to_le_bytes());
        raw[12..14].copy_from_slice(&self.p2.to_le_bytes());
        raw[14] = self.index;
        raw[15] = self.action.code();
        raw
    }

    /// Decode from the 24-byte wire form
    ///
    /// # Errors
    /// Returns `IpcError::UnknownAction` if the action byte is not a known code
    pub fn decode(raw: &[u8; MESSAGE_SIZE]) -> Result<Self> {
        let mut p0 = [0u8; 8];
        p0.copy_from_slice(&raw[0..8]);
        let mut p1 = [0u8; 4];
        p1.copy_from_slice(&raw[8..12]);
        let p2 = [raw[12], raw[13]];

        Ok(Self {
            p0: u64::from_le_bytes(p0),
            p1: u32::from_le_bytes(p1),
            p2: u16::from_le_bytes(p2),
            index: raw[14],
            action: Action::from_code(raw[15])?,
        })
    }

    /// Split the encoded record into the three words stored in a ring slot
    pub(crate) fn to_words(self) -> [u64; 3] {
        let raw = self.encode();
        let mut words = [0u64; 3];
        for (word, chunk) in words.iter_mut().zip(raw.chunks_exact(8)) {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(chunk);
            *word = u64::from_le_bytes(bytes);
        }
        words
    }

    pub(crate) fn from_words(words: [u64; 3]) -> Result<Self> {
        let mut raw = [0u8; MESSAGE_SIZE];
        for (chunk, word) in raw.chunks_exact_mut(8).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        Self::decode(&raw)
    }
}
