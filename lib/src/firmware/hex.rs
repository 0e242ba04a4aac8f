//! Intel-HEX parsing for PIC32 firmware images.
//!
//! Records whose full linear address falls inside a protected range are
//! dropped so that factory calibration stored in flash survives an update.

use std::ops::RangeInclusive;

use log::debug;
use thiserror::Error;

pub const RECORD_TYPE_DATA: u8 = 0x00;
pub const RECORD_TYPE_EOF: u8 = 0x01;
pub const RECORD_TYPE_EXTENDED_LINEAR_ADDRESS: u8 = 0x04;

/// Flash addresses holding factory calibration, inclusive at both ends.
pub const DEFAULT_PROTECTED_RANGE: RangeInclusive<u32> = 0x1D1E0000..=0x1D200000;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum HexError {
    #[error("record does not start with ':': {0:?}")]
    MissingStartCode(String),
    #[error("record length not divisible by two: {0:?}")]
    UnevenLength(String),
    #[error("record too short: {0:?}")]
    TooShort(String),
    #[error("record contains non-hex characters: {0:?}")]
    NonHexCharacter(String),
    #[error("record length does not match its byte count: {0:?}")]
    LengthMismatch(String),
    #[error("invalid checksum (expected {expected:#04x}, got {found:#04x})")]
    InvalidChecksum { expected: u8, found: u8 },
}

/// One surviving record. `bytes` holds the full raw record (byte count,
/// offset address, type, data, checksum).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexRecord {
    pub full_address: u32,
    pub bytes: Vec<u8>,
    pub record_type: u8,
}

impl HexRecord {
    pub fn byte_count(&self) -> u8 {
        self.bytes[0]
    }

    pub fn offset_address(&self) -> u16 {
        u16::from_be_bytes([self.bytes[1], self.bytes[2]])
    }

    pub fn data(&self) -> &[u8] {
        &self.bytes[4..self.bytes.len() - 1]
    }
}

#[derive(Debug, Clone)]
pub struct HexParser {
    protected: RangeInclusive<u32>,
}

impl Default for HexParser {
    fn default() -> Self {
        Self::new()
    }
}

impl HexParser {
    pub fn new() -> Self {
        HexParser {
            protected: DEFAULT_PROTECTED_RANGE,
        }
    }

    pub fn with_protected_range(protected: RangeInclusive<u32>) -> Self {
        HexParser { protected }
    }

    pub fn parse(&self, text: &str) -> Result<Vec<HexRecord>, HexError> {
        self.parse_lines(text.lines())
    }

    /// Parse an ordered sequence of record lines, tracking the extended
    /// linear base address and filtering protected data records.
    pub fn parse_lines<'a>(
        &self,
        lines: impl IntoIterator<Item = &'a str>,
    ) -> Result<Vec<HexRecord>, HexError> {
        let mut base_address: u16 = 0;
        let mut records = Vec::new();

        for line in lines {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let bytes = decode_record(line)?;

            let record_type = bytes[3];
            if record_type == RECORD_TYPE_EXTENDED_LINEAR_ADDRESS && bytes[0] >= 2 {
                base_address = u16::from_be_bytes([bytes[4], bytes[5]]);
            }

            let offset = u16::from_be_bytes([bytes[1], bytes[2]]);
            let full_address = (u32::from(base_address) << 16) | u32::from(offset);

            if record_type == RECORD_TYPE_DATA && self.protected.contains(&full_address) {
                debug!("dropping data record at protected address {full_address:#010x}");
                continue;
            }

            records.push(HexRecord {
                full_address,
                bytes,
                record_type,
            });
        }

        Ok(records)
    }

    /// Raw byte-vector form of [`parse`](Self::parse).
    pub fn parse_raw(&self, text: &str) -> Result<Vec<Vec<u8>>, HexError> {
        Ok(self.parse(text)?.into_iter().map(|r| r.bytes).collect())
    }
}

fn decode_record(line: &str) -> Result<Vec<u8>, HexError> {
    let Some(hex) = line.strip_prefix(':') else {
        return Err(HexError::MissingStartCode(line.to_string()));
    };
    if line.len() < 11 {
        return Err(HexError::TooShort(line.to_string()));
    }
    if hex.len() % 2 != 0 {
        return Err(HexError::UnevenLength(line.to_string()));
    }

    let mut bytes = Vec::with_capacity(hex.len() / 2);
    for pair in hex.as_bytes().chunks_exact(2) {
        let pair = std::str::from_utf8(pair).map_err(|_| HexError::NonHexCharacter(line.to_string()))?;
        let byte = u8::from_str_radix(pair, 16)
            .map_err(|_| HexError::NonHexCharacter(line.to_string()))?;
        bytes.push(byte);
    }

    if bytes.len() != usize::from(bytes[0]) + 5 {
        return Err(HexError::LengthMismatch(line.to_string()));
    }

    let sum = bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    if sum != 0 {
        let found = *bytes.last().unwrap();
        let expected = found.wrapping_sub(sum);
        return Err(HexError::InvalidChecksum { expected, found });
    }

    Ok(bytes)
}
