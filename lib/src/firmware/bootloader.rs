//! Framing for the PIC32 bootloader protocol. Messages are delimited by
//! SOH/EOT, control bytes inside the body are DLE-escaped, and a CRC-16
//! trailer (low byte first) covers the unescaped command + payload.

use bytes::Buf;
use crc::{CRC_16_XMODEM, Crc};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

pub const SOH: u8 = 0x01;
pub const EOT: u8 = 0x04;
pub const DLE: u8 = 0x10;

pub const CRC_XMODEM: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// CRC-16/XMODEM over `data` (poly 0x1021, init 0).
pub fn crc16(data: &[u8]) -> u16 {
    CRC_XMODEM.checksum(data)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum BootCommand {
    RequestVersion = 0x01,
    EraseFlash = 0x02,
    ProgramFlash = 0x03,
    JumpToApp = 0x05,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum FrameError {
    #[error("Data too short to be a bootloader frame")]
    TooShort,
    #[error("Frame does not start with SOH (got {0:#04x})")]
    MissingStartOfHeader(u8),
    #[error("Frame does not end with EOT (got {0:#04x})")]
    MissingEndOfTransmission(u8),
    #[error("DLE escape at end of frame body")]
    TruncatedEscape,
    #[error("Unescaped control byte {0:#04x} in frame body")]
    UnescapedControl(u8),
    #[error("Missing checksum")]
    MissingChecksum,
    #[error("Invalid checksum (expected {0:#06x}, got {1:#06x})")]
    InvalidChecksum(u16, u16),
}

fn push_escaped(frame: &mut Vec<u8>, b: u8) {
    if matches!(b, SOH | EOT | DLE) {
        frame.push(DLE);
    }
    frame.push(b);
}

/// Frame a command byte plus payload: `SOH, escaped(cmd ++ payload ++ crc), EOT`.
pub fn encode_frame(command: BootCommand, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(payload.len() + 3);
    body.push(command.into());
    body.extend_from_slice(payload);
    let crc = crc16(&body);
    body.extend_from_slice(&crc.to_le_bytes());

    let mut frame = Vec::with_capacity(body.len() + 2);
    frame.push(SOH);
    for &b in &body {
        push_escaped(&mut frame, b);
    }
    frame.push(EOT);
    frame
}

/// Undo [`encode_frame`]: strip the delimiters, unescape the body, and verify
/// the CRC trailer. Returns the command byte and payload.
pub fn decode_frame(frame: &[u8]) -> Result<(u8, Vec<u8>), FrameError> {
    if frame.len() < 5 {
        return Err(FrameError::TooShort);
    }
    if frame[0] != SOH {
        return Err(FrameError::MissingStartOfHeader(frame[0]));
    }
    if frame[frame.len() - 1] != EOT {
        return Err(FrameError::MissingEndOfTransmission(frame[frame.len() - 1]));
    }

    let mut unescaped = Vec::with_capacity(frame.len());
    let mut escaping = false;
    for &b in &frame[1..frame.len() - 1] {
        if escaping {
            unescaped.push(b);
            escaping = false;
        } else if b == DLE {
            escaping = true;
        } else if b == SOH || b == EOT {
            return Err(FrameError::UnescapedControl(b));
        } else {
            unescaped.push(b);
        }
    }
    if escaping {
        return Err(FrameError::TruncatedEscape);
    }

    let checksum_hi = unescaped.pop().ok_or(FrameError::MissingChecksum)?;
    let checksum_lo = unescaped.pop().ok_or(FrameError::MissingChecksum)?;
    let checksum = [checksum_lo, checksum_hi].as_slice().get_u16_le();
    let computed = crc16(&unescaped);
    if checksum != computed {
        return Err(FrameError::InvalidChecksum(checksum, computed));
    }
    if unescaped.is_empty() {
        return Err(FrameError::TooShort);
    }

    let command = unescaped.remove(0);
    Ok((command, unescaped))
}

pub fn request_version_frame() -> Vec<u8> {
    encode_frame(BootCommand::RequestVersion, &[])
}

pub fn erase_frame() -> Vec<u8> {
    encode_frame(BootCommand::EraseFlash, &[])
}

/// Program-flash frame carrying one raw Intel-HEX record.
pub fn program_frame(record_bytes: &[u8]) -> Vec<u8> {
    encode_frame(BootCommand::ProgramFlash, record_bytes)
}

pub fn jump_frame() -> Vec<u8> {
    encode_frame(BootCommand::JumpToApp, &[])
}

fn read_unescaped(buf: &[u8], pos: &mut usize) -> Option<u8> {
    let b = *buf.get(*pos)?;
    *pos += 1;
    if b == DLE {
        let value = *buf.get(*pos)?;
        *pos += 1;
        Some(value)
    } else {
        Some(b)
    }
}

/// Decode a version response payload into `"{major}.{minor}"`.
///
/// Returns `None` when the buffer is not a bootloader response at all, and
/// `"0.0"` when the SOH+DLE prefix is present but the command byte is not.
pub fn decode_version(buf: &[u8]) -> Option<String> {
    if buf.len() < 2 || buf[0] != SOH {
        return None;
    }
    if buf[1] != DLE || buf.get(2) != Some(&u8::from(BootCommand::RequestVersion)) {
        return Some("0.0".to_string());
    }
    let mut pos = 3;
    let major = read_unescaped(buf, &mut pos).unwrap_or(0);
    let minor = read_unescaped(buf, &mut pos).unwrap_or(0);
    Some(format!("{major}.{minor}"))
}

pub fn is_erase_ack(buf: &[u8]) -> bool {
    buf.len() >= 2 && buf[0] == SOH && buf[1] == u8::from(BootCommand::EraseFlash)
}

pub fn is_program_ack(buf: &[u8]) -> bool {
    buf.len() >= 2 && buf[0] == SOH && buf[1] == u8::from(BootCommand::ProgramFlash)
}
