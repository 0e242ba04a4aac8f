//! Just enough of the protocol-buffers wire format to walk the device's
//! "out" message: varints, fixed-width scalars, and length-delimited fields,
//! with packed and unpacked repeated encodings accepted for the numeric
//! lists. Unknown fields are skipped by wire type.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub(crate) enum WireError {
    #[error("varint overruns the buffer")]
    TruncatedVarint,
    #[error("varint exceeds 64 bits")]
    OversizedVarint,
    #[error("field {0} overruns the buffer")]
    TruncatedField(u32),
    #[error("unsupported wire type {0}")]
    UnsupportedWireType(u8),
}

const WIRE_VARINT: u8 = 0;
const WIRE_FIXED64: u8 = 1;
const WIRE_LEN: u8 = 2;
const WIRE_FIXED32: u8 = 5;

// Field numbers of the device "out" message, limited to the subset the host
// consumes.
const MSG_TIME_STAMP: u32 = 1;
const ANALOG_IN_DATA: u32 = 2;
const ANALOG_IN_DATA_FLOAT: u32 = 3;
const ANALOG_IN_DATA_TS: u32 = 4;
const DIGITAL_DATA: u32 = 5;
const ANALOG_IN_PORT_NUM: u32 = 16;
const DIGITAL_PORT_NUM: u32 = 17;
const TIMESTAMP_FREQ: u32 = 18;
const ANALOG_IN_CAL_M: u32 = 19;
const ANALOG_IN_CAL_B: u32 = 20;
const DEVICE_PN: u32 = 21;
const DEVICE_FW_REV: u32 = 22;
const DEVICE_SN: u32 = 23;

pub(crate) fn read_varint(buf: &mut &[u8]) -> Result<u64, WireError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        if shift >= 70 {
            return Err(WireError::OversizedVarint);
        }
        let Some((&byte, rest)) = buf.split_first() else {
            return Err(WireError::TruncatedVarint);
        };
        *buf = rest;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

fn take<'a>(buf: &mut &'a [u8], len: usize, field: u32) -> Result<&'a [u8], WireError> {
    if buf.len() < len {
        return Err(WireError::TruncatedField(field));
    }
    let (head, rest) = buf.split_at(len);
    *buf = rest;
    Ok(head)
}

fn read_f32(buf: &mut &[u8], field: u32) -> Result<f32, WireError> {
    let bytes = take(buf, 4, field)?;
    Ok(f32::from_le_bytes(bytes.try_into().unwrap()))
}

/// The field subset of the device's streaming/status message.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct OutMessage {
    pub msg_timestamp: Option<u32>,
    pub analog_float: Vec<f32>,
    pub analog_int: Vec<i32>,
    pub analog_ts: Vec<u32>,
    pub digital_data: Option<Vec<u8>>,
    pub analog_in_port_num: u32,
    pub digital_port_num: u32,
    pub timestamp_freq: u32,
    pub device_fw_rev: String,
    pub device_pn: String,
    pub device_sn: u64,
    pub cal_m: Vec<f32>,
    pub cal_b: Vec<f32>,
}

impl OutMessage {
    /// A message is sample-bearing when it carries a timestamp or any
    /// analog/digital payload; everything else is configuration-only.
    pub(crate) fn is_sample(&self) -> bool {
        self.msg_timestamp.is_some()
            || !self.analog_float.is_empty()
            || !self.analog_int.is_empty()
            || self.digital_data.is_some()
    }

    pub(crate) fn decode(mut buf: &[u8]) -> Result<Self, WireError> {
        let mut message = OutMessage::default();
        while !buf.is_empty() {
            let key = read_varint(&mut buf)?;
            let field = (key >> 3) as u32;
            let wire_type = (key & 0x7) as u8;
            match field {
                MSG_TIME_STAMP => {
                    message.msg_timestamp = Some(read_varint(&mut buf)? as u32);
                }
                ANALOG_IN_DATA => {
                    decode_repeated_varint(&mut buf, wire_type, field, |v| {
                        message.analog_int.push(v as i32)
                    })?;
                }
                ANALOG_IN_DATA_FLOAT => {
                    decode_repeated_f32(&mut buf, wire_type, field, &mut message.analog_float)?;
                }
                ANALOG_IN_DATA_TS => {
                    decode_repeated_varint(&mut buf, wire_type, field, |v| {
                        message.analog_ts.push(v as u32)
                    })?;
                }
                DIGITAL_DATA => {
                    let len = read_varint(&mut buf)? as usize;
                    message.digital_data = Some(take(&mut buf, len, field)?.to_vec());
                }
                ANALOG_IN_PORT_NUM => {
                    message.analog_in_port_num = read_varint(&mut buf)? as u32;
                }
                DIGITAL_PORT_NUM => {
                    message.digital_port_num = read_varint(&mut buf)? as u32;
                }
                TIMESTAMP_FREQ => {
                    message.timestamp_freq = read_varint(&mut buf)? as u32;
                }
                ANALOG_IN_CAL_M => {
                    decode_repeated_f32(&mut buf, wire_type, field, &mut message.cal_m)?;
                }
                ANALOG_IN_CAL_B => {
                    decode_repeated_f32(&mut buf, wire_type, field, &mut message.cal_b)?;
                }
                DEVICE_PN => {
                    let len = read_varint(&mut buf)? as usize;
                    let bytes = take(&mut buf, len, field)?;
                    message.device_pn = String::from_utf8_lossy(bytes).into_owned();
                }
                DEVICE_FW_REV => {
                    let len = read_varint(&mut buf)? as usize;
                    let bytes = take(&mut buf, len, field)?;
                    message.device_fw_rev = String::from_utf8_lossy(bytes).into_owned();
                }
                DEVICE_SN => {
                    message.device_sn = read_varint(&mut buf)?;
                }
                _ => skip_field(&mut buf, wire_type, field)?,
            }
        }
        Ok(message)
    }
}

fn decode_repeated_varint(
    buf: &mut &[u8],
    wire_type: u8,
    field: u32,
    mut push: impl FnMut(u64),
) -> Result<(), WireError> {
    match wire_type {
        WIRE_VARINT => push(read_varint(buf)?),
        WIRE_LEN => {
            let len = read_varint(buf)? as usize;
            let mut packed = take(buf, len, field)?;
            while !packed.is_empty() {
                push(read_varint(&mut packed)?);
            }
        }
        other => return Err(WireError::UnsupportedWireType(other)),
    }
    Ok(())
}

fn decode_repeated_f32(
    buf: &mut &[u8],
    wire_type: u8,
    field: u32,
    values: &mut Vec<f32>,
) -> Result<(), WireError> {
    match wire_type {
        WIRE_FIXED32 => values.push(read_f32(buf, field)?),
        WIRE_LEN => {
            let len = read_varint(buf)? as usize;
            let mut packed = take(buf, len, field)?;
            while !packed.is_empty() {
                values.push(read_f32(&mut packed, field)?);
            }
        }
        other => return Err(WireError::UnsupportedWireType(other)),
    }
    Ok(())
}

fn skip_field(buf: &mut &[u8], wire_type: u8, field: u32) -> Result<(), WireError> {
    match wire_type {
        WIRE_VARINT => {
            read_varint(buf)?;
        }
        WIRE_FIXED64 => {
            take(buf, 8, field)?;
        }
        WIRE_LEN => {
            let len = read_varint(buf)? as usize;
            take(buf, len, field)?;
        }
        WIRE_FIXED32 => {
            take(buf, 4, field)?;
        }
        other => return Err(WireError::UnsupportedWireType(other)),
    }
    Ok(())
}
