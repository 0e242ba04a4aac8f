//! Length-prefixed binary SD logs: a stream of varint-framed device "out"
//! messages. Status-only messages feed the session configuration; messages
//! with a timestamp or an analog/digital payload are emitted as samples (and
//! still contribute any configuration fields they carry).

use chrono::{DateTime, NaiveDateTime, Utc};
use futures::TryStream;
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

use super::transfer::END_OF_FILE_SENTINEL;
use super::wire::{OutMessage, WireError, read_varint};
use super::{
    CalibrationPair, DeviceConfig, LogSample, ParseProgress, PROGRESS_MESSAGE_INTERVAL,
    ProgressFn, SdParseError, SdParserOptions, TickAdvance,
};

/// A length prefix larger than this is structural corruption we cannot
/// resync from; the file ends at the last valid record.
const MAX_RECORD_LEN: usize = 16 * 1024 * 1024;

pub struct SdBinaryParser<R: AsyncRead + Unpin> {
    reader: R,
    file_name: String,
    created_date: Option<NaiveDateTime>,

    buf: Vec<u8>,
    start: usize,
    source_done: bool,
    finished: bool,
    chunk_size: usize,

    anchor: Option<DateTime<Utc>>,
    override_frequency: Option<u32>,
    file_frequency: Option<u32>,
    fallback_frequency: Option<u32>,
    ticks: TickAdvance,

    config: DeviceConfig,
    has_config: bool,

    progress: Option<ProgressFn>,
    cancel: CancellationToken,
    bytes_read: u64,
    messages_read: u64,
    last_progress: u64,
    final_progress_sent: bool,
}

impl<R: AsyncRead + Unpin> SdBinaryParser<R> {
    pub fn new(
        file_name: &str,
        reader: R,
        mut options: SdParserOptions,
    ) -> Result<Self, SdParseError> {
        options.validate()?;
        let anchor = super::resolve_anchor(options.session_start_time, file_name);
        let config = options.config_override.clone().unwrap_or_default();
        Ok(SdBinaryParser {
            reader,
            file_name: file_name.to_string(),
            created_date: super::log_name_date(file_name),
            buf: Vec::with_capacity(options.buffer_size),
            start: 0,
            source_done: false,
            finished: false,
            chunk_size: options.buffer_size,
            anchor,
            override_frequency: config.timestamp_frequency,
            file_frequency: None,
            fallback_frequency: options.fallback_timestamp_frequency,
            ticks: TickAdvance::default(),
            has_config: options.config_override.is_some(),
            config,
            progress: options.progress.take(),
            cancel: options.cancel.take().unwrap_or_default(),
            bytes_read: 0,
            messages_read: 0,
            last_progress: 0,
            final_progress_sent: false,
        })
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn created_date(&self) -> Option<NaiveDateTime> {
        self.created_date
    }

    /// Configuration observed so far; grows as samples are consumed.
    pub fn config(&self) -> Option<&DeviceConfig> {
        self.has_config.then_some(&self.config)
    }

    /// Next sample in file order, or `None` once the stream is exhausted.
    pub async fn next_sample(&mut self) -> Result<Option<LogSample>, SdParseError> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(SdParseError::Cancelled);
            }
            if self.finished {
                self.report_progress(true);
                return Ok(None);
            }
            let Some(payload) = self.next_record().await? else {
                self.finished = true;
                continue;
            };
            self.messages_read += 1;
            self.report_progress(false);

            let message = match OutMessage::decode(&payload) {
                Ok(message) => message,
                Err(error) => {
                    warn!("skipping undecodable record #{}: {error}", self.messages_read);
                    continue;
                }
            };
            self.merge_config(&message);
            if message.is_sample() {
                return Ok(Some(self.build_sample(&message)));
            }
        }
    }

    pub fn as_stream(&mut self) -> impl TryStream<Ok = LogSample, Error = SdParseError> + '_ {
        futures::stream::try_unfold(self, |parser| async {
            match parser.next_sample().await? {
                Some(sample) => Ok(Some((sample, parser))),
                None => Ok(None),
            }
        })
    }

    /// Pull the next length-prefixed payload, stripping the EOF sentinel and
    /// ending gracefully on truncation.
    async fn next_record(&mut self) -> Result<Option<Vec<u8>>, SdParseError> {
        // A sentinel at the record boundary ends the file; everything after
        // it is ignored.
        while self.available().len() < END_OF_FILE_SENTINEL.len() && !self.source_done {
            self.fill().await?;
        }
        if self.available().starts_with(END_OF_FILE_SENTINEL) {
            debug!("end-of-file sentinel after {} messages", self.messages_read);
            return Ok(None);
        }
        if self.available().is_empty() && self.source_done {
            return Ok(None);
        }

        let (length, varint_len) = loop {
            let mut slice = self.available();
            let before = slice.len();
            match read_varint(&mut slice) {
                Ok(value) => break (value, before - slice.len()),
                Err(WireError::TruncatedVarint) if !self.source_done => {
                    self.fill().await?;
                }
                Err(_) => {
                    debug!("truncated or invalid length prefix; ending file");
                    return Ok(None);
                }
            }
        };
        if length > u64::from(u32::MAX) || length as usize > MAX_RECORD_LEN {
            warn!("implausible record length {length}; ending file");
            return Ok(None);
        }
        let length = length as usize;

        while self.available().len() < varint_len + length {
            if self.source_done {
                debug!("file ends inside a record; dropping the partial tail");
                return Ok(None);
            }
            self.fill().await?;
        }

        let payload = self.available()[varint_len..varint_len + length].to_vec();
        self.consume(varint_len + length);
        self.bytes_read += (varint_len + length) as u64;
        Ok(Some(payload))
    }

    fn available(&self) -> &[u8] {
        &self.buf[self.start..]
    }

    fn consume(&mut self, len: usize) {
        self.start += len;
        if self.start >= self.buf.len() {
            self.buf.clear();
            self.start = 0;
        }
    }

    async fn fill(&mut self) -> Result<(), SdParseError> {
        if self.start > 0 && self.buf.len() > self.chunk_size {
            self.buf.drain(..self.start);
            self.start = 0;
        }
        let old_len = self.buf.len();
        self.buf.resize(old_len + self.chunk_size, 0);
        let read = self.reader.read(&mut self.buf[old_len..]).await?;
        self.buf.truncate(old_len + read);
        if read == 0 {
            self.source_done = true;
        }
        Ok(())
    }

    fn merge_config(&mut self, message: &OutMessage) {
        let mut observed = false;
        observed |= DeviceConfig::merge_number(
            &mut self.config.analog_port_count,
            message.analog_in_port_num,
        );
        observed |= DeviceConfig::merge_number(
            &mut self.config.digital_port_count,
            message.digital_port_num,
        );
        observed |= DeviceConfig::merge_number(
            &mut self.config.timestamp_frequency,
            message.timestamp_freq,
        );
        observed |= DeviceConfig::merge_string(
            &mut self.config.firmware_revision,
            &message.device_fw_rev,
        );
        observed |=
            DeviceConfig::merge_string(&mut self.config.device_part_number, &message.device_pn);
        if message.device_sn != 0 {
            observed |= DeviceConfig::merge_string(
                &mut self.config.device_serial_number,
                &message.device_sn.to_string(),
            );
        }
        if !message.cal_m.is_empty() && message.cal_m.len() == message.cal_b.len() {
            if self.config.calibration.is_none() {
                self.config.calibration = Some(
                    message
                        .cal_m
                        .iter()
                        .zip(&message.cal_b)
                        .map(|(&slope, &intercept)| CalibrationPair {
                            slope: f64::from(slope),
                            intercept: f64::from(intercept),
                        })
                        .collect(),
                );
            }
            observed = true;
        }
        if message.timestamp_freq != 0 && self.file_frequency.is_none() {
            self.file_frequency = Some(message.timestamp_freq);
        }
        self.has_config |= observed;
    }

    fn build_sample(&mut self, message: &OutMessage) -> LogSample {
        let analog_values: Vec<f64> = if !message.analog_float.is_empty() {
            message.analog_float.iter().map(|&v| f64::from(v)).collect()
        } else {
            message.analog_int.iter().map(|&v| f64::from(v)).collect()
        };
        let analog_timestamps = (!message.analog_ts.is_empty()
            && message.analog_ts.len() == analog_values.len())
        .then(|| message.analog_ts.clone());
        let digital_data = message
            .digital_data
            .as_deref()
            .map(decode_digital_word)
            .unwrap_or(0);

        let frequency = self
            .override_frequency
            .or(self.file_frequency)
            .or(self.fallback_frequency);
        let timestamp = self.ticks.next(message.msg_timestamp, self.anchor, frequency);

        LogSample {
            timestamp,
            analog_values,
            analog_timestamps,
            digital_data,
        }
    }

    fn report_progress(&mut self, finished: bool) {
        let due = finished && !self.final_progress_sent;
        let interval_due = self.messages_read - self.last_progress >= PROGRESS_MESSAGE_INTERVAL;
        if !(due || interval_due) {
            return;
        }
        if finished {
            self.final_progress_sent = true;
        }
        self.last_progress = self.messages_read;
        if let Some(progress) = self.progress.as_mut() {
            progress(ParseProgress {
                bytes_read: self.bytes_read,
                messages_read: self.messages_read,
            });
        }
    }
}

/// Little-endian digital word: byte 0 is least-significant, unused high
/// bytes are zero.
pub(crate) fn decode_digital_word(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .take(4)
        .enumerate()
        .fold(0u32, |word, (i, &b)| word | (u32::from(b) << (8 * i)))
}
