//! SD-card log ingestion.
//!
//! Devices log to SD in three formats sharing one file-name convention
//! (`log_YYYYMMDD_HHMMSS.{bin,json,dat,csv}`): a length-prefixed binary
//! stream, line-delimited JSON, and a comment-headered CSV dialect. All three
//! parsers yield [`LogSample`]s in file order and accumulate a
//! [`DeviceConfig`] from whatever status information the file carries.

pub mod binary;
pub mod csv;
pub mod file_list;
pub mod json;
pub mod transfer;
pub(crate) mod wire;

use std::sync::LazyLock;

use chrono::{DateTime, NaiveDateTime, Utc};
use futures::TryStream;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

use crate::clock;

pub use binary::SdBinaryParser;
pub use csv::SdCsvParser;
pub use file_list::{SdFileEntry, parse_file_list, parse_file_listing};
pub use json::SdJsonParser;

pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Emit an intermediate progress report every this many messages.
pub(crate) const PROGRESS_MESSAGE_INTERVAL: u64 = 100;

#[derive(Debug, Error)]
pub enum SdParseError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("unrecognized log file extension: {0:?}")]
    UnknownFormat(String),
    #[error("parse cancelled")]
    Cancelled,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One decoded log sample. Produced during parsing, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSample {
    pub timestamp: DateTime<Utc>,
    pub analog_values: Vec<f64>,
    /// Per-channel device ticks; always the same length as `analog_values`
    /// when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analog_timestamps: Option<Vec<u32>>,
    pub digital_data: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationPair {
    pub slope: f64,
    pub intercept: f64,
}

/// Device configuration observed in a log file, merged across all
/// status-like records: first non-empty string wins, first non-zero number
/// wins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub analog_port_count: Option<u32>,
    pub digital_port_count: Option<u32>,
    pub timestamp_frequency: Option<u32>,
    pub firmware_revision: Option<String>,
    pub device_part_number: Option<String>,
    pub device_serial_number: Option<String>,
    pub calibration: Option<Vec<CalibrationPair>>,
}

impl DeviceConfig {
    /// Fill `slot` with a non-zero value unless already set. Returns whether
    /// the value counted as observed.
    pub(crate) fn merge_number(slot: &mut Option<u32>, value: u32) -> bool {
        if value == 0 {
            return false;
        }
        if slot.is_none() {
            *slot = Some(value);
        }
        true
    }

    /// Fill `slot` with a non-empty string unless already set. Returns
    /// whether the value counted as observed.
    pub(crate) fn merge_string(slot: &mut Option<String>, value: &str) -> bool {
        if value.is_empty() {
            return false;
        }
        if slot.is_none() {
            *slot = Some(value.to_string());
        }
        true
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ParseProgress {
    pub bytes_read: u64,
    pub messages_read: u64,
}

pub type ProgressFn = Box<dyn FnMut(ParseProgress) + Send>;

/// Options shared by all SD log parsers.
pub struct SdParserOptions {
    /// Anchor for the first sample; falls back to a date derived from the
    /// file name, then to the current time.
    pub session_start_time: Option<DateTime<Utc>>,
    /// Caller-known configuration; its fields win over anything observed in
    /// the file.
    pub config_override: Option<DeviceConfig>,
    /// Tick frequency to assume when the file does not state one.
    pub fallback_timestamp_frequency: Option<u32>,
    pub buffer_size: usize,
    pub progress: Option<ProgressFn>,
    pub cancel: Option<CancellationToken>,
}

impl Default for SdParserOptions {
    fn default() -> Self {
        SdParserOptions {
            session_start_time: None,
            config_override: None,
            fallback_timestamp_frequency: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            progress: None,
            cancel: None,
        }
    }
}

impl SdParserOptions {
    pub(crate) fn validate(&self) -> Result<(), SdParseError> {
        if self.buffer_size == 0 {
            return Err(SdParseError::InvalidArgument(
                "buffer_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

static LOG_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^log_(\d{8})_(\d{6})\.[A-Za-z0-9]+$").unwrap());

/// Derive the session date from a `log_YYYYMMDD_HHMMSS.*` file name.
pub fn log_name_date(file_name: &str) -> Option<NaiveDateTime> {
    let captures = LOG_NAME_RE.captures(file_name)?;
    NaiveDateTime::parse_from_str(
        &format!("{}_{}", &captures[1], &captures[2]),
        "%Y%m%d_%H%M%S",
    )
    .ok()
}

/// Anchor precedence: explicit session start, then the file-name date.
/// `None` means "current time at first sample".
pub(crate) fn resolve_anchor(
    session_start_time: Option<DateTime<Utc>>,
    file_name: &str,
) -> Option<DateTime<Utc>> {
    session_start_time.or_else(|| log_name_date(file_name).map(|d| d.and_utc()))
}

/// Anchored tick-to-wall-clock advance shared by the SD parsers. The first
/// sample lands on the anchor; later samples advance by the tick delta when a
/// tick frequency is known, and repeat the previous wall-clock otherwise.
#[derive(Debug, Default)]
pub(crate) struct TickAdvance {
    prev_tick: Option<u32>,
    wall: Option<DateTime<Utc>>,
}

impl TickAdvance {
    pub(crate) fn next(
        &mut self,
        tick: Option<u32>,
        anchor: Option<DateTime<Utc>>,
        frequency: Option<u32>,
    ) -> DateTime<Utc> {
        let wall = match self.wall {
            None => anchor.unwrap_or_else(Utc::now),
            Some(prev_wall) => {
                match (self.prev_tick, tick, frequency) {
                    (Some(prev), Some(tick), Some(freq)) if freq > 0 => {
                        let (_, seconds, _) = clock::tick_delta(prev, tick, 1.0 / f64::from(freq));
                        prev_wall + chrono::TimeDelta::nanoseconds((seconds * 1e9).round() as i64)
                    }
                    _ => prev_wall,
                }
            }
        };
        self.wall = Some(wall);
        if tick.is_some() {
            self.prev_tick = tick;
        }
        wall
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Binary,
    Json,
    Csv,
}

impl LogFormat {
    /// Extension-based routing: `bin`/`dat` are binary, `json` and `csv`
    /// their own formats.
    pub fn from_file_name(file_name: &str) -> Option<LogFormat> {
        let extension = file_name.rsplit_once('.')?.1;
        match extension.to_ascii_lowercase().as_str() {
            "bin" | "dat" => Some(LogFormat::Binary),
            "json" => Some(LogFormat::Json),
            "csv" => Some(LogFormat::Csv),
            _ => None,
        }
    }
}

/// A parsed session over any of the three on-device formats. Samples are
/// yielded in file order and may be enumerated at most once.
pub enum SdLogReader<R: AsyncRead + Unpin> {
    Binary(SdBinaryParser<R>),
    Json(SdJsonParser<R>),
    Csv(SdCsvParser<R>),
}

/// Route a log file to its parser by extension.
pub fn open_log<R: AsyncRead + Unpin>(
    file_name: &str,
    reader: R,
    options: SdParserOptions,
) -> Result<SdLogReader<R>, SdParseError> {
    match LogFormat::from_file_name(file_name) {
        Some(LogFormat::Binary) => Ok(SdLogReader::Binary(SdBinaryParser::new(
            file_name, reader, options,
        )?)),
        Some(LogFormat::Json) => Ok(SdLogReader::Json(SdJsonParser::new(
            file_name, reader, options,
        )?)),
        Some(LogFormat::Csv) => Ok(SdLogReader::Csv(SdCsvParser::new(
            file_name, reader, options,
        )?)),
        None => Err(SdParseError::UnknownFormat(file_name.to_string())),
    }
}

impl<R: AsyncRead + Unpin> SdLogReader<R> {
    pub fn format(&self) -> LogFormat {
        match self {
            SdLogReader::Binary(_) => LogFormat::Binary,
            SdLogReader::Json(_) => LogFormat::Json,
            SdLogReader::Csv(_) => LogFormat::Csv,
        }
    }

    pub fn file_name(&self) -> &str {
        match self {
            SdLogReader::Binary(p) => p.file_name(),
            SdLogReader::Json(p) => p.file_name(),
            SdLogReader::Csv(p) => p.file_name(),
        }
    }

    pub fn created_date(&self) -> Option<NaiveDateTime> {
        match self {
            SdLogReader::Binary(p) => p.created_date(),
            SdLogReader::Json(p) => p.created_date(),
            SdLogReader::Csv(p) => p.created_date(),
        }
    }

    /// Configuration merged from everything observed so far; grows as the
    /// sample sequence is consumed.
    pub fn config(&self) -> Option<&DeviceConfig> {
        match self {
            SdLogReader::Binary(p) => p.config(),
            SdLogReader::Json(p) => p.config(),
            SdLogReader::Csv(p) => p.config(),
        }
    }

    pub async fn next_sample(&mut self) -> Result<Option<LogSample>, SdParseError> {
        match self {
            SdLogReader::Binary(p) => p.next_sample().await,
            SdLogReader::Json(p) => p.next_sample().await,
            SdLogReader::Csv(p) => p.next_sample().await,
        }
    }

    pub fn as_stream(&mut self) -> impl TryStream<Ok = LogSample, Error = SdParseError> + '_ {
        futures::stream::try_unfold(self, |reader| async {
            match reader.next_sample().await? {
                Some(sample) => Ok(Some((sample, reader))),
                None => Ok(None),
            }
        })
    }

    /// Drain the sample sequence into memory.
    pub async fn collect_samples(&mut self) -> Result<Vec<LogSample>, SdParseError> {
        let mut samples = Vec::new();
        while let Some(sample) = self.next_sample().await? {
            samples.push(sample);
        }
        Ok(samples)
    }
}
