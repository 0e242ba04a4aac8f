//! Line-delimited JSON SD logs: one `{"ts", "analog", "digital"}` object per
//! line. Malformed lines are skipped so a log truncated by a power loss still
//! yields everything before the damage.

use chrono::{DateTime, NaiveDateTime, Utc};
use futures::TryStream;
use log::warn;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio_util::sync::CancellationToken;

use super::{
    DeviceConfig, LogSample, ParseProgress, PROGRESS_MESSAGE_INTERVAL, ProgressFn, SdParseError,
    SdParserOptions, TickAdvance,
};

#[derive(Debug, Deserialize)]
struct JsonRow {
    ts: u32,
    analog: Vec<f64>,
    digital: String,
}

pub struct SdJsonParser<R: AsyncRead + Unpin> {
    reader: BufReader<R>,
    line: String,
    file_name: String,
    created_date: Option<NaiveDateTime>,
    finished: bool,

    anchor: Option<DateTime<Utc>>,
    frequency: Option<u32>,
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

impl<R: AsyncRead + Unpin> SdJsonParser<R> {
    pub fn new(
        file_name: &str,
        reader: R,
        mut options: SdParserOptions,
    ) -> Result<Self, SdParseError> {
        options.validate()?;
        let config = options.config_override.clone().unwrap_or_default();
        Ok(SdJsonParser {
            reader: BufReader::with_capacity(options.buffer_size, reader),
            line: String::new(),
            file_name: file_name.to_string(),
            created_date: super::log_name_date(file_name),
            finished: false,
            anchor: super::resolve_anchor(options.session_start_time, file_name),
            frequency: config
                .timestamp_frequency
                .or(options.fallback_timestamp_frequency),
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

    pub fn config(&self) -> Option<&DeviceConfig> {
        self.has_config.then_some(&self.config)
    }

    pub async fn next_sample(&mut self) -> Result<Option<LogSample>, SdParseError> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(SdParseError::Cancelled);
            }
            if self.finished {
                self.report_progress(true);
                return Ok(None);
            }

            self.line.clear();
            let read = self.reader.read_line(&mut self.line).await?;
            if read == 0 {
                self.finished = true;
                continue;
            }
            self.bytes_read += read as u64;

            let line = self.line.trim();
            if line.is_empty() {
                continue;
            }

            let row: JsonRow = match serde_json::from_str(line) {
                Ok(row) => row,
                Err(error) => {
                    warn!("skipping malformed JSON line: {error}");
                    continue;
                }
            };
            let Some(digital_data) = parse_digital(&row.digital) else {
                warn!("skipping line with malformed digital word {:?}", row.digital);
                continue;
            };

            self.messages_read += 1;
            self.observe_sample(&row);
            let timestamp = self.ticks.next(Some(row.ts), self.anchor, self.frequency);
            self.report_progress(false);
            return Ok(Some(LogSample {
                timestamp,
                analog_values: row.analog,
                analog_timestamps: None,
                digital_data,
            }));
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

    /// A session with at least one sample exposes a configuration: the
    /// channel count comes from the first sample, the tick frequency from
    /// the caller's fallback.
    fn observe_sample(&mut self, row: &JsonRow) {
        self.has_config = true;
        DeviceConfig::merge_number(
            &mut self.config.analog_port_count,
            row.analog.len() as u32,
        );
        if let Some(fallback) = self.fallback_frequency {
            DeviceConfig::merge_number(&mut self.config.timestamp_frequency, fallback);
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

/// Digital word as dash-joined hex byte tokens, first token least
/// significant; an empty string is zero.
fn parse_digital(s: &str) -> Option<u32> {
    let s = s.trim();
    if s.is_empty() {
        return Some(0);
    }
    let mut word = 0u32;
    for (i, token) in s.split('-').enumerate() {
        let byte = u8::from_str_radix(token, 16).ok()?;
        if i < 4 {
            word |= u32::from(byte) << (8 * i);
        }
    }
    Some(word)
}
