//! Comment-headered CSV SD logs. A `#` block carries device identity and the
//! tick rate, a `ch0_ts,ch0_val,…` header names the channels, and every data
//! row holds one `(tick, value)` pair per channel. Bad rows are skipped.

use chrono::{DateTime, NaiveDateTime, Utc};
use futures::TryStream;
use log::warn;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio_util::sync::CancellationToken;

use super::{
    DeviceConfig, LogSample, ParseProgress, PROGRESS_MESSAGE_INTERVAL, ProgressFn, SdParseError,
    SdParserOptions, TickAdvance,
};

pub struct SdCsvParser<R: AsyncRead + Unpin> {
    reader: BufReader<R>,
    line: String,
    file_name: String,
    created_date: Option<NaiveDateTime>,
    header_parsed: bool,
    expected_columns: usize,
    finished: bool,

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

impl<R: AsyncRead + Unpin> SdCsvParser<R> {
    pub fn new(
        file_name: &str,
        reader: R,
        mut options: SdParserOptions,
    ) -> Result<Self, SdParseError> {
        options.validate()?;
        let config = options.config_override.clone().unwrap_or_default();
        Ok(SdCsvParser {
            reader: BufReader::with_capacity(options.buffer_size, reader),
            line: String::new(),
            file_name: file_name.to_string(),
            created_date: super::log_name_date(file_name),
            header_parsed: false,
            expected_columns: 0,
            finished: false,
            anchor: super::resolve_anchor(options.session_start_time, file_name),
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

            let line = self.line.trim().to_string();
            if line.is_empty() {
                continue;
            }

            if !self.header_parsed {
                if let Some(comment) = line.strip_prefix('#') {
                    self.parse_comment(comment);
                } else {
                    self.parse_header(&line);
                }
                continue;
            }

            let Some((ticks, values)) = self.parse_row(&line) else {
                continue;
            };
            self.messages_read += 1;

            let frequency = self
                .override_frequency
                .or(self.file_frequency)
                .or(self.fallback_frequency);
            let timestamp = self
                .ticks
                .next(ticks.first().copied(), self.anchor, frequency);
            self.report_progress(false);
            return Ok(Some(LogSample {
                timestamp,
                analog_values: values,
                analog_timestamps: Some(ticks),
                digital_data: 0,
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

    /// Recognized comment keys, one `key: value` per line.
    fn parse_comment(&mut self, comment: &str) {
        let Some((key, value)) = comment.split_once(':') else {
            return;
        };
        let value = value.trim();
        match key.trim() {
            "Device" => {
                self.has_config |=
                    DeviceConfig::merge_string(&mut self.config.device_part_number, value);
            }
            "Serial Number" => {
                self.has_config |=
                    DeviceConfig::merge_string(&mut self.config.device_serial_number, value);
            }
            "Timestamp Tick Rate" => {
                let Some(rate) = parse_tick_rate(value) else {
                    warn!("unparseable tick rate comment {value:?}");
                    return;
                };
                self.has_config |=
                    DeviceConfig::merge_number(&mut self.config.timestamp_frequency, rate);
                if self.file_frequency.is_none() && rate > 0 {
                    self.file_frequency = Some(rate);
                }
            }
            _ => {}
        }
    }

    /// `ch0_ts,ch0_val,…` column header; channel count is half the columns.
    fn parse_header(&mut self, line: &str) {
        self.expected_columns = line.split(',').count();
        let channel_count = (self.expected_columns / 2) as u32;
        self.has_config |=
            DeviceConfig::merge_number(&mut self.config.analog_port_count, channel_count);
        self.header_parsed = true;
    }

    /// Alternating `(tick, value)` pairs; any malformed cell skips the row.
    fn parse_row(&self, line: &str) -> Option<(Vec<u32>, Vec<f64>)> {
        let cells: Vec<&str> = line.split(',').collect();
        if cells.len() != self.expected_columns || cells.len() % 2 != 0 {
            warn!("skipping row with {} columns, expected {}", cells.len(), self.expected_columns);
            return None;
        }
        let mut ticks = Vec::with_capacity(cells.len() / 2);
        let mut values = Vec::with_capacity(cells.len() / 2);
        for pair in cells.chunks_exact(2) {
            let Ok(tick) = pair[0].trim().parse::<u32>() else {
                warn!("skipping row with unparseable tick {:?}", pair[0]);
                return None;
            };
            let Ok(value) = pair[1].trim().parse::<f64>() else {
                warn!("skipping row with unparseable value {:?}", pair[1]);
                return None;
            };
            ticks.push(tick);
            values.push(value);
        }
        Some((ticks, values))
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

/// `"<integer> Hz"`, whitespace tolerated between the number and the unit.
fn parse_tick_rate(value: &str) -> Option<u32> {
    let digits_end = value
        .as_bytes()
        .iter()
        .position(|b| !b.is_ascii_digit())
        .unwrap_or(value.len());
    if digits_end == 0 {
        return None;
    }
    let rate = value[..digits_end].parse().ok()?;
    let unit = value[digits_end..].trim();
    if unit != "Hz" {
        return None;
    }
    Some(rate)
}
