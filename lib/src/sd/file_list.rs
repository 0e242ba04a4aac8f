//! Directory-listing responses from the device's SD card: one path per line,
//! possibly with leading directory segments, possibly interleaved with SCPI
//! error lines.

use std::sync::LazyLock;

use chrono::NaiveDateTime;
use regex::Regex;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SdFileEntry {
    pub file_name: String,
    /// Derived from `log_YYYYMMDD_HHMMSS.(bin|json|dat)` names.
    pub created_date: Option<NaiveDateTime>,
}

static LOG_FILE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^log_(\d{8})_(\d{6})\.(bin|json|dat)$").unwrap());

/// Parse a directory listing line by line. Empty lines and device error
/// responses are dropped; leading path segments are stripped.
pub fn parse_file_list<'a>(lines: impl IntoIterator<Item = &'a str>) -> Vec<SdFileEntry> {
    let mut entries = Vec::new();
    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.to_ascii_uppercase().contains("**ERROR") {
            continue;
        }
        let file_name = match line.rsplit_once('/') {
            Some((_, name)) => name,
            None => line,
        };
        if file_name.is_empty() {
            continue;
        }
        entries.push(SdFileEntry {
            file_name: file_name.to_string(),
            created_date: derive_created_date(file_name),
        });
    }
    entries
}

pub fn parse_file_listing(text: &str) -> Vec<SdFileEntry> {
    parse_file_list(text.lines())
}

fn derive_created_date(file_name: &str) -> Option<NaiveDateTime> {
    let captures = LOG_FILE_RE.captures(file_name)?;
    NaiveDateTime::parse_from_str(
        &format!("{}_{}", &captures[1], &captures[2]),
        "%Y%m%d_%H%M%S",
    )
    .ok()
}
