//! Firmware version strings: `1.2.3`, `v3.0.1rc2`, `2.1b1`, …
//!
//! Versions order by their numeric triple first, then by pre-release tier
//! (a release outranks any pre-release of the same triple), then by the
//! pre-release number. Equality follows the same precedence, so `1.0a1` and
//! `1.0alpha1` compare equal.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    /// Lowercased pre-release label; empty for a release.
    pub label: String,
    pub number: u32,
}

impl FirmwareVersion {
    /// Parse `MAJOR(.MINOR(.PATCH)?)?(LABEL NUM?)?` with an optional leading
    /// `v`/`V` and an optional `-`/`_` before the label. Returns `None` for
    /// anything outside the grammar.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        let mut rest = s.strip_prefix(['v', 'V']).unwrap_or(s);

        let major = take_number(&mut rest)?;
        let mut minor = 0;
        let mut patch = 0;
        if let Some(r) = rest.strip_prefix('.') {
            rest = r;
            minor = take_number(&mut rest)?;
            if let Some(r) = rest.strip_prefix('.') {
                rest = r;
                patch = take_number(&mut rest)?;
            }
        }

        let mut label = String::new();
        let mut number = 0;
        if !rest.is_empty() {
            rest = rest.strip_prefix(['-', '_']).unwrap_or(rest);
            label = take_label(&mut rest)?;
            if !rest.is_empty() {
                number = take_number(&mut rest)?;
            }
        }
        if !rest.is_empty() {
            return None;
        }

        Some(FirmwareVersion {
            major,
            minor,
            patch,
            label,
            number,
        })
    }

    pub fn is_release(&self) -> bool {
        self.label.is_empty()
    }

    fn label_rank(&self) -> u8 {
        match self.label.as_str() {
            "" => 3,
            "rc" => 2,
            "beta" | "b" => 1,
            _ => 0,
        }
    }
}

fn take_number(rest: &mut &str) -> Option<u32> {
    let end = rest
        .as_bytes()
        .iter()
        .position(|b| !b.is_ascii_digit())
        .unwrap_or(rest.len());
    if end == 0 {
        return None;
    }
    let value = rest[..end].parse().ok()?;
    *rest = &rest[end..];
    Some(value)
}

fn take_label(rest: &mut &str) -> Option<String> {
    let end = rest
        .as_bytes()
        .iter()
        .position(|b| !b.is_ascii_alphabetic())
        .unwrap_or(rest.len());
    if end == 0 {
        return None;
    }
    let label = rest[..end].to_ascii_lowercase();
    *rest = &rest[end..];
    Some(label)
}

impl PartialEq for FirmwareVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FirmwareVersion {}

impl PartialOrd for FirmwareVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FirmwareVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch, self.label_rank(), self.number).cmp(&(
            other.major,
            other.minor,
            other.patch,
            other.label_rank(),
            other.number,
        ))
    }
}

impl std::fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if !self.label.is_empty() {
            write!(f, "{}{}", self.label, self.number)?;
        }
        Ok(())
    }
}

/// Compare two version strings. Unparseable strings sort strictly before any
/// parseable one; two unparseable strings compare equal.
pub fn compare_version_strings(a: &str, b: &str) -> Ordering {
    match (FirmwareVersion::parse(a), FirmwareVersion::parse(b)) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => Ordering::Equal,
    }
}
