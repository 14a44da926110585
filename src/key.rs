//! Geographic key normalization.
//!
//! Source datasets identify counties inconsistently: zero-padded or not,
//! as a separate state/county pair, or embedded in a 12-digit census block
//! group code. [`KeyNormalizer`] turns all of these into a fixed-width
//! [`GeoKey`].

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

use crate::error::RecordError;

/// Width of a county FIPS key (2-digit state + 3-digit county).
pub const COUNTY_KEY_WIDTH: usize = 5;
pub const STATE_WIDTH: usize = 2;
pub const COUNTY_WIDTH: usize = 3;
/// Width of a census block group code.
pub const BLOCK_GROUP_WIDTH: usize = 12;

/// A normalized, fixed-width, all-digit geographic key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct GeoKey(String);

impl GeoKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for GeoKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GeoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a single-field identifier becomes a key.
///
/// Chosen by the caller from the known granularity of the source, never
/// detected from the data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyMode {
    /// Left-pad with `'0'` up to the key width.
    #[default]
    Pad,
    /// Keep the leading key-width digits of a finer-grained code.
    Truncate,
}

/// A geographic identifier as it appears in a source row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawKey {
    Code(String),
    StateCounty { state: String, county: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyNormalizer {
    width: usize,
    mode: KeyMode,
    source_width: Option<usize>,
}

impl Default for KeyNormalizer {
    fn default() -> Self {
        Self::county()
    }
}

impl KeyNormalizer {
    pub fn new(width: usize, mode: KeyMode) -> Self {
        Self {
            width,
            mode,
            source_width: None,
        }
    }

    /// Pad-mode normalizer for 5-digit county keys.
    pub fn county() -> Self {
        Self::new(COUNTY_KEY_WIDTH, KeyMode::Pad)
    }

    /// In truncate mode, left-pad codes to `source_width` before truncating.
    ///
    /// Block group codes stored as integers lose their leading zero
    /// (`"10010001001"` for Alabama), and truncating those directly would
    /// shift every digit of the county key.
    pub fn with_source_width(mut self, source_width: Option<usize>) -> Self {
        self.source_width = source_width;
        self
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn mode(&self) -> KeyMode {
        self.mode
    }

    pub fn normalize(&self, raw: &RawKey) -> Result<GeoKey, RecordError> {
        match raw {
            RawKey::Code(code) => match self.mode {
                KeyMode::Pad => self.pad(code),
                KeyMode::Truncate => self.truncate(code),
            },
            RawKey::StateCounty { state, county } => self.concat(state, county),
        }
    }

    pub fn pad(&self, raw: &str) -> Result<GeoKey, RecordError> {
        let digits = digits(raw)?;
        if digits.len() > self.width {
            return Err(malformed(raw, "wider than key width"));
        }
        Ok(GeoKey(format!("{:0>width$}", digits, width = self.width)))
    }

    pub fn pad_number(&self, value: u64) -> Result<GeoKey, RecordError> {
        self.pad(&value.to_string())
    }

    pub fn truncate(&self, raw: &str) -> Result<GeoKey, RecordError> {
        let digits = digits(raw)?;
        let restored = match self.source_width {
            Some(source_width) if digits.len() > source_width => {
                return Err(malformed(raw, "wider than source width"));
            }
            Some(source_width) => format!("{:0>width$}", digits, width = source_width),
            None => digits.to_string(),
        };
        if restored.len() < self.width {
            return Err(malformed(raw, "narrower than key width"));
        }
        Ok(GeoKey(restored[..self.width].to_string()))
    }

    /// Joins a state code (up to 2 digits) and county code (up to 3 digits).
    pub fn concat(&self, state: &str, county: &str) -> Result<GeoKey, RecordError> {
        let state_digits = digits(state)?;
        let county_digits = digits(county)?;
        if state_digits.len() > STATE_WIDTH {
            return Err(malformed(state, "state code wider than 2 digits"));
        }
        if county_digits.len() > COUNTY_WIDTH {
            return Err(malformed(county, "county code wider than 3 digits"));
        }
        let joined = format!(
            "{:0>sw$}{:0>cw$}",
            state_digits,
            county_digits,
            sw = STATE_WIDTH,
            cw = COUNTY_WIDTH
        );
        self.pad(&joined)
    }
}

fn digits(raw: &str) -> Result<&str, RecordError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(malformed(raw, "empty"));
    }
    if !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed(raw, "non-numeric"));
    }
    Ok(trimmed)
}

fn malformed(raw: &str, reason: &'static str) -> RecordError {
    RecordError::MalformedKey {
        raw: raw.to_string(),
        reason,
    }
}
