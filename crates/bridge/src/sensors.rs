//! Extraction of custom sensor readings from free-form text messages.

use regex::Regex;

/// A sensor pattern compiled once, when its definition is validated.
#[derive(Debug, Clone)]
pub struct Matcher {
    on: Regex,
    off: Option<Regex>,
}

impl Matcher {
    /// Captures the first signed decimal that follows the pattern,
    /// case-insensitively at a word boundary.
    pub fn numeric(pattern: &str) -> Result<Self, regex::Error> {
        let on = Regex::new(&format!(r"(?i)\b{}\s*(-?\d+\.?\d*)", regex::escape(pattern)))?;
        Ok(Self { on, off: None })
    }

    /// Turns on for the pattern as a whole word or "detected", off for "cleared".
    pub fn binary(pattern: &str) -> Result<Self, regex::Error> {
        let on = Regex::new(&format!(r"(?i)\b(?:{}|detected)\b", regex::escape(pattern)))?;
        let off = Regex::new(r"(?i)\bcleared\b")?;
        Ok(Self { on, off: Some(off) })
    }

    pub fn reading(&self, text: &str) -> Option<f64> {
        self.on.captures(text)?.get(1)?.as_str().parse().ok()
    }

    /// `Some(true)` on a match, `Some(false)` when the text only says
    /// "cleared", `None` otherwise.
    pub fn signal(&self, text: &str) -> Option<bool> {
        if self.on.is_match(text) {
            Some(true)
        } else if self.off.as_ref().is_some_and(|off| off.is_match(text)) {
            Some(false)
        } else {
            None
        }
    }
}

impl PartialEq for Matcher {
    fn eq(&self, other: &Self) -> bool {
        self.on.as_str() == other.on.as_str()
    }
}

impl Eq for Matcher {}

/// Render a reading the way it is published: integral values keep one
/// decimal place ("21.0"), everything else prints as-is.
pub fn format_reading(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e16 {
        format!("{value:.1}")
    } else {
        value.to_string()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
