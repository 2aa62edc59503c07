use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

/// UK-style current format, e.g. `LE75 CFG`
static UK_STYLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z]{2}[0-9]{2} [A-Z]{3}$").expect("valid regex"));

/// Two-digit region code, a series letter and a 4-5 digit number, e.g. `24-A 83878`
static REGIONAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]{2}[ -]?[A-Z][ -]?[0-9]{4,5}$").expect("valid regex"));

/// Badge and trim tokens that are never plates, even when they mix letters and digits.
pub const DEFAULT_DENY_LIST: &[&str] = &[
    "EV9", "EV6", "EV3", "EV5", "ID.4", "ID4", "IX3", "I4", "I7", "GT", "GTI", "GTD", "GTE",
    "AMG", "TDI", "TSI", "TFSI", "HDI", "CRDI", "4MATIC", "4MOTION", "XDRIVE", "SDRIVE",
    "QUATTRO", "HYBRID", "PHEV", "AWD", "4X4", "4WD", "V6", "V8", "V12", "M340I", "RS6",
    "RS3", "S-LINE", "TURBO", "SPORT", "SE", "GLE", "GLC", "CX-5", "CX-30", "RAV4", "Q5",
    "Q7", "X5", "X3", "500E",
];

/// Layout a plate-like string matched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlateFormat {
    UkStyle,
    Regional,
    Generic,
}

/// Why a string was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Empty,
    PureLetters,
    ShortDigits,
    DenyListed,
    NoFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlateVerdict {
    Plate(PlateFormat),
    Rejected(Rejection),
}

impl PlateVerdict {
    pub fn is_plate(&self) -> bool {
        matches!(self, PlateVerdict::Plate(_))
    }
}

/// Rule-based "does this text look like a license plate" filter.
#[derive(Debug, Clone)]
pub struct PlateClassifier {
    deny_list: HashSet<String>,
}

impl Default for PlateClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_DENY_LIST.iter().copied())
    }
}

impl PlateClassifier {
    pub fn new<I, S>(deny_list: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            deny_list: deny_list
                .into_iter()
                .map(|s| s.as_ref().trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    pub fn is_plate_like(&self, text: &str) -> bool {
        self.classify(text).is_plate()
    }

    pub fn classify(&self, text: &str) -> PlateVerdict {
        let normalized = text.trim().to_uppercase();
        if normalized.is_empty() {
            return PlateVerdict::Rejected(Rejection::Empty);
        }

        let compact: Vec<char> = normalized.chars().filter(|c| !is_separator(*c)).collect();
        if compact.is_empty() {
            return PlateVerdict::Rejected(Rejection::Empty);
        }
        if compact.iter().all(|c| c.is_alphabetic()) {
            return PlateVerdict::Rejected(Rejection::PureLetters);
        }
        if compact.iter().all(|c| c.is_ascii_digit()) && compact.len() < 4 {
            return PlateVerdict::Rejected(Rejection::ShortDigits);
        }
        if self.deny_list.contains(&normalized) {
            return PlateVerdict::Rejected(Rejection::DenyListed);
        }

        if UK_STYLE.is_match(&normalized) {
            PlateVerdict::Plate(PlateFormat::UkStyle)
        } else if REGIONAL.is_match(&normalized) {
            PlateVerdict::Plate(PlateFormat::Regional)
        } else if is_generic_plate(&normalized) {
            PlateVerdict::Plate(PlateFormat::Generic)
        } else {
            PlateVerdict::Rejected(Rejection::NoFormat)
        }
    }
}

fn is_separator(c: char) -> bool {
    c.is_whitespace() || c == '-'
}

/// Fallback: at least 5 characters, letters and digits mixed, at most one separator.
fn is_generic_plate(normalized: &str) -> bool {
    if normalized.chars().count() < 5 {
        return false;
    }
    let separators = normalized.chars().filter(|c| is_separator(*c)).count();
    if separators > 1 {
        return false;
    }
    let only_plate_chars = normalized
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || is_separator(c));
    let has_letter = normalized.chars().any(|c| c.is_ascii_alphabetic());
    let has_digit = normalized.chars().any(|c| c.is_ascii_digit());
    only_plate_chars && has_letter && has_digit
}
