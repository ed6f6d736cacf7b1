//! Parsing error and warning types
//!
//! Parsing a notice page never fails as a whole: a missing or malformed
//! block becomes a `ParseWarning` and the rest of the page is still
//! extracted. `ParsingError` is reserved for setting the parser up.

use std::fmt;
use thiserror::Error;

use crate::domain::PageKind;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParsingError {
    #[error("Invalid CSS selector: {selector} - {reason}")]
    InvalidSelector { selector: String, reason: String },

    #[error("Invalid pattern: {pattern} - {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

impl ParsingError {
    pub fn invalid_selector(selector: &str, reason: impl fmt::Display) -> Self {
        Self::InvalidSelector {
            selector: selector.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn invalid_pattern(pattern: &str, reason: impl fmt::Display) -> Self {
        Self::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Non-fatal extraction problem on one page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseWarning {
    pub page: PageKind,
    pub message: String,
}

impl ParseWarning {
    pub fn new(page: PageKind, message: impl Into<String>) -> Self {
        Self {
            page,
            message: message.into(),
        }
    }
}

impl fmt::Display for ParseWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.page, self.message)
    }
}

pub type ParsingResult<T> = Result<T, ParsingError>;
