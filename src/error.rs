//! Custom error types for sysrev.
//!
//! Every library function returns `Result<T, SysrevError>`. Source failures are
//! caught by the multi-source search and turned into warnings, so most of these
//! variants only surface to the caller when a single stage is run directly.

use thiserror::Error;

/// Main error type for sysrev operations.
#[derive(Debug, Error)]
pub enum SysrevError {
    /// Network/HTTP request error
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Malformed payload from an API or an input file
    #[error("Parse error: {0}")]
    Parse(String),

    /// Rate limited by external API
    #[error("Rate limited, retry after {0}s")]
    RateLimited(u64),

    /// External API returned a non-success status
    #[error("API error: {code} - {message}")]
    Api {
        /// HTTP status or API error code
        code: i32,
        /// Error message from API
        message: String,
    },

    /// Google Scholar served a CAPTCHA page instead of results
    #[error("CAPTCHA detected, refresh the scholar cookie or use a mirror")]
    Captcha,

    /// File I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV read/write error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Configuration error
    #[error("Config error: {0}")]
    Config(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Result type alias using `SysrevError`
pub type Result<T> = std::result::Result<T, SysrevError>;

/// Extension trait for adding context to Option types
pub trait OptionExt<T> {
    /// Convert Option to Result with a parse error message
    fn ok_or_parse(self, msg: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_parse(self, msg: &str) -> Result<T> {
        self.ok_or_else(|| SysrevError::Parse(msg.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_or_parse() {
        let missing: Option<i32> = None;
        let err = missing.ok_or_parse("no esearchresult").expect_err("should fail");
        assert_eq!(err.to_string(), "Parse error: no esearchresult");
        assert_eq!(Some(3).ok_or_parse("unused").ok(), Some(3));
    }
}
