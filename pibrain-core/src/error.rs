//! Error types for pibrain-core.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Main error type for the pibrain-core library.
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Node or job not found
    #[error("not found: {0}")]
    NotFound(String),

    /// A job or node payload failed validation
    #[error("validation error: {0}")]
    Validation(String),

    /// An analyzer / embedding provider call failed
    #[error("analyzer error: {0}")]
    Analyzer(String),
}

/// Result type alias for pibrain-core.
pub type Result<T> = std::result::Result<T, Error>;

/// Retry classification for job and analyzer failures.
///
/// Mirrors the three-way taxonomy used throughout the worker pipeline:
/// transient failures are retried with backoff, permanent failures are
/// terminal, and unknown failures get exactly one retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Transient,
    Permanent,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

impl std::str::FromStr for ErrorCategory {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "transient" => Ok(ErrorCategory::Transient),
            "permanent" => Ok(ErrorCategory::Permanent),
            "unknown" => Ok(ErrorCategory::Unknown),
            other => Err(Error::Validation(format!("unknown error category: {other}"))),
        }
    }
}

/// Closed set of reason tags used across the worker, analyzer contract, and
/// storage engine. Kept as a string newtype rather than an enum because new
/// reasons are appended by external callers (the analyzer, the embedding
/// provider) that this crate does not control the vocabulary of end to end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reason(pub String);

impl Reason {
    pub const IO: &'static str = "io";
    pub const NETWORK: &'static str = "network";
    pub const TIMEOUT: &'static str = "timeout";
    pub const RATE_LIMIT: &'static str = "rate_limit";
    pub const ANALYZER_FAILED: &'static str = "analyzer_failed";
    pub const VALIDATION: &'static str = "validation";
    pub const SCHEMA: &'static str = "schema";
    pub const FILE_NOT_FOUND: &'static str = "file_not_found";
    pub const INVALID_SESSION: &'static str = "invalid_session";
    pub const ENVIRONMENT: &'static str = "environment";
    pub const INTERNAL: &'static str = "internal";

    pub fn new(s: impl Into<String>) -> Self {
        Reason(s.into())
    }
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A classified error carried through the worker pipeline instead of being
/// thrown. Workers dispatch on `category` to decide retry vs. terminal
/// failure; `reason` and `message` are what gets persisted on the job row
/// and in the error log.
#[derive(Debug, Clone)]
pub struct ClassifiedError {
    pub category: ErrorCategory,
    pub reason: Reason,
    pub message: String,
    pub stack: Option<String>,
}

impl ClassifiedError {
    pub fn transient(reason: &str, message: impl Into<String>) -> Self {
        ClassifiedError {
            category: ErrorCategory::Transient,
            reason: Reason::new(reason),
            message: message.into(),
            stack: None,
        }
    }

    pub fn permanent(reason: &str, message: impl Into<String>) -> Self {
        ClassifiedError {
            category: ErrorCategory::Permanent,
            reason: Reason::new(reason),
            message: message.into(),
            stack: None,
        }
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        ClassifiedError {
            category: ErrorCategory::Unknown,
            reason: Reason::new(Reason::INTERNAL),
            message: message.into(),
            stack: None,
        }
    }

    /// `createTypedError` equivalent: programmatically build an error whose
    /// category prefix survives serialization (`TransientError: …`).
    pub fn create_typed(message: impl Into<String>, category: ErrorCategory) -> Self {
        ClassifiedError {
            category,
            reason: Reason::new(Reason::INTERNAL),
            message: message.into(),
            stack: None,
        }
    }

    /// Parses an explicit type-tag prefix (`TransientError: …` /
    /// `PermanentError: …`) off a raw error string, falling back to a
    /// pattern table over the message, and finally `Unknown`.
    pub fn classify(raw: &str) -> Self {
        if let Some(rest) = raw.strip_prefix("TransientError: ") {
            return ClassifiedError::transient(Reason::INTERNAL, rest.to_string());
        }
        if let Some(rest) = raw.strip_prefix("PermanentError: ") {
            return ClassifiedError::permanent(Reason::INTERNAL, rest.to_string());
        }

        let lower = raw.to_ascii_lowercase();
        let transient_patterns = ["network", "timeout", "rate limit", "connection reset"];
        let permanent_patterns = ["file not found", "invalid session", "validation"];

        if transient_patterns.iter().any(|p| lower.contains(p)) {
            return ClassifiedError::transient(Reason::NETWORK, raw.to_string());
        }
        if permanent_patterns.iter().any(|p| lower.contains(p)) {
            return ClassifiedError::permanent(Reason::VALIDATION, raw.to_string());
        }

        ClassifiedError::unknown(raw.to_string())
    }

    /// `classifyErrorWithContext`: decides whether a job should be retried
    /// given the current retry count and policy.
    pub fn should_retry(&self, retry_count: u32, max_retries: u32) -> bool {
        let eligible = matches!(self.category, ErrorCategory::Transient)
            || (matches!(self.category, ErrorCategory::Unknown) && retry_count == 0);
        eligible && retry_count < max_retries
    }

    /// Serializes to the pipe-joined line format
    /// `[ISO-timestamp | category | reason | message | stack?]`.
    pub fn to_stored_line(&self, at: DateTime<Utc>) -> String {
        let escape = |s: &str| s.replace('|', "\\|").replace('\n', "\\n");
        let mut fields = vec![
            at.to_rfc3339(),
            self.category.as_str().to_string(),
            escape(&self.reason.0),
            escape(&self.message),
        ];
        if let Some(stack) = &self.stack {
            fields.push(escape(stack));
        }
        fields.join("|")
    }

    /// `parseStoredError`: round-trips the pipe-joined storage format.
    pub fn parse_stored_line(line: &str) -> Result<(DateTime<Utc>, Self)> {
        let unescape = |s: &str| s.replace("\\n", "\n").replace("\\|", "|");
        let fields = split_unescaped(line);
        if fields.len() < 4 {
            return Err(Error::Validation(format!(
                "malformed stored error line: {line}"
            )));
        }
        let at = DateTime::parse_from_rfc3339(&fields[0])
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| Error::Validation(format!("bad timestamp in stored error: {e}")))?;
        let category: ErrorCategory = fields[1].parse()?;
        let reason = Reason::new(unescape(&fields[2]));
        let message = unescape(&fields[3]);
        let stack = fields.get(4).map(|s| unescape(s));
        Ok((
            at,
            ClassifiedError {
                category,
                reason,
                message,
                stack,
            },
        ))
    }
}

/// Splits a pipe-joined line on unescaped `|` characters.
fn split_unescaped(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(&next) = chars.peek() {
                current.push(c);
                current.push(next);
                chars.next();
                continue;
            }
        }
        if c == '|' {
            fields.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    fields.push(current);
    fields
}

/// Exponential backoff policy for transient retries.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay_sec: f64,
    pub max_delay_sec: f64,
    pub jitter_ratio: f64,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            base_delay_sec: 5.0,
            max_delay_sec: 3600.0,
            jitter_ratio: 0.1,
            max_retries: 5,
        }
    }
}

/// `calculateRetryDelay`: `min(base * 2^n * (1 +/- jitter), maxDelay)`.
///
/// `jitter_sample` is a caller-supplied value in `[-1, 1]` so the function
/// stays deterministic and testable; callers pass `0.0` for no jitter and a
/// `rand`-backed sample in production.
pub fn calculate_retry_delay_secs(n: u32, policy: &RetryPolicy, jitter_sample: f64) -> f64 {
    let exp = policy.base_delay_sec * 2f64.powi(n as i32);
    let jittered = exp * (1.0 + policy.jitter_ratio * jitter_sample.clamp(-1.0, 1.0));
    jittered.min(policy.max_delay_sec).max(0.0)
}

/// Minute-granularity helper for queue `availableAt` scheduling.
pub fn calculate_retry_delay_minutes(n: u32, policy: &RetryPolicy) -> i64 {
    (calculate_retry_delay_secs(n, policy, 0.0) / 60.0).ceil() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_respects_explicit_prefix() {
        let err = ClassifiedError::classify("PermanentError: invalid schema");
        assert_eq!(err.category, ErrorCategory::Permanent);
    }

    #[test]
    fn classify_falls_back_to_pattern_table() {
        let err = ClassifiedError::classify("connection reset by peer");
        assert_eq!(err.category, ErrorCategory::Transient);
    }

    #[test]
    fn classify_unknown_retries_once() {
        let err = ClassifiedError::classify("something weird happened");
        assert_eq!(err.category, ErrorCategory::Unknown);
        assert!(err.should_retry(0, 5));
        assert!(!err.should_retry(1, 5));
    }

    #[test]
    fn permanent_never_retries() {
        let err = ClassifiedError::permanent(Reason::VALIDATION, "bad");
        assert!(!err.should_retry(0, 5));
    }

    #[test]
    fn backoff_is_monotonic_and_exact_without_jitter() {
        let policy = RetryPolicy {
            base_delay_sec: 2.0,
            max_delay_sec: 100.0,
            jitter_ratio: 0.0,
            max_retries: 10,
        };
        let mut prev = 0.0;
        for n in 0..8 {
            let delay = calculate_retry_delay_secs(n, &policy, 0.0);
            assert!(delay >= prev);
            prev = delay;
        }
        assert_eq!(calculate_retry_delay_secs(3, &policy, 0.0), (2.0 * 8.0).min(100.0));
    }

    #[test]
    fn stored_error_round_trips() {
        let err = ClassifiedError::transient(Reason::TIMEOUT, "analyzer timed out after 10m");
        let at = Utc::now();
        let line = err.to_stored_line(at);
        let (parsed_at, parsed) = ClassifiedError::parse_stored_line(&line).unwrap();
        assert_eq!(parsed.category, ErrorCategory::Transient);
        assert_eq!(parsed.message, err.message);
        assert_eq!(parsed_at.timestamp(), at.timestamp());
    }

    #[test]
    fn stored_error_escapes_pipe_in_message() {
        let err = ClassifiedError::permanent(Reason::VALIDATION, "bad field: a|b");
        let line = err.to_stored_line(Utc::now());
        let (_, parsed) = ClassifiedError::parse_stored_line(&line).unwrap();
        assert_eq!(parsed.message, "bad field: a|b");
    }
}
