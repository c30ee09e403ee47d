//! Shared types for dlsession
//!
//! This crate contains the data structures that cross the boundary between
//! the coordination core and whatever relays its replies and events outward
//! (the stdio method channel, a UI bridge, tests).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// Identifiers
// ============================================================================

/// Opaque download identifier, rendered as 16 lowercase hex digits
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Gid(String);

impl Gid {
    pub fn from_u64(raw: u64) -> Self {
        Self(format!("{:016x}", raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Gid {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Gid {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

// ============================================================================
// Session Types
// ============================================================================

/// Scalar option value attached to a session at creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Bool(b) => write!(f, "{}", b),
            OptionValue::Int(i) => write!(f, "{}", i),
            OptionValue::Float(x) => write!(f, "{}", x),
            OptionValue::Str(s) => f.write_str(s),
        }
    }
}

/// Per-session options, ordered by key
pub type Options = BTreeMap<String, OptionValue>;

/// Lifecycle state of a download session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Pending,
    Active,
    Paused,
    Complete,
    Error,
    Removed,
}

impl SessionState {
    /// Complete and Error only ever move on to Removed
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Complete | SessionState::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Pending => "Pending",
            SessionState::Active => "Active",
            SessionState::Paused => "Paused",
            SessionState::Complete => "Complete",
            SessionState::Error => "Error",
            SessionState::Removed => "Removed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Byte counters of a transfer. `total` is `None` while the size is unknown
/// and travels as `-1`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub downloaded: u64,
    #[serde(with = "unknown_total_serde")]
    pub total: Option<u64>,
}

impl Progress {
    pub fn new(downloaded: u64, total: Option<u64>) -> Self {
        Self { downloaded, total }
    }

    /// Fold an engine report into these counters.
    ///
    /// Both counters never go backwards and `downloaded` never exceeds a
    /// known `total`. A reported total below the current total or below the
    /// bytes already counted is ignored, so a report can only complete the
    /// transfer against a total that did not shrink.
    pub fn merged(self, downloaded: u64, total: Option<u64>) -> Self {
        let downloaded = downloaded.max(self.downloaded);
        let total = match (total, self.total) {
            (Some(reported), Some(known)) if reported >= known => Some(reported),
            (Some(reported), None) if reported >= self.downloaded => Some(reported),
            (_, known) => known,
        };
        Self {
            downloaded: total.map_or(downloaded, |total| downloaded.min(total)),
            total,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.total, Some(total) if self.downloaded == total)
    }

    pub fn percent(&self) -> f64 {
        match self.total {
            Some(total) if total > 0 => (self.downloaded as f64 / total as f64) * 100.0,
            Some(_) => 100.0,
            None => 0.0,
        }
    }
}

/// Encodes an unknown total as -1 on the wire
mod unknown_total_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(total: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match total {
            Some(total) => serializer.serialize_u64(*total),
            None => serializer.serialize_i64(-1),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = i64::deserialize(deserializer)?;
        Ok(u64::try_from(raw).ok())
    }
}

/// Why a session ended up in the Error state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    /// Engine-specific numeric code, when the engine provides one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    pub message: String,
}

impl ErrorDescriptor {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(code: i32, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (code {})", self.message, code),
            None => f.write_str(&self.message),
        }
    }
}

/// Snapshot of a single download session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadSession {
    pub gid: Gid,
    pub state: SessionState,
    pub source_uri: String,
    pub options: Options,
    pub progress: Progress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ErrorDescriptor>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When the session entered Complete or Error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl DownloadSession {
    pub fn new(gid: Gid, source_uri: String, options: Options) -> Self {
        let now = Utc::now();
        Self {
            gid,
            state: SessionState::Pending,
            source_uri,
            options,
            progress: Progress::default(),
            last_error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Move to `state`, keeping the timestamps and `last_error` consistent
    pub fn set_state(&mut self, state: SessionState) {
        let now = Utc::now();
        self.state = state;
        self.updated_at = now;
        if state.is_terminal() {
            self.finished_at = Some(now);
        }
        if state != SessionState::Error {
            self.last_error = None;
        }
    }
}

/// Engine-wide counters, grouped the way aria2 reports them
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalStat {
    pub num_active: usize,
    /// Pending and Paused sessions
    pub num_waiting: usize,
    /// Complete and Error sessions
    pub num_stopped: usize,
}

// ============================================================================
// Event Types
// ============================================================================

/// Kind of lifecycle event delivered to the subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Started,
    Paused,
    Resumed,
    Progress,
    Complete,
    Error,
    Removed,
}

/// A lifecycle event. `sequence` is stamped by the bus on publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub gid: Gid,
    pub sequence: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDescriptor>,
}

impl Event {
    pub fn new(kind: EventKind, gid: Gid) -> Self {
        Self {
            kind,
            gid,
            sequence: 0,
            progress: None,
            error: None,
        }
    }

    pub fn with_progress(mut self, progress: Progress) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_error(mut self, error: ErrorDescriptor) -> Self {
        self.error = Some(error);
        self
    }
}

// ============================================================================
// Boundary Error Types
// ============================================================================

/// Stable error codes surfaced to the boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NotFound,
    IllegalState,
    BadArgs,
    NativeError,
    NotImplemented,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::IllegalState => "ILLEGAL_STATE",
            ErrorCode::BadArgs => "BAD_ARGS",
            ErrorCode::NativeError => "NATIVE_ERROR",
            ErrorCode::NotImplemented => "NOT_IMPLEMENTED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{code, message}` error shape handed to the boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unknown_total_is_minus_one() {
        let progress = Progress::new(10, None);
        assert_eq!(
            serde_json::to_value(progress).unwrap(),
            json!({"downloaded": 10, "total": -1})
        );

        let back: Progress = serde_json::from_value(json!({"downloaded": 3, "total": -1})).unwrap();
        assert_eq!(back.total, None);
    }

    #[test]
    fn test_progress_merge_never_goes_backwards() {
        let progress = Progress::new(60, Some(100));
        assert_eq!(progress.merged(40, None), Progress::new(60, Some(100)));
        assert_eq!(progress.merged(150, Some(100)), Progress::new(100, Some(100)));
        assert!(progress.merged(100, None).is_complete());
    }

    #[test]
    fn test_progress_total_never_shrinks() {
        let progress = Progress::new(60, Some(100));
        assert_eq!(progress.merged(40, Some(50)), Progress::new(60, Some(100)));
        assert_eq!(progress.merged(70, Some(50)), Progress::new(70, Some(100)));
        assert!(!progress.merged(40, Some(50)).is_complete());
        assert_eq!(progress.merged(60, Some(120)), Progress::new(60, Some(120)));

        // A first total below what is already counted is not believed
        let unsized_progress = Progress::new(60, None);
        assert_eq!(unsized_progress.merged(40, Some(50)), Progress::new(60, None));
        assert_eq!(unsized_progress.merged(60, Some(80)), Progress::new(60, Some(80)));
    }

    #[test]
    fn test_event_payload_shape() {
        let event = Event::new(EventKind::Progress, Gid::from("2089b05ecca3d829"))
            .with_progress(Progress::new(50, Some(100)));
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "kind": "Progress",
                "gid": "2089b05ecca3d829",
                "sequence": 0,
                "progress": {"downloaded": 50, "total": 100}
            })
        );
    }

    #[test]
    fn test_error_codes_on_the_wire() {
        for code in [
            ErrorCode::NotFound,
            ErrorCode::IllegalState,
            ErrorCode::BadArgs,
            ErrorCode::NativeError,
            ErrorCode::NotImplemented,
        ] {
            assert_eq!(serde_json::to_value(code).unwrap(), json!(code.as_str()));
        }
    }

    #[test]
    fn test_option_values_stay_scalar() {
        let options: Options =
            serde_json::from_value(json!({"max-connection-per-server": 4, "dir": "/tmp", "continue": true}))
                .unwrap();
        assert_eq!(options["max-connection-per-server"], OptionValue::Int(4));
        assert_eq!(options["dir"], OptionValue::Str("/tmp".into()));
        assert_eq!(options["continue"], OptionValue::Bool(true));
    }

    #[test]
    fn test_session_snapshot_is_camel_case() {
        let session = DownloadSession::new(Gid::from_u64(1), "http://x/file".into(), Options::new());
        let value = serde_json::to_value(&session).unwrap();
        assert_eq!(value["gid"], json!("0000000000000001"));
        assert_eq!(value["state"], json!("Pending"));
        assert_eq!(value["sourceUri"], json!("http://x/file"));
        assert!(value.get("lastError").is_none());
    }
}
