//! RelayPass protocol commands and message structures
//!
//! Defines the JSON request/response envelope spoken on the control stream
//! and how command payloads map onto broker requests.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::broker::IssueRequest;
use crate::dispatch::DispatchRequest;
use crate::error::{RelayError, RelayResult};
use crate::mailer::MessageOptions;

/// Incoming request structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Command name (e.g., "AUTH", "SEND", "PING")
    pub cmd: String,

    /// Optional data payload
    #[serde(default)]
    pub data: Option<Value>,
}

impl Request {
    /// Parse a request from JSON string
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// A present, non-null field of data
    fn field(&self, key: &str) -> Option<&Value> {
        self.data.as_ref()?.get(key).filter(|v| !v.is_null())
    }

    /// Read an optional field. Absent is `None`; present with the wrong
    /// type is a validation error rather than a silent default.
    fn typed<T>(
        &self,
        key: &str,
        expected: &str,
        cast: impl Fn(&Value) -> Option<T>,
    ) -> RelayResult<Option<T>> {
        match self.field(key) {
            None => Ok(None),
            Some(value) => cast(value)
                .map(Some)
                .ok_or_else(|| RelayError::Validation(format!("field {key}: expected {expected}"))),
        }
    }

    /// Get a string field from data
    pub fn get_str(&self, key: &str) -> RelayResult<Option<String>> {
        self.typed(key, "a string", |v| v.as_str().map(str::to_string))
    }

    /// Get an integer field from data
    pub fn get_int(&self, key: &str) -> RelayResult<Option<i64>> {
        self.typed(key, "an integer", Value::as_i64)
    }

    /// Get a boolean field from data
    pub fn get_bool(&self, key: &str) -> RelayResult<Option<bool>> {
        self.typed(key, "a boolean", Value::as_bool)
    }

    /// Get a field that may be a single string or an array of strings
    pub fn get_str_list(&self, key: &str) -> RelayResult<Option<Vec<String>>> {
        self.typed(key, "a string or an array of strings", |v| match v {
            Value::String(s) => Some(vec![s.clone()]),
            Value::Array(items) => items
                .iter()
                .map(|item| item.as_str().map(str::to_string))
                .collect(),
            _ => None,
        })
    }

    fn require_str(&self, key: &str) -> RelayResult<String> {
        self.get_str(key)?
            .ok_or_else(|| RelayError::Validation(format!("missing field: {key}")))
    }

    /// Bearer credential, from `authorization` or `token`
    pub fn bearer(&self) -> RelayResult<Option<String>> {
        match self.get_str("authorization")? {
            Some(value) => Ok(Some(value)),
            None => self.get_str("token"),
        }
    }

    /// Payload of an AUTH command
    pub fn issue_request(&self) -> RelayResult<IssueRequest> {
        let data = self
            .data
            .clone()
            .ok_or_else(|| RelayError::Validation("missing data".to_string()))?;
        serde_json::from_value(data).map_err(|e| RelayError::Validation(e.to_string()))
    }

    /// Payload of a SEND command
    pub fn dispatch_request(&self) -> RelayResult<DispatchRequest> {
        let recipients = match self.get_str_list("recipients")? {
            Some(list) => list,
            None => self.get_str_list("recipient")?.unwrap_or_default(),
        };
        let repeat_count = match self.get_int("repeat_count")? {
            Some(n) => n,
            None => self.get_int("quantity")?.unwrap_or(1),
        };

        Ok(DispatchRequest {
            recipients,
            subject: self.require_str("subject")?,
            body: self.require_str("body")?,
            repeat_count,
            options: MessageOptions {
                cc: self.get_str_list("cc")?.unwrap_or_default(),
                bcc: self.get_str_list("bcc")?.unwrap_or_default(),
                reply_to: self.get_str("reply_to")?.filter(|s| !s.trim().is_empty()),
                is_html: self.get_bool("is_html")?.unwrap_or(false),
            },
        })
    }
}

/// Outgoing response structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Status ("OK" or "ERR")
    pub status: String,

    /// Command/response type
    pub cmd: String,

    /// Optional message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,

    /// Error code (if error)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<u32>,

    /// Additional data payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Response {
    /// Create a success response
    pub fn ok(cmd: &str) -> Self {
        Self {
            status: "OK".to_string(),
            cmd: cmd.to_string(),
            msg: None,
            code: None,
            data: None,
        }
    }

    /// Create an error response
    pub fn err(cmd: &str, msg: &str, code: u32) -> Self {
        Self {
            status: "ERR".to_string(),
            cmd: cmd.to_string(),
            msg: Some(msg.to_string()),
            code: Some(code),
            data: None,
        }
    }

    /// Create an error response from a [`RelayError`]
    pub fn from_error(cmd: &str, err: &RelayError) -> Self {
        let msg = match err {
            // Internal detail stays in the logs.
            RelayError::Decryption(_) | RelayError::Internal(_) => {
                "Unexpected server error".to_string()
            }
            other => other.to_string(),
        };
        Self::err(cmd, &msg, err.code())
    }

    /// Add message
    pub fn with_msg(mut self, msg: &str) -> Self {
        self.msg = Some(msg.to_string());
        self
    }

    /// Add data payload
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"status":"ERR","cmd":"INTERNAL","msg":"json_serialization_failed"}"#.to_string()
        })
    }
}

/// Heartbeat message sent periodically to keep connection alive
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Command type (always "HB")
    pub cmd: String,

    /// Unix timestamp
    pub ts: i64,
}

impl Heartbeat {
    /// Create a new heartbeat message
    pub fn new() -> Self {
        Self {
            cmd: cmd::HB.to_string(),
            ts: Utc::now().timestamp(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"cmd":"HB","ts":0}"#.to_string())
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

/// Command constants
pub mod cmd {
    pub const AUTH: &str = "AUTH";
    pub const SEND: &str = "SEND";

    pub const PING: &str = "PING";
    pub const PONG: &str = "PONG";
    pub const HB: &str = "HB";

    pub const STATS: &str = "STATS";
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::codes;

    #[test]
    fn test_request_parsing() {
        let json = r#"{"cmd":"AUTH","data":{"email":"test@example.com","password":"pw"}}"#;
        let req = Request::from_json(json).unwrap();

        assert_eq!(req.cmd, "AUTH");
        let issue = req.issue_request().unwrap();
        assert_eq!(issue.identity, "test@example.com");
        assert_eq!(issue.secret, "pw");
        assert!(issue.relay_host.is_none());
    }

    #[test]
    fn test_auth_missing_fields() {
        let req = Request::from_json(r#"{"cmd":"AUTH"}"#).unwrap();
        assert!(matches!(req.issue_request(), Err(RelayError::Validation(_))));

        let req = Request::from_json(r#"{"cmd":"AUTH","data":{"email":"a@b.c"}}"#).unwrap();
        assert!(matches!(req.issue_request(), Err(RelayError::Validation(_))));
    }

    #[test]
    fn test_send_payload() {
        let json = r#"{"cmd":"SEND","data":{
            "token":"rp_abc",
            "recipients":["a@example.com","b@example.com"],
            "subject":"Hi","body":"<b>x</b>","repeat_count":3,"is_html":true,
            "cc":"c@example.com","bcc":[],"reply_to":""
        }}"#;
        let req = Request::from_json(json).unwrap();
        let send = req.dispatch_request().unwrap();

        assert_eq!(req.bearer().unwrap().as_deref(), Some("rp_abc"));
        assert_eq!(send.recipients.len(), 2);
        assert_eq!(send.repeat_count, 3);
        assert!(send.options.is_html);
        assert_eq!(send.options.cc, vec!["c@example.com"]);
        assert!(send.options.bcc.is_empty());
        assert!(send.options.reply_to.is_none());
    }

    #[test]
    fn test_send_single_recipient_and_quantity() {
        let json = r#"{"cmd":"SEND","data":{"recipient":"a@example.com","subject":"s","body":"b","quantity":-2}}"#;
        let send = Request::from_json(json).unwrap().dispatch_request().unwrap();

        assert_eq!(send.recipients, vec!["a@example.com"]);
        assert_eq!(send.repeat_count, -2);
    }

    fn send_with(extra: &str) -> RelayResult<DispatchRequest> {
        let json = format!(
            r#"{{"cmd":"SEND","data":{{"subject":"s","body":"b",{extra}}}}}"#
        );
        Request::from_json(&json).unwrap().dispatch_request()
    }

    #[test]
    fn test_send_rejects_mistyped_fields() {
        for extra in [
            r#""recipients":["a@example.com",7]"#,
            r#""recipients":["a@example.com"],"repeat_count":"0""#,
            r#""recipients":["a@example.com"],"repeat_count":1.5"#,
            r#""recipients":["a@example.com"],"repeat_count":18446744073709551615"#,
            r#""recipients":["a@example.com"],"is_html":"true""#,
            r#""recipients":["a@example.com"],"cc":[null]"#,
            r#""recipients":["a@example.com"],"bcc":{"to":"x@example.com"}"#,
            r#""recipients":["a@example.com"],"reply_to":5"#,
            r#""recipient":42"#,
        ] {
            let err = send_with(extra).unwrap_err();
            assert!(matches!(err, RelayError::Validation(_)), "{extra}: {err}");
        }
    }

    #[test]
    fn test_send_absent_and_null_fields_default() {
        let send = send_with(r#""recipients":["a@example.com"],"is_html":null,"cc":null"#).unwrap();

        assert_eq!(send.repeat_count, 1);
        assert!(!send.options.is_html);
        assert!(send.options.cc.is_empty());
    }

    #[test]
    fn test_mistyped_bearer() {
        let req = Request::from_json(r#"{"cmd":"SEND","data":{"token":12}}"#).unwrap();
        assert!(matches!(req.bearer(), Err(RelayError::Validation(_))));

        let req = Request::from_json(r#"{"cmd":"SEND","data":{}}"#).unwrap();
        assert!(req.bearer().unwrap().is_none());
    }

    #[test]
    fn test_send_missing_subject() {
        let json = r#"{"cmd":"SEND","data":{"recipients":["a@example.com"],"body":"b"}}"#;
        let err = Request::from_json(json).unwrap().dispatch_request().unwrap_err();
        assert!(err.to_string().contains("subject"));
    }

    #[test]
    fn test_error_response() {
        let resp = Response::from_error("SEND", &RelayError::TokenExpired);

        assert_eq!(resp.status, "ERR");
        assert_eq!(resp.cmd, "SEND");
        assert_eq!(resp.code, Some(codes::SESSION_EXPIRED));
    }

    #[test]
    fn test_internal_error_is_opaque() {
        let resp = Response::from_error("SEND", &RelayError::Decryption("tag mismatch".into()));
        assert_eq!(resp.msg.as_deref(), Some("Unexpected server error"));
    }

    #[test]
    fn test_heartbeat() {
        let json = Heartbeat::new().to_json();
        assert!(json.contains("HB"));
        assert!(json.contains("ts"));
    }

    #[test]
    fn test_response_to_json() {
        let json = Response::ok(cmd::PONG).with_msg("pong").to_json();

        assert!(json.contains("OK"));
        assert!(json.contains("PONG"));
        assert!(!json.contains("code"));
    }
}
