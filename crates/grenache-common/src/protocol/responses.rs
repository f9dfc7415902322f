//! Grenache Reply Types

use serde_json::Value;

use super::error::GrenacheError;
use super::RequestId;

/// A decoded reply envelope `[rid, errorMessage, result]`.
///
/// A reply's `rid` always equals the rid of the request it answers.
///
/// # Example
///
/// ```
/// use grenache_common::protocol::Reply;
/// use serde_json::json;
///
/// let ok = Reply::success("rid-1", json!("world"));
/// assert_eq!(ok.into_result().unwrap(), json!("world"));
///
/// let failed = Reply::error("rid-2", "ERR_BUSY");
/// assert!(failed.into_result().is_err());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub rid: RequestId,
    /// Present when the remote handler replied with an error.
    pub error: Option<String>,
    pub result: Value,
}

impl Reply {
    pub fn success(rid: impl Into<String>, result: Value) -> Self {
        Reply {
            rid: rid.into(),
            error: None,
            result,
        }
    }

    pub fn error(rid: impl Into<String>, error: impl Into<String>) -> Self {
        Reply {
            rid: rid.into(),
            error: Some(error.into()),
            result: Value::Null,
        }
    }

    /// Splits the reply into the caller-facing `(error, result)` outcome.
    pub fn into_result(self) -> Result<Value, GrenacheError> {
        match self.error {
            Some(message) if !message.is_empty() => Err(GrenacheError::Remote(message)),
            _ => Ok(self.result),
        }
    }
}
