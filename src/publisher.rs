use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// Indicator state a line can be switched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineStatus {
    Active,
    Inactive,
}

impl FromStr for LineStatus {
    type Err = ();

    /// Case-insensitive, surrounding whitespace is not accepted.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("active") {
            Ok(LineStatus::Active)
        } else if s.eq_ignore_ascii_case("inactive") {
            Ok(LineStatus::Inactive)
        } else {
            Err(())
        }
    }
}

/// The message published for one call-miss request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndicatorPayload {
    pub line: String,
    pub status: LineStatus,
}

impl IndicatorPayload {
    pub fn new(line: &str, status: LineStatus) -> Self {
        Self {
            line: line.trim().to_string(),
            status,
        }
    }

    /// Canonical wire form, `{"line":"A1","status":"active"}`.
    pub fn to_json(&self) -> Result<String, PublishError> {
        serde_json::to_string(self).map_err(|e| PublishError::Serialization(e.to_string()))
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to serialize payload: {0}")]
    Serialization(String),
    #[error("{0}")]
    Client(String),
}

/// Where validated indicators are sent.
///
/// `publish` resolves once the message has been accepted for delivery;
/// broker acknowledgements arrive later on the connection's event loop.
#[rocket::async_trait]
pub trait IndicatorSink: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn publish(&self, payload: &IndicatorPayload) -> Result<(), PublishError>;
}
