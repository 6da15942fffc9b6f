use rocket::serde::{Deserialize, Serialize};
use rocket::FromForm;

use crate::publisher::IndicatorPayload;

pub const SERVICE_NAME: &str = "cmas-status-api";

/// `POST /api/callMiss` body, JSON or form-encoded. Both fields are optional
/// so that missing values reach validation instead of failing decoding.
#[derive(Deserialize, FromForm, Debug, Default)]
#[serde(crate = "rocket::serde")]
pub struct CallMissRequest {
    pub line: Option<String>,
    pub status: Option<String>,
}

#[derive(Serialize, Debug)]
#[serde(crate = "rocket::serde")]
pub struct CallMissResponse {
    pub success: bool,
    pub message: String,
    pub data: IndicatorPayload,
}

#[derive(Serialize, Debug)]
#[serde(crate = "rocket::serde")]
pub struct HealthResponse {
    pub service: &'static str,
    pub mqtt: MqttHealth,
    pub timestamp: String,
}

#[derive(Serialize, Debug)]
#[serde(crate = "rocket::serde")]
pub struct MqttHealth {
    pub connected: bool,
    pub status: &'static str,
}

#[derive(Serialize, Debug)]
#[serde(crate = "rocket::serde")]
pub struct StatusResponse {
    pub timestamp: String,
    pub service: &'static str,
    pub uptime: String,
    pub mqtt: MqttStatus,
    pub statistics: Statistics,
}

#[derive(Serialize, Debug)]
#[serde(crate = "rocket::serde")]
pub struct MqttStatus {
    pub connected: bool,
    pub broker: String,
    pub topic: String,
}

#[derive(Serialize, Debug)]
#[serde(crate = "rocket::serde", rename_all = "camelCase")]
pub struct Statistics {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub success_rate: String,
    pub last_publish: Option<String>,
    pub breakdown: FailureBreakdown,
}

/// Why the failed publishes failed.
#[derive(Serialize, Debug)]
#[serde(crate = "rocket::serde", rename_all = "camelCase")]
pub struct FailureBreakdown {
    pub unavailable: u64,
    pub publish_error: u64,
}

#[derive(Serialize, Debug)]
#[serde(crate = "rocket::serde")]
pub struct DeviceResponse {
    pub success: bool,
    pub device_id: String,
    pub lines: Vec<String>,
}
