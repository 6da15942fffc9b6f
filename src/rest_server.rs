use rocket::fairing::{Fairing, Info, Kind};
use rocket::figment::Figment;
use rocket::form::{self, Form};
use rocket::http::Status;
use rocket::response::{self, status, Responder};
use rocket::serde::json::{self, json, Json};
use rocket::{catch, catchers, get, options, post, routes, Build, Request, Rocket, State};
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::device_registry::DeviceRegistry;
use crate::models::{
    CallMissRequest, CallMissResponse, DeviceResponse, FailureBreakdown, HealthResponse,
    MqttHealth, MqttStatus, Statistics, StatusResponse, SERVICE_NAME,
};
use crate::publisher::{IndicatorPayload, IndicatorSink, LineStatus, PublishError};
use crate::service_utils::LocalClock;
use crate::stats::{format_uptime, Stats};

/// Everything the handlers share, managed by Rocket.
pub struct GatewayState {
    pub sink: Arc<dyn IndicatorSink>,
    pub stats: Stats,
    pub devices: DeviceRegistry,
    pub broker_url: String,
    pub topic: String,
    pub clock: LocalClock,
}

/// Request failures, each rendered as a JSON body with its own status.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Validation {
        message: &'static str,
        available_lines: Option<Vec<String>>,
    },
    #[error("MQTT service unavailable")]
    Unavailable,
    #[error("Failed to publish to MQTT")]
    Publish(#[source] PublishError),
    #[error("Device not found")]
    DeviceNotFound { available_devices: Vec<String> },
}

impl ApiError {
    fn validation(message: &'static str) -> Self {
        ApiError::Validation {
            message,
            available_lines: None,
        }
    }

    pub fn status(&self) -> Status {
        match self {
            ApiError::Validation { .. } => Status::BadRequest,
            ApiError::Unavailable => Status::ServiceUnavailable,
            ApiError::Publish(_) => Status::InternalServerError,
            ApiError::DeviceNotFound { .. } => Status::NotFound,
        }
    }
}

impl<'r> Responder<'r, 'static> for ApiError {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'static> {
        let status = self.status();
        let body = match &self {
            ApiError::Validation {
                available_lines: Some(lines),
                ..
            } => json!({ "success": false, "error": self.to_string(), "available_lines": lines }),
            ApiError::Validation { .. } | ApiError::Unavailable => {
                json!({ "success": false, "error": self.to_string() })
            }
            ApiError::Publish(cause) => json!({
                "success": false,
                "error": self.to_string(),
                "message": cause.to_string(),
            }),
            ApiError::DeviceNotFound { available_devices } => json!({
                "success": false,
                "message": self.to_string(),
                "available_devices": available_devices,
            }),
        };
        status::Custom(status, Json(body)).respond_to(req)
    }
}

/// CORS Fairing for Rocket
pub struct Cors;

#[rocket::async_trait]
impl Fairing for Cors {
    fn info(&self) -> Info {
        Info {
            name: "CORS",
            kind: Kind::Response,
        }
    }

    async fn on_response<'r>(&self, _req: &'r Request<'_>, res: &mut rocket::Response<'r>) {
        res.set_header(rocket::http::Header::new("Access-Control-Allow-Origin", "*"));
        res.set_header(rocket::http::Header::new(
            "Access-Control-Allow-Methods",
            "GET, POST, OPTIONS",
        ));
        res.set_header(rocket::http::Header::new(
            "Access-Control-Allow-Headers",
            "Content-Type",
        ));
    }
}

/// Checks a call-miss body in a fixed order: line present, status known,
/// line registered. The first failure wins.
pub fn validate_call_miss(
    request: &CallMissRequest,
    devices: &DeviceRegistry,
) -> Result<IndicatorPayload, ApiError> {
    let line = request
        .line
        .as_deref()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .ok_or_else(|| ApiError::validation("Line name cannot be empty"))?;

    let status = request
        .status
        .as_deref()
        .and_then(|status| status.parse::<LineStatus>().ok())
        .ok_or_else(|| ApiError::validation("Wrong status"))?;

    if !devices.is_registered_line(line) {
        return Err(ApiError::Validation {
            message: "Line not registered in any device",
            available_lines: Some(devices.all_lines().into_iter().map(String::from).collect()),
        });
    }

    Ok(IndicatorPayload::new(line, status))
}

type CallMissResult = Result<status::Custom<Json<CallMissResponse>>, ApiError>;

/// Form-encoded bodies; ranked ahead of the JSON route.
#[post("/callMiss", format = "form", data = "<body>")]
async fn call_miss_form(
    body: Result<Form<CallMissRequest>, form::Errors<'_>>,
    state: &State<GatewayState>,
) -> CallMissResult {
    let request = body.map_err(|e| {
        debug!("Rejected call-miss form: {}", e);
        ApiError::validation("Malformed request body")
    })?;
    publish_call_miss(&request, state).await
}

#[post("/callMiss", data = "<body>", rank = 2)]
async fn call_miss(
    body: Result<Json<CallMissRequest>, json::Error<'_>>,
    state: &State<GatewayState>,
) -> CallMissResult {
    let request = body.map_err(|e| {
        debug!("Rejected call-miss body: {}", e);
        ApiError::validation("Malformed request body")
    })?;
    publish_call_miss(&request, state).await
}

async fn publish_call_miss(request: &CallMissRequest, state: &GatewayState) -> CallMissResult {
    let payload = validate_call_miss(request, &state.devices)?;

    if !state.sink.is_connected() {
        state.stats.record_unavailable();
        warn!("Rejected call-miss for line {}: broker not connected", payload.line);
        return Err(ApiError::Unavailable);
    }

    match state.sink.publish(&payload).await {
        Ok(()) => {
            state.stats.record_success(state.clock.now());
            Ok(status::Custom(
                Status::Created,
                Json(CallMissResponse {
                    success: true,
                    message: "Data published successfully".to_string(),
                    data: payload,
                }),
            ))
        }
        Err(e) => {
            error!("Failed to publish: {}", e);
            state.stats.record_publish_error();
            Err(ApiError::Publish(e))
        }
    }
}

#[get("/device/health")]
fn health(state: &State<GatewayState>) -> status::Custom<Json<HealthResponse>> {
    let connected = state.sink.is_connected();
    let code = if connected {
        Status::Ok
    } else {
        Status::ServiceUnavailable
    };

    status::Custom(
        code,
        Json(HealthResponse {
            service: SERVICE_NAME,
            mqtt: MqttHealth {
                connected,
                status: if connected { "healthy" } else { "unhealthy" },
            },
            timestamp: state.clock.now_formatted(),
        }),
    )
}

#[get("/device/status")]
fn device_status(state: &State<GatewayState>) -> Json<StatusResponse> {
    let snapshot = state.stats.snapshot();

    Json(StatusResponse {
        timestamp: state.clock.now_formatted(),
        service: SERVICE_NAME,
        uptime: format_uptime(snapshot.uptime.as_secs()),
        mqtt: MqttStatus {
            connected: state.sink.is_connected(),
            broker: state.broker_url.clone(),
            topic: state.topic.clone(),
        },
        statistics: Statistics {
            total: snapshot.total(),
            successful: snapshot.successful,
            failed: snapshot.failed(),
            success_rate: snapshot.success_rate(),
            last_publish: snapshot.last_publish.map(|at| state.clock.format(at)),
            breakdown: FailureBreakdown {
                unavailable: snapshot.failed_unavailable,
                publish_error: snapshot.failed_publish,
            },
        },
    })
}

#[get("/device/<device_id>")]
fn device(device_id: &str, state: &State<GatewayState>) -> Result<Json<DeviceResponse>, ApiError> {
    match state.devices.lines_of(device_id) {
        Some(lines) => Ok(Json(DeviceResponse {
            success: true,
            device_id: device_id.to_string(),
            lines: lines.to_vec(),
        })),
        None => Err(ApiError::DeviceNotFound {
            available_devices: state
                .devices
                .device_ids()
                .into_iter()
                .map(String::from)
                .collect(),
        }),
    }
}

#[options("/<_..>")]
fn preflight() -> Status {
    Status::NoContent
}

#[catch(default)]
fn json_catcher(status: Status, _req: &Request) -> status::Custom<Json<json::Value>> {
    status::Custom(
        status,
        Json(json!({ "success": false, "error": status.reason_lossy() })),
    )
}

/// Assemble the API on top of the given Rocket configuration
pub fn build_rocket(figment: Figment, state: GatewayState) -> Rocket<Build> {
    rocket::custom(figment)
        .manage(state)
        .mount(
            "/api",
            routes![call_miss_form, call_miss, health, device_status, device, preflight],
        )
        .register("/", catchers![json_catcher])
        .attach(Cors)
}

/// Run the Rocket server until it receives a shutdown signal
pub async fn run_rest_server(
    state: GatewayState,
    address: IpAddr,
    port: u16,
) -> Result<(), rocket::Error> {
    let figment = rocket::Config::figment()
        .merge(("address", address))
        .merge(("port", port));

    build_rocket(figment, state).launch().await?;
    Ok(())
}
