use dotenvy::dotenv;
use rumqttc::QoS;
use std::env;
use std::net::IpAddr;
use thiserror::Error;

use crate::device_registry::DeviceRegistry;

const DEFAULT_MQTT_PORT: u16 = 1883;

/// Host and port of the broker, parsed from `MQTT_BROKER`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// The broker URL as given, reported by the status endpoint.
    pub mqtt_broker_url: String,
    pub mqtt_endpoint: BrokerEndpoint,
    pub mqtt_topic: String,
    pub mqtt_qos: QoS,
    pub mqtt_username: String,
    pub mqtt_password: String,
    pub mqtt_reconnect_period_ms: u64,
    pub mqtt_connect_timeout_ms: u64,
    pub mqtt_keep_alive_secs: u64,

    pub http_address: IpAddr,
    pub http_port: u16,
    pub display_utc_offset_hours: i8,

    pub devices: DeviceRegistry,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable {0} is missing or invalid.")]
    MissingOrInvalid(String),
    #[error("Parsing error: {0}")]
    ParsingError(String),
}

impl Config {
    /// Validate timeout values and other critical configurations.
    fn validate_timeouts(&self) -> Result<(), ConfigError> {
        const MIN_TIMEOUT: u64 = 100;
        const MAX_TIMEOUT: u64 = 1_000_000;

        if !(MIN_TIMEOUT..=MAX_TIMEOUT).contains(&self.mqtt_reconnect_period_ms) {
            return Err(ConfigError::ParsingError(format!(
                "MQTT_RECONNECT_PERIOD_MS must be between {} and {} ms",
                MIN_TIMEOUT, MAX_TIMEOUT
            )));
        }

        if !(MIN_TIMEOUT..=MAX_TIMEOUT).contains(&self.mqtt_connect_timeout_ms) {
            return Err(ConfigError::ParsingError(format!(
                "MQTT_CONNECT_TIMEOUT_MS must be between {} and {} ms",
                MIN_TIMEOUT, MAX_TIMEOUT
            )));
        }

        if !(-12..=14).contains(&self.display_utc_offset_hours) {
            return Err(ConfigError::ParsingError(
                "DISPLAY_UTC_OFFSET_HOURS must be between -12 and 14".to_string(),
            ));
        }

        Ok(())
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok(); // Load environment variables from .env file
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key)
                .filter(|value| !value.trim().is_empty())
                .ok_or_else(|| ConfigError::MissingOrInvalid(key.to_string()))
        };
        let parsed = |key: &str, default: &str, what: &str| {
            let raw = lookup(key).unwrap_or_else(|| default.to_string());
            raw.trim()
                .parse::<u64>()
                .map_err(|_| ConfigError::ParsingError(format!("{} must be {}", key, what)))
        };

        let mqtt_broker_url = required("MQTT_BROKER")?;
        let mqtt_endpoint = parse_broker_url(&mqtt_broker_url)?;

        let mqtt_qos = parse_qos(&lookup("MQTT_QOS").unwrap_or_else(|| "0".to_string()))?;

        let http_port = lookup("PORT")
            .unwrap_or_else(|| "3000".to_string())
            .trim()
            .parse::<u16>()
            .map_err(|_| ConfigError::ParsingError("PORT must be a valid number".to_string()))?;
        let http_address = lookup("HTTP_ADDRESS")
            .unwrap_or_else(|| "0.0.0.0".to_string())
            .trim()
            .parse::<IpAddr>()
            .map_err(|_| {
                ConfigError::ParsingError("HTTP_ADDRESS must be an IP address".to_string())
            })?;
        let display_utc_offset_hours = lookup("DISPLAY_UTC_OFFSET_HOURS")
            .unwrap_or_else(|| "7".to_string())
            .trim()
            .parse::<i8>()
            .map_err(|_| {
                ConfigError::ParsingError("DISPLAY_UTC_OFFSET_HOURS must be an integer".to_string())
            })?;

        let devices = match lookup("DEVICE_REGISTRY") {
            Some(spec) if !spec.trim().is_empty() => DeviceRegistry::parse(&spec)
                .map_err(|e| ConfigError::ParsingError(format!("DEVICE_REGISTRY: {}", e)))?,
            _ => DeviceRegistry::default(),
        };

        let config = Self {
            mqtt_broker_url,
            mqtt_endpoint,
            mqtt_topic: required("MQTT_TOPIC")?,
            mqtt_qos,
            mqtt_username: lookup("MQTT_USERNAME").unwrap_or_default(), // Default to empty
            mqtt_password: lookup("MQTT_PASSWORD").unwrap_or_default(), // Default to empty
            mqtt_reconnect_period_ms: parsed("MQTT_RECONNECT_PERIOD_MS", "1000", "a valid number")?,
            mqtt_connect_timeout_ms: parsed("MQTT_CONNECT_TIMEOUT_MS", "30000", "a valid number")?,
            mqtt_keep_alive_secs: parsed("MQTT_KEEP_ALIVE_SECS", "60", "a valid number")?,
            http_address,
            http_port,
            display_utc_offset_hours,
            devices,
        };

        // Validate timeouts after constructing the configuration
        config.validate_timeouts()?;

        Ok(config)
    }
}

/// Accepts `mqtt://host[:port]` and `tcp://host[:port]`; a bare `host[:port]` is
/// treated as plain MQTT.
pub fn parse_broker_url(url: &str) -> Result<BrokerEndpoint, ConfigError> {
    let url = url.trim();
    let rest = match url.split_once("://") {
        Some(("mqtt", rest)) | Some(("tcp", rest)) => rest,
        Some((scheme, _)) => {
            return Err(ConfigError::ParsingError(format!(
                "MQTT_BROKER scheme '{}' is not supported",
                scheme
            )))
        }
        None => url,
    };

    // Credentials in the URL are not used, and anything after the authority is ignored.
    let authority = rest.split(['/', '?']).next().unwrap_or_default();
    let authority = authority.rsplit('@').next().unwrap_or_default();

    let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
        // IPv6 literal, `[::1]` or `[::1]:1883`
        let (host, after) = bracketed.split_once(']').ok_or_else(|| {
            ConfigError::ParsingError("MQTT_BROKER has an unclosed '['".to_string())
        })?;
        let port = match after {
            "" => DEFAULT_MQTT_PORT,
            _ => parse_port(after.strip_prefix(':').ok_or_else(|| {
                ConfigError::ParsingError("MQTT_BROKER has junk after ']'".to_string())
            })?)?,
        };
        (host, port)
    } else if authority.matches(':').count() > 1 {
        return Err(ConfigError::ParsingError(
            "MQTT_BROKER IPv6 hosts must be enclosed in brackets".to_string(),
        ));
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, parse_port(port)?),
            None => (authority, DEFAULT_MQTT_PORT),
        }
    };

    if host.is_empty() {
        return Err(ConfigError::MissingOrInvalid("MQTT_BROKER".to_string()));
    }

    Ok(BrokerEndpoint {
        host: host.to_string(),
        port,
    })
}

fn parse_port(raw: &str) -> Result<u16, ConfigError> {
    raw.parse::<u16>()
        .map_err(|_| ConfigError::ParsingError("MQTT_BROKER port must be a valid number".to_string()))
}

pub fn parse_qos(raw: &str) -> Result<QoS, ConfigError> {
    match raw.trim() {
        "0" => Ok(QoS::AtMostOnce),
        "1" => Ok(QoS::AtLeastOnce),
        "2" => Ok(QoS::ExactlyOnce),
        _ => Err(ConfigError::ParsingError(
            "MQTT_QOS must be 0, 1 or 2".to_string(),
        )),
    }
}
