use std::sync::Arc;
use std::time::Duration;
use time::error::ComponentRange;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::mqtt_service::MqttService;

/// How long shutdown waits for the MQTT supervisor to wind down.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// `en-GB` style, e.g. `18/10/2026, 14:05:09`.
const DISPLAY_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[day]/[month]/[year], [hour]:[minute]:[second]");

/// Renders timestamps in the configured display offset.
#[derive(Debug, Clone, Copy)]
pub struct LocalClock {
    offset: UtcOffset,
}

impl LocalClock {
    pub fn from_hours(hours: i8) -> Result<Self, ComponentRange> {
        Ok(Self {
            offset: UtcOffset::from_hms(hours, 0, 0)?,
        })
    }

    pub fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc().to_offset(self.offset)
    }

    pub fn format(&self, at: OffsetDateTime) -> String {
        at.to_offset(self.offset)
            .format(DISPLAY_FORMAT)
            .unwrap_or_else(|e| {
                warn!("Failed to format timestamp: {}", e);
                at.to_string()
            })
    }

    pub fn now_formatted(&self) -> String {
        self.format(self.now())
    }
}

/// Start the MQTT connection supervisor
pub fn start_mqtt_service(mqtt_service: Arc<MqttService>) -> JoinHandle<()> {
    tokio::spawn(async move {
        mqtt_service.start().await;
    })
}

/// Close the broker connection and wait for the supervisor to finish.
///
/// Queuing the DISCONNECT counts against `grace` too: a stalled connection
/// can leave the client's request channel full.
pub async fn shutdown_mqtt_service(
    mqtt_service: Arc<MqttService>,
    supervisor: JoinHandle<()>,
    grace: Duration,
) {
    let wind_down = async {
        mqtt_service.disconnect().await;
        supervisor.await
    };

    match tokio::time::timeout(grace, wind_down).await {
        Ok(Ok(())) => info!("MQTT connection closed gracefully"),
        Ok(Err(e)) => error!("MQTT supervisor task failed: {:?}", e),
        Err(_) => warn!(
            "MQTT supervisor did not stop within {:?}, exiting anyway",
            grace
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn formats_in_display_offset() {
        let clock = LocalClock::from_hours(7).unwrap();
        let at = datetime!(2026-10-18 07:05:09 UTC);
        assert_eq!(clock.format(at), "18/10/2026, 14:05:09");

        let late = datetime!(2026-12-31 20:00:00 UTC);
        assert_eq!(clock.format(late), "01/01/2027, 03:00:00");
    }

    #[test]
    fn negative_offsets() {
        let clock = LocalClock::from_hours(-5).unwrap();
        let at = datetime!(2026-03-01 02:30:00 UTC);
        assert_eq!(clock.format(at), "28/02/2026, 21:30:00");
    }

    #[test]
    fn out_of_range_offset_is_rejected() {
        assert!(LocalClock::from_hours(30).is_err());
    }

    #[tokio::test]
    async fn shutdown_is_bounded_when_the_request_channel_is_full() {
        use crate::mqtt_service::{generate_client_id, MqttConfig};
        use crate::publisher::{IndicatorPayload, IndicatorSink, LineStatus};
        use rumqttc::QoS;

        // Never started, so nothing drains the client's request channel.
        let service = MqttService::new(MqttConfig {
            broker_url: "mqtt://127.0.0.1:1".to_string(),
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: 1,
            mqtt_username: String::new(),
            mqtt_password: String::new(),
            client_id: generate_client_id(),
            topic: "cmas/test".to_string(),
            qos: QoS::AtLeastOnce,
            reconnect_period_ms: 100,
            connect_timeout_ms: 1000,
            keep_alive_secs: 60,
        });
        let payload = IndicatorPayload::new("A1", LineStatus::Active);
        for _ in 0..10 {
            service.publish(&payload).await.unwrap();
        }
        let supervisor = tokio::spawn(std::future::pending::<()>());

        tokio::time::timeout(
            Duration::from_secs(2),
            shutdown_mqtt_service(service.clone(), supervisor, Duration::from_millis(200)),
        )
        .await
        .expect("shutdown must respect its grace period");
        assert!(!service.is_connected());
    }
}
