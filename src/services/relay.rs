//! Ingestion and routing of device messages.
//!
//! All three transports (request/response, persistent socket, broker relay)
//! funnel into the two ingest functions here; the transport shells only
//! differ in how they obtain the origin and, for broker messages, the
//! topic. Messages are append-only and unique per (instant, origin); a
//! collision is a client bug and is surfaced, not resolved.

use crate::db::models as dbm;
use crate::db::models::{MessageKind, TopicPrefix};
use crate::schema;
use crate::services::telemetry;
use chrono::{DateTime, Utc};
use core::fmt;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::PgConnection;
use log::debug;
use serde::Deserialize;
use std::error::Error;
use uuid::Uuid;

#[derive(Debug)]
pub enum RelayError {
    /// Origin is not a known, bound device.
    UnknownOrigin(Uuid),
    /// Broker topic does not decompose into a recognized prefix.
    InvalidTopic(String),
    /// Payload does not match the schema of its message kind.
    Payload(String),
    /// A message from this origin already exists at this exact instant.
    DuplicateMessage { origin: Uuid, at: DateTime<Utc> },
    Storage(String),
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::UnknownOrigin(id) => write!(f, "unknown origin device: {}", id),
            RelayError::InvalidTopic(topic) => write!(f, "unrecognized topic: {}", topic),
            RelayError::Payload(s) => write!(f, "invalid payload: {}", s),
            RelayError::DuplicateMessage { origin, at } => {
                write!(f, "duplicate message from {} at {}", origin, at)
            }
            RelayError::Storage(s) => write!(f, "storage error: {}", s),
        }
    }
}

impl Error for RelayError {}

/// Decompose a broker topic into its recognized prefix and free-form
/// suffix context.
pub fn parse_topic(topic: &str) -> Result<(TopicPrefix, String), RelayError> {
    let (prefix, suffix) = match topic.split_once('/') {
        Some((prefix, suffix)) => (prefix, suffix),
        None => (topic, ""),
    };
    let prefix = prefix
        .parse::<TopicPrefix>()
        .map_err(|_| RelayError::InvalidTopic(topic.to_string()))?;
    Ok((prefix, suffix.to_string()))
}

// Per-kind envelopes. Fields beyond the envelope are free-form and travel
// with the stored payload untouched.

#[derive(Debug, Deserialize)]
struct CommandEnvelope {
    command: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryReading {
    pub peripheral: Uuid,
    pub data_point_type: Uuid,
    pub value: f64,
}

#[derive(Debug, Deserialize)]
struct TelemetryEnvelope {
    readings: Vec<TelemetryReading>,
}

#[derive(Debug, Deserialize)]
struct RegisterEnvelope {
    #[serde(default)]
    peripherals: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    message: String,
}

fn deserialize_envelope<T: serde::de::DeserializeOwned>(payload: &serde_json::Value) -> Result<T, RelayError> {
    serde_path_to_error::deserialize(payload.clone())
        .map_err(|e| RelayError::Payload(format!("{}: {}", e.path(), e.inner())))
}

/// Validate `payload` against the envelope of its kind; telemetry payloads
/// yield their readings for fan-out into the telemetry store.
pub fn validate_payload(kind: MessageKind, payload: &serde_json::Value) -> Result<Vec<TelemetryReading>, RelayError> {
    if !payload.is_object() {
        return Err(RelayError::Payload("payload must be a JSON object".to_string()));
    }
    match kind {
        MessageKind::Command => {
            let envelope: CommandEnvelope = deserialize_envelope(payload)?;
            if envelope.command.trim().is_empty() {
                return Err(RelayError::Payload("command must not be empty".to_string()));
            }
            Ok(Vec::new())
        }
        MessageKind::Telemetry => {
            let envelope: TelemetryEnvelope = deserialize_envelope(payload)?;
            Ok(envelope.readings)
        }
        MessageKind::Register => {
            let envelope: RegisterEnvelope = deserialize_envelope(payload)?;
            for entry in &envelope.peripherals {
                if !entry.is_object() {
                    return Err(RelayError::Payload("peripheral entries must be JSON objects".to_string()));
                }
            }
            Ok(Vec::new())
        }
        MessageKind::Error => {
            let envelope: ErrorEnvelope = deserialize_envelope(payload)?;
            if envelope.message.is_empty() {
                return Err(RelayError::Payload("error message must not be empty".to_string()));
            }
            Ok(Vec::new())
        }
    }
}

fn fan_out_readings(
    conn: &mut PgConnection,
    controller_id: Uuid,
    readings: &[TelemetryReading],
    at: DateTime<Utc>,
) -> Result<(), RelayError> {
    use schema::peripherals::dsl as P;

    if readings.is_empty() {
        return Ok(());
    }
    let known: Vec<Uuid> = P::peripherals
        .filter(P::controller_id.eq(controller_id))
        .select(P::id)
        .load(conn)
        .map_err(|e| RelayError::Storage(format!("fetch peripherals failed: {}", e)))?;
    for reading in readings {
        if !known.contains(&reading.peripheral) {
            return Err(RelayError::Payload(format!(
                "peripheral {} does not belong to controller {}",
                reading.peripheral, controller_id
            )));
        }
    }
    for reading in readings {
        telemetry::record(conn, reading.peripheral, reading.data_point_type, reading.value, Some(at))
            .map_err(RelayError::Storage)?;
    }
    Ok(())
}

/// Ingest a direct controller message. Returns the stored creation instant.
pub fn ingest_controller_message(
    conn: &mut PgConnection,
    controller_id: Uuid,
    kind: MessageKind,
    payload: serde_json::Value,
    at: Option<DateTime<Utc>>,
) -> Result<DateTime<Utc>, RelayError> {
    use schema::controllers::dsl as C;
    use schema::controller_messages::dsl as M;

    let controller: Option<dbm::Controller> = C::controllers
        .find(controller_id)
        .select(dbm::Controller::as_select())
        .first(conn)
        .optional()
        .map_err(|e| RelayError::Storage(format!("fetch controller failed: {}", e)))?;
    let controller = controller.ok_or(RelayError::UnknownOrigin(controller_id))?;
    if !controller.is_registered() {
        return Err(RelayError::UnknownOrigin(controller_id));
    }

    let readings = validate_payload(kind, &payload)?;
    let at = at.unwrap_or_else(Utc::now);

    let row = dbm::NewControllerMessage {
        created_at: at,
        controller_id,
        kind: kind.code().to_string(),
        message: payload,
    };
    diesel::insert_into(M::controller_messages)
        .values(&row)
        .execute(conn)
        .map_err(|e| match e {
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
                RelayError::DuplicateMessage { origin: controller_id, at }
            }
            other => RelayError::Storage(format!("insert controller message failed: {}", other)),
        })?;
    debug!("Stored {} message from controller {} at {}", kind, controller_id, at);

    fan_out_readings(conn, controller_id, &readings, at)?;
    Ok(at)
}

/// Ingest a broker-relayed message for `coordinator_id` under `topic`.
/// `controller_id`, when present, names the original sender.
pub fn ingest_mqtt_message(
    conn: &mut PgConnection,
    coordinator_id: Uuid,
    topic: &str,
    payload: serde_json::Value,
    controller_id: Option<Uuid>,
    at: Option<DateTime<Utc>>,
) -> Result<DateTime<Utc>, RelayError> {
    use schema::coordinators::dsl as K;
    use schema::controllers::dsl as C;
    use schema::mqtt_messages::dsl as M;

    let coordinator: Option<dbm::Coordinator> = K::coordinators
        .find(coordinator_id)
        .select(dbm::Coordinator::as_select())
        .first(conn)
        .optional()
        .map_err(|e| RelayError::Storage(format!("fetch coordinator failed: {}", e)))?;
    let coordinator = coordinator.ok_or(RelayError::UnknownOrigin(coordinator_id))?;
    if !coordinator.is_registered() {
        return Err(RelayError::UnknownOrigin(coordinator_id));
    }
    if let Some(controller_id) = controller_id {
        let known = C::controllers
            .find(controller_id)
            .count()
            .get_result::<i64>(conn)
            .map_err(|e| RelayError::Storage(format!("fetch controller failed: {}", e)))?;
        if known == 0 {
            return Err(RelayError::UnknownOrigin(controller_id));
        }
    }

    let (prefix, suffix) = parse_topic(topic)?;
    let readings = validate_payload(prefix.message_kind(), &payload)?;
    let at = at.unwrap_or_else(Utc::now);

    let row = dbm::NewMqttMessage {
        created_at: at,
        coordinator_id,
        message: payload,
        controller_id,
        topic_prefix: prefix.code().to_string(),
        topic_suffix: suffix,
    };
    diesel::insert_into(M::mqtt_messages)
        .values(&row)
        .execute(conn)
        .map_err(|e| match e {
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
                RelayError::DuplicateMessage { origin: coordinator_id, at }
            }
            other => RelayError::Storage(format!("insert mqtt message failed: {}", other)),
        })?;
    debug!(
        "Stored {} message via coordinator {} at {}",
        prefix.code(),
        coordinator_id,
        at
    );

    if let Some(controller_id) = controller_id {
        fan_out_readings(conn, controller_id, &readings, at)?;
    }
    Ok(at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn topics_decompose_into_prefix_and_suffix() {
        let (prefix, suffix) = parse_topic("tel/zone-a").unwrap();
        assert_eq!(prefix, TopicPrefix::Telemetry);
        assert_eq!(suffix, "zone-a");

        let (prefix, suffix) = parse_topic("cmd").unwrap();
        assert_eq!(prefix, TopicPrefix::Command);
        assert_eq!(suffix, "");

        // suffix stays free-form, further slashes included
        let (_, suffix) = parse_topic("reg/a/b/c").unwrap();
        assert_eq!(suffix, "a/b/c");
    }

    #[test]
    fn unrecognized_prefix_is_invalid_topic() {
        assert!(matches!(parse_topic("err/zone-a"), Err(RelayError::InvalidTopic(_))));
        assert!(matches!(parse_topic("status"), Err(RelayError::InvalidTopic(_))));
        assert!(matches!(parse_topic(""), Err(RelayError::InvalidTopic(_))));
    }

    #[test]
    fn command_payload_requires_command_field() {
        let ok = json!({"command": "set_pump", "peripheral": Uuid::new_v4(), "power": 0.5});
        assert!(validate_payload(MessageKind::Command, &ok).is_ok());

        let missing = json!({"power": 0.5});
        assert!(matches!(
            validate_payload(MessageKind::Command, &missing),
            Err(RelayError::Payload(_))
        ));
    }

    #[test]
    fn telemetry_payload_yields_readings() {
        let peripheral = Uuid::new_v4();
        let data_point_type = Uuid::new_v4();
        let payload = json!({
            "readings": [
                {"peripheral": peripheral, "data_point_type": data_point_type, "value": 21.5},
                {"peripheral": peripheral, "data_point_type": data_point_type, "value": 21.6},
            ]
        });
        let readings = validate_payload(MessageKind::Telemetry, &payload).unwrap();
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[0].peripheral, peripheral);
        assert_eq!(readings[1].value, 21.6);
    }

    #[test]
    fn telemetry_error_names_the_failing_path() {
        let payload = json!({"readings": [{"peripheral": "not-a-uuid"}]});
        match validate_payload(MessageKind::Telemetry, &payload) {
            Err(RelayError::Payload(msg)) => assert!(msg.contains("readings"), "got: {}", msg),
            other => panic!("expected payload error, got {:?}", other),
        }
    }

    #[test]
    fn non_object_payload_is_rejected_for_every_kind() {
        for kind in [
            MessageKind::Command,
            MessageKind::Telemetry,
            MessageKind::Register,
            MessageKind::Error,
        ] {
            assert!(matches!(
                validate_payload(kind, &json!([1, 2, 3])),
                Err(RelayError::Payload(_))
            ));
        }
    }

    #[test]
    fn error_payload_requires_message() {
        assert!(validate_payload(MessageKind::Error, &json!({"message": "pump stalled"})).is_ok());
        assert!(validate_payload(MessageKind::Error, &json!({})).is_err());
    }
}
