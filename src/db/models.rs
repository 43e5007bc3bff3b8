//! Diesel model structs representing registry entities, message logs and
//! time-series data.
//!
//! Important: `controller_messages`, `mqtt_messages` and `data_points` are
//! append-only; their primary keys double as the uniqueness invariants the
//! protocol relies on.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::schema;

/// Kind tag of a direct controller message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    #[serde(rename = "cmd")]
    Command,
    #[serde(rename = "tel")]
    Telemetry,
    #[serde(rename = "reg")]
    Register,
    #[serde(rename = "err")]
    Error,
}

impl MessageKind {
    pub fn code(self) -> &'static str {
        match self {
            MessageKind::Command => "cmd",
            MessageKind::Telemetry => "tel",
            MessageKind::Register => "reg",
            MessageKind::Error => "err",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cmd" => Ok(MessageKind::Command),
            "tel" => Ok(MessageKind::Telemetry),
            "reg" => Ok(MessageKind::Register),
            "err" => Ok(MessageKind::Error),
            other => Err(format!("unknown message kind: {}", other)),
        }
    }
}

/// Recognized prefix of a broker-relayed message topic. Unlike direct
/// messages there is no error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopicPrefix {
    #[serde(rename = "cmd")]
    Command,
    #[serde(rename = "tel")]
    Telemetry,
    #[serde(rename = "reg")]
    Register,
}

impl TopicPrefix {
    pub fn code(self) -> &'static str {
        match self {
            TopicPrefix::Command => "cmd",
            TopicPrefix::Telemetry => "tel",
            TopicPrefix::Register => "reg",
        }
    }

    pub fn message_kind(self) -> MessageKind {
        match self {
            TopicPrefix::Command => MessageKind::Command,
            TopicPrefix::Telemetry => MessageKind::Telemetry,
            TopicPrefix::Register => MessageKind::Register,
        }
    }
}

impl FromStr for TopicPrefix {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cmd" => Ok(TopicPrefix::Command),
            "tel" => Ok(TopicPrefix::Telemetry),
            "reg" => Ok(TopicPrefix::Register),
            other => Err(format!("unknown topic prefix: {}", other)),
        }
    }
}

/// Main function of a controller (pump, dosage, camera, sensor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControllerKind {
    #[serde(rename = "PUM")]
    Pump,
    #[serde(rename = "DOS")]
    Dosage,
    #[serde(rename = "CAM")]
    Camera,
    #[serde(rename = "SEN")]
    Sensor,
    #[serde(rename = "UNK")]
    Unknown,
}

impl ControllerKind {
    pub fn code(self) -> &'static str {
        match self {
            ControllerKind::Pump => "PUM",
            ControllerKind::Dosage => "DOS",
            ControllerKind::Camera => "CAM",
            ControllerKind::Sensor => "SEN",
            ControllerKind::Unknown => "UNK",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ControllerKind::Pump => "Pump controller",
            ControllerKind::Dosage => "Dosage controller",
            ControllerKind::Camera => "Camera controller",
            ControllerKind::Sensor => "Sensor controller",
            ControllerKind::Unknown => "Unknown controller",
        }
    }
}

impl FromStr for ControllerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PUM" => Ok(ControllerKind::Pump),
            "DOS" => Ok(ControllerKind::Dosage),
            "CAM" => Ok(ControllerKind::Camera),
            "SEN" => Ok(ControllerKind::Sensor),
            "UNK" => Ok(ControllerKind::Unknown),
            other => Err(format!("unknown controller type: {}", other)),
        }
    }
}

/// Hydroponic system construction type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemType {
    #[serde(rename = "VT")]
    VerticalTower,
    #[serde(rename = "FD")]
    FloodAndDrain,
    #[serde(rename = "NFT")]
    NutrientFilmTechnique,
    #[serde(rename = "DWC")]
    DeepWaterCulture,
}

impl SystemType {
    pub fn code(self) -> &'static str {
        match self {
            SystemType::VerticalTower => "VT",
            SystemType::FloodAndDrain => "FD",
            SystemType::NutrientFilmTechnique => "NFT",
            SystemType::DeepWaterCulture => "DWC",
        }
    }
}

impl FromStr for SystemType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "VT" => Ok(SystemType::VerticalTower),
            "FD" => Ok(SystemType::FloodAndDrain),
            "NFT" => Ok(SystemType::NutrientFilmTechnique),
            "DWC" => Ok(SystemType::DeepWaterCulture),
            other => Err(format!("unknown system type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::users)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::users)]
pub struct NewUser {
    pub id: Uuid,
    pub email: String,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::sites)]
#[diesel(belongs_to(User, foreign_key = owner_id))]
pub struct Site {
    pub id: Uuid,
    pub name: String,
    pub owner_id: Option<Uuid>,
    pub address_line1: Option<String>,
    pub address_line2: Option<String>,
    pub zip_code: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub subdomain: Option<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::sites)]
pub struct NewSite {
    pub id: Uuid,
    pub name: String,
    pub owner_id: Option<Uuid>,
    pub address_line1: Option<String>,
    pub address_line2: Option<String>,
    pub zip_code: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::hydroponic_systems)]
#[diesel(belongs_to(Site))]
pub struct HydroponicSystem {
    pub id: Uuid,
    pub site_id: Uuid,
    pub name: Option<String>,
    pub system_type: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::hydroponic_systems)]
pub struct NewHydroponicSystem {
    pub id: Uuid,
    pub site_id: Uuid,
    pub name: Option<String>,
    pub system_type: String,
}

/// On-site relay device. Registered iff `site_id` is set.
#[derive(Debug, Clone, Queryable, Identifiable, Associations, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::coordinators)]
#[diesel(belongs_to(Site))]
pub struct Coordinator {
    pub id: Uuid,
    pub site_id: Option<Uuid>,
    pub local_ip_address: String,
    pub external_ip_address: String,
    pub channel_name: String,
    pub user_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl Coordinator {
    pub fn is_registered(&self) -> bool {
        self.site_id.is_some()
    }
}

#[derive(Debug, Clone, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::coordinators)]
pub struct NewCoordinator {
    pub id: Uuid,
    pub local_ip_address: String,
    pub external_ip_address: String,
}

/// Physical actuator/sensor device. Registered iff `coordinator_id` is set.
#[derive(Debug, Clone, Queryable, Identifiable, Associations, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::controllers)]
#[diesel(belongs_to(Coordinator))]
#[diesel(belongs_to(Site))]
pub struct Controller {
    pub id: Uuid,
    pub name: Option<String>,
    pub coordinator_id: Option<Uuid>,
    pub site_id: Option<Uuid>,
    pub wifi_mac_address: String,
    pub external_ip_address: String,
    pub controller_type: String,
    pub channel_name: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl Controller {
    pub fn is_registered(&self) -> bool {
        self.coordinator_id.is_some()
    }
}

#[derive(Debug, Clone, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::controllers)]
pub struct NewController {
    pub id: Uuid,
    pub name: Option<String>,
    pub wifi_mac_address: String,
    pub external_ip_address: String,
    pub controller_type: String,
}

/// Bearer token minted when a controller is first seen.
#[derive(Debug, Clone, Queryable, Identifiable, Associations, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::controller_tokens)]
#[diesel(primary_key(key))]
#[diesel(belongs_to(Controller))]
pub struct ControllerToken {
    pub key: String,
    pub controller_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::controller_tokens)]
pub struct NewControllerToken {
    pub key: String,
    pub controller_id: Uuid,
}

/// A sensor or actuator attached to a controller; the source of data points.
#[derive(Debug, Clone, Queryable, Identifiable, Associations, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::peripherals)]
#[diesel(belongs_to(Controller))]
pub struct Peripheral {
    pub id: Uuid,
    pub controller_id: Uuid,
    pub name: String,
    pub peripheral_type: String,
    pub config: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::peripherals)]
pub struct NewPeripheral {
    pub id: Uuid,
    pub controller_id: Uuid,
    pub name: String,
    pub peripheral_type: String,
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::controller_messages)]
#[diesel(primary_key(created_at, controller_id))]
#[diesel(belongs_to(Controller))]
pub struct ControllerMessage {
    pub created_at: DateTime<Utc>,
    pub controller_id: Uuid,
    pub kind: String,
    pub message: serde_json::Value,
}

#[derive(Debug, Clone, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::controller_messages)]
pub struct NewControllerMessage {
    pub created_at: DateTime<Utc>,
    pub controller_id: Uuid,
    pub kind: String,
    pub message: serde_json::Value,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::mqtt_messages)]
#[diesel(primary_key(created_at, coordinator_id))]
#[diesel(belongs_to(Coordinator))]
pub struct MqttMessage {
    pub created_at: DateTime<Utc>,
    pub coordinator_id: Uuid,
    pub message: serde_json::Value,
    pub controller_id: Option<Uuid>,
    pub topic_prefix: String,
    pub topic_suffix: String,
}

#[derive(Debug, Clone, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::mqtt_messages)]
pub struct NewMqttMessage {
    pub created_at: DateTime<Utc>,
    pub coordinator_id: Uuid,
    pub message: serde_json::Value,
    pub controller_id: Option<Uuid>,
    pub topic_prefix: String,
    pub topic_suffix: String,
}

/// A (name, unit) pair describing a measurement kind.
#[derive(Debug, Clone, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::data_point_types)]
pub struct DataPointType {
    pub id: Uuid,
    pub name: String,
    pub unit: String,
}

#[derive(Debug, Clone, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::data_point_types)]
pub struct NewDataPointType {
    pub id: Uuid,
    pub name: String,
    pub unit: String,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::data_points)]
#[diesel(primary_key(time))]
#[diesel(belongs_to(Peripheral))]
#[diesel(belongs_to(DataPointType))]
pub struct DataPoint {
    pub time: DateTime<Utc>,
    pub peripheral_id: Uuid,
    pub data_point_type_id: Uuid,
    pub value: f64,
}

#[derive(Debug, Clone, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::data_points)]
pub struct NewDataPoint {
    pub time: DateTime<Utc>,
    pub peripheral_id: Uuid,
    pub data_point_type_id: Uuid,
    pub value: f64,
}

/// Row written by the external background-task runner.
#[derive(Debug, Clone, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::task_results)]
#[diesel(primary_key(task_id))]
pub struct TaskResult {
    pub task_id: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_kind_codes_round_trip() {
        for kind in [
            MessageKind::Command,
            MessageKind::Telemetry,
            MessageKind::Register,
            MessageKind::Error,
        ] {
            assert_eq!(kind.code().parse::<MessageKind>().unwrap(), kind);
        }
        assert!("bogus".parse::<MessageKind>().is_err());
    }

    #[test]
    fn topic_prefix_has_no_error_kind() {
        assert!("err".parse::<TopicPrefix>().is_err());
        assert_eq!("tel".parse::<TopicPrefix>().unwrap().message_kind(), MessageKind::Telemetry);
    }

    #[test]
    fn controller_kind_labels() {
        assert_eq!("PUM".parse::<ControllerKind>().unwrap().label(), "Pump controller");
        assert_eq!(ControllerKind::Unknown.code(), "UNK");
    }
}
