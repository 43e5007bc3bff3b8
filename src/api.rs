//! Transport-agnostic request boundary.
//!
//! Handlers here are what the HTTP/WebSocket shells call: they take an
//! explicit authenticated principal (never ambient session state), a
//! connection, and a deserialized request body, and return response
//! documents or an [`ApiError`] carrying the status code and structured
//! detail the shell should render.

use crate::addressing::{self, AddressError, RequestMeta};
use crate::config::Config;
use crate::db::models as dbm;
use crate::services::registration::{
    self, ClaimError, ClaimRequest, ControllerPing, CoordinatorPing, FieldError, PingError,
};
use crate::services::registry;
use crate::services::relay::RelayError;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::PgConnection;
use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

/// The authenticated caller, as established by the identity provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal {
    pub user_id: Uuid,
}

/// A request-boundary failure: a status code plus the structured detail
/// document the transport shell renders as the response body.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiError {
    status: StatusCode,
    detail: Value,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn detail(&self) -> &Value {
        &self.detail
    }

    fn bad_request(detail: Value) -> Self {
        ApiError {
            status: StatusCode::BAD_REQUEST,
            detail,
        }
    }

    fn not_found() -> Self {
        ApiError {
            status: StatusCode::NOT_FOUND,
            detail: json!({"detail": "Not found."}),
        }
    }

    fn internal(message: String) -> Self {
        ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            detail: json!({"detail": message}),
        }
    }
}

/// Render field errors the way interactive forms expect them: a map of
/// field name (or `non_field_errors`) to message list.
fn field_errors_to_detail(errors: &[FieldError]) -> Value {
    let mut map = serde_json::Map::new();
    for error in errors {
        let key = error.field.unwrap_or("non_field_errors");
        match map.get_mut(key) {
            Some(Value::Array(messages)) => messages.push(Value::String(error.message.clone())),
            _ => {
                map.insert(key.to_string(), json!([error.message]));
            }
        }
    }
    Value::Object(map)
}

impl From<AddressError> for ApiError {
    fn from(value: AddressError) -> Self {
        ApiError::bad_request(json!({"detail": value.to_string()}))
    }
}

impl From<PingError> for ApiError {
    fn from(value: PingError) -> Self {
        match value {
            PingError::UnauthenticatedPing { url } => ApiError {
                status: StatusCode::FORBIDDEN,
                detail: json!({
                    "detail": format!("Unauthenticated ping of registered device. Use {}", url)
                }),
            },
            PingError::Validation(errors) => ApiError::bad_request(field_errors_to_detail(&errors)),
            PingError::Storage(message) => ApiError::internal(message),
        }
    }
}

impl From<ClaimError> for ApiError {
    fn from(value: ClaimError) -> Self {
        match value {
            ClaimError::Validation(errors) => ApiError::bad_request(field_errors_to_detail(&errors)),
            ClaimError::Conflict(message) => ApiError {
                status: StatusCode::CONFLICT,
                detail: json!({"detail": message}),
            },
            ClaimError::Storage(message) => ApiError::internal(message),
        }
    }
}

impl From<RelayError> for ApiError {
    fn from(value: RelayError) -> Self {
        match value {
            RelayError::UnknownOrigin(_) => ApiError::not_found(),
            RelayError::InvalidTopic(_) | RelayError::Payload(_) => {
                ApiError::bad_request(json!({"detail": value.to_string()}))
            }
            RelayError::DuplicateMessage { .. } => ApiError {
                status: StatusCode::CONFLICT,
                detail: json!({"detail": value.to_string()}),
            },
            RelayError::Storage(message) => ApiError::internal(message),
        }
    }
}

impl From<String> for ApiError {
    fn from(value: String) -> Self {
        ApiError::internal(value)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorPingRequest {
    pub id: Uuid,
    pub local_ip_address: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorResponse {
    pub id: Uuid,
    pub site: Option<Uuid>,
    pub local_ip_address: String,
    pub external_ip_address: String,
    pub url: String,
}

impl CoordinatorResponse {
    fn from_model(cfg: &Config, coordinator: &dbm::Coordinator) -> Self {
        CoordinatorResponse {
            id: coordinator.id,
            site: coordinator.site_id,
            local_ip_address: coordinator.local_ip_address.clone(),
            external_ip_address: coordinator.external_ip_address.clone(),
            url: registration::coordinator_url(cfg, coordinator.id),
        }
    }
}

/// `POST /coordinators/ping`
pub fn coordinator_ping(
    conn: &mut PgConnection,
    cfg: &Config,
    meta: &RequestMeta,
    request: &CoordinatorPingRequest,
) -> Result<CoordinatorResponse, ApiError> {
    let external = addressing::resolve_external_address(meta, cfg.strict_addressing())?;
    let ping = CoordinatorPing {
        id: request.id,
        local_ip_address: request.local_ip_address.clone(),
    };
    let coordinator = registration::ping_coordinator(conn, cfg, &ping, external)?;
    Ok(CoordinatorResponse::from_model(cfg, &coordinator))
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct ControllerPingLookupResponse {
    pub coordinator_local_ip_address: Option<String>,
}

/// `GET /controllers/ping` — the local address of a coordinator sharing
/// the caller's external address, if one exists.
pub fn controller_ping_lookup(
    conn: &mut PgConnection,
    cfg: &Config,
    meta: &RequestMeta,
) -> Result<ControllerPingLookupResponse, ApiError> {
    let external = addressing::resolve_external_address(meta, cfg.strict_addressing())?;
    let coordinator_local_ip_address = registry::first_coordinator_local_address(conn, external)?;
    Ok(ControllerPingLookupResponse {
        coordinator_local_ip_address,
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControllerPingRequest {
    pub id: Uuid,
    #[serde(default)]
    pub name: Option<String>,
    pub wifi_mac_address: String,
    #[serde(default = "default_controller_type")]
    pub controller_type: String,
}

fn default_controller_type() -> String {
    dbm::ControllerKind::Unknown.code().to_string()
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerResponse {
    pub id: Uuid,
    pub name: Option<String>,
    pub coordinator: Option<Uuid>,
    pub site: Option<Uuid>,
    pub wifi_mac_address: String,
    pub external_ip_address: String,
    pub controller_type: String,
    pub url: String,
    /// Bearer token, present only in the response that minted it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl ControllerResponse {
    fn from_model(cfg: &Config, controller: &dbm::Controller, token: Option<String>) -> Self {
        ControllerResponse {
            id: controller.id,
            name: controller.name.clone(),
            coordinator: controller.coordinator_id,
            site: controller.site_id,
            wifi_mac_address: controller.wifi_mac_address.clone(),
            external_ip_address: controller.external_ip_address.clone(),
            controller_type: controller.controller_type.clone(),
            url: registration::controller_url(cfg, controller.id),
            token,
        }
    }
}

/// `POST /controllers/ping`
pub fn controller_ping(
    conn: &mut PgConnection,
    cfg: &Config,
    meta: &RequestMeta,
    request: &ControllerPingRequest,
) -> Result<ControllerResponse, ApiError> {
    let external = addressing::resolve_external_address(meta, cfg.strict_addressing())?;
    let ping = ControllerPing {
        id: request.id,
        name: request.name.clone(),
        wifi_mac_address: request.wifi_mac_address.clone(),
        controller_type: request.controller_type.clone(),
    };
    let outcome = registration::ping_controller(conn, cfg, &ping, external)?;
    Ok(ControllerResponse::from_model(cfg, &outcome.controller, outcome.token))
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSiteRequest {
    pub name: String,
    #[serde(default)]
    pub address_line1: Option<String>,
    #[serde(default)]
    pub address_line2: Option<String>,
    #[serde(default)]
    pub zip_code: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SiteResponse {
    pub id: Uuid,
    pub name: String,
    pub owner: Option<Uuid>,
    pub subdomain: Option<String>,
    pub address_line1: Option<String>,
    pub address_line2: Option<String>,
    pub zip_code: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl From<dbm::Site> for SiteResponse {
    fn from(site: dbm::Site) -> Self {
        SiteResponse {
            id: site.id,
            name: site.name,
            owner: site.owner_id,
            subdomain: site.subdomain,
            address_line1: site.address_line1,
            address_line2: site.address_line2,
            zip_code: site.zip_code,
            city: site.city,
            state: site.state,
            country: site.country,
            created_at: site.created_at,
            modified_at: site.modified_at,
        }
    }
}

/// `GET /sites`, scoped to the principal.
pub fn list_sites(conn: &mut PgConnection, principal: Principal) -> Result<Vec<SiteResponse>, ApiError> {
    let sites = registry::list_sites_owned(conn, principal.user_id)?;
    Ok(sites.into_iter().map(SiteResponse::from).collect())
}

/// `POST /sites`
pub fn create_site(
    conn: &mut PgConnection,
    principal: Principal,
    request: &CreateSiteRequest,
) -> Result<SiteResponse, ApiError> {
    let name = request.name.trim();
    if name.is_empty() || name.len() > 30 {
        return Err(ApiError::bad_request(field_errors_to_detail(&[FieldError::on(
            "name",
            "name must be between 1 and 30 characters",
        )])));
    }
    let site = registry::create_site(
        conn,
        &dbm::NewSite {
            id: Uuid::new_v4(),
            name: name.to_string(),
            owner_id: Some(principal.user_id),
            address_line1: request.address_line1.clone(),
            address_line2: request.address_line2.clone(),
            zip_code: request.zip_code.clone(),
            city: request.city.clone(),
            state: request.state.clone(),
            country: request.country.clone(),
        },
    )?;
    Ok(SiteResponse::from(site))
}

#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorSelectResponse {
    pub unregistered: Vec<CoordinatorResponse>,
    pub registered: Vec<CoordinatorResponse>,
}

/// The authenticated select step: coordinators sharing the caller's own
/// external address, grouped and ordered for the claim form.
pub fn coordinator_setup_select(
    conn: &mut PgConnection,
    cfg: &Config,
    meta: &RequestMeta,
) -> Result<CoordinatorSelectResponse, ApiError> {
    let external = addressing::resolve_external_address(meta, cfg.strict_addressing())?;
    let groups = registry::find_coordinators_by_address(conn, external)?;
    Ok(CoordinatorSelectResponse {
        unregistered: groups
            .unregistered
            .iter()
            .map(|c| CoordinatorResponse::from_model(cfg, c))
            .collect(),
        registered: groups
            .registered
            .iter()
            .map(|c| CoordinatorResponse::from_model(cfg, c))
            .collect(),
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClaimCoordinatorRequest {
    pub site: Uuid,
    pub subdomain_prefix: String,
}

/// `POST /coordinators/{id}/claim`
pub fn claim_coordinator(
    conn: &mut PgConnection,
    cfg: &Config,
    principal: Principal,
    meta: &RequestMeta,
    coordinator_id: Uuid,
    request: &ClaimCoordinatorRequest,
) -> Result<CoordinatorResponse, ApiError> {
    let external = addressing::resolve_external_address(meta, cfg.strict_addressing())?;
    let claim = ClaimRequest {
        site_id: request.site,
        subdomain_prefix: request.subdomain_prefix.clone(),
    };
    let (coordinator, _site) =
        registration::claim_coordinator(conn, cfg, principal.user_id, coordinator_id, &claim, external)?;
    Ok(CoordinatorResponse::from_model(cfg, &coordinator))
}

/// `GET /coordinators`, scoped to sites the principal owns.
pub fn list_coordinators(
    conn: &mut PgConnection,
    cfg: &Config,
    principal: Principal,
) -> Result<Vec<CoordinatorResponse>, ApiError> {
    let coordinators = registry::list_coordinators_owned(conn, principal.user_id)?;
    Ok(coordinators
        .iter()
        .map(|c| CoordinatorResponse::from_model(cfg, c))
        .collect())
}

fn owned_coordinator(
    conn: &mut PgConnection,
    principal: Principal,
    coordinator_id: Uuid,
) -> Result<dbm::Coordinator, ApiError> {
    let coordinator = registry::get_coordinator(conn, coordinator_id)?.ok_or_else(ApiError::not_found)?;
    let site_id = coordinator.site_id.ok_or_else(ApiError::not_found)?;
    let site = registry::get_site(conn, site_id)?.ok_or_else(ApiError::not_found)?;
    if site.owner_id != Some(principal.user_id) {
        return Err(ApiError::not_found());
    }
    Ok(coordinator)
}

/// `GET /coordinators/{id}`
pub fn get_coordinator(
    conn: &mut PgConnection,
    cfg: &Config,
    principal: Principal,
    coordinator_id: Uuid,
) -> Result<CoordinatorResponse, ApiError> {
    let coordinator = owned_coordinator(conn, principal, coordinator_id)?;
    Ok(CoordinatorResponse::from_model(cfg, &coordinator))
}

#[derive(Debug, Clone, Serialize)]
pub struct MqttMessageResponse {
    pub created_at: DateTime<Utc>,
    pub coordinator: Uuid,
    pub controller: Option<Uuid>,
    pub topic_prefix: String,
    pub topic_suffix: String,
    pub message: Value,
}

/// `GET /coordinators/{id}/mqtt-messages`
pub fn list_mqtt_messages(
    conn: &mut PgConnection,
    principal: Principal,
    coordinator_id: Uuid,
) -> Result<Vec<MqttMessageResponse>, ApiError> {
    owned_coordinator(conn, principal, coordinator_id)?;
    let messages = registry::list_mqtt_messages(conn, coordinator_id)?;
    Ok(messages
        .into_iter()
        .map(|m| MqttMessageResponse {
            created_at: m.created_at,
            coordinator: m.coordinator_id,
            controller: m.controller_id,
            topic_prefix: m.topic_prefix,
            topic_suffix: m.topic_suffix,
            message: m.message,
        })
        .collect())
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskStatusResponse {
    pub status: String,
}

/// `GET /tasks/{id}/status` — the external task runner writes terminal
/// statuses; anything unknown is still pending.
pub fn task_status(conn: &mut PgConnection, task_id: &str) -> Result<TaskStatusResponse, ApiError> {
    use crate::schema::task_results::dsl as T;

    let status: Option<String> = T::task_results
        .find(task_id)
        .select(T::status)
        .first(conn)
        .optional()
        .map_err(|e| ApiError::internal(format!("fetch task result failed: {}", e)))?;
    Ok(TaskStatusResponse {
        status: status.unwrap_or_else(|| "PENDING".to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthenticated_ping_maps_to_forbidden_with_redirect_detail() {
        let error = ApiError::from(PingError::UnauthenticatedPing {
            url: "https://farms.example.com/api/coordinators/abc/".to_string(),
        });
        assert_eq!(error.status(), StatusCode::FORBIDDEN);
        let detail = error.detail()["detail"].as_str().unwrap();
        assert!(detail.starts_with("Unauthenticated ping of registered device. Use https://"));
    }

    #[test]
    fn field_errors_group_by_field_name() {
        let detail = field_errors_to_detail(&[
            FieldError::on("site", "site is not owned by the requesting user"),
            FieldError::on("site", "site already has a coordinator"),
            FieldError::form("external address mismatch"),
        ]);
        assert_eq!(detail["site"].as_array().unwrap().len(), 2);
        assert_eq!(
            detail["non_field_errors"][0].as_str().unwrap(),
            "external address mismatch"
        );
    }

    #[test]
    fn address_errors_map_to_bad_request() {
        let error = ApiError::from(AddressError::NotRoutable("10.0.0.1".parse().unwrap()));
        assert_eq!(error.status(), StatusCode::BAD_REQUEST);
        assert!(error.detail()["detail"].as_str().unwrap().contains("10.0.0.1"));
    }

    #[test]
    fn duplicate_message_maps_to_conflict() {
        let error = ApiError::from(RelayError::DuplicateMessage {
            origin: Uuid::nil(),
            at: Utc::now(),
        });
        assert_eq!(error.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn claim_conflict_maps_to_conflict_status() {
        let error = ApiError::from(ClaimError::Conflict("coordinators_site_id_key".to_string()));
        assert_eq!(error.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn unknown_origin_maps_to_not_found() {
        let error = ApiError::from(RelayError::UnknownOrigin(Uuid::nil()));
        assert_eq!(error.status(), StatusCode::NOT_FOUND);
    }
}
