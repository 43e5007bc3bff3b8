//! The ping/claim registration handshake.
//!
//! Devices move through three states: unseen, pinged (row exists, nothing
//! bound) and claimed (coordinator bound to a site, controller bound to a
//! coordinator). Pings are anonymous upserts keyed by the device identity;
//! claims are authenticated and re-validate the address match before
//! committing. All one-to-one invariants are enforced by storage
//! constraints, so concurrent claims resolve by unique violation rather
//! than application locks.

use crate::config::Config;
use crate::db::models as dbm;
use crate::db::models::ControllerKind;
use crate::schema;
use crate::utils;
use chrono::Utc;
use core::fmt;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::PgConnection;
use log::{debug, info};
use std::error::Error;
use std::net::Ipv4Addr;
use uuid::Uuid;

/// A field-scoped validation failure; `field` of `None` is a form-level
/// error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: Option<&'static str>,
    pub message: String,
}

impl FieldError {
    pub fn on(field: &'static str, message: impl Into<String>) -> Self {
        FieldError {
            field: Some(field),
            message: message.into(),
        }
    }

    pub fn form(message: impl Into<String>) -> Self {
        FieldError {
            field: None,
            message: message.into(),
        }
    }
}

#[derive(Debug)]
pub enum PingError {
    /// The device is already claimed; anonymous pings must be replaced by
    /// the authenticated channel at the carried URL.
    UnauthenticatedPing { url: String },
    Validation(Vec<FieldError>),
    Storage(String),
}

impl fmt::Display for PingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PingError::UnauthenticatedPing { url } => {
                write!(f, "Unauthenticated ping of registered device. Use {}", url)
            }
            PingError::Validation(errors) => {
                write!(f, "validation failed: ")?;
                for (i, e) in errors.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    match e.field {
                        Some(field) => write!(f, "{}: {}", field, e.message)?,
                        None => write!(f, "{}", e.message)?,
                    }
                }
                Ok(())
            }
            PingError::Storage(s) => write!(f, "storage error: {}", s),
        }
    }
}

impl Error for PingError {}

#[derive(Debug)]
pub enum ClaimError {
    Validation(Vec<FieldError>),
    /// A concurrent claim won the unique constraint; retry against fresh
    /// state.
    Conflict(String),
    Storage(String),
}

impl fmt::Display for ClaimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClaimError::Validation(errors) => write!(f, "claim validation failed ({} error(s))", errors.len()),
            ClaimError::Conflict(s) => write!(f, "claim conflict: {}", s),
            ClaimError::Storage(s) => write!(f, "storage error: {}", s),
        }
    }
}

impl Error for ClaimError {}

/// Canonical resource URL for a claimed coordinator.
pub fn coordinator_url(cfg: &Config, id: Uuid) -> String {
    format!("https://{}/api/coordinators/{}/", cfg.server_domain, id)
}

/// Canonical resource URL for a claimed controller.
pub fn controller_url(cfg: &Config, id: Uuid) -> String {
    format!("https://{}/api/controllers/{}/", cfg.server_domain, id)
}

#[derive(Debug, Clone)]
pub struct CoordinatorPing {
    pub id: Uuid,
    pub local_ip_address: String,
}

/// Anonymous coordinator ping: create-or-update keyed by identity with the
/// server-resolved external address attached.
pub fn ping_coordinator(
    conn: &mut PgConnection,
    cfg: &Config,
    ping: &CoordinatorPing,
    external: Ipv4Addr,
) -> Result<dbm::Coordinator, PingError> {
    use schema::coordinators::dsl as K;

    // Claimed devices reject anonymous pings before any payload
    // validation; the identity alone decides.
    let existing = K::coordinators
        .find(ping.id)
        .select(dbm::Coordinator::as_select())
        .first(conn)
        .optional()
        .map_err(|e| PingError::Storage(format!("fetch coordinator failed: {}", e)))?;
    if let Some(coordinator) = existing
        && coordinator.is_registered()
    {
        return Err(PingError::UnauthenticatedPing {
            url: coordinator_url(cfg, coordinator.id),
        });
    }

    if ping.local_ip_address.parse::<Ipv4Addr>().is_err() {
        return Err(PingError::Validation(vec![FieldError::on(
            "local_ip_address",
            format!("not a valid IPv4 address: {}", ping.local_ip_address),
        )]));
    }

    let row = dbm::NewCoordinator {
        id: ping.id,
        local_ip_address: ping.local_ip_address.clone(),
        external_ip_address: external.to_string(),
    };
    diesel::insert_into(K::coordinators)
        .values(&row)
        .on_conflict(K::id)
        .do_update()
        .set((
            K::local_ip_address.eq(row.local_ip_address.clone()),
            K::external_ip_address.eq(row.external_ip_address.clone()),
            K::modified_at.eq(Utc::now()),
        ))
        .execute(conn)
        .map_err(|e| PingError::Storage(format!("upsert coordinator failed: {}", e)))?;
    debug!("Coordinator {} pinged from {}", ping.id, external);

    K::coordinators
        .find(ping.id)
        .select(dbm::Coordinator::as_select())
        .first(conn)
        .map_err(|e| PingError::Storage(format!("fetch coordinator failed: {}", e)))
}

#[derive(Debug, Clone)]
pub struct ControllerPing {
    pub id: Uuid,
    pub name: Option<String>,
    pub wifi_mac_address: String,
    pub controller_type: String,
}

/// Result of a controller ping; `token` is set when the controller was
/// unseen and a bearer token was minted for it.
#[derive(Debug, Clone)]
pub struct ControllerPingOutcome {
    pub controller: dbm::Controller,
    pub token: Option<String>,
}

/// Anonymous controller ping, same shape as the coordinator one but keyed
/// to the hardware fingerprint and controller kind.
pub fn ping_controller(
    conn: &mut PgConnection,
    cfg: &Config,
    ping: &ControllerPing,
    external: Ipv4Addr,
) -> Result<ControllerPingOutcome, PingError> {
    use schema::controller_tokens::dsl as T;
    use schema::controllers::dsl as C;

    // Claimed devices reject anonymous pings before any payload
    // validation; the identity alone decides.
    let existing = C::controllers
        .find(ping.id)
        .select(dbm::Controller::as_select())
        .first(conn)
        .optional()
        .map_err(|e| PingError::Storage(format!("fetch controller failed: {}", e)))?;
    if let Some(controller) = existing.as_ref()
        && controller.is_registered()
    {
        return Err(PingError::UnauthenticatedPing {
            url: controller_url(cfg, controller.id),
        });
    }
    let first_seen = existing.is_none();

    let mut errors = Vec::new();
    let mac = match utils::normalize_mac_address(&ping.wifi_mac_address) {
        Ok(mac) => mac,
        Err(e) => {
            errors.push(FieldError::on("wifi_mac_address", e));
            String::new()
        }
    };
    if ping.controller_type.parse::<ControllerKind>().is_err() {
        errors.push(FieldError::on(
            "controller_type",
            format!("unknown controller type: {}", ping.controller_type),
        ));
    }
    if !errors.is_empty() {
        return Err(PingError::Validation(errors));
    }

    let row = dbm::NewController {
        id: ping.id,
        name: ping.name.clone(),
        wifi_mac_address: mac,
        external_ip_address: external.to_string(),
        controller_type: ping.controller_type.clone(),
    };
    let token = conn
        .transaction::<Option<String>, DieselError, _>(|conn| {
            diesel::insert_into(C::controllers)
                .values(&row)
                .on_conflict(C::id)
                .do_update()
                .set((
                    C::name.eq(row.name.clone()),
                    C::external_ip_address.eq(row.external_ip_address.clone()),
                    C::controller_type.eq(row.controller_type.clone()),
                    C::modified_at.eq(Utc::now()),
                ))
                .execute(conn)?;

            if first_seen {
                let token = dbm::NewControllerToken {
                    key: utils::generate_token(cfg.controller_token_bytes),
                    controller_id: row.id,
                };
                diesel::insert_into(T::controller_tokens).values(&token).execute(conn)?;
                Ok(Some(token.key))
            } else {
                Ok(None)
            }
        })
        .map_err(|e| PingError::Storage(format!("upsert controller failed: {}", e)))?;
    debug!("Controller {} pinged from {}", ping.id, external);

    let controller = C::controllers
        .find(ping.id)
        .select(dbm::Controller::as_select())
        .first(conn)
        .map_err(|e| PingError::Storage(format!("fetch controller failed: {}", e)))?;
    Ok(ControllerPingOutcome { controller, token })
}

/// The pure validation kernel of the claim step.
#[derive(Debug, Clone)]
pub struct ClaimCheck<'a> {
    pub principal: Uuid,
    pub site_owner: Option<Uuid>,
    pub site_already_bound: bool,
    pub coordinator_external_ip: &'a str,
    pub claimer_external_ip: &'a str,
}

pub fn validate_claim(check: &ClaimCheck) -> Vec<FieldError> {
    let mut errors = Vec::new();
    if check.site_owner != Some(check.principal) {
        errors.push(FieldError::on("site", "site is not owned by the requesting user"));
    }
    if check.site_already_bound {
        errors.push(FieldError::on("site", "site already has a coordinator"));
    }
    // Exact value equality; the protocol is not subnet-aware.
    if check.claimer_external_ip != check.coordinator_external_ip {
        errors.push(FieldError::form(format!(
            "Your external IP address ({}) does not match the coordinator's.",
            check.claimer_external_ip
        )));
    }
    errors
}

#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub site_id: Uuid,
    pub subdomain_prefix: String,
}

/// Authenticated claim: bind `coordinator_id` to the principal's site and
/// assign the site its derived subdomain. Both writes commit in one
/// transaction or not at all; a lost unique-constraint race surfaces as
/// [`ClaimError::Conflict`].
pub fn claim_coordinator(
    conn: &mut PgConnection,
    cfg: &Config,
    principal: Uuid,
    coordinator_id: Uuid,
    request: &ClaimRequest,
    claimer_external: Ipv4Addr,
) -> Result<(dbm::Coordinator, dbm::Site), ClaimError> {
    use schema::coordinators::dsl as K;
    use schema::sites::dsl as S;

    let coordinator: dbm::Coordinator = K::coordinators
        .find(coordinator_id)
        .select(dbm::Coordinator::as_select())
        .first(conn)
        .optional()
        .map_err(|e| ClaimError::Storage(format!("fetch coordinator failed: {}", e)))?
        .ok_or_else(|| {
            ClaimError::Validation(vec![FieldError::on("coordinator", "unknown coordinator")])
        })?;
    if coordinator.is_registered() {
        return Err(ClaimError::Validation(vec![FieldError::on(
            "coordinator",
            "coordinator is already registered to a site",
        )]));
    }

    let site: Option<dbm::Site> = S::sites
        .find(request.site_id)
        .select(dbm::Site::as_select())
        .first(conn)
        .optional()
        .map_err(|e| ClaimError::Storage(format!("fetch site failed: {}", e)))?;
    let Some(site) = site else {
        return Err(ClaimError::Validation(vec![FieldError::on("site", "unknown site")]));
    };

    let site_already_bound = K::coordinators
        .filter(K::site_id.eq(site.id))
        .count()
        .get_result::<i64>(conn)
        .map_err(|e| ClaimError::Storage(format!("check site binding failed: {}", e)))?
        > 0;

    let claimer_ip = claimer_external.to_string();
    let mut errors = validate_claim(&ClaimCheck {
        principal,
        site_owner: site.owner_id,
        site_already_bound,
        coordinator_external_ip: &coordinator.external_ip_address,
        claimer_external_ip: &claimer_ip,
    });
    let subdomain = match utils::derive_subdomain(&request.subdomain_prefix, &cfg.subdomain_namespace, &cfg.server_domain)
    {
        Ok(subdomain) => subdomain,
        Err(e) => {
            errors.push(FieldError::on("subdomain_prefix", e));
            String::new()
        }
    };
    if !errors.is_empty() {
        return Err(ClaimError::Validation(errors));
    }

    conn.transaction::<_, DieselError, _>(|conn| {
        diesel::update(S::sites.find(site.id))
            .set((S::subdomain.eq(&subdomain), S::modified_at.eq(Utc::now())))
            .execute(conn)?;
        diesel::update(K::coordinators.find(coordinator.id))
            .set((K::site_id.eq(site.id), K::modified_at.eq(Utc::now())))
            .execute(conn)?;
        Ok(())
    })
    .map_err(|e| match e {
        DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
            ClaimError::Conflict(info.message().to_string())
        }
        other => ClaimError::Storage(format!("claim transaction failed: {}", other)),
    })?;
    info!("Coordinator {} claimed onto site {} ({})", coordinator.id, site.id, subdomain);

    let coordinator = K::coordinators
        .find(coordinator.id)
        .select(dbm::Coordinator::as_select())
        .first(conn)
        .map_err(|e| ClaimError::Storage(format!("fetch coordinator failed: {}", e)))?;
    let site = S::sites
        .find(site.id)
        .select(dbm::Site::as_select())
        .first(conn)
        .map_err(|e| ClaimError::Storage(format!("fetch site failed: {}", e)))?;
    Ok((coordinator, site))
}

/// Bind every unregistered controller sharing the coordinator's external
/// address to it. This is the programmatic controller claim; there is no
/// interactive select step for controllers.
pub fn claim_local_controllers(conn: &mut PgConnection, coordinator: &dbm::Coordinator) -> Result<usize, String> {
    use schema::controllers::dsl as C;

    let updated = diesel::update(
        C::controllers
            .filter(C::external_ip_address.eq(&coordinator.external_ip_address))
            .filter(C::coordinator_id.is_null()),
    )
    .set((
        C::coordinator_id.eq(coordinator.id),
        C::site_id.eq(coordinator.site_id),
        C::modified_at.eq(Utc::now()),
    ))
    .execute(conn)
    .map_err(|e| format!("claim local controllers failed: {}", e))?;
    if updated > 0 {
        info!("Coordinator {} claimed {} local controller(s)", coordinator.id, updated);
    }
    Ok(updated)
}

/// Create a login credential binding for a claimed coordinator. The
/// password and session handling live with the identity provider; the core
/// persists only the account row and the link.
pub fn create_coordinator_login(conn: &mut PgConnection, coordinator_id: Uuid) -> Result<dbm::User, String> {
    use schema::coordinators::dsl as K;
    use schema::users::dsl as U;

    let user = dbm::NewUser {
        id: Uuid::new_v4(),
        email: utils::coordinator_login_email(coordinator_id),
    };
    conn.transaction::<_, DieselError, _>(|conn| {
        diesel::insert_into(U::users).values(&user).execute(conn)?;
        diesel::update(K::coordinators.find(coordinator_id))
            .set((K::user_id.eq(user.id), K::modified_at.eq(Utc::now())))
            .execute(conn)?;
        Ok(())
    })
    .map_err(|e| format!("create coordinator login failed: {}", e))?;

    U::users
        .find(user.id)
        .select(dbm::User::as_select())
        .first(conn)
        .map_err(|e| format!("fetch user failed: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check<'a>(owner: Option<Uuid>, principal: Uuid, bound: bool, theirs: &'a str, ours: &'a str) -> ClaimCheck<'a> {
        ClaimCheck {
            principal,
            site_owner: owner,
            site_already_bound: bound,
            coordinator_external_ip: theirs,
            claimer_external_ip: ours,
        }
    }

    #[test]
    fn valid_claim_passes() {
        let user = Uuid::new_v4();
        assert!(validate_claim(&check(Some(user), user, false, "203.0.113.5", "203.0.113.5")).is_empty());
    }

    #[test]
    fn foreign_site_is_rejected() {
        let errors = validate_claim(&check(
            Some(Uuid::new_v4()),
            Uuid::new_v4(),
            false,
            "203.0.113.5",
            "203.0.113.5",
        ));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, Some("site"));
    }

    #[test]
    fn bound_site_is_rejected() {
        let user = Uuid::new_v4();
        let errors = validate_claim(&check(Some(user), user, true, "203.0.113.5", "203.0.113.5"));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "site already has a coordinator");
    }

    #[test]
    fn address_mismatch_is_a_form_error_naming_the_caller_address() {
        let user = Uuid::new_v4();
        let errors = validate_claim(&check(Some(user), user, false, "203.0.113.5", "198.51.100.7"));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, None);
        assert!(errors[0].message.contains("198.51.100.7"));
    }

    #[test]
    fn independent_failures_accumulate() {
        let errors = validate_claim(&check(None, Uuid::new_v4(), true, "203.0.113.5", "198.51.100.7"));
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn canonical_urls_embed_domain_and_id() {
        let cfg = Config {
            database_url: String::new(),
            debug: true,
            server_domain: "farms.example.com".to_string(),
            subdomain_namespace: "farms".to_string(),
            controller_token_bytes: 20,
        };
        let id = Uuid::nil();
        assert_eq!(
            coordinator_url(&cfg, id),
            "https://farms.example.com/api/coordinators/00000000-0000-0000-0000-000000000000/"
        );
        assert!(controller_url(&cfg, id).contains("/api/controllers/"));
    }
}
