//! Device registry queries.
//!
//! Lookups never error on an empty result; callers get empty collections.
//! The address-keyed queries below are what lets a coordinator discover
//! unclaimed controllers behind the same NAT, and a user discover
//! coordinators behind their own.

use crate::db::models as dbm;
use crate::schema;
use diesel::prelude::*;
use diesel::PgConnection;
use std::net::Ipv4Addr;
use uuid::Uuid;

/// Coordinators sharing an external address, split by registration state.
#[derive(Debug, Clone, Default)]
pub struct CoordinatorsByAddress {
    pub unregistered: Vec<dbm::Coordinator>,
    pub registered: Vec<dbm::Coordinator>,
}

/// Controllers with no bound coordinator whose last-known external address
/// equals `addr`.
pub fn find_unregistered_controllers_sharing_address(
    conn: &mut PgConnection,
    addr: Ipv4Addr,
) -> Result<Vec<dbm::Controller>, String> {
    use schema::controllers::dsl as C;

    C::controllers
        .filter(C::external_ip_address.eq(addr.to_string()))
        .filter(C::coordinator_id.is_null())
        .select(dbm::Controller::as_select())
        .load(conn)
        .map_err(|e| format!("query unregistered controllers failed: {}", e))
}

/// All coordinators sharing `addr`, partitioned into unregistered and
/// registered groups, each most recently modified first.
pub fn find_coordinators_by_address(
    conn: &mut PgConnection,
    addr: Ipv4Addr,
) -> Result<CoordinatorsByAddress, String> {
    use schema::coordinators::dsl as K;

    let rows: Vec<dbm::Coordinator> = K::coordinators
        .filter(K::external_ip_address.eq(addr.to_string()))
        .select(dbm::Coordinator::as_select())
        .load(conn)
        .map_err(|e| format!("query coordinators by address failed: {}", e))?;
    Ok(partition_by_registration(rows))
}

pub fn partition_by_registration(mut coordinators: Vec<dbm::Coordinator>) -> CoordinatorsByAddress {
    coordinators.sort_by(|a, b| b.modified_at.cmp(&a.modified_at));
    let (registered, unregistered) = coordinators.into_iter().partition(dbm::Coordinator::is_registered);
    CoordinatorsByAddress {
        unregistered,
        registered,
    }
}

/// Local address of the most recently seen coordinator sharing `addr`, if
/// any. Answers the controller ping lookup.
pub fn first_coordinator_local_address(
    conn: &mut PgConnection,
    addr: Ipv4Addr,
) -> Result<Option<String>, String> {
    use schema::coordinators::dsl as K;

    K::coordinators
        .filter(K::external_ip_address.eq(addr.to_string()))
        .order(K::modified_at.desc())
        .select(K::local_ip_address)
        .first(conn)
        .optional()
        .map_err(|e| format!("query coordinator local address failed: {}", e))
}

pub fn get_coordinator(conn: &mut PgConnection, id: Uuid) -> Result<Option<dbm::Coordinator>, String> {
    use schema::coordinators::dsl as K;

    K::coordinators
        .find(id)
        .select(dbm::Coordinator::as_select())
        .first(conn)
        .optional()
        .map_err(|e| format!("fetch coordinator failed: {}", e))
}

pub fn get_controller(conn: &mut PgConnection, id: Uuid) -> Result<Option<dbm::Controller>, String> {
    use schema::controllers::dsl as C;

    C::controllers
        .find(id)
        .select(dbm::Controller::as_select())
        .first(conn)
        .optional()
        .map_err(|e| format!("fetch controller failed: {}", e))
}

pub fn get_site(conn: &mut PgConnection, id: Uuid) -> Result<Option<dbm::Site>, String> {
    use schema::sites::dsl as S;

    S::sites
        .find(id)
        .select(dbm::Site::as_select())
        .first(conn)
        .optional()
        .map_err(|e| format!("fetch site failed: {}", e))
}

pub fn list_sites_owned(conn: &mut PgConnection, owner: Uuid) -> Result<Vec<dbm::Site>, String> {
    use schema::sites::dsl as S;

    S::sites
        .filter(S::owner_id.eq(owner))
        .order(S::created_at.asc())
        .select(dbm::Site::as_select())
        .load(conn)
        .map_err(|e| format!("list sites failed: {}", e))
}

/// Sites owned by `owner` that have no coordinator bound yet; the claim
/// form's site choices.
pub fn list_sites_available_for_claim(conn: &mut PgConnection, owner: Uuid) -> Result<Vec<dbm::Site>, String> {
    use schema::coordinators::dsl as K;
    use schema::sites::dsl as S;

    S::sites
        .left_join(K::coordinators)
        .filter(S::owner_id.eq(owner))
        .filter(K::id.nullable().is_null())
        .order(S::created_at.asc())
        .select(dbm::Site::as_select())
        .load(conn)
        .map_err(|e| format!("list claimable sites failed: {}", e))
}

pub fn create_site(conn: &mut PgConnection, site: &dbm::NewSite) -> Result<dbm::Site, String> {
    use schema::sites::dsl as S;

    diesel::insert_into(S::sites)
        .values(site)
        .execute(conn)
        .map_err(|e| format!("insert site failed: {}", e))?;
    S::sites
        .find(site.id)
        .select(dbm::Site::as_select())
        .first(conn)
        .map_err(|e| format!("fetch site failed: {}", e))
}

/// Coordinators bound to sites the user owns.
pub fn list_coordinators_owned(conn: &mut PgConnection, owner: Uuid) -> Result<Vec<dbm::Coordinator>, String> {
    use schema::coordinators::dsl as K;
    use schema::sites::dsl as S;

    K::coordinators
        .inner_join(S::sites)
        .filter(S::owner_id.eq(owner))
        .order(K::modified_at.desc())
        .select(dbm::Coordinator::as_select())
        .load(conn)
        .map_err(|e| format!("list coordinators failed: {}", e))
}

pub fn list_hydroponic_systems(conn: &mut PgConnection, site_id: Uuid) -> Result<Vec<dbm::HydroponicSystem>, String> {
    use schema::hydroponic_systems::dsl as H;

    H::hydroponic_systems
        .filter(H::site_id.eq(site_id))
        .order(H::created_at.asc())
        .select(dbm::HydroponicSystem::as_select())
        .load(conn)
        .map_err(|e| format!("list hydroponic systems failed: {}", e))
}

pub fn create_hydroponic_system(
    conn: &mut PgConnection,
    system: &dbm::NewHydroponicSystem,
) -> Result<dbm::HydroponicSystem, String> {
    use schema::hydroponic_systems::dsl as H;

    system
        .system_type
        .parse::<dbm::SystemType>()
        .map_err(|e| format!("invalid hydroponic system: {}", e))?;
    diesel::insert_into(H::hydroponic_systems)
        .values(system)
        .execute(conn)
        .map_err(|e| format!("insert hydroponic system failed: {}", e))?;
    H::hydroponic_systems
        .find(system.id)
        .select(dbm::HydroponicSystem::as_select())
        .first(conn)
        .map_err(|e| format!("fetch hydroponic system failed: {}", e))
}

pub fn list_peripherals(conn: &mut PgConnection, controller_id: Uuid) -> Result<Vec<dbm::Peripheral>, String> {
    use schema::peripherals::dsl as P;

    P::peripherals
        .filter(P::controller_id.eq(controller_id))
        .order(P::created_at.asc())
        .select(dbm::Peripheral::as_select())
        .load(conn)
        .map_err(|e| format!("list peripherals failed: {}", e))
}

pub fn create_peripheral(conn: &mut PgConnection, peripheral: &dbm::NewPeripheral) -> Result<dbm::Peripheral, String> {
    use schema::peripherals::dsl as P;

    diesel::insert_into(P::peripherals)
        .values(peripheral)
        .execute(conn)
        .map_err(|e| format!("insert peripheral failed: {}", e))?;
    P::peripherals
        .find(peripheral.id)
        .select(dbm::Peripheral::as_select())
        .first(conn)
        .map_err(|e| format!("fetch peripheral failed: {}", e))
}

/// Record the live-connection channel for a coordinator; `None` clears it
/// (socket closed). The default naming scheme is
/// [`crate::utils::device_channel_name`].
pub fn set_coordinator_channel(
    conn: &mut PgConnection,
    coordinator_id: Uuid,
    channel_name: Option<&str>,
) -> Result<(), String> {
    use schema::coordinators::dsl as K;

    diesel::update(K::coordinators.find(coordinator_id))
        .set(K::channel_name.eq(channel_name.unwrap_or("")))
        .execute(conn)
        .map_err(|e| format!("set coordinator channel failed: {}", e))?;
    Ok(())
}

pub fn set_controller_channel(
    conn: &mut PgConnection,
    controller_id: Uuid,
    channel_name: Option<&str>,
) -> Result<(), String> {
    use schema::controllers::dsl as C;

    diesel::update(C::controllers.find(controller_id))
        .set(C::channel_name.eq(channel_name.unwrap_or("")))
        .execute(conn)
        .map_err(|e| format!("set controller channel failed: {}", e))?;
    Ok(())
}

pub fn list_mqtt_messages(conn: &mut PgConnection, coordinator_id: Uuid) -> Result<Vec<dbm::MqttMessage>, String> {
    use schema::mqtt_messages::dsl as M;

    M::mqtt_messages
        .filter(M::coordinator_id.eq(coordinator_id))
        .order(M::created_at.asc())
        .select(dbm::MqttMessage::as_select())
        .load(conn)
        .map_err(|e| format!("list mqtt messages failed: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn coordinator(site: Option<Uuid>, modified_minute: u32) -> dbm::Coordinator {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, modified_minute, 0).unwrap();
        dbm::Coordinator {
            id: Uuid::new_v4(),
            site_id: site,
            local_ip_address: "192.168.0.2".to_string(),
            external_ip_address: "203.0.113.5".to_string(),
            channel_name: String::new(),
            user_id: None,
            created_at: at,
            modified_at: at,
        }
    }

    #[test]
    fn partitions_by_registration_state() {
        let bound = coordinator(Some(Uuid::new_v4()), 10);
        let free = coordinator(None, 20);
        let groups = partition_by_registration(vec![bound.clone(), free.clone()]);
        assert_eq!(groups.unregistered.len(), 1);
        assert_eq!(groups.unregistered[0].id, free.id);
        assert_eq!(groups.registered.len(), 1);
        assert_eq!(groups.registered[0].id, bound.id);
    }

    #[test]
    fn groups_are_most_recent_first() {
        let older = coordinator(None, 5);
        let newer = coordinator(None, 45);
        let groups = partition_by_registration(vec![older.clone(), newer.clone()]);
        assert_eq!(
            groups.unregistered.iter().map(|c| c.id).collect::<Vec<_>>(),
            vec![newer.id, older.id]
        );
        assert!(groups.registered.is_empty());
    }

    #[test]
    fn empty_input_yields_empty_groups() {
        let groups = partition_by_registration(Vec::new());
        assert!(groups.unregistered.is_empty());
        assert!(groups.registered.is_empty());
    }
}
