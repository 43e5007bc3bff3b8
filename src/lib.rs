pub mod db {
    pub mod models;
}

pub mod addressing;
pub mod api;
pub mod config;
pub mod schema;
pub mod services {
    pub mod registration;
    pub mod registry;
    pub mod relay;
    pub mod telemetry;
}
pub mod utils;

use crate::config::Config;
use crate::services::telemetry;
use diesel::prelude::*;
use diesel::PgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use log::info;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

pub fn apply_database_migrations(conn: &mut PgConnection) -> Result<(), String> {
    match conn.run_pending_migrations(MIGRATIONS) {
        Ok(applied) => {
            if applied.is_empty() {
                info!("Database schema is up to date; no migrations were applied");
            } else {
                let names = applied.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ");
                info!("Applied {} database migration(s): {}", applied.len(), names);
            }
            Ok(())
        }
        Err(e) => Err(format!("Applying database migrations failed: {}", e)),
    }
}

fn log_registry_summary(conn: &mut PgConnection) -> Result<(), String> {
    use crate::schema::controllers::dsl as C;
    use crate::schema::coordinators::dsl as K;
    use crate::schema::sites::dsl as S;

    let sites: i64 = S::sites
        .count()
        .get_result(conn)
        .map_err(|e| format!("count sites failed: {}", e))?;
    let coordinators: i64 = K::coordinators
        .count()
        .get_result(conn)
        .map_err(|e| format!("count coordinators failed: {}", e))?;
    let unregistered: i64 = K::coordinators
        .filter(K::site_id.is_null())
        .count()
        .get_result(conn)
        .map_err(|e| format!("count unregistered coordinators failed: {}", e))?;
    let controllers: i64 = C::controllers
        .count()
        .get_result(conn)
        .map_err(|e| format!("count controllers failed: {}", e))?;

    info!(
        "Registry: {} site(s), {} coordinator(s) ({} awaiting claim), {} controller(s)",
        sites, coordinators, unregistered, controllers
    );
    Ok(())
}

/// Prepare the database for the request-facing shells: connect, migrate,
/// seed reference data and log a registry summary.
pub fn run() -> Result<(), String> {
    // 1) Load config
    let cfg = Config::from_env()?;
    info!(
        "Config loaded (debug={}, server_domain={}, subdomain_namespace={}, controller_token_bytes={})",
        cfg.debug, cfg.server_domain, cfg.subdomain_namespace, cfg.controller_token_bytes
    );

    // 2) Connect DB
    let mut conn = PgConnection::establish(&cfg.database_url).map_err(|e| format!("DB connection failed: {}", e))?;
    info!("Connected to database");

    // 3) Apply pending database migrations
    apply_database_migrations(&mut conn)?;

    // 4) Seed built-in data point types
    telemetry::seed_data_point_types(&mut conn)?;

    // 5) Registry summary
    log_registry_summary(&mut conn)?;

    Ok(())
}
