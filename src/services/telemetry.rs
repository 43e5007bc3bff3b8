//! Append-only time-series storage with timestamp smearing.
//!
//! The data point primary key is the timestamp alone, so a collision means
//! some measurement (from any peripheral) already owns that microsecond.
//! Collisions are resolved, not rejected: the timestamp is incremented by
//! one microsecond and the insert retried until a free slot is found. The
//! loop is unbounded in theory; in practice collisions are rare and the
//! smear terminates after a handful of steps.

use crate::db::models as dbm;
use crate::schema;
use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::PgConnection;
use log::{info, trace};
use uuid::Uuid;

/// Built-in measurement kinds seeded at startup.
pub const DEFAULT_DATA_POINT_TYPES: &[(&str, &str)] = &[
    ("air temperature", "°C"),
    ("water temperature", "°C"),
    ("relative humidity", "%"),
    ("acidity", "pH"),
    ("electrical conductivity", "mS/cm"),
    ("water level", "cm"),
];

pub(crate) enum InsertOutcome {
    Inserted,
    TimeTaken,
    Failed(String),
}

/// The smear kernel: advance one microsecond per occupied slot until an
/// insert succeeds, returning the instant actually stored.
pub(crate) fn record_with(
    mut at: DateTime<Utc>,
    mut attempt: impl FnMut(DateTime<Utc>) -> InsertOutcome,
) -> Result<DateTime<Utc>, String> {
    loop {
        match attempt(at) {
            InsertOutcome::Inserted => return Ok(at),
            InsertOutcome::TimeTaken => {
                trace!("data point slot {} taken, smearing forward", at);
                at += Duration::microseconds(1);
            }
            InsertOutcome::Failed(e) => return Err(e),
        }
    }
}

/// Persist one measurement. On a timestamp collision the stored time is
/// smeared forward; the returned instant is the one actually stored, which
/// may differ from the requested one under contention.
pub fn record(
    conn: &mut PgConnection,
    peripheral_id: Uuid,
    data_point_type_id: Uuid,
    value: f64,
    at: Option<DateTime<Utc>>,
) -> Result<DateTime<Utc>, String> {
    use schema::data_points::dsl as D;

    let requested = at.unwrap_or_else(Utc::now);
    record_with(requested, |slot| {
        let row = dbm::NewDataPoint {
            time: slot,
            peripheral_id,
            data_point_type_id,
            value,
        };
        match diesel::insert_into(D::data_points).values(&row).execute(conn) {
            Ok(_) => InsertOutcome::Inserted,
            Err(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => InsertOutcome::TimeTaken,
            Err(e) => InsertOutcome::Failed(format!("insert data point failed: {}", e)),
        }
    })
}

/// Upsert the built-in data point types. Idempotent; returns the number of
/// newly created rows.
pub fn seed_data_point_types(conn: &mut PgConnection) -> Result<usize, String> {
    use schema::data_point_types::dsl as T;

    let mut created = 0;
    for (name, unit) in DEFAULT_DATA_POINT_TYPES {
        let row = dbm::NewDataPointType {
            id: Uuid::new_v4(),
            name: (*name).to_string(),
            unit: (*unit).to_string(),
        };
        created += diesel::insert_into(T::data_point_types)
            .values(&row)
            .on_conflict(T::name)
            .do_nothing()
            .execute(conn)
            .map_err(|e| format!("seed data point type {} failed: {}", name, e))?;
    }
    if created > 0 {
        info!("Seeded {} data point type(s)", created);
    }
    Ok(created)
}

pub fn list_data_point_types(conn: &mut PgConnection) -> Result<Vec<dbm::DataPointType>, String> {
    use schema::data_point_types::dsl as T;

    T::data_point_types
        .order(T::name.asc())
        .select(dbm::DataPointType::as_select())
        .load(conn)
        .map_err(|e| format!("list data point types failed: {}", e))
}

/// Data points for one peripheral within `[from, to)`, oldest first.
pub fn load_series(
    conn: &mut PgConnection,
    peripheral_id: Uuid,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<dbm::DataPoint>, String> {
    use schema::data_points::dsl as D;

    D::data_points
        .filter(D::peripheral_id.eq(peripheral_id))
        .filter(D::time.ge(from))
        .filter(D::time.lt(to))
        .order(D::time.asc())
        .select(dbm::DataPoint::as_select())
        .load(conn)
        .map_err(|e| format!("load data point series failed: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::BTreeSet;

    fn instant() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn fake_store(taken: BTreeSet<DateTime<Utc>>) -> impl FnMut(DateTime<Utc>) -> InsertOutcome {
        let mut slots = taken;
        move |at| {
            if slots.insert(at) {
                InsertOutcome::Inserted
            } else {
                InsertOutcome::TimeTaken
            }
        }
    }

    #[test]
    fn free_slot_is_stored_verbatim() {
        let at = instant();
        let stored = record_with(at, fake_store(BTreeSet::new())).unwrap();
        assert_eq!(stored, at);
    }

    #[test]
    fn collision_smears_forward_by_whole_microseconds() {
        let at = instant();
        let taken: BTreeSet<_> = [at, at + Duration::microseconds(1)].into_iter().collect();
        let stored = record_with(at, fake_store(taken)).unwrap();
        assert_eq!(stored, at + Duration::microseconds(2));
    }

    #[test]
    fn n_way_collision_yields_distinct_spaced_stamps() {
        let at = instant();
        let mut store = fake_store(BTreeSet::new());
        let mut stored = Vec::new();
        for _ in 0..5 {
            stored.push(record_with(at, &mut store).unwrap());
        }

        let unique: BTreeSet<_> = stored.iter().copied().collect();
        assert_eq!(unique.len(), 5);
        for (i, ts) in stored.iter().enumerate() {
            assert_eq!(*ts, at + Duration::microseconds(i as i64));
        }
    }

    #[test]
    fn storage_failure_aborts_the_loop() {
        let at = instant();
        let result = record_with(at, |_| InsertOutcome::Failed("connection lost".to_string()));
        assert_eq!(result, Err("connection lost".to_string()));
    }

    #[test]
    fn default_types_have_unique_names() {
        let names: BTreeSet<_> = DEFAULT_DATA_POINT_TYPES.iter().map(|(name, _)| name).collect();
        assert_eq!(names.len(), DEFAULT_DATA_POINT_TYPES.len());
    }
}
