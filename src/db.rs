//! Sqlite-backed event store and aggregates.
//!
//! `record_event` is the one atomic unit of the pipeline: the event row,
//! the per-device status upsert and the daily trigger counter either all
//! apply or none do. Deduplication is enforced by the store itself through
//! the UNIQUE(device_id, device_timestamp) constraint, never by
//! pre-checking, so redundant bus deliveries race safely to a single row.

use crate::event::{EventKind, IncomingEvent};
use crate::schema::events;
use crate::utils;
use anyhow::Result;
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;

/// Result of offering an event to the store. `Duplicate` is not an error;
/// it means aggregation must be skipped for this delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = events)]
struct NewEvent<'a> {
    device_id: i32,
    event_type: i32,
    event_type_str: &'a str,
    trap_count: Option<i32>,
    battery_voltage: Option<f32>,
    route_hops: Option<i32>,
    device_timestamp: Option<i64>,
    gateway_time: Option<i64>,
    mac_address: Option<&'a str>,
    received_at: i64,
}

#[derive(Debug, Queryable, serde::Serialize)]
pub struct Event {
    pub id: i32,
    pub device_id: i32,
    pub event_type: i32,
    pub event_type_str: String,
    pub trap_count: Option<i32>,
    pub battery_voltage: Option<f32>,
    pub route_hops: Option<i32>,
    pub device_timestamp: Option<i64>,
    pub gateway_time: Option<i64>,
    pub mac_address: Option<String>,
    pub received_at: i64,
}

#[derive(Debug, Queryable, serde::Serialize)]
pub struct DeviceStatus {
    pub device_id: i32,
    pub mac_address: Option<String>,
    pub last_seen: i64,
    pub last_event_type: String,
    pub total_triggers: i32,
    pub battery_voltage: Option<f32>,
    pub is_online: bool,
}

#[derive(Debug, Queryable, serde::Serialize)]
pub struct DailyStatistic {
    pub date: String,
    pub total_triggers: i32,
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id INTEGER NOT NULL,
    event_type INTEGER NOT NULL,
    event_type_str TEXT NOT NULL,
    trap_count INTEGER,
    battery_voltage REAL,
    route_hops INTEGER,
    device_timestamp BIGINT,
    gateway_time BIGINT,
    mac_address TEXT,
    received_at BIGINT NOT NULL,
    UNIQUE(device_id, device_timestamp)
);
CREATE INDEX IF NOT EXISTS idx_events_device_id ON events(device_id);
CREATE INDEX IF NOT EXISTS idx_events_received_at ON events(received_at);
CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type);
CREATE TABLE IF NOT EXISTS device_status (
    device_id INTEGER PRIMARY KEY,
    mac_address TEXT,
    last_seen BIGINT NOT NULL,
    last_event_type TEXT NOT NULL,
    total_triggers INTEGER NOT NULL DEFAULT 0,
    battery_voltage REAL,
    is_online BOOLEAN NOT NULL DEFAULT 1
);
CREATE TABLE IF NOT EXISTS statistics (
    date TEXT PRIMARY KEY,
    total_triggers INTEGER NOT NULL DEFAULT 0
);
";

pub struct Db {
    conn: SqliteConnection,
}

impl Db {
    pub fn connect(database_url: &str) -> Result<Self> {
        let conn = SqliteConnection::establish(database_url)?;
        Ok(Self { conn })
    }

    /// Create tables and indexes. Failure here is fatal at startup; the
    /// pipeline must not run against a store it could not initialize.
    pub fn init_schema(&mut self) -> Result<()> {
        self.conn.batch_execute(SCHEMA_SQL)?;
        Ok(())
    }

    /// Persist an accepted event and update both aggregates in one
    /// transaction. Returns `Duplicate` when the natural key already
    /// exists; in that case neither aggregate is touched.
    pub fn record_event(
        &mut self,
        ev: &IncomingEvent,
        received_at_ms: i64,
    ) -> Result<InsertOutcome> {
        let day = utils::day_of(received_at_ms);
        let is_trigger = ev.kind == EventKind::Trigger;

        self.conn
            .transaction::<InsertOutcome, anyhow::Error, _>(|conn| {
                let inserted = diesel::insert_or_ignore_into(events::table)
                    .values(&NewEvent {
                        device_id: ev.device_id,
                        event_type: ev.kind.code(),
                        event_type_str: &ev.kind_label,
                        trap_count: ev.trap_count,
                        battery_voltage: ev.battery_voltage,
                        route_hops: ev.route_hops,
                        device_timestamp: ev.device_timestamp,
                        gateway_time: ev.gateway_time,
                        mac_address: ev.mac_address.as_deref(),
                        received_at: received_at_ms,
                    })
                    .execute(conn)?;

                if inserted == 0 {
                    return Ok(InsertOutcome::Duplicate);
                }

                {
                    use crate::schema::device_status::dsl::*;
                    let inc = i32::from(is_trigger);

                    diesel::insert_into(device_status)
                        .values((
                            device_id.eq(ev.device_id),
                            mac_address.eq(ev.mac_address.as_deref()),
                            last_seen.eq(received_at_ms),
                            last_event_type.eq(&ev.kind_label),
                            total_triggers.eq(inc),
                            battery_voltage.eq(ev.battery_voltage),
                            is_online.eq(true),
                        ))
                        .on_conflict(device_id)
                        .do_update()
                        .set((
                            last_seen.eq(received_at_ms),
                            last_event_type.eq(&ev.kind_label),
                            total_triggers.eq(total_triggers + inc),
                            is_online.eq(true),
                        ))
                        .execute(conn)?;

                    // Readings only overwrite when the event carries them;
                    // an absent value must not clobber the last known one.
                    if let Some(v) = ev.battery_voltage {
                        diesel::update(device_status.find(ev.device_id))
                            .set(battery_voltage.eq(v))
                            .execute(conn)?;
                    }
                    if let Some(mac) = ev.mac_address.as_deref() {
                        diesel::update(device_status.find(ev.device_id))
                            .set(mac_address.eq(mac))
                            .execute(conn)?;
                    }
                }

                if is_trigger {
                    use crate::schema::statistics::dsl::*;
                    diesel::insert_into(statistics)
                        .values((date.eq(&day), total_triggers.eq(1)))
                        .on_conflict(date)
                        .do_update()
                        .set(total_triggers.eq(total_triggers + 1))
                        .execute(conn)?;
                }

                Ok(InsertOutcome::Inserted)
            })
    }

    pub fn recent_events(&mut self, limit: i64) -> Result<Vec<Event>> {
        use crate::schema::events::dsl::*;
        let rows = events
            .order((received_at.desc(), id.desc()))
            .limit(limit)
            .load::<Event>(&mut self.conn)?;
        Ok(rows)
    }

    pub fn recent_events_for_device(&mut self, device: i32, limit: i64) -> Result<Vec<Event>> {
        use crate::schema::events::dsl::*;
        let rows = events
            .filter(device_id.eq(device))
            .order((received_at.desc(), id.desc()))
            .limit(limit)
            .load::<Event>(&mut self.conn)?;
        Ok(rows)
    }

    pub fn devices(&mut self) -> Result<Vec<DeviceStatus>> {
        use crate::schema::device_status::dsl::*;
        let rows = device_status
            .order(device_id.asc())
            .load::<DeviceStatus>(&mut self.conn)?;
        Ok(rows)
    }

    /// All devices ordered by battery voltage ascending (weakest first).
    /// Devices that never reported a voltage sort last.
    pub fn battery_ranking(&mut self) -> Result<Vec<DeviceStatus>> {
        use crate::schema::device_status::dsl::*;
        let rows = device_status
            .order((battery_voltage.is_null().asc(), battery_voltage.asc()))
            .load::<DeviceStatus>(&mut self.conn)?;
        Ok(rows)
    }

    /// Daily trigger counts for the last `days` calendar days, oldest first.
    pub fn daily_statistics(&mut self, days: i64) -> Result<Vec<DailyStatistic>> {
        use crate::schema::statistics::dsl::*;
        let cutoff = utils::day_of(utils::now_millis() - (days.max(1) - 1) * 86_400_000);
        let rows = statistics
            .filter(date.ge(cutoff))
            .order(date.asc())
            .load::<DailyStatistic>(&mut self.conn)?;
        Ok(rows)
    }

    pub fn total_triggers(&mut self) -> Result<i64> {
        use crate::schema::statistics::dsl::*;
        let total: Option<i64> = statistics
            .select(diesel::dsl::sum(total_triggers))
            .first(&mut self.conn)?;
        Ok(total.unwrap_or(0))
    }

    pub fn active_device_count(&mut self) -> Result<i64> {
        use crate::schema::device_status::dsl::*;
        let count = device_status
            .filter(is_online.eq(true))
            .count()
            .get_result(&mut self.conn)?;
        Ok(count)
    }

    /// Trigger events received at or after `cutoff_ms`.
    pub fn triggers_since(&mut self, cutoff_ms: i64) -> Result<i64> {
        use crate::schema::events::dsl::*;
        let count = events
            .filter(event_type.eq(EventKind::Trigger.code()))
            .filter(received_at.ge(cutoff_ms))
            .count()
            .get_result(&mut self.conn)?;
        Ok(count)
    }

    /// Liveness sweep hook: flip devices offline when their last event is
    /// older than `cutoff_ms`. The core only sets `is_online` true; this is
    /// the one entry point for the collaborator that sets it false.
    pub fn mark_stale_offline(&mut self, cutoff_ms: i64) -> Result<usize> {
        use crate::schema::device_status::dsl::*;
        let changed = diesel::update(device_status)
            .filter(last_seen.lt(cutoff_ms))
            .filter(is_online.eq(true))
            .set(is_online.eq(false))
            .execute(&mut self.conn)?;
        Ok(changed)
    }
}
