//! Persistent repeater registry and call archive.
//!
//! Repeater identity and metadata persist here; session state lives in the
//! session store because it churns at heartbeat frequency. SQLite-backed
//! with an in-memory read cache so the hot admission/auth path never
//! touches the database.

use std::collections::HashMap;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::calls::CallRecord;
use crate::error::{Result, StoreError};
use crate::protocol::{RptcConfig, Timeslot};

/// A registered repeater: identity, shared secret, and metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepeaterRecord {
    /// 7-digit radio id (this IS the identity).
    pub radio_id: u32,
    /// Station callsign.
    pub callsign: String,
    /// Receive frequency in Hz.
    pub rx_frequency: u32,
    /// Transmit frequency in Hz.
    pub tx_frequency: u32,
    /// Transmit power in watts.
    pub tx_power: u16,
    /// DMR color code.
    pub color_code: u8,
    pub latitude: f32,
    pub longitude: f32,
    /// Antenna height in meters.
    pub height: i32,
    pub location: String,
    pub description: String,
    pub url: String,
    /// Number of timeslots the repeater serves.
    pub slots: u8,
    pub software_id: String,
    pub package_id: String,
    /// Shared secret for the login challenge.
    pub password: String,
    /// Radio id of the owning user.
    pub owner_id: u32,
    /// Personal low-power hotspot (protocol-indistinguishable).
    pub hotspot: bool,
    /// Static talkgroups on timeslot 1.
    pub static_ts1: Vec<u32>,
    /// Static talkgroups on timeslot 2.
    pub static_ts2: Vec<u32>,
}

impl RepeaterRecord {
    /// Create a bare record with just identity and credential.
    pub fn new(radio_id: u32, password: impl Into<String>, owner_id: u32) -> Self {
        Self {
            radio_id,
            callsign: String::new(),
            rx_frequency: 0,
            tx_frequency: 0,
            tx_power: 0,
            color_code: 1,
            latitude: 0.0,
            longitude: 0.0,
            height: 0,
            location: String::new(),
            description: String::new(),
            url: String::new(),
            slots: 2,
            software_id: String::new(),
            package_id: String::new(),
            password: password.into(),
            owner_id,
            hotspot: false,
            static_ts1: Vec::new(),
            static_ts2: Vec::new(),
        }
    }

    pub fn with_hotspot(mut self, hotspot: bool) -> Self {
        self.hotspot = hotspot;
        self
    }

    pub fn with_static(mut self, slot: Timeslot, talkgroups: Vec<u32>) -> Self {
        match slot {
            Timeslot::One => self.static_ts1 = talkgroups,
            Timeslot::Two => self.static_ts2 = talkgroups,
        }
        self
    }
}

/// The repeater registry.
pub struct Registry {
    db: std::sync::Mutex<Connection>,
    /// In-memory cache for fast lookups on the packet path.
    cache: RwLock<HashMap<u32, RepeaterRecord>>,
}

impl Registry {
    /// Open (or create) a registry with SQLite backing.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .map_err(|e| StoreError::Registry(format!("failed to open database: {e}")))?;

        Self::init_schema(&conn)?;

        let registry = Self {
            db: std::sync::Mutex::new(conn),
            cache: RwLock::new(HashMap::new()),
        };

        registry.refresh_cache()?;

        Ok(registry)
    }

    /// Create an in-memory registry (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::Registry(format!("failed to create database: {e}")))?;

        Self::init_schema(&conn)?;

        Ok(Self {
            db: std::sync::Mutex::new(conn),
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// Initialize database schema.
    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS repeaters (
                radio_id INTEGER PRIMARY KEY,
                callsign TEXT NOT NULL DEFAULT '',
                rx_frequency INTEGER NOT NULL DEFAULT 0,
                tx_frequency INTEGER NOT NULL DEFAULT 0,
                tx_power INTEGER NOT NULL DEFAULT 0,
                color_code INTEGER NOT NULL DEFAULT 1,
                latitude REAL NOT NULL DEFAULT 0,
                longitude REAL NOT NULL DEFAULT 0,
                height INTEGER NOT NULL DEFAULT 0,
                location TEXT NOT NULL DEFAULT '',
                description TEXT NOT NULL DEFAULT '',
                url TEXT NOT NULL DEFAULT '',
                slots INTEGER NOT NULL DEFAULT 2,
                software_id TEXT NOT NULL DEFAULT '',
                package_id TEXT NOT NULL DEFAULT '',
                password TEXT NOT NULL,
                owner_id INTEGER NOT NULL DEFAULT 0,
                hotspot INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS static_talkgroups (
                radio_id INTEGER NOT NULL,
                slot INTEGER NOT NULL,
                talkgroup INTEGER NOT NULL,
                PRIMARY KEY (radio_id, slot, talkgroup)
            );

            CREATE TABLE IF NOT EXISTS calls (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                stream_id INTEGER NOT NULL,
                repeater_id INTEGER NOT NULL,
                source_id INTEGER NOT NULL,
                destination_id INTEGER NOT NULL,
                group_call INTEGER NOT NULL,
                timeslot INTEGER NOT NULL,
                start_time INTEGER NOT NULL,
                duration_ms INTEGER NOT NULL,
                total_packets INTEGER NOT NULL,
                lost_packets INTEGER NOT NULL,
                ber REAL NOT NULL,
                rssi REAL NOT NULL,
                lost_terminator INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_calls_start ON calls(start_time DESC);
            CREATE INDEX IF NOT EXISTS idx_calls_source ON calls(source_id);
            CREATE INDEX IF NOT EXISTS idx_calls_repeater ON calls(repeater_id);
            CREATE INDEX IF NOT EXISTS idx_calls_destination ON calls(destination_id);
            "#,
        )
        .map_err(|e| StoreError::Registry(format!("failed to initialize schema: {e}")))?;

        Ok(())
    }

    /// Refresh the in-memory cache from the database.
    pub fn refresh_cache(&self) -> Result<()> {
        let db = self.db.lock().unwrap();

        let mut stmt = db
            .prepare(
                "SELECT radio_id, callsign, rx_frequency, tx_frequency, tx_power, color_code,
                        latitude, longitude, height, location, description, url, slots,
                        software_id, package_id, password, owner_id, hotspot
                 FROM repeaters",
            )
            .map_err(|e| StoreError::Registry(format!("failed to prepare query: {e}")))?;

        let mut records: Vec<RepeaterRecord> = stmt
            .query_map([], |row| {
                Ok(RepeaterRecord {
                    radio_id: row.get(0)?,
                    callsign: row.get(1)?,
                    rx_frequency: row.get(2)?,
                    tx_frequency: row.get(3)?,
                    tx_power: row.get(4)?,
                    color_code: row.get(5)?,
                    latitude: row.get(6)?,
                    longitude: row.get(7)?,
                    height: row.get(8)?,
                    location: row.get(9)?,
                    description: row.get(10)?,
                    url: row.get(11)?,
                    slots: row.get(12)?,
                    software_id: row.get(13)?,
                    package_id: row.get(14)?,
                    password: row.get(15)?,
                    owner_id: row.get(16)?,
                    hotspot: row.get::<_, i32>(17)? != 0,
                    static_ts1: Vec::new(),
                    static_ts2: Vec::new(),
                })
            })
            .map_err(|e| StoreError::Registry(format!("failed to query repeaters: {e}")))?
            .filter_map(|r| r.ok())
            .collect();

        let mut stmt = db
            .prepare("SELECT radio_id, slot, talkgroup FROM static_talkgroups")
            .map_err(|e| StoreError::Registry(format!("failed to prepare query: {e}")))?;

        let subscriptions: Vec<(u32, u8, u32)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .map_err(|e| StoreError::Registry(format!("failed to query talkgroups: {e}")))?
            .filter_map(|r| r.ok())
            .collect();

        for (radio_id, slot, talkgroup) in subscriptions {
            if let Some(record) = records.iter_mut().find(|r| r.radio_id == radio_id) {
                if slot == 2 {
                    record.static_ts2.push(talkgroup);
                } else {
                    record.static_ts1.push(talkgroup);
                }
            }
        }

        let mut cache = self.cache.write();
        cache.clear();
        for record in records {
            cache.insert(record.radio_id, record);
        }

        info!("Loaded {} registered repeaters", cache.len());

        Ok(())
    }

    /// Check whether a radio id is registered. Used at login admission.
    pub fn repeater_exists(&self, radio_id: u32) -> bool {
        self.cache.read().contains_key(&radio_id)
    }

    /// Get a repeater record.
    pub fn get(&self, radio_id: u32) -> Option<RepeaterRecord> {
        self.cache.read().get(&radio_id).cloned()
    }

    /// List all registered repeaters.
    pub fn list(&self) -> Vec<RepeaterRecord> {
        let mut records: Vec<_> = self.cache.read().values().cloned().collect();
        records.sort_by_key(|r| r.radio_id);
        records
    }

    /// Number of registered repeaters.
    pub fn count(&self) -> usize {
        self.cache.read().len()
    }

    /// Register (or replace) a repeater.
    pub fn add_repeater(&self, record: RepeaterRecord) -> Result<()> {
        let created_at = unix_now();
        {
            let db = self.db.lock().unwrap();
            db.execute(
                "INSERT OR REPLACE INTO repeaters
                 (radio_id, callsign, rx_frequency, tx_frequency, tx_power, color_code,
                  latitude, longitude, height, location, description, url, slots,
                  software_id, package_id, password, owner_id, hotspot, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                         ?14, ?15, ?16, ?17, ?18, ?19)",
                params![
                    record.radio_id,
                    record.callsign,
                    record.rx_frequency,
                    record.tx_frequency,
                    record.tx_power,
                    record.color_code,
                    record.latitude,
                    record.longitude,
                    record.height,
                    record.location,
                    record.description,
                    record.url,
                    record.slots,
                    record.software_id,
                    record.package_id,
                    record.password,
                    record.owner_id,
                    i32::from(record.hotspot),
                    created_at,
                ],
            )
            .map_err(|e| StoreError::Registry(format!("failed to add repeater: {e}")))?;

            db.execute(
                "DELETE FROM static_talkgroups WHERE radio_id = ?1",
                params![record.radio_id],
            )
            .map_err(|e| StoreError::Registry(format!("failed to reset talkgroups: {e}")))?;

            for (slot, talkgroups) in [(1u8, &record.static_ts1), (2u8, &record.static_ts2)] {
                for tg in talkgroups {
                    db.execute(
                        "INSERT OR IGNORE INTO static_talkgroups (radio_id, slot, talkgroup)
                         VALUES (?1, ?2, ?3)",
                        params![record.radio_id, slot, tg],
                    )
                    .map_err(|e| StoreError::Registry(format!("failed to add talkgroup: {e}")))?;
                }
            }
        }

        self.cache.write().insert(record.radio_id, record);

        Ok(())
    }

    /// Delete a repeater entirely.
    pub fn remove_repeater(&self, radio_id: u32) -> Result<()> {
        {
            let db = self.db.lock().unwrap();
            db.execute("DELETE FROM repeaters WHERE radio_id = ?1", params![radio_id])
                .map_err(|e| StoreError::Registry(format!("failed to remove repeater: {e}")))?;
            db.execute(
                "DELETE FROM static_talkgroups WHERE radio_id = ?1",
                params![radio_id],
            )
            .map_err(|e| StoreError::Registry(format!("failed to remove talkgroups: {e}")))?;
        }

        self.cache.write().remove(&radio_id);

        info!("Removed repeater {radio_id}");
        Ok(())
    }

    /// Idempotent upsert of the fields delivered by `RPTC`.
    pub fn persist_repeater_config(&self, radio_id: u32, config: &RptcConfig) -> Result<()> {
        {
            let db = self.db.lock().unwrap();
            db.execute(
                "UPDATE repeaters SET
                    callsign = ?2, rx_frequency = ?3, tx_frequency = ?4, tx_power = ?5,
                    color_code = ?6, latitude = ?7, longitude = ?8, height = ?9,
                    location = ?10, description = ?11, url = ?12, slots = ?13,
                    software_id = ?14, package_id = ?15
                 WHERE radio_id = ?1",
                params![
                    radio_id,
                    config.callsign,
                    config.rx_frequency,
                    config.tx_frequency,
                    config.tx_power,
                    config.color_code,
                    config.latitude,
                    config.longitude,
                    config.height,
                    config.location,
                    config.description,
                    config.url,
                    config.slots,
                    config.software_id,
                    config.package_id,
                ],
            )
            .map_err(|e| StoreError::Registry(format!("failed to persist config: {e}")))?;
        }

        if let Some(record) = self.cache.write().get_mut(&radio_id) {
            record.callsign = config.callsign.clone();
            record.rx_frequency = config.rx_frequency;
            record.tx_frequency = config.tx_frequency;
            record.tx_power = config.tx_power;
            record.color_code = config.color_code;
            record.latitude = config.latitude;
            record.longitude = config.longitude;
            record.height = config.height;
            record.location = config.location.clone();
            record.description = config.description.clone();
            record.url = config.url.clone();
            record.slots = config.slots;
            record.software_id = config.software_id.clone();
            record.package_id = config.package_id.clone();
        }

        Ok(())
    }

    /// Replace one slot's static talkgroup list.
    pub fn set_static_talkgroups(
        &self,
        radio_id: u32,
        slot: Timeslot,
        talkgroups: &[u32],
    ) -> Result<()> {
        {
            let db = self.db.lock().unwrap();
            db.execute(
                "DELETE FROM static_talkgroups WHERE radio_id = ?1 AND slot = ?2",
                params![radio_id, slot.number()],
            )
            .map_err(|e| StoreError::Registry(format!("failed to reset talkgroups: {e}")))?;

            for tg in talkgroups {
                db.execute(
                    "INSERT OR IGNORE INTO static_talkgroups (radio_id, slot, talkgroup)
                     VALUES (?1, ?2, ?3)",
                    params![radio_id, slot.number(), tg],
                )
                .map_err(|e| StoreError::Registry(format!("failed to add talkgroup: {e}")))?;
            }
        }

        if let Some(record) = self.cache.write().get_mut(&radio_id) {
            match slot {
                Timeslot::One => record.static_ts1 = talkgroups.to_vec(),
                Timeslot::Two => record.static_ts2 = talkgroups.to_vec(),
            }
        }

        Ok(())
    }

    /// Append-only insert of a finalized call record.
    pub fn persist_call(&self, call: &CallRecord) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO calls
             (stream_id, repeater_id, source_id, destination_id, group_call, timeslot,
              start_time, duration_ms, total_packets, lost_packets, ber, rssi,
              lost_terminator)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                call.stream_id,
                call.repeater_id,
                call.source_id,
                call.destination_id,
                i32::from(call.group_call),
                call.timeslot,
                call.start_time_ms,
                call.duration_ms,
                call.total_packets,
                call.lost_packets,
                call.ber,
                call.rssi,
                i32::from(call.lost_terminator),
            ],
        )
        .map_err(|e| StoreError::Registry(format!("failed to persist call: {e}")))?;

        Ok(())
    }

    /// Most recent calls.
    pub fn lastheard(&self, limit: usize) -> Result<Vec<CallRecord>> {
        self.query_calls("SELECT * FROM calls ORDER BY start_time DESC LIMIT ?1", limit, None)
    }

    /// Most recent calls originated by a user.
    pub fn lastheard_for_user(&self, user_id: u32, limit: usize) -> Result<Vec<CallRecord>> {
        self.query_calls(
            "SELECT * FROM calls WHERE source_id = ?2 ORDER BY start_time DESC LIMIT ?1",
            limit,
            Some(user_id),
        )
    }

    /// Most recent calls heard through a repeater.
    pub fn lastheard_for_repeater(&self, radio_id: u32, limit: usize) -> Result<Vec<CallRecord>> {
        self.query_calls(
            "SELECT * FROM calls WHERE repeater_id = ?2 ORDER BY start_time DESC LIMIT ?1",
            limit,
            Some(radio_id),
        )
    }

    /// Most recent calls addressed to a talkgroup.
    pub fn lastheard_for_talkgroup(&self, talkgroup: u32, limit: usize) -> Result<Vec<CallRecord>> {
        self.query_calls(
            "SELECT * FROM calls WHERE destination_id = ?2 AND group_call = 1
             ORDER BY start_time DESC LIMIT ?1",
            limit,
            Some(talkgroup),
        )
    }

    fn query_calls(&self, sql: &str, limit: usize, filter: Option<u32>) -> Result<Vec<CallRecord>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db
            .prepare(sql)
            .map_err(|e| StoreError::Registry(format!("failed to prepare query: {e}")))?;

        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<CallRecord> {
            Ok(CallRecord {
                stream_id: row.get("stream_id")?,
                repeater_id: row.get("repeater_id")?,
                source_id: row.get("source_id")?,
                destination_id: row.get("destination_id")?,
                group_call: row.get::<_, i32>("group_call")? != 0,
                timeslot: row.get("timeslot")?,
                start_time_ms: row.get("start_time")?,
                duration_ms: row.get("duration_ms")?,
                total_packets: row.get("total_packets")?,
                lost_packets: row.get("lost_packets")?,
                ber: row.get("ber")?,
                rssi: row.get("rssi")?,
                active: false,
                lost_terminator: row.get::<_, i32>("lost_terminator")? != 0,
            })
        };

        let rows = match filter {
            Some(value) => stmt
                .query_map(params![limit, value], map_row)
                .map_err(|e| StoreError::Registry(format!("failed to query calls: {e}")))?
                .filter_map(|r| r.ok())
                .collect(),
            None => stmt
                .query_map(params![limit], map_row)
                .map_err(|e| StoreError::Registry(format!("failed to query calls: {e}")))?
                .filter_map(|r| r.ok())
                .collect(),
        };

        Ok(rows)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
