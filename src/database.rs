//! Database module for the DuckDB record store.
//!
//! This module handles:
//! - DuckDB connection initialization at the configured path
//! - Schema creation for missions, telemetry, events, clips, targets,
//!   autonomy state and manual commands
//! - One transaction per operation, so multi-row writes (record + audit event)
//!   land atomically
//!
//! Mission references are plain nullable columns with no foreign key
//! constraint: deleting a mission leaves its telemetry, events, clips and
//! targets in place.

use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use duckdb::{params, Connection, OptionalExt, Result as DuckResult, Row};
use thiserror::Error;

use crate::models::{
    now_timestamp, AutonomyState, AutonomyStateUpdate, EventLevel, EventLogEntry, ManualCommand,
    Mission, MissionMode, MissionStatus, NewEvent, NewTargetImage, TargetImage, TargetStatus,
    TelemetryPoint, TelemetrySample, VideoClip,
};

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("DuckDB error: {0}")]
    DuckDb(#[from] duckdb::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database connection lock poisoned")]
    LockPoisoned,

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: i64 },
}

/// Thread-safe database manager
pub struct Database {
    conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

const TELEMETRY_COLUMNS: &str = "id, mission_id, timestamp, yaw, pitch, roll, battery_v, battery_i, \
     water_temp, turbidity, leak, internal_temp";
const EVENT_COLUMNS: &str = "id, timestamp, level, message, mission_id";
const TARGET_COLUMNS: &str =
    "id, mission_id, label, filename, url, status, created_at, matched_at";

impl Database {
    /// Open (or create) the database file and make sure the schema exists.
    pub fn new(db_path: PathBuf) -> Result<Self, DatabaseError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        log::info!("Initializing DuckDB at: {:?}", db_path);
        let conn = Connection::open(&db_path)?;

        let db = Self {
            conn: Mutex::new(conn),
            db_path,
        };
        db.init_schema()?;
        Ok(db)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DatabaseError> {
        self.conn.lock().map_err(|_| DatabaseError::LockPoisoned)
    }

    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<(), DatabaseError> {
        self.conn()?.execute_batch(sql)?;
        Ok(())
    }

    /// Initialize the database schema
    fn init_schema(&self) -> Result<(), DatabaseError> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            -- ============================================================
            -- MISSIONS: root entity, others reference it optionally
            -- ============================================================
            CREATE SEQUENCE IF NOT EXISTS mission_id_seq START 1;
            CREATE TABLE IF NOT EXISTS missions (
                id              BIGINT PRIMARY KEY DEFAULT nextval('mission_id_seq'),
                name            VARCHAR NOT NULL,
                status          VARCHAR NOT NULL DEFAULT 'planned',
                mode            VARCHAR NOT NULL DEFAULT 'manual',
                created_at      VARCHAR NOT NULL
            );

            -- ============================================================
            -- TELEMETRY: append-only time series
            -- ============================================================
            CREATE SEQUENCE IF NOT EXISTS telemetry_id_seq START 1;
            CREATE TABLE IF NOT EXISTS telemetry (
                id              BIGINT PRIMARY KEY DEFAULT nextval('telemetry_id_seq'),
                mission_id      BIGINT,
                timestamp       VARCHAR NOT NULL,
                yaw             DOUBLE,
                pitch           DOUBLE,
                roll            DOUBLE,
                battery_v       DOUBLE,                  -- Pack voltage (V)
                battery_i       DOUBLE,                  -- Pack current (A)
                water_temp      DOUBLE,                  -- Celsius
                turbidity       DOUBLE,                  -- NTU
                leak            BOOLEAN NOT NULL DEFAULT false,
                internal_temp   DOUBLE                   -- Celsius
            );

            CREATE INDEX IF NOT EXISTS idx_telemetry_timestamp
                ON telemetry(timestamp);

            -- ============================================================
            -- EVENTS: operator-visible event log
            -- ============================================================
            CREATE SEQUENCE IF NOT EXISTS event_id_seq START 1;
            CREATE TABLE IF NOT EXISTS events (
                id              BIGINT PRIMARY KEY DEFAULT nextval('event_id_seq'),
                mission_id      BIGINT,
                timestamp       VARCHAR NOT NULL,
                level           VARCHAR NOT NULL DEFAULT 'info',
                message         VARCHAR NOT NULL DEFAULT ''
            );

            CREATE INDEX IF NOT EXISTS idx_events_timestamp
                ON events(timestamp);

            -- ============================================================
            -- VIDEO_CLIPS: metadata only, the media lives elsewhere
            -- ============================================================
            CREATE SEQUENCE IF NOT EXISTS video_clip_id_seq START 1;
            CREATE TABLE IF NOT EXISTS video_clips (
                id              BIGINT PRIMARY KEY DEFAULT nextval('video_clip_id_seq'),
                mission_id      BIGINT,
                timestamp       VARCHAR NOT NULL,
                label           VARCHAR NOT NULL,
                url             VARCHAR NOT NULL
            );

            -- ============================================================
            -- TARGET_IMAGES: uploaded reference images, pending -> matched
            -- ============================================================
            CREATE SEQUENCE IF NOT EXISTS target_image_id_seq START 1;
            CREATE TABLE IF NOT EXISTS target_images (
                id              BIGINT PRIMARY KEY DEFAULT nextval('target_image_id_seq'),
                mission_id      BIGINT,
                label           VARCHAR NOT NULL,
                filename        VARCHAR NOT NULL,
                url             VARCHAR NOT NULL,
                status          VARCHAR NOT NULL DEFAULT 'pending',
                created_at      VARCHAR NOT NULL,
                matched_at      VARCHAR
            );

            -- ============================================================
            -- AUTONOMY_STATE: singleton row, id is always 1
            -- ============================================================
            CREATE TABLE IF NOT EXISTS autonomy_state (
                id              INTEGER PRIMARY KEY CHECK (id = 1),
                is_enabled      BOOLEAN NOT NULL DEFAULT false,
                phase           VARCHAR NOT NULL DEFAULT 'idle',
                task            VARCHAR NOT NULL DEFAULT 'inspect',
                note            VARCHAR NOT NULL DEFAULT '',
                updated_at      VARCHAR NOT NULL
            );

            -- ============================================================
            -- MANUAL_COMMANDS: raw operator commands, audit only
            -- ============================================================
            CREATE SEQUENCE IF NOT EXISTS manual_command_id_seq START 1;
            CREATE TABLE IF NOT EXISTS manual_commands (
                id              BIGINT PRIMARY KEY DEFAULT nextval('manual_command_id_seq'),
                timestamp       VARCHAR NOT NULL,
                command         VARCHAR NOT NULL,
                payload         VARCHAR NOT NULL         -- JSON document
            );
            "#,
        )?;

        log::info!("Database schema initialized successfully");
        Ok(())
    }

    // ================================================================
    // ROW MAPPING
    // ================================================================

    fn mission_from_row(row: &Row<'_>) -> DuckResult<Mission> {
        Ok(Mission {
            id: row.get(0)?,
            name: row.get(1)?,
            status: MissionStatus::from(row.get::<_, String>(2)?),
            mode: MissionMode::from(row.get::<_, String>(3)?),
            created_at: row.get(4)?,
        })
    }

    fn telemetry_from_row(row: &Row<'_>) -> DuckResult<TelemetrySample> {
        Ok(TelemetrySample {
            id: row.get(0)?,
            mission_id: row.get(1)?,
            timestamp: row.get(2)?,
            point: TelemetryPoint {
                yaw: row.get(3)?,
                pitch: row.get(4)?,
                roll: row.get(5)?,
                battery_v: row.get(6)?,
                battery_i: row.get(7)?,
                water_temp: row.get(8)?,
                turbidity: row.get(9)?,
                leak: row.get(10)?,
                internal_temp: row.get(11)?,
            },
        })
    }

    fn event_from_row(row: &Row<'_>) -> DuckResult<EventLogEntry> {
        Ok(EventLogEntry {
            id: row.get(0)?,
            timestamp: row.get(1)?,
            level: EventLevel::from(row.get::<_, String>(2)?),
            message: row.get(3)?,
            mission_id: row.get(4)?,
        })
    }

    fn clip_from_row(row: &Row<'_>) -> DuckResult<VideoClip> {
        Ok(VideoClip {
            id: row.get(0)?,
            timestamp: row.get(1)?,
            label: row.get(2)?,
            url: row.get(3)?,
            mission_id: row.get(4)?,
        })
    }

    fn target_from_row(row: &Row<'_>) -> DuckResult<TargetImage> {
        Ok(TargetImage {
            id: row.get(0)?,
            mission_id: row.get(1)?,
            label: row.get(2)?,
            filename: row.get(3)?,
            url: row.get(4)?,
            status: TargetStatus::from_column(&row.get::<_, String>(5)?),
            created_at: row.get(6)?,
            matched_at: row.get(7)?,
        })
    }

    // ================================================================
    // SHARED HELPERS (usable inside a transaction)
    // ================================================================

    fn insert_event_with(conn: &Connection, event: &NewEvent) -> DuckResult<i64> {
        conn.query_row(
            "INSERT INTO events (mission_id, timestamp, level, message) VALUES (?, ?, ?, ?) RETURNING id",
            params![
                event.mission_id,
                now_timestamp(),
                event.level.as_str(),
                event.message,
            ],
            |row| row.get(0),
        )
    }

    fn insert_telemetry_with(
        conn: &Connection,
        mission_id: Option<i64>,
        timestamp: &str,
        point: &TelemetryPoint,
    ) -> DuckResult<i64> {
        conn.query_row(
            r#"
            INSERT INTO telemetry (
                mission_id, timestamp, yaw, pitch, roll, battery_v, battery_i,
                water_temp, turbidity, leak, internal_temp
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
            params![
                mission_id,
                timestamp,
                point.yaw,
                point.pitch,
                point.roll,
                point.battery_v,
                point.battery_i,
                point.water_temp,
                point.turbidity,
                point.leak,
                point.internal_temp,
            ],
            |row| row.get(0),
        )
    }

    /// Mission that ownerless records are attached to.
    ///
    /// The lowest-id mission whose status is `active`, falling back to the
    /// lowest-id mission of any status.
    fn default_mission_id_with(conn: &Connection) -> DuckResult<Option<i64>> {
        conn.query_row(
            r#"
            SELECT id FROM missions
            ORDER BY CASE WHEN status = 'active' THEN 0 ELSE 1 END, id
            LIMIT 1
            "#,
            [],
            |row| row.get(0),
        )
        .optional()
    }

    fn latest_sample_with(conn: &Connection) -> DuckResult<Option<TelemetrySample>> {
        conn.query_row(
            &format!(
                "SELECT {} FROM telemetry ORDER BY timestamp DESC, id DESC LIMIT 1",
                TELEMETRY_COLUMNS
            ),
            [],
            Self::telemetry_from_row,
        )
        .optional()
    }

    fn count_with(conn: &Connection, table: &str) -> DuckResult<i64> {
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
            row.get(0)
        })
    }

    // ================================================================
    // MISSIONS
    // ================================================================

    /// All missions, newest first
    pub fn list_missions(&self) -> Result<Vec<Mission>, DatabaseError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, status, mode, created_at FROM missions ORDER BY created_at DESC, id DESC",
        )?;
        let missions = stmt
            .query_map([], Self::mission_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(missions)
    }

    /// Create a mission and log its creation in the same transaction
    pub fn create_mission(
        &self,
        name: &str,
        status: &MissionStatus,
        mode: &MissionMode,
    ) -> Result<Mission, DatabaseError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let created_at = now_timestamp();
        let id: i64 = tx.query_row(
            "INSERT INTO missions (name, status, mode, created_at) VALUES (?, ?, ?, ?) RETURNING id",
            params![name, status.as_str(), mode.as_str(), created_at],
            |row| row.get(0),
        )?;
        Self::insert_event_with(
            &tx,
            &NewEvent::info(Some(id), format!("Mission created: {}", name)),
        )?;
        tx.commit()?;

        log::info!("Created mission {} ({})", id, name);
        Ok(Mission {
            id,
            name: name.to_string(),
            status: status.clone(),
            mode: mode.clone(),
            created_at,
        })
    }

    /// Delete a mission row. Dependent records are left in place; a warning
    /// event records the deletion.
    pub fn delete_mission(&self, mission_id: i64) -> Result<Mission, DatabaseError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let mission = tx
            .query_row(
                "SELECT id, name, status, mode, created_at FROM missions WHERE id = ?",
                params![mission_id],
                Self::mission_from_row,
            )
            .optional()?
            .ok_or(DatabaseError::NotFound {
                entity: "mission",
                id: mission_id,
            })?;

        Self::insert_event_with(
            &tx,
            &NewEvent::warn(None, format!("Mission deleted: {}", mission.name)),
        )?;
        tx.execute("DELETE FROM missions WHERE id = ?", params![mission_id])?;
        tx.commit()?;

        log::info!("Deleted mission {} ({})", mission.id, mission.name);
        Ok(mission)
    }

    pub fn default_mission_id(&self) -> Result<Option<i64>, DatabaseError> {
        let conn = self.conn()?;
        Ok(Self::default_mission_id_with(&conn)?)
    }

    pub fn count_missions(&self) -> Result<i64, DatabaseError> {
        let conn = self.conn()?;
        Ok(Self::count_with(&conn, "missions")?)
    }

    // ================================================================
    // TELEMETRY
    // ================================================================

    /// The `limit` most recent samples, returned oldest first
    pub fn latest_telemetry(&self, limit: usize) -> Result<Vec<TelemetrySample>, DatabaseError> {
        let start = std::time::Instant::now();
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM telemetry ORDER BY timestamp DESC, id DESC LIMIT {}",
            TELEMETRY_COLUMNS, limit
        ))?;
        let mut samples = stmt
            .query_map([], Self::telemetry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        samples.reverse();

        log::debug!(
            "latest_telemetry: {} rows in {:.1}ms",
            samples.len(),
            start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(samples)
    }

    #[cfg(test)]
    pub(crate) fn latest_sample(&self) -> Result<Option<TelemetrySample>, DatabaseError> {
        let conn = self.conn()?;
        Ok(Self::latest_sample_with(&conn)?)
    }

    /// Append a sample with an explicit timestamp (used for seeding history)
    pub fn insert_telemetry(
        &self,
        mission_id: Option<i64>,
        timestamp: &str,
        point: &TelemetryPoint,
    ) -> Result<i64, DatabaseError> {
        let conn = self.conn()?;
        Ok(Self::insert_telemetry_with(&conn, mission_id, timestamp, point)?)
    }

    /// Append an operator-supplied sample stamped now.
    ///
    /// `None` attaches it to the default mission, if any.
    pub fn ingest_telemetry(
        &self,
        mission_id: Option<i64>,
        point: &TelemetryPoint,
    ) -> Result<i64, DatabaseError> {
        let conn = self.conn()?;
        let mission_id = match mission_id {
            Some(id) => Some(id),
            None => Self::default_mission_id_with(&conn)?,
        };
        let id = Self::insert_telemetry_with(&conn, mission_id, &now_timestamp(), point)?;
        log::debug!("Ingested telemetry sample {} (mission {:?})", id, mission_id);
        Ok(id)
    }

    /// One simulator step in a single transaction: read the latest sample,
    /// derive the next one from it, append it, and log a critical event if
    /// the new sample reports a leak.
    pub fn append_derived_sample<F>(&self, derive: F) -> Result<TelemetrySample, DatabaseError>
    where
        F: FnOnce(Option<&TelemetryPoint>) -> TelemetryPoint,
    {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let baseline = Self::latest_sample_with(&tx)?;
        let point = derive(baseline.as_ref().map(|s| &s.point));
        let mission_id = Self::default_mission_id_with(&tx)?;
        let timestamp = now_timestamp();
        let id = Self::insert_telemetry_with(&tx, mission_id, &timestamp, &point)?;

        if point.leak {
            Self::insert_event_with(&tx, &NewEvent::critical(None, "Leak detected in demo stream"))?;
        }
        tx.commit()?;

        Ok(TelemetrySample {
            id,
            mission_id,
            timestamp,
            point,
        })
    }

    pub fn count_telemetry(&self) -> Result<i64, DatabaseError> {
        let conn = self.conn()?;
        Ok(Self::count_with(&conn, "telemetry")?)
    }

    // ================================================================
    // EVENTS
    // ================================================================

    pub fn append_event(&self, event: &NewEvent) -> Result<i64, DatabaseError> {
        let conn = self.conn()?;
        Ok(Self::insert_event_with(&conn, event)?)
    }

    /// The `limit` most recent events, optionally for one mission, oldest first
    pub fn recent_events(
        &self,
        mission_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<EventLogEntry>, DatabaseError> {
        let conn = self.conn()?;
        let mut events = match mission_id {
            Some(mission_id) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM events WHERE mission_id = ? ORDER BY timestamp DESC, id DESC LIMIT {}",
                    EVENT_COLUMNS, limit
                ))?;
                let rows = stmt
                    .query_map(params![mission_id], Self::event_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM events ORDER BY timestamp DESC, id DESC LIMIT {}",
                    EVENT_COLUMNS, limit
                ))?;
                let rows = stmt
                    .query_map([], Self::event_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
        };
        events.reverse();
        Ok(events)
    }

    pub fn delete_event(&self, event_id: i64) -> Result<(), DatabaseError> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM events WHERE id = ?", params![event_id])?;
        if deleted == 0 {
            return Err(DatabaseError::NotFound {
                entity: "event",
                id: event_id,
            });
        }
        log::debug!("Deleted event {}", event_id);
        Ok(())
    }

    pub fn delete_all_events(&self) -> Result<usize, DatabaseError> {
        let start = std::time::Instant::now();
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM events", [])?;
        log::info!(
            "Deleted {} events in {:.1}ms",
            deleted,
            start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(deleted)
    }

    pub fn count_events(&self) -> Result<i64, DatabaseError> {
        let conn = self.conn()?;
        Ok(Self::count_with(&conn, "events")?)
    }

    // ================================================================
    // VIDEO CLIPS
    // ================================================================

    /// The `limit` most recent clips, oldest first
    pub fn list_video_clips(&self, limit: usize) -> Result<Vec<VideoClip>, DatabaseError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT id, timestamp, label, url, mission_id FROM video_clips ORDER BY timestamp DESC, id DESC LIMIT {}",
            limit
        ))?;
        let mut clips = stmt
            .query_map([], Self::clip_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        clips.reverse();
        Ok(clips)
    }

    pub fn create_video_clip(
        &self,
        mission_id: Option<i64>,
        label: &str,
        url: &str,
    ) -> Result<i64, DatabaseError> {
        let conn = self.conn()?;
        let id = conn.query_row(
            "INSERT INTO video_clips (mission_id, timestamp, label, url) VALUES (?, ?, ?, ?) RETURNING id",
            params![mission_id, now_timestamp(), label, url],
            |row| row.get(0),
        )?;
        log::debug!("Created video clip {} ({})", id, label);
        Ok(id)
    }

    pub fn delete_video_clip(&self, clip_id: i64) -> Result<(), DatabaseError> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM video_clips WHERE id = ?", params![clip_id])?;
        if deleted == 0 {
            return Err(DatabaseError::NotFound {
                entity: "video clip",
                id: clip_id,
            });
        }
        Ok(())
    }

    pub fn delete_all_video_clips(&self) -> Result<usize, DatabaseError> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM video_clips", [])?;
        log::info!("Deleted {} video clips", deleted);
        Ok(deleted)
    }

    pub fn count_video_clips(&self) -> Result<i64, DatabaseError> {
        let conn = self.conn()?;
        Ok(Self::count_with(&conn, "video_clips")?)
    }

    // ================================================================
    // TARGET IMAGES
    // ================================================================

    /// The `limit` most recent targets, oldest first
    pub fn list_targets(&self, limit: usize) -> Result<Vec<TargetImage>, DatabaseError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM target_images ORDER BY created_at DESC, id DESC LIMIT {}",
            TARGET_COLUMNS, limit
        ))?;
        let mut targets = stmt
            .query_map([], Self::target_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        targets.reverse();
        Ok(targets)
    }

    fn get_target_with(conn: &Connection, target_id: i64) -> Result<TargetImage, DatabaseError> {
        conn.query_row(
            &format!("SELECT {} FROM target_images WHERE id = ?", TARGET_COLUMNS),
            params![target_id],
            Self::target_from_row,
        )
        .optional()?
        .ok_or(DatabaseError::NotFound {
            entity: "target",
            id: target_id,
        })
    }

    #[cfg(test)]
    pub(crate) fn get_target(&self, target_id: i64) -> Result<TargetImage, DatabaseError> {
        let conn = self.conn()?;
        Self::get_target_with(&conn, target_id)
    }

    /// Register an uploaded image as a pending target and log the upload
    pub fn create_target(&self, target: &NewTargetImage) -> Result<TargetImage, DatabaseError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let created_at = now_timestamp();
        let id: i64 = tx.query_row(
            r#"
            INSERT INTO target_images (mission_id, label, filename, url, status, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
            params![
                target.mission_id,
                target.label,
                target.filename,
                target.url,
                TargetStatus::Pending.as_str(),
                created_at,
            ],
            |row| row.get(0),
        )?;
        Self::insert_event_with(
            &tx,
            &NewEvent::info(
                target.mission_id,
                format!("Target image uploaded: {}", target.label),
            ),
        )?;
        tx.commit()?;

        log::info!("Registered target image {} ({})", id, target.filename);
        Ok(TargetImage {
            id,
            mission_id: target.mission_id,
            label: target.label.clone(),
            filename: target.filename.clone(),
            url: target.url.clone(),
            status: TargetStatus::Pending,
            created_at,
            matched_at: None,
        })
    }

    /// Mark a target as matched, stamping the match time.
    ///
    /// Matching an already matched target succeeds and overwrites `matched_at`.
    pub fn match_target(&self, target_id: i64) -> Result<TargetImage, DatabaseError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let mut target = Self::get_target_with(&tx, target_id)?;
        let matched_at = now_timestamp();
        tx.execute(
            "UPDATE target_images SET status = ?, matched_at = ? WHERE id = ?",
            params![TargetStatus::Matched.as_str(), matched_at, target_id],
        )?;
        Self::insert_event_with(
            &tx,
            &NewEvent::info(target.mission_id, format!("Target matched: {}", target.label)),
        )?;
        tx.commit()?;

        target.status = TargetStatus::Matched;
        target.matched_at = Some(matched_at);
        log::info!("Target {} matched", target_id);
        Ok(target)
    }

    /// Delete a target's metadata row, returning it
    pub fn delete_target(&self, target_id: i64) -> Result<TargetImage, DatabaseError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let target = Self::get_target_with(&tx, target_id)?;
        tx.execute("DELETE FROM target_images WHERE id = ?", params![target_id])?;
        tx.commit()?;
        Ok(target)
    }

    // ================================================================
    // AUTONOMY STATE
    // ================================================================

    fn autonomy_state_with(conn: &Connection) -> DuckResult<Option<AutonomyState>> {
        conn.query_row(
            "SELECT is_enabled, phase, task, note, updated_at FROM autonomy_state WHERE id = 1",
            [],
            |row| {
                Ok(AutonomyState {
                    is_enabled: row.get(0)?,
                    phase: row.get::<_, String>(1)?.into(),
                    task: row.get::<_, String>(2)?.into(),
                    note: row.get(3)?,
                    updated_at: Some(row.get(4)?),
                })
            },
        )
        .optional()
    }

    fn write_autonomy_state_with(conn: &Connection, state: &AutonomyState) -> DuckResult<usize> {
        conn.execute(
            r#"
            INSERT OR REPLACE INTO autonomy_state (id, is_enabled, phase, task, note, updated_at)
            VALUES (1, ?, ?, ?, ?, ?)
            "#,
            params![
                state.is_enabled,
                state.phase.as_str(),
                state.task.as_str(),
                state.note,
                state.updated_at.clone().unwrap_or_else(now_timestamp),
            ],
        )
    }

    /// Current autonomy state, or the defaults if it was never written.
    /// Reading never creates the row.
    pub fn autonomy_state(&self) -> Result<AutonomyState, DatabaseError> {
        let conn = self.conn()?;
        Ok(Self::autonomy_state_with(&conn)?.unwrap_or_default())
    }

    #[cfg(test)]
    pub(crate) fn has_autonomy_state(&self) -> Result<bool, DatabaseError> {
        let conn = self.conn()?;
        Ok(Self::autonomy_state_with(&conn)?.is_some())
    }

    /// Store the default autonomy row if none exists yet
    pub fn ensure_autonomy_state(&self) -> Result<(), DatabaseError> {
        let conn = self.conn()?;
        if Self::autonomy_state_with(&conn)?.is_none() {
            Self::write_autonomy_state_with(&conn, &AutonomyState::default())?;
        }
        Ok(())
    }

    /// Merge a partial update into the stored state and log the transition
    pub fn update_autonomy_state(
        &self,
        update: &AutonomyStateUpdate,
    ) -> Result<AutonomyState, DatabaseError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let current = Self::autonomy_state_with(&tx)?.unwrap_or_default();
        let next = current.merged(update);
        Self::write_autonomy_state_with(&tx, &next)?;
        Self::insert_event_with(
            &tx,
            &NewEvent::info(
                update.mission_id,
                format!(
                    "Auto state updated → enabled={}, phase={}",
                    next.is_enabled, next.phase
                ),
            ),
        )?;
        tx.commit()?;

        log::info!(
            "Autonomy state: enabled={}, phase={}, task={}",
            next.is_enabled,
            next.phase,
            next.task
        );
        Ok(next)
    }

    // ================================================================
    // MANUAL COMMANDS
    // ================================================================

    /// Store a raw operator command and log it
    pub fn record_manual_command(
        &self,
        command: &str,
        payload: &serde_json::Value,
    ) -> Result<i64, DatabaseError> {
        let payload_json = serde_json::to_string(payload)?;

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let id: i64 = tx.query_row(
            "INSERT INTO manual_commands (timestamp, command, payload) VALUES (?, ?, ?) RETURNING id",
            params![now_timestamp(), command, payload_json],
            |row| row.get(0),
        )?;
        Self::insert_event_with(&tx, &NewEvent::info(None, format!("Manual command: {}", command)))?;
        tx.commit()?;

        log::debug!("Recorded manual command {} ({})", id, command);
        Ok(id)
    }

    /// The `limit` most recent manual commands, oldest first
    pub fn recent_manual_commands(&self, limit: usize) -> Result<Vec<ManualCommand>, DatabaseError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT id, timestamp, command, payload FROM manual_commands ORDER BY timestamp DESC, id DESC LIMIT {}",
            limit
        ))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut commands = rows
            .into_iter()
            .map(|(id, timestamp, command, payload)| {
                Ok(ManualCommand {
                    id,
                    timestamp,
                    command,
                    payload: serde_json::from_str(&payload)?,
                })
            })
            .collect::<Result<Vec<_>, DatabaseError>>()?;
        commands.reverse();
        Ok(commands)
    }
}
