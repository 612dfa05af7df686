//! Persistent, single-writer workout archive. SQLite over `sqlx`, WAL
//! journal mode, schema loaded via `include_str!` and executed
//! statement-by-statement.

use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{FromRow, Row, SqlitePool};
use tracing::{info, warn};

use crate::model::{DeviceDescriptor, Kind, Sample, Summary, Workout, WorkoutId, WorkoutState};

pub struct Store {
    pool: SqlitePool,
    /// Samples dropped because their `(workout_id, t)` key already existed
    /// (clock regression after the façade's monotonic stamp already fired).
    pub duplicate_samples_dropped: std::sync::atomic::AtomicU64,
}

#[derive(FromRow)]
struct WorkoutRow {
    id: i64,
    device_address: String,
    device_name: String,
    kind: String,
    start_t: String,
    end_t: Option<String>,
    state: String,
    summary_blob: Option<String>,
}

impl WorkoutRow {
    fn into_workout(self) -> Result<Workout> {
        Ok(Workout {
            id: WorkoutId(self.id),
            device: DeviceDescriptor {
                address: self.device_address,
                name: self.device_name,
                kind: parse_kind(&self.kind),
                rssi: None,
                origin: crate::model::Origin::Live,
            },
            kind: parse_kind(&self.kind),
            start_time: self.start_t.parse()?,
            end_time: self.end_t.map(|s| s.parse()).transpose()?,
            state: parse_state(&self.state),
        })
    }

    fn summary(&self) -> Result<Option<Summary>> {
        self.summary_blob.as_deref().map(serde_json::from_str).transpose().map_err(Into::into)
    }
}

fn kind_str(kind: Kind) -> &'static str {
    match kind {
        Kind::Bike => "bike",
        Kind::Rower => "rower",
        Kind::Unknown => "unknown",
    }
}

fn parse_kind(s: &str) -> Kind {
    match s {
        "bike" => Kind::Bike,
        "rower" => Kind::Rower,
        _ => Kind::Unknown,
    }
}

fn state_str(state: WorkoutState) -> &'static str {
    match state {
        WorkoutState::Active => "active",
        WorkoutState::Ended => "ended",
        WorkoutState::Aborted => "aborted",
    }
}

fn parse_state(s: &str) -> WorkoutState {
    match s {
        "ended" => WorkoutState::Ended,
        "aborted" => WorkoutState::Aborted,
        _ => WorkoutState::Active,
    }
}

impl Store {
    pub async fn new(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new().max_connections(5).connect_with(options).await?;

        let schema = include_str!("schema.sql");
        for statement in schema.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement).execute(&pool).await?;
        }

        let store = Self { pool, duplicate_samples_dropped: std::sync::atomic::AtomicU64::new(0) };
        store.recover_active_workouts().await?;
        Ok(store)
    }

    /// Any workout left `state=active` from a prior process (crash, kill
    /// -9) is swept to `aborted` with a summary computed from its
    /// persisted samples, run once at startup.
    async fn recover_active_workouts(&self) -> Result<()> {
        let rows: Vec<(i64,)> = sqlx::query_as("SELECT id FROM workouts WHERE state = 'active'")
            .fetch_all(&self.pool)
            .await?;
        for (id,) in rows {
            warn!("recovering crashed workout {id} as aborted");
            let samples = self.get_samples(WorkoutId(id)).await?;
            let summary = crate::manager::summarize(&samples, None, None);
            let summary_json = serde_json::to_string(&summary)?;
            sqlx::query("UPDATE workouts SET state = 'aborted', end_t = ?, summary_blob = ? WHERE id = ?")
                .bind(Utc::now().to_rfc3339())
                .bind(summary_json)
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    pub async fn create_workout(&self, device: &DeviceDescriptor, kind: Kind) -> Result<WorkoutId> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO workouts (device_address, device_name, kind, start_t, state) VALUES (?, ?, ?, ?, 'active')",
        )
        .bind(&device.address)
        .bind(&device.name)
        .bind(kind_str(kind))
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;
        let id = WorkoutId(result.last_insert_rowid());
        sqlx::query(
            "INSERT INTO devices (address, name, kind, last_seen) VALUES (?, ?, ?, ?)
             ON CONFLICT(address) DO UPDATE SET name = excluded.name, kind = excluded.kind, last_seen = excluded.last_seen",
        )
        .bind(&device.address)
        .bind(&device.name)
        .bind(kind_str(kind))
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;
        info!("created workout {id} for device {}", device.address);
        Ok(id)
    }

    /// `(workout_id, t)` is the primary key; a duplicate insert (clock
    /// regression after the monotonic stamp already fired once) is dropped
    /// silently and counted rather than erroring the active workout.
    pub async fn append_sample(&self, workout_id: WorkoutId, sample: &Sample) -> Result<()> {
        let payload = serde_json::to_string(sample)?;
        let result = sqlx::query("INSERT OR IGNORE INTO samples (workout_id, t, payload_blob) VALUES (?, ?, ?)")
            .bind(workout_id.0)
            .bind(sample.t as i64)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            self.duplicate_samples_dropped.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        Ok(())
    }

    pub async fn finalize(&self, workout_id: WorkoutId, state: WorkoutState, summary: &Summary) -> Result<()> {
        let summary_json = serde_json::to_string(summary)?;
        sqlx::query("UPDATE workouts SET state = ?, end_t = ?, summary_blob = ? WHERE id = ?")
            .bind(state_str(state))
            .bind(Utc::now().to_rfc3339())
            .bind(summary_json)
            .bind(workout_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_workouts(&self, limit: i64, offset: i64) -> Result<Vec<(Workout, Option<Summary>)>> {
        let rows: Vec<WorkoutRow> = sqlx::query_as(
            "SELECT id, device_address, device_name, kind, start_t, end_t, state, summary_blob
             FROM workouts ORDER BY id DESC LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let summary = row.summary()?;
            out.push((row.into_workout()?, summary));
        }
        Ok(out)
    }

    pub async fn get_workout(&self, id: WorkoutId) -> Result<Option<(Workout, Option<Summary>)>> {
        let row: Option<WorkoutRow> = sqlx::query_as(
            "SELECT id, device_address, device_name, kind, start_t, end_t, state, summary_blob
             FROM workouts WHERE id = ?",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => {
                let summary = row.summary()?;
                Ok(Some((row.into_workout()?, summary)))
            }
            None => Ok(None),
        }
    }

    pub async fn get_samples(&self, id: WorkoutId) -> Result<Vec<Sample>> {
        let rows = sqlx::query("SELECT payload_blob FROM samples WHERE workout_id = ? ORDER BY t ASC")
            .bind(id.0)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let blob: String = row.get("payload_blob");
                serde_json::from_str(&blob).map_err(Into::into)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Origin;

    fn device() -> DeviceDescriptor {
        DeviceDescriptor {
            address: "AA:BB:CC:DD:EE:FF".to_string(),
            name: "Test Bike".to_string(),
            kind: Kind::Bike,
            rssi: None,
            origin: Origin::Simulated,
        }
    }

    fn sample(t: u64) -> Sample {
        Sample {
            t,
            kind: Kind::Bike,
            instant_power_w: Some(150),
            avg_power_w: None,
            instant_cadence_rpm: Some(80.0),
            stroke_rate_spm: None,
            instant_speed_kph: Some(25.0),
            total_distance_m: Some(100.0),
            heart_rate_bpm: Some(120),
            total_energy_kcal: Some(10),
            elapsed_time_s: Some(1),
            resistance_level: None,
        }
    }

    async fn test_store() -> Store {
        Store::new("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn create_append_and_finalize_round_trip() {
        let store = test_store().await;
        let id = store.create_workout(&device(), Kind::Bike).await.unwrap();
        store.append_sample(id, &sample(1_000_000)).await.unwrap();
        store.append_sample(id, &sample(2_000_000)).await.unwrap();

        let samples = store.get_samples(id).await.unwrap();
        assert_eq!(samples.len(), 2);

        let summary = Summary::default();
        store.finalize(id, WorkoutState::Ended, &summary).await.unwrap();

        let (workout, _) = store.get_workout(id).await.unwrap().unwrap();
        assert_eq!(workout.state, WorkoutState::Ended);
        assert!(workout.end_time.is_some());
    }

    #[tokio::test]
    async fn duplicate_t_is_dropped_and_counted() {
        let store = test_store().await;
        let id = store.create_workout(&device(), Kind::Bike).await.unwrap();
        store.append_sample(id, &sample(1_000_000)).await.unwrap();
        store.append_sample(id, &sample(1_000_000)).await.unwrap();

        let samples = store.get_samples(id).await.unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(store.duplicate_samples_dropped.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn list_workouts_orders_newest_first() {
        let store = test_store().await;
        let first = store.create_workout(&device(), Kind::Bike).await.unwrap();
        let second = store.create_workout(&device(), Kind::Rower).await.unwrap();

        let listed = store.list_workouts(10, 0).await.unwrap();
        assert_eq!(listed[0].0.id, second);
        assert_eq!(listed[1].0.id, first);
    }
}
