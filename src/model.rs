//! Shared data types that flow between the BLE/simulator sources, the sample
//! store, the workout manager, and the FIT encoder.

use serde::{Deserialize, Serialize};

/// Process-unique identifier for a workout row. Backed by sqlite's
/// `AUTOINCREMENT` rowid, which is never reused once assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkoutId(pub i64);

impl std::fmt::Display for WorkoutId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Equipment category. Drives which optional fields a Sample typically
/// carries (cadence vs. stroke rate) and which FIT sport/sub_sport pair the
/// encoder emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    Bike,
    Rower,
    Unknown,
}

impl Kind {
    /// Infer from an advertised device name by a simple case-insensitive
    /// token match — "bike" or "row" anywhere in the advertised name.
    pub fn infer_from_name(name: &str) -> Kind {
        let lower = name.to_ascii_lowercase();
        if lower.contains("bike") {
            Kind::Bike
        } else if lower.contains("row") {
            Kind::Rower
        } else {
            Kind::Unknown
        }
    }
}

/// Where a device or sample originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Live,
    Simulated,
}

/// Immutable once produced by discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub address: String,
    pub name: String,
    pub kind: Kind,
    pub rssi: Option<i16>,
    pub origin: Origin,
}

/// A normalized, time-stamped telemetry snapshot. Fields that the source did
/// not report stay `None` rather than being zero-filled; only the workout
/// manager may materialize zeros, and only when writing persistence rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Monotonic timestamp, microsecond resolution.
    pub t: u64,
    pub kind: Kind,
    pub instant_power_w: Option<i32>,
    pub avg_power_w: Option<i32>,
    pub instant_cadence_rpm: Option<f64>,
    pub stroke_rate_spm: Option<f64>,
    pub instant_speed_kph: Option<f64>,
    pub total_distance_m: Option<f64>,
    /// 0 means "not present" for aggregation purposes.
    pub heart_rate_bpm: Option<u8>,
    pub total_energy_kcal: Option<u32>,
    pub elapsed_time_s: Option<u32>,
    pub resistance_level: Option<i16>,
}

impl Sample {
    /// A heart rate reading usable for aggregation: present and nonzero.
    pub fn effective_heart_rate(&self) -> Option<u8> {
        self.heart_rate_bpm.filter(|&hr| hr != 0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkoutState {
    Active,
    Ended,
    Aborted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workout {
    pub id: WorkoutId,
    pub device: DeviceDescriptor,
    pub kind: Kind,
    pub start_time: chrono::DateTime<chrono::Utc>,
    pub end_time: Option<chrono::DateTime<chrono::Utc>>,
    pub state: WorkoutState,
}

/// Why `vo2max` is absent from a Summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Vo2maxReason {
    WeightUnknown,
    HrTooLow,
    DurationTooShort,
    TooFewHrSamples,
}

/// Derived, incrementally computed per-workout summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Summary {
    pub sample_count: u64,

    pub power_sum: f64,
    pub power_sumsq: f64,
    pub power_count: u64,
    pub power_max: Option<i32>,

    pub cadence_sum: f64,
    pub cadence_count: u64,
    pub cadence_max: Option<f64>,

    /// Time-weighted sum of instant_speed_kph * dt_seconds.
    pub speed_time_weighted_sum: f64,
    /// Total seconds covered by speed-bearing sample intervals.
    pub speed_time_weight_total: f64,
    pub speed_max: Option<f64>,

    pub hr_sum: f64,
    pub hr_count: u64,
    pub hr_max: Option<u8>,

    pub total_distance_m: Option<f64>,
    pub total_energy_kcal: Option<u32>,

    pub active_duration_s: f64,

    pub vo2max: Option<f64>,
    pub vo2max_reason: Option<Vo2maxReason>,
}

impl Summary {
    pub fn avg_power_w(&self) -> Option<f64> {
        (self.power_count > 0).then(|| self.power_sum / self.power_count as f64)
    }

    pub fn avg_cadence(&self) -> Option<f64> {
        (self.cadence_count > 0).then(|| self.cadence_sum / self.cadence_count as f64)
    }

    pub fn avg_speed_kph(&self) -> Option<f64> {
        (self.speed_time_weight_total > 0.0)
            .then(|| self.speed_time_weighted_sum / self.speed_time_weight_total)
    }

    pub fn avg_heart_rate(&self) -> Option<f64> {
        (self.hr_count > 0).then(|| self.hr_sum / self.hr_count as f64)
    }
}
