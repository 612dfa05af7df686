//! Workout lifecycle state machine, in-memory summary aggregator, and
//! latest-sample broadcast cell. Owns the single active-workout slot.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

use crate::error::{BridgeError, Result};
use crate::model::{DeviceDescriptor, Kind, Sample, Summary, Vo2maxReason, Workout, WorkoutId, WorkoutState};
use crate::source::Source;
use crate::store::Store;

/// User-configured inputs to the VO2max estimate. All optional; absence of
/// `weight_kg` alone disqualifies the estimate regardless of the rest.
#[derive(Debug, Clone, Copy, Default)]
pub struct Vo2Params {
    pub weight_kg: Option<f64>,
    pub age: Option<u32>,
    pub hr_max_override: Option<f64>,
    pub hr_rest_override: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkoutEvent {
    Started { workout: Workout },
    Sample { workout_id: WorkoutId, sample: Sample },
    Ended { workout: Workout, summary: Summary },
    Aborted { workout_id: WorkoutId },
}

struct ActiveWorkout {
    id: WorkoutId,
    device: DeviceDescriptor,
    kind: Kind,
    start_time: chrono::DateTime<Utc>,
    summary: Summary,
    acc: AccState,
}

#[derive(Default)]
struct AccState {
    first_t: Option<u64>,
    last_speed_t: Option<u64>,
}

pub struct Manager {
    store: Arc<Store>,
    source: Arc<Source>,
    active: RwLock<Option<ActiveWorkout>>,
    latest_sample: RwLock<Option<Sample>>,
    event_tx: broadcast::Sender<WorkoutEvent>,
    vo2: Vo2Params,
}

impl Manager {
    pub fn new(store: Arc<Store>, source: Arc<Source>, vo2: Vo2Params) -> (Self, broadcast::Receiver<WorkoutEvent>) {
        let (event_tx, event_rx) = broadcast::channel(256);
        (
            Self { store, source, active: RwLock::new(None), latest_sample: RwLock::new(None), event_tx, vo2 },
            event_rx,
        )
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<WorkoutEvent> {
        self.event_tx.subscribe()
    }

    pub async fn start_workout(&self, device: DeviceDescriptor, kind: Kind) -> Result<WorkoutId> {
        let mut guard = self.active.write().await;
        if guard.is_some() {
            return Err(BridgeError::AlreadyActive);
        }
        let id = self.store.create_workout(&device, kind).await?;
        self.source.begin_workout().await;
        let workout = Workout {
            id,
            device: device.clone(),
            kind,
            start_time: Utc::now(),
            end_time: None,
            state: WorkoutState::Active,
        };
        *guard = Some(ActiveWorkout {
            id,
            device,
            kind,
            start_time: workout.start_time,
            summary: Summary::default(),
            acc: AccState::default(),
        });
        let _ = self.event_tx.send(WorkoutEvent::Started { workout });
        info!("workout {id} started");
        Ok(id)
    }

    /// Called by the ingest lane for every sample the source façade emits.
    pub async fn record_sample(&self, sample: Sample) -> Result<()> {
        let mut guard = self.active.write().await;
        let Some(active) = guard.as_mut() else {
            return Err(BridgeError::NotActive);
        };

        if let Err(e) = self.store.append_sample(active.id, &sample).await {
            warn!("store write failed for workout {}: {e}; aborting", active.id);
            let summary = active.summary.clone();
            let id = active.id;
            drop(guard);
            self.store.finalize(id, WorkoutState::Aborted, &summary).await.ok();
            let _ = self.event_tx.send(WorkoutEvent::Aborted { workout_id: id });
            return Err(BridgeError::Internal(e));
        }

        accumulate(&mut active.summary, &sample, &mut active.acc);
        let id = active.id;
        drop(guard);

        *self.latest_sample.write().await = Some(sample.clone());
        let _ = self.event_tx.send(WorkoutEvent::Sample { workout_id: id, sample });
        Ok(())
    }

    pub async fn end_workout(&self) -> Result<WorkoutId> {
        let mut guard = self.active.write().await;
        let active = guard.take().ok_or(BridgeError::NotActive)?;
        drop(guard);

        self.source.end_workout().await;

        let mut summary = active.summary;
        apply_vo2max(&mut summary, self.vo2);
        self.store.finalize(active.id, WorkoutState::Ended, &summary).await?;

        let workout = Workout {
            id: active.id,
            device: active.device,
            kind: active.kind,
            start_time: active.start_time,
            end_time: Some(Utc::now()),
            state: WorkoutState::Ended,
        };
        let _ = self.event_tx.send(WorkoutEvent::Ended { workout, summary });
        *self.latest_sample.write().await = None;
        info!("workout {} ended", active.id);
        Ok(active.id)
    }

    pub async fn is_active(&self) -> bool {
        self.active.read().await.is_some()
    }

    pub async fn latest_sample(&self) -> Option<Sample> {
        self.latest_sample.read().await.clone()
    }

    pub async fn active_summary(&self) -> Option<Summary> {
        self.active.read().await.as_ref().map(|a| a.summary.clone())
    }
}

fn accumulate(summary: &mut Summary, sample: &Sample, acc: &mut AccState) {
    summary.sample_count += 1;

    if let Some(p) = sample.instant_power_w {
        let pf = p as f64;
        summary.power_sum += pf;
        summary.power_sumsq += pf * pf;
        summary.power_count += 1;
        summary.power_max = Some(summary.power_max.map_or(p, |m| m.max(p)));
    }

    let cadence = sample.instant_cadence_rpm.or(sample.stroke_rate_spm);
    if let Some(c) = cadence {
        summary.cadence_sum += c;
        summary.cadence_count += 1;
        summary.cadence_max = Some(summary.cadence_max.map_or(c, |m| m.max(c)));
    }

    if let Some(speed) = sample.instant_speed_kph {
        if let Some(last_t) = acc.last_speed_t {
            let dt_s = sample.t.saturating_sub(last_t) as f64 / 1_000_000.0;
            summary.speed_time_weighted_sum += speed * dt_s;
            summary.speed_time_weight_total += dt_s;
        }
        acc.last_speed_t = Some(sample.t);
        summary.speed_max = Some(summary.speed_max.map_or(speed, |m| m.max(speed)));
    }

    if let Some(hr) = sample.effective_heart_rate() {
        summary.hr_sum += hr as f64;
        summary.hr_count += 1;
        summary.hr_max = Some(summary.hr_max.map_or(hr, |m| m.max(hr)));
    }

    if let Some(d) = sample.total_distance_m {
        summary.total_distance_m = Some(d);
    }
    if let Some(e) = sample.total_energy_kcal {
        summary.total_energy_kcal = Some(e);
    }

    if acc.first_t.is_none() {
        acc.first_t = Some(sample.t);
    }
    if let Some(first) = acc.first_t {
        summary.active_duration_s = sample.t.saturating_sub(first) as f64 / 1_000_000.0;
    }
}

/// Estimate only if: weight known, mean HR >= 120, active_duration >= 120s,
/// samples carrying heart rate >= 60. Formula: 15.3 * (HRmax / HRrest),
/// HRmax defaulted to 208 - 0.7*age, HRrest defaulted to 60.
fn apply_vo2max(summary: &mut Summary, params: Vo2Params) {
    let Some(weight_kg) = params.weight_kg else {
        summary.vo2max = None;
        summary.vo2max_reason = Some(Vo2maxReason::WeightUnknown);
        return;
    };
    let _ = weight_kg;

    let mean_hr = summary.avg_heart_rate();
    let Some(mean_hr) = mean_hr else {
        summary.vo2max = None;
        summary.vo2max_reason = Some(Vo2maxReason::TooFewHrSamples);
        return;
    };
    if mean_hr < 120.0 {
        summary.vo2max = None;
        summary.vo2max_reason = Some(Vo2maxReason::HrTooLow);
        return;
    }
    if summary.active_duration_s < 120.0 {
        summary.vo2max = None;
        summary.vo2max_reason = Some(Vo2maxReason::DurationTooShort);
        return;
    }
    if summary.hr_count < 60 {
        summary.vo2max = None;
        summary.vo2max_reason = Some(Vo2maxReason::TooFewHrSamples);
        return;
    }

    let hr_max = params.hr_max_override.unwrap_or_else(|| match params.age {
        Some(age) => 208.0 - 0.7 * age as f64,
        None => 208.0 - 0.7 * 30.0, // age unknown: assume 30
    });
    let hr_rest = params.hr_rest_override.unwrap_or(60.0);

    summary.vo2max = Some(15.3 * (hr_max / hr_rest));
    summary.vo2max_reason = None;
}

/// Build a [`Summary`] from a complete, already-persisted sample set in one
/// pass. Used by crash recovery, which has no incremental accumulator to
/// fall back on.
pub fn summarize(samples: &[Sample], weight_kg: Option<f64>, vo2_age: Option<u32>) -> Summary {
    let mut summary = Summary::default();
    let mut acc = AccState::default();
    for sample in samples {
        accumulate(&mut summary, sample, &mut acc);
    }
    apply_vo2max(&mut summary, Vo2Params { weight_kg, age: vo2_age, ..Default::default() });
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Origin;

    fn sample(t: u64, power: i32, hr: u8, speed: f64) -> Sample {
        Sample {
            t,
            kind: Kind::Bike,
            instant_power_w: Some(power),
            avg_power_w: None,
            instant_cadence_rpm: Some(80.0),
            stroke_rate_spm: None,
            instant_speed_kph: Some(speed),
            total_distance_m: None,
            heart_rate_bpm: Some(hr),
            total_energy_kcal: None,
            elapsed_time_s: None,
            resistance_level: None,
        }
    }

    #[test]
    fn time_weighted_speed_average_not_arithmetic_mean() {
        let mut summary = Summary::default();
        let mut acc = AccState::default();
        // 10s at 20kph, then a single sample 100s later at 40kph: a naive
        // arithmetic mean would read 30; the time-weighted mean should
        // heavily favor the second, longer interval.
        accumulate(&mut summary, &sample(0, 150, 120, 20.0), &mut acc);
        accumulate(&mut summary, &sample(10_000_000, 150, 120, 20.0), &mut acc);
        accumulate(&mut summary, &sample(110_000_000, 150, 120, 40.0), &mut acc);
        let avg = summary.avg_speed_kph().unwrap();
        assert!(avg > 35.0, "expected time-weighted average to favor the long interval, got {avg}");
    }

    #[test]
    fn vo2max_gated_on_low_heart_rate() {
        let samples: Vec<Sample> = (0..70).map(|i| sample(i * 5_000_000, 150, 100, 25.0)).collect();
        let summary = summarize(&samples, Some(80.0), Some(35));
        assert!(summary.vo2max.is_none());
        assert_eq!(summary.vo2max_reason, Some(Vo2maxReason::HrTooLow));
    }

    #[test]
    fn vo2max_estimated_when_eligible() {
        let samples: Vec<Sample> = (0..70).map(|i| sample(i * 5_000_000, 150, 150, 25.0)).collect();
        let summary = summarize(&samples, Some(80.0), Some(35));
        assert!(summary.vo2max.unwrap() > 0.0);
    }

    #[test]
    fn heart_rate_of_zero_not_counted_as_a_sample() {
        let mut summary = Summary::default();
        let mut acc = AccState::default();
        let mut s = sample(0, 150, 0, 25.0);
        s.heart_rate_bpm = Some(0);
        accumulate(&mut summary, &s, &mut acc);
        assert_eq!(summary.hr_count, 0);
        let _ = Origin::Live;
    }
}
