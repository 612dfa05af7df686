//! Deterministic substitute for a live BLE source: produces Bike or Rower
//! samples at 1 Hz with bounded stochastic variation around fixed means,
//! starting only once `begin_workout` is called and never until then.

use rand::Rng;

use crate::model::{Kind, Sample};
use crate::time::MonotonicClock;

const BIKE_POWER_MEAN: f64 = 150.0;
const BIKE_POWER_VAR: f64 = 20.0;
const BIKE_CADENCE_MEAN: f64 = 80.0;
const BIKE_CADENCE_VAR: f64 = 5.0;
const BIKE_SPEED_MEAN: f64 = 25.0;
const BIKE_SPEED_VAR: f64 = 3.0;

const ROWER_POWER_MEAN: f64 = 180.0;
const ROWER_POWER_VAR: f64 = 20.0;
const ROWER_STROKE_MEAN: f64 = 25.0;
const ROWER_STROKE_VAR: f64 = 3.0;
const ROWER_SPEED_MEAN: f64 = 18.0;
const ROWER_SPEED_VAR: f64 = 2.0;

/// kcal ≈ W·s·1.0e-3·4.184⁻¹·metabolic_factor. A metabolic factor of 4.0
/// approximates the gross efficiency of indoor cardio equipment.
const METABOLIC_FACTOR: f64 = 4.0;

pub struct Simulator {
    kind: Kind,
    clock: MonotonicClock,
    elapsed_s: u32,
    total_distance_m: f64,
    total_energy_kcal: f64,
    running: bool,
}

impl Simulator {
    pub fn new(kind: Kind) -> Self {
        Self {
            kind,
            clock: MonotonicClock::new(),
            elapsed_s: 0,
            total_distance_m: 0.0,
            total_energy_kcal: 0.0,
            running: false,
        }
    }

    pub fn begin_workout(&mut self) {
        self.running = true;
        self.elapsed_s = 0;
        self.total_distance_m = 0.0;
        self.total_energy_kcal = 0.0;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Advance the simulator by one second. Returns `None` before
    /// `begin_workout` has been called.
    pub fn tick(&mut self) -> Option<Sample> {
        if !self.running {
            return None;
        }
        let mut rng = rand::rng();

        let (power, secondary, speed_kph) = match self.kind {
            Kind::Rower => (
                gauss(&mut rng, ROWER_POWER_MEAN, ROWER_POWER_VAR).max(0.0),
                gauss(&mut rng, ROWER_STROKE_MEAN, ROWER_STROKE_VAR).max(0.0),
                gauss(&mut rng, ROWER_SPEED_MEAN, ROWER_SPEED_VAR).max(0.0),
            ),
            _ => (
                gauss(&mut rng, BIKE_POWER_MEAN, BIKE_POWER_VAR).max(0.0),
                gauss(&mut rng, BIKE_CADENCE_MEAN, BIKE_CADENCE_VAR).max(0.0),
                gauss(&mut rng, BIKE_SPEED_MEAN, BIKE_SPEED_VAR).max(0.0),
            ),
        };

        let hr_noise: f64 = rng.random_range(-2.0..2.0);
        let hr = (80.0 + power * 0.5 + hr_noise).clamp(60.0, 200.0) as u8;

        self.elapsed_s += 1;
        self.total_distance_m += speed_kph / 3.6;
        self.total_energy_kcal += power * 1.0 * 1.0e-3 / 4.184 * METABOLIC_FACTOR;

        let (instant_cadence_rpm, stroke_rate_spm) = match self.kind {
            Kind::Rower => (None, Some(secondary)),
            _ => (Some(secondary), None),
        };

        let t = self.clock.next();
        Some(Sample {
            t,
            kind: self.kind,
            instant_power_w: Some(power.round() as i32),
            avg_power_w: None,
            instant_cadence_rpm,
            stroke_rate_spm,
            instant_speed_kph: Some(speed_kph),
            total_distance_m: Some(self.total_distance_m),
            heart_rate_bpm: Some(hr),
            total_energy_kcal: Some(self.total_energy_kcal.round() as u32),
            elapsed_time_s: Some(self.elapsed_s),
            resistance_level: None,
        })
    }

    /// One last synthesized sample carrying final totals, then the
    /// simulator ceases producing samples until `begin_workout` again.
    pub fn end_workout(&mut self) -> Option<Sample> {
        if !self.running {
            return None;
        }
        let sample = self.tick();
        self.running = false;
        sample
    }
}

fn gauss(rng: &mut impl Rng, mean: f64, stddev: f64) -> f64 {
    // Box-Muller transform; deterministic enough for a bounded-variation
    // generator, not intended as a general-purpose RNG primitive.
    let u1: f64 = rng.random_range(f64::EPSILON..1.0);
    let u2: f64 = rng.random_range(0.0..1.0);
    let z0 = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
    mean + z0 * stddev
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_samples_before_begin_workout() {
        let mut sim = Simulator::new(Kind::Bike);
        assert!(sim.tick().is_none());
    }

    #[test]
    fn bike_samples_have_cadence_not_stroke_rate() {
        let mut sim = Simulator::new(Kind::Bike);
        sim.begin_workout();
        let sample = sim.tick().unwrap();
        assert!(sample.instant_cadence_rpm.is_some());
        assert!(sample.stroke_rate_spm.is_none());
        assert_eq!(sample.kind, Kind::Bike);
    }

    #[test]
    fn rower_samples_have_stroke_rate_not_cadence() {
        let mut sim = Simulator::new(Kind::Rower);
        sim.begin_workout();
        let sample = sim.tick().unwrap();
        assert!(sample.stroke_rate_spm.is_some());
        assert!(sample.instant_cadence_rpm.is_none());
    }

    #[test]
    fn distance_and_energy_monotonically_increase() {
        let mut sim = Simulator::new(Kind::Bike);
        sim.begin_workout();
        let a = sim.tick().unwrap();
        let b = sim.tick().unwrap();
        assert!(b.total_distance_m.unwrap() >= a.total_distance_m.unwrap());
        assert!(b.total_energy_kcal.unwrap() >= a.total_energy_kcal.unwrap());
    }

    #[test]
    fn end_workout_stops_further_samples() {
        let mut sim = Simulator::new(Kind::Bike);
        sim.begin_workout();
        sim.tick();
        assert!(sim.end_workout().is_some());
        assert!(sim.tick().is_none());
    }

    #[test]
    fn heart_rate_follows_power_formula_within_clamp() {
        let mut sim = Simulator::new(Kind::Bike);
        sim.begin_workout();
        let sample = sim.tick().unwrap();
        let hr = sample.heart_rate_bpm.unwrap();
        assert!((60..=200).contains(&hr));
    }
}
