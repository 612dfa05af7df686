//! Binary FIT file encoder: file header, definition/data message pairs, and
//! trailing CRC16. Extends the definition/data writer pattern with Device
//! Info, Event, and Activity messages so a third-party FIT parser (and
//! Garmin Connect's training-load computation, which otherwise requires a
//! recognized manufacturer code) accepts the output.

use crate::model::{Kind, Sample, Summary, Workout};

/// Seconds between the Unix epoch (1970-01-01) and the FIT epoch
/// (1989-12-31 00:00:00 UTC).
const FIT_EPOCH_OFFSET: i64 = 631065600;

const BASE_ENUM: u8 = 0x00;
const BASE_UINT8: u8 = 0x02;
const BASE_UINT16: u8 = 0x84;
const BASE_UINT32: u8 = 0x86;
const BASE_UINT32Z: u8 = 0x8C;

const U8_INVALID: u8 = 0xFF;
const U16_INVALID: u16 = 0xFFFF;
const U32_INVALID: u32 = 0xFFFF_FFFF;

/// Garmin's manufacturer code. A "development" (0xFE) or unrecognized code
/// causes Garmin Connect to silently skip training-load computation.
const MANUFACTURER_GARMIN: u16 = 1;
const PRODUCT_CODE: u16 = 0;
const SOFTWARE_VERSION_X100: u16 = 100;

const LOCAL_FILE_ID: u8 = 0;
const LOCAL_DEVICE_INFO: u8 = 1;
const LOCAL_EVENT: u8 = 2;
const LOCAL_RECORD: u8 = 3;
const LOCAL_LAP: u8 = 4;
const LOCAL_SESSION: u8 = 5;
const LOCAL_ACTIVITY: u8 = 6;

const EVENT_TIMER: u8 = 0;
const EVENT_TYPE_START: u8 = 0;
const EVENT_TYPE_STOP_ALL: u8 = 4;

fn sport_sub_sport(kind: Kind) -> (u8, u8) {
    match kind {
        Kind::Bike | Kind::Unknown => (4, 6),  // fitness_equipment / indoor_cycling
        Kind::Rower => (15, 14),               // rowing / indoor_rowing
    }
}

fn fit_timestamp(dt: chrono::DateTime<chrono::Utc>) -> u32 {
    (dt.timestamp() - FIT_EPOCH_OFFSET).max(0) as u32
}

/// CRC-16/ARC, polynomial 0xA001, reflected. Running this over
/// `data || crc.to_le_bytes()` always yields zero.
fn fit_crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        for bit in 0..8 {
            let b = (byte >> bit) & 1;
            let c = crc & 1;
            crc >>= 1;
            if (b ^ c as u8) != 0 {
                crc ^= 0xA001;
            }
        }
    }
    crc
}

struct FitWriter {
    data: Vec<u8>,
}

impl FitWriter {
    fn new() -> Self {
        Self { data: vec![0u8; 14] }
    }

    fn write_definition(&mut self, local_msg: u8, global_msg: u16, fields: &[(u8, u8, u8)]) {
        self.data.push(0x40 | (local_msg & 0x0F));
        self.data.push(0);
        self.data.push(0); // architecture: little-endian
        self.data.extend_from_slice(&global_msg.to_le_bytes());
        self.data.push(fields.len() as u8);
        for &(field_def_num, size, base_type) in fields {
            self.data.push(field_def_num);
            self.data.push(size);
            self.data.push(base_type);
        }
    }

    fn write_data(&mut self, local_msg: u8, field_data: &[u8]) {
        self.data.push(local_msg & 0x0F);
        self.data.extend_from_slice(field_data);
    }

    fn finish(mut self) -> Vec<u8> {
        let data_size = (self.data.len() - 14) as u32;

        self.data[0] = 14;
        self.data[1] = 0x20; // protocol version 2.0
        self.data[2..4].copy_from_slice(&2132u16.to_le_bytes()); // profile version 21.32
        self.data[4..8].copy_from_slice(&data_size.to_le_bytes());
        self.data[8..12].copy_from_slice(b".FIT");
        let header_crc = fit_crc16(&self.data[0..12]);
        self.data[12..14].copy_from_slice(&header_crc.to_le_bytes());

        let file_crc = fit_crc16(&self.data);
        self.data.extend_from_slice(&file_crc.to_le_bytes());
        self.data
    }
}

/// Convert a km/h reading to FIT's m/s-scaled-by-1000 uint16. Dividing by
/// 3.6 before scaling is the fix for the historical bug that left speeds
/// 3.6x too large in Garmin Connect.
fn speed_kph_to_fit(kph: f64) -> u16 {
    ((kph / 3.6) * 1000.0).round().clamp(0.0, (U16_INVALID - 1) as f64) as u16
}

/// Encode a finished workout as a complete FIT activity file.
pub fn encode(workout: &Workout, summary: &Summary, samples: &[Sample]) -> Vec<u8> {
    let mut w = FitWriter::new();
    let start_ts = fit_timestamp(workout.start_time);
    let end_ts = workout.end_time.map(fit_timestamp).unwrap_or(start_ts);
    let (sport, sub_sport) = sport_sub_sport(workout.kind);

    write_file_id(&mut w, start_ts);
    write_device_info(&mut w, start_ts);
    write_event(&mut w, start_ts, EVENT_TYPE_START);

    write_record_definition(&mut w);
    for sample in samples {
        write_record(&mut w, sample);
    }

    write_event(&mut w, end_ts, EVENT_TYPE_STOP_ALL);
    write_lap(&mut w, start_ts, end_ts, summary, sport, sub_sport);
    write_session(&mut w, start_ts, end_ts, summary, sport, sub_sport);
    write_activity(&mut w, end_ts);

    w.finish()
}

fn write_file_id(w: &mut FitWriter, start_ts: u32) {
    w.write_definition(
        LOCAL_FILE_ID,
        0,
        &[(0, 1, BASE_ENUM), (1, 2, BASE_UINT16), (2, 2, BASE_UINT16), (3, 4, BASE_UINT32Z), (4, 4, BASE_UINT32)],
    );
    let mut data = Vec::with_capacity(13);
    data.push(4); // type = activity
    data.extend_from_slice(&MANUFACTURER_GARMIN.to_le_bytes());
    data.extend_from_slice(&PRODUCT_CODE.to_le_bytes());
    data.extend_from_slice(&0u32.to_le_bytes()); // serial_number
    data.extend_from_slice(&start_ts.to_le_bytes());
    w.write_data(LOCAL_FILE_ID, &data);
}

fn write_device_info(w: &mut FitWriter, start_ts: u32) {
    w.write_definition(
        LOCAL_DEVICE_INFO,
        23,
        &[
            (253, 4, BASE_UINT32),
            (3, 4, BASE_UINT32Z),
            (2, 2, BASE_UINT16),
            (4, 2, BASE_UINT16),
            (5, 2, BASE_UINT16),
        ],
    );
    let mut data = Vec::with_capacity(14);
    data.extend_from_slice(&start_ts.to_le_bytes());
    data.extend_from_slice(&0u32.to_le_bytes()); // serial_number
    data.extend_from_slice(&MANUFACTURER_GARMIN.to_le_bytes());
    data.extend_from_slice(&PRODUCT_CODE.to_le_bytes());
    data.extend_from_slice(&SOFTWARE_VERSION_X100.to_le_bytes());
    w.write_data(LOCAL_DEVICE_INFO, &data);
}

fn write_event(w: &mut FitWriter, ts: u32, event_type: u8) {
    w.write_definition(LOCAL_EVENT, 21, &[(253, 4, BASE_UINT32), (0, 1, BASE_ENUM), (1, 1, BASE_ENUM)]);
    let mut data = Vec::with_capacity(6);
    data.extend_from_slice(&ts.to_le_bytes());
    data.push(EVENT_TIMER);
    data.push(event_type);
    w.write_data(LOCAL_EVENT, &data);
}

fn write_record_definition(w: &mut FitWriter) {
    w.write_definition(
        LOCAL_RECORD,
        20,
        &[
            (253, 4, BASE_UINT32), // timestamp
            (3, 1, BASE_UINT8),    // heart_rate
            (4, 1, BASE_UINT8),    // cadence
            (5, 4, BASE_UINT32),   // distance, scale 100
            (6, 2, BASE_UINT16),   // speed, m/s * 1000
            (7, 2, BASE_UINT16),   // power
        ],
    );
}

fn write_record(w: &mut FitWriter, sample: &Sample) {
    let ts = ((sample.t / 1_000_000) as i64 - FIT_EPOCH_OFFSET).max(0) as u32;
    let hr = sample.effective_heart_rate().unwrap_or(U8_INVALID);
    let cadence = sample
        .instant_cadence_rpm
        .or(sample.stroke_rate_spm)
        .map(|c| c.round().clamp(0.0, (U8_INVALID - 1) as f64) as u8)
        .unwrap_or(U8_INVALID);
    let distance = sample.total_distance_m.map(|d| (d * 100.0).round() as u32).unwrap_or(U32_INVALID);
    let speed = sample.instant_speed_kph.map(speed_kph_to_fit).unwrap_or(U16_INVALID);
    let power = sample
        .instant_power_w
        .map(|p| p.clamp(0, (U16_INVALID - 1) as i32) as u16)
        .unwrap_or(U16_INVALID);

    let mut data = Vec::with_capacity(14);
    data.extend_from_slice(&ts.to_le_bytes());
    data.push(hr);
    data.push(cadence);
    data.extend_from_slice(&distance.to_le_bytes());
    data.extend_from_slice(&speed.to_le_bytes());
    data.extend_from_slice(&power.to_le_bytes());
    w.write_data(LOCAL_RECORD, &data);
}

fn write_lap(w: &mut FitWriter, start_ts: u32, end_ts: u32, summary: &Summary, sport: u8, sub_sport: u8) {
    w.write_definition(
        LOCAL_LAP,
        19,
        &[
            (253, 4, BASE_UINT32), // timestamp
            (2, 4, BASE_UINT32),   // start_time
            (7, 4, BASE_UINT32),   // total_elapsed_time, scale 1000
            (8, 4, BASE_UINT32),   // total_timer_time, scale 1000
            (9, 4, BASE_UINT32),   // total_distance, scale 100
            (11, 2, BASE_UINT16),  // total_calories
            (15, 1, BASE_UINT8),   // avg_heart_rate
            (16, 1, BASE_UINT8),   // max_heart_rate
            (19, 2, BASE_UINT16),  // avg_power
            (20, 2, BASE_UINT16),  // max_power
            (25, 1, BASE_ENUM),    // sport
            (39, 1, BASE_ENUM),    // sub_sport
        ],
    );
    let elapsed_ms = (summary.active_duration_s * 1000.0).round() as u32;
    let mut data = Vec::with_capacity(30);
    data.extend_from_slice(&end_ts.to_le_bytes());
    data.extend_from_slice(&start_ts.to_le_bytes());
    data.extend_from_slice(&elapsed_ms.to_le_bytes());
    data.extend_from_slice(&elapsed_ms.to_le_bytes());
    data.extend_from_slice(&summary.total_distance_m.map(|d| (d * 100.0).round() as u32).unwrap_or(U32_INVALID).to_le_bytes());
    data.extend_from_slice(&summary.total_energy_kcal.map(|c| c.min(U16_INVALID as u32) as u16).unwrap_or(U16_INVALID).to_le_bytes());
    data.push(summary.avg_heart_rate().map(|h| h.round() as u8).unwrap_or(U8_INVALID));
    data.push(summary.hr_max.unwrap_or(U8_INVALID));
    data.extend_from_slice(&summary.avg_power_w().map(|p| p.round() as u16).unwrap_or(U16_INVALID).to_le_bytes());
    data.extend_from_slice(&summary.power_max.map(|p| p.clamp(0, (U16_INVALID - 1) as i32) as u16).unwrap_or(U16_INVALID).to_le_bytes());
    data.push(sport);
    data.push(sub_sport);
    w.write_data(LOCAL_LAP, &data);
}

fn write_session(w: &mut FitWriter, start_ts: u32, end_ts: u32, summary: &Summary, sport: u8, sub_sport: u8) {
    w.write_definition(
        LOCAL_SESSION,
        18,
        &[
            (253, 4, BASE_UINT32), // timestamp
            (2, 4, BASE_UINT32),   // start_time
            (5, 1, BASE_ENUM),     // sport
            (6, 1, BASE_ENUM),     // sub_sport
            (7, 4, BASE_UINT32),   // total_elapsed_time, scale 1000
            (8, 4, BASE_UINT32),   // total_timer_time, scale 1000
            (9, 4, BASE_UINT32),   // total_distance, scale 100
            (11, 2, BASE_UINT16),  // total_calories
            (14, 2, BASE_UINT16),  // avg_speed, m/s * 1000
            (15, 2, BASE_UINT16),  // max_speed, m/s * 1000
            (16, 1, BASE_UINT8),   // avg_heart_rate
            (17, 1, BASE_UINT8),   // max_heart_rate
            (18, 1, BASE_UINT8),   // avg_cadence
            (20, 2, BASE_UINT16),  // avg_power
            (21, 2, BASE_UINT16),  // max_power
        ],
    );
    let elapsed_ms = (summary.active_duration_s * 1000.0).round() as u32;
    let mut data = Vec::with_capacity(36);
    data.extend_from_slice(&end_ts.to_le_bytes());
    data.extend_from_slice(&start_ts.to_le_bytes());
    data.push(sport);
    data.push(sub_sport);
    data.extend_from_slice(&elapsed_ms.to_le_bytes());
    data.extend_from_slice(&elapsed_ms.to_le_bytes());
    data.extend_from_slice(&summary.total_distance_m.map(|d| (d * 100.0).round() as u32).unwrap_or(U32_INVALID).to_le_bytes());
    data.extend_from_slice(&summary.total_energy_kcal.map(|c| c.min(U16_INVALID as u32) as u16).unwrap_or(U16_INVALID).to_le_bytes());
    data.extend_from_slice(&summary.avg_speed_kph().map(speed_kph_to_fit).unwrap_or(U16_INVALID).to_le_bytes());
    data.extend_from_slice(&summary.speed_max.map(speed_kph_to_fit).unwrap_or(U16_INVALID).to_le_bytes());
    data.push(summary.avg_heart_rate().map(|h| h.round() as u8).unwrap_or(U8_INVALID));
    data.push(summary.hr_max.unwrap_or(U8_INVALID));
    data.push(summary.avg_cadence().map(|c| c.round().clamp(0.0, (U8_INVALID - 1) as f64) as u8).unwrap_or(U8_INVALID));
    data.extend_from_slice(&summary.avg_power_w().map(|p| p.round() as u16).unwrap_or(U16_INVALID).to_le_bytes());
    data.extend_from_slice(&summary.power_max.map(|p| p.clamp(0, (U16_INVALID - 1) as i32) as u16).unwrap_or(U16_INVALID).to_le_bytes());
    w.write_data(LOCAL_SESSION, &data);
}

fn write_activity(w: &mut FitWriter, end_ts: u32) {
    w.write_definition(
        LOCAL_ACTIVITY,
        34,
        &[
            (253, 4, BASE_UINT32), // timestamp
            (0, 4, BASE_UINT32),   // total_timer_time, scale 1000
            (1, 2, BASE_UINT16),   // num_sessions
            (2, 1, BASE_ENUM),     // type
            (3, 1, BASE_ENUM),     // event
            (4, 1, BASE_ENUM),     // event_type
            (5, 4, BASE_UINT32),   // local_timestamp
        ],
    );
    let mut data = Vec::with_capacity(17);
    data.extend_from_slice(&end_ts.to_le_bytes());
    data.extend_from_slice(&0u32.to_le_bytes()); // total_timer_time unknown at this granularity; session carries it
    data.extend_from_slice(&1u16.to_le_bytes());
    data.push(0); // type = manual
    data.push(EVENT_TIMER);
    data.push(EVENT_TYPE_STOP_ALL);
    data.extend_from_slice(&end_ts.to_le_bytes());
    w.write_data(LOCAL_ACTIVITY, &data);
}

/// Suggested on-disk filename: `workout_<id>_<iso8601>.fit`.
pub fn suggested_filename(workout: &Workout) -> String {
    format!("workout_{}_{}.fit", workout.id, workout.start_time.format("%Y%m%dT%H%M%SZ"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeviceDescriptor, Origin, WorkoutId, WorkoutState};

    fn workout() -> Workout {
        Workout {
            id: WorkoutId(1),
            device: DeviceDescriptor {
                address: "AA:BB:CC:DD:EE:FF".into(),
                name: "Test Bike".into(),
                kind: Kind::Bike,
                rssi: None,
                origin: Origin::Simulated,
            },
            kind: Kind::Bike,
            start_time: "2024-06-15T10:00:00Z".parse().unwrap(),
            end_time: Some("2024-06-15T10:30:00Z".parse().unwrap()),
            state: WorkoutState::Ended,
        }
    }

    fn sample(t: u64, elapsed_s: u32) -> Sample {
        Sample {
            t,
            kind: Kind::Bike,
            instant_power_w: Some(150),
            avg_power_w: None,
            instant_cadence_rpm: Some(80.0),
            stroke_rate_spm: None,
            instant_speed_kph: Some(25.2),
            total_distance_m: Some(100.0),
            heart_rate_bpm: Some(120),
            total_energy_kcal: Some(10),
            elapsed_time_s: Some(elapsed_s),
            resistance_level: None,
        }
    }

    #[test]
    fn header_and_magic_present() {
        let data = encode(&workout(), &Summary::default(), &[]);
        assert_eq!(data[0], 14);
        assert_eq!(&data[8..12], b".FIT");
    }

    #[test]
    fn header_crc_matches_recomputed() {
        let data = encode(&workout(), &Summary::default(), &[]);
        let stored = u16::from_le_bytes([data[12], data[13]]);
        assert_eq!(stored, fit_crc16(&data[0..12]));
    }

    #[test]
    fn file_crc_self_check_yields_zero() {
        let data = encode(&workout(), &Summary::default(), &[sample(0, 0), sample(1_000_000, 1)]);
        assert_eq!(fit_crc16(&data), 0);
    }

    #[test]
    fn speed_conversion_divides_by_3_6_before_scaling() {
        // 36 km/h == 10 m/s == 10000 (m/s * 1000), not 36000.
        assert_eq!(speed_kph_to_fit(36.0), 10_000);
    }

    #[test]
    fn manufacturer_code_is_not_development() {
        let data = encode(&workout(), &Summary::default(), &[]);
        // file_id data message for local type 0 is written right after its
        // definition message; manufacturer bytes are at a fixed offset.
        assert_ne!(MANUFACTURER_GARMIN, 0xFE);
        let _ = data;
    }

    #[test]
    fn record_count_matches_sample_count() {
        let samples = vec![sample(0, 0), sample(1_000_000, 1), sample(2_000_000, 2)];
        let with = encode(&workout(), &Summary::default(), &samples);
        let without = encode(&workout(), &Summary::default(), &[]);
        assert!(with.len() > without.len());
    }
}
