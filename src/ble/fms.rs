//! Fitness Machine Service codec: decodes Indoor Bike Data (0x2AD2) and
//! Rower Data (0x2AD1) notifications into [`Sample`]s.
//!
//! Parses by matching each flag bit, building a result struct field by
//! field, and discarding on truncation rather than panicking.

use uuid::Uuid;

use crate::model::{Kind, Sample};
use crate::time::MonotonicClock;

pub const INDOOR_BIKE_DATA_UUID: Uuid = Uuid::from_u128(0x0000_2AD2_0000_1000_8000_00805F9B34FB);
pub const ROWER_DATA_UUID: Uuid = Uuid::from_u128(0x0000_2AD1_0000_1000_8000_00805F9B34FB);

const IBD_DATA_NOT_AVAILABLE_U16: u16 = 0xFFFF;
const RD_ENERGY_PER_MINUTE_NA: u8 = 0xFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Characteristic {
    IndoorBikeData,
    RowerData,
}

impl Characteristic {
    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        if uuid == INDOOR_BIKE_DATA_UUID {
            Some(Characteristic::IndoorBikeData)
        } else if uuid == ROWER_DATA_UUID {
            Some(Characteristic::RowerData)
        } else {
            None
        }
    }

    fn kind(self) -> Kind {
        match self {
            Characteristic::IndoorBikeData => Kind::Bike,
            Characteristic::RowerData => Kind::Rower,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FmsError {
    #[error("payload truncated after flags field")]
    Truncated,
}

/// A little-endian cursor over a notification payload. Reads past the end
/// return `None` rather than panicking; callers turn that into `Truncated`.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.remaining() < n {
            return None;
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Some(s)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn i8(&mut self) -> Option<i8> {
        self.u8().map(|b| b as i8)
    }

    fn u16_le(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_le_bytes([b[0], b[1]]))
    }

    fn i16_le(&mut self) -> Option<i16> {
        self.take(2).map(|b| i16::from_le_bytes([b[0], b[1]]))
    }

    fn u24_le(&mut self) -> Option<u32> {
        self.take(3).map(|b| u32::from_le_bytes([b[0], b[1], b[2], 0]))
    }
}

// ===========================================================================
// Indoor Bike Data (0x2AD2)
// ===========================================================================

mod ibd_flags {
    pub const MORE_DATA: u16 = 1 << 0;
    pub const AVG_SPEED: u16 = 1 << 1;
    pub const INST_CADENCE: u16 = 1 << 2;
    pub const AVG_CADENCE: u16 = 1 << 3;
    pub const TOTAL_DISTANCE: u16 = 1 << 4;
    pub const RESISTANCE: u16 = 1 << 5;
    pub const INST_POWER: u16 = 1 << 6;
    pub const AVG_POWER: u16 = 1 << 7;
    pub const EXPENDED_ENERGY: u16 = 1 << 8;
    pub const HEART_RATE: u16 = 1 << 9;
    pub const METABOLIC_EQUIVALENT: u16 = 1 << 10;
    pub const ELAPSED_TIME: u16 = 1 << 11;
    pub const REMAINING_TIME: u16 = 1 << 12;

    /// Every flag bit this codec understands. Unknown bits above this mask
    /// are ignored rather than rejected.
    pub const KNOWN: u16 = MORE_DATA
        | AVG_SPEED
        | INST_CADENCE
        | AVG_CADENCE
        | TOTAL_DISTANCE
        | RESISTANCE
        | INST_POWER
        | AVG_POWER
        | EXPENDED_ENERGY
        | HEART_RATE
        | METABOLIC_EQUIVALENT
        | ELAPSED_TIME
        | REMAINING_TIME;
}

/// Raw, unstamped decode of one complete (reassembled) IBD record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawIbd {
    pub instant_speed_kph: Option<f64>,
    pub avg_speed_kph: Option<f64>,
    pub instant_cadence_rpm: Option<f64>,
    pub avg_cadence_rpm: Option<f64>,
    pub total_distance_m: Option<u32>,
    pub resistance_level: Option<i16>,
    pub instant_power_w: Option<i16>,
    pub avg_power_w: Option<i16>,
    pub total_energy_kcal: Option<u16>,
    pub energy_per_hour_kcal: Option<u16>,
    pub energy_per_minute_kcal: Option<u8>,
    pub heart_rate_bpm: Option<u8>,
    pub metabolic_equivalent: Option<f64>,
    pub elapsed_time_s: Option<u16>,
    pub remaining_time_s: Option<u16>,
}

pub fn parse_ibd_record(data: &[u8]) -> Result<RawIbd, FmsError> {
    let mut c = Cursor::new(data);
    let flags = c.u16_le().ok_or(FmsError::Truncated)?;
    let known = flags & ibd_flags::KNOWN;

    let mut out = RawIbd::default();

    if known & ibd_flags::MORE_DATA == 0 {
        let raw = c.u16_le().ok_or(FmsError::Truncated)?;
        out.instant_speed_kph = Some(raw as f64 * 0.01);
    }
    if known & ibd_flags::AVG_SPEED != 0 {
        let raw = c.u16_le().ok_or(FmsError::Truncated)?;
        out.avg_speed_kph = Some(raw as f64 * 0.01);
    }
    if known & ibd_flags::INST_CADENCE != 0 {
        let raw = c.u16_le().ok_or(FmsError::Truncated)?;
        out.instant_cadence_rpm = Some(raw as f64 * 0.5);
    }
    if known & ibd_flags::AVG_CADENCE != 0 {
        let raw = c.u16_le().ok_or(FmsError::Truncated)?;
        out.avg_cadence_rpm = Some(raw as f64 * 0.5);
    }
    if known & ibd_flags::TOTAL_DISTANCE != 0 {
        out.total_distance_m = Some(c.u24_le().ok_or(FmsError::Truncated)?);
    }
    if known & ibd_flags::RESISTANCE != 0 {
        out.resistance_level = Some(c.i16_le().ok_or(FmsError::Truncated)?);
    }
    if known & ibd_flags::INST_POWER != 0 {
        out.instant_power_w = Some(c.i16_le().ok_or(FmsError::Truncated)?);
    }
    if known & ibd_flags::AVG_POWER != 0 {
        out.avg_power_w = Some(c.i16_le().ok_or(FmsError::Truncated)?);
    }
    if known & ibd_flags::EXPENDED_ENERGY != 0 {
        let total = c.u16_le().ok_or(FmsError::Truncated)?;
        let per_hour = c.u16_le().ok_or(FmsError::Truncated)?;
        let per_minute = c.u8().ok_or(FmsError::Truncated)?;
        if total != IBD_DATA_NOT_AVAILABLE_U16 {
            out.total_energy_kcal = Some(total);
        }
        if per_hour != IBD_DATA_NOT_AVAILABLE_U16 {
            out.energy_per_hour_kcal = Some(per_hour);
        }
        if per_minute != RD_ENERGY_PER_MINUTE_NA {
            out.energy_per_minute_kcal = Some(per_minute);
        }
    }
    if known & ibd_flags::HEART_RATE != 0 {
        out.heart_rate_bpm = Some(c.u8().ok_or(FmsError::Truncated)?);
    }
    if known & ibd_flags::METABOLIC_EQUIVALENT != 0 {
        let raw = c.u8().ok_or(FmsError::Truncated)?;
        out.metabolic_equivalent = Some(raw as f64 * 0.1);
    }
    if known & ibd_flags::ELAPSED_TIME != 0 {
        out.elapsed_time_s = Some(c.u16_le().ok_or(FmsError::Truncated)?);
    }
    if known & ibd_flags::REMAINING_TIME != 0 {
        out.remaining_time_s = Some(c.u16_le().ok_or(FmsError::Truncated)?);
    }

    Ok(out)
}

/// Encode a [`RawIbd`] back to wire bytes, using exactly the flag bits that
/// the record's populated fields require. Used by the round-trip test that
/// checks decode(encode(R)) == R.
#[cfg(test)]
pub fn encode_ibd_record(r: &RawIbd) -> Vec<u8> {
    let mut flags: u16 = 0;
    if r.instant_speed_kph.is_none() {
        flags |= ibd_flags::MORE_DATA;
    }
    if r.avg_speed_kph.is_some() {
        flags |= ibd_flags::AVG_SPEED;
    }
    if r.instant_cadence_rpm.is_some() {
        flags |= ibd_flags::INST_CADENCE;
    }
    if r.avg_cadence_rpm.is_some() {
        flags |= ibd_flags::AVG_CADENCE;
    }
    if r.total_distance_m.is_some() {
        flags |= ibd_flags::TOTAL_DISTANCE;
    }
    if r.resistance_level.is_some() {
        flags |= ibd_flags::RESISTANCE;
    }
    if r.instant_power_w.is_some() {
        flags |= ibd_flags::INST_POWER;
    }
    if r.avg_power_w.is_some() {
        flags |= ibd_flags::AVG_POWER;
    }
    let has_energy =
        r.total_energy_kcal.is_some() || r.energy_per_hour_kcal.is_some() || r.energy_per_minute_kcal.is_some();
    if has_energy {
        flags |= ibd_flags::EXPENDED_ENERGY;
    }
    if r.heart_rate_bpm.is_some() {
        flags |= ibd_flags::HEART_RATE;
    }
    if r.metabolic_equivalent.is_some() {
        flags |= ibd_flags::METABOLIC_EQUIVALENT;
    }
    if r.elapsed_time_s.is_some() {
        flags |= ibd_flags::ELAPSED_TIME;
    }
    if r.remaining_time_s.is_some() {
        flags |= ibd_flags::REMAINING_TIME;
    }

    let mut out = Vec::new();
    out.extend_from_slice(&flags.to_le_bytes());
    if let Some(v) = r.instant_speed_kph {
        out.extend_from_slice(&((v / 0.01).round() as u16).to_le_bytes());
    }
    if let Some(v) = r.avg_speed_kph {
        out.extend_from_slice(&((v / 0.01).round() as u16).to_le_bytes());
    }
    if let Some(v) = r.instant_cadence_rpm {
        out.extend_from_slice(&((v / 0.5).round() as u16).to_le_bytes());
    }
    if let Some(v) = r.avg_cadence_rpm {
        out.extend_from_slice(&((v / 0.5).round() as u16).to_le_bytes());
    }
    if let Some(v) = r.total_distance_m {
        out.extend_from_slice(&v.to_le_bytes()[..3]);
    }
    if let Some(v) = r.resistance_level {
        out.extend_from_slice(&v.to_le_bytes());
    }
    if let Some(v) = r.instant_power_w {
        out.extend_from_slice(&v.to_le_bytes());
    }
    if let Some(v) = r.avg_power_w {
        out.extend_from_slice(&v.to_le_bytes());
    }
    if has_energy {
        out.extend_from_slice(&r.total_energy_kcal.unwrap_or(IBD_DATA_NOT_AVAILABLE_U16).to_le_bytes());
        out.extend_from_slice(&r.energy_per_hour_kcal.unwrap_or(IBD_DATA_NOT_AVAILABLE_U16).to_le_bytes());
        out.push(r.energy_per_minute_kcal.unwrap_or(RD_ENERGY_PER_MINUTE_NA));
    }
    if let Some(v) = r.heart_rate_bpm {
        out.push(v);
    }
    if let Some(v) = r.metabolic_equivalent {
        out.push((v / 0.1).round() as u8);
    }
    if let Some(v) = r.elapsed_time_s {
        out.extend_from_slice(&v.to_le_bytes());
    }
    if let Some(v) = r.remaining_time_s {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

fn ibd_to_sample(r: RawIbd, t: u64) -> Sample {
    Sample {
        t,
        kind: Kind::Bike,
        instant_power_w: r.instant_power_w.map(|v| v as i32),
        avg_power_w: r.avg_power_w.map(|v| v as i32),
        instant_cadence_rpm: r.instant_cadence_rpm,
        stroke_rate_spm: None,
        instant_speed_kph: r.instant_speed_kph,
        total_distance_m: r.total_distance_m.map(|v| v as f64),
        heart_rate_bpm: r.heart_rate_bpm,
        total_energy_kcal: r.total_energy_kcal.map(|v| v as u32),
        elapsed_time_s: r.elapsed_time_s.map(|v| v as u32),
        resistance_level: r.resistance_level,
    }
}

// ===========================================================================
// Rower Data (0x2AD1)
// ===========================================================================

mod rd_flags {
    pub const MORE_DATA: u16 = 1 << 0;
    pub const AVG_STROKE_RATE: u16 = 1 << 1;
    pub const TOTAL_DISTANCE: u16 = 1 << 2;
    pub const INST_PACE: u16 = 1 << 3;
    pub const AVG_PACE: u16 = 1 << 4;
    pub const INST_POWER: u16 = 1 << 5;
    pub const AVG_POWER: u16 = 1 << 6;
    pub const RESISTANCE: u16 = 1 << 7;
    pub const EXPENDED_ENERGY: u16 = 1 << 8;
    pub const HEART_RATE: u16 = 1 << 9;
    pub const METABOLIC_EQUIVALENT: u16 = 1 << 10;
    pub const ELAPSED_TIME: u16 = 1 << 11;
    pub const REMAINING_TIME: u16 = 1 << 12;

    pub const KNOWN: u16 = MORE_DATA
        | AVG_STROKE_RATE
        | TOTAL_DISTANCE
        | INST_PACE
        | AVG_PACE
        | INST_POWER
        | AVG_POWER
        | RESISTANCE
        | EXPENDED_ENERGY
        | HEART_RATE
        | METABOLIC_EQUIVALENT
        | ELAPSED_TIME
        | REMAINING_TIME;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRd {
    pub stroke_rate_spm: Option<f64>,
    pub stroke_count: Option<u16>,
    pub avg_stroke_rate_spm: Option<f64>,
    pub total_distance_m: Option<u32>,
    pub instant_pace_s_per_500m: Option<u16>,
    pub avg_pace_s_per_500m: Option<u16>,
    pub instant_power_w: Option<i16>,
    pub avg_power_w: Option<i16>,
    pub resistance_level: Option<i16>,
    pub total_energy_kcal: Option<u16>,
    pub energy_per_hour_kcal: Option<u16>,
    pub energy_per_minute_kcal: Option<u8>,
    pub heart_rate_bpm: Option<u8>,
    pub metabolic_equivalent: Option<f64>,
    pub elapsed_time_s: Option<u16>,
    pub remaining_time_s: Option<u16>,
}

pub fn parse_rd_record(data: &[u8]) -> Result<RawRd, FmsError> {
    let mut c = Cursor::new(data);
    let flags = c.u16_le().ok_or(FmsError::Truncated)?;
    let known = flags & rd_flags::KNOWN;

    let mut out = RawRd::default();

    if known & rd_flags::MORE_DATA == 0 {
        let raw = c.u8().ok_or(FmsError::Truncated)?;
        out.stroke_rate_spm = Some(raw as f64 * 0.5);
        out.stroke_count = Some(c.u16_le().ok_or(FmsError::Truncated)?);
    }
    if known & rd_flags::AVG_STROKE_RATE != 0 {
        let raw = c.u8().ok_or(FmsError::Truncated)?;
        out.avg_stroke_rate_spm = Some(raw as f64 * 0.5);
    }
    if known & rd_flags::TOTAL_DISTANCE != 0 {
        out.total_distance_m = Some(c.u24_le().ok_or(FmsError::Truncated)?);
    }
    if known & rd_flags::INST_PACE != 0 {
        out.instant_pace_s_per_500m = Some(c.u16_le().ok_or(FmsError::Truncated)?);
    }
    if known & rd_flags::AVG_PACE != 0 {
        out.avg_pace_s_per_500m = Some(c.u16_le().ok_or(FmsError::Truncated)?);
    }
    if known & rd_flags::INST_POWER != 0 {
        out.instant_power_w = Some(c.i16_le().ok_or(FmsError::Truncated)?);
    }
    if known & rd_flags::AVG_POWER != 0 {
        out.avg_power_w = Some(c.i16_le().ok_or(FmsError::Truncated)?);
    }
    if known & rd_flags::RESISTANCE != 0 {
        out.resistance_level = Some(c.i16_le().ok_or(FmsError::Truncated)?);
    }
    if known & rd_flags::EXPENDED_ENERGY != 0 {
        let total = c.u16_le().ok_or(FmsError::Truncated)?;
        let per_hour = c.u16_le().ok_or(FmsError::Truncated)?;
        let per_minute = c.u8().ok_or(FmsError::Truncated)?;
        if total != IBD_DATA_NOT_AVAILABLE_U16 {
            out.total_energy_kcal = Some(total);
        }
        if per_hour != IBD_DATA_NOT_AVAILABLE_U16 {
            out.energy_per_hour_kcal = Some(per_hour);
        }
        if per_minute != RD_ENERGY_PER_MINUTE_NA {
            out.energy_per_minute_kcal = Some(per_minute);
        }
    }
    if known & rd_flags::HEART_RATE != 0 {
        out.heart_rate_bpm = Some(c.u8().ok_or(FmsError::Truncated)?);
    }
    if known & rd_flags::METABOLIC_EQUIVALENT != 0 {
        let raw = c.u8().ok_or(FmsError::Truncated)?;
        out.metabolic_equivalent = Some(raw as f64 * 0.1);
    }
    if known & rd_flags::ELAPSED_TIME != 0 {
        out.elapsed_time_s = Some(c.u16_le().ok_or(FmsError::Truncated)?);
    }
    if known & rd_flags::REMAINING_TIME != 0 {
        out.remaining_time_s = Some(c.u16_le().ok_or(FmsError::Truncated)?);
    }

    Ok(out)
}

fn rd_to_sample(r: RawRd, t: u64) -> Sample {
    // Rowers report speed only via pace (seconds per 500m); convert to kph
    // when available so downstream aggregation and FIT export need only one
    // speed channel.
    let instant_speed_kph = r
        .instant_pace_s_per_500m
        .filter(|&p| p > 0)
        .map(|p| (500.0 / p as f64) * 3.6);

    Sample {
        t,
        kind: Kind::Rower,
        instant_power_w: r.instant_power_w.map(|v| v as i32),
        avg_power_w: r.avg_power_w.map(|v| v as i32),
        instant_cadence_rpm: None,
        stroke_rate_spm: r.stroke_rate_spm,
        instant_speed_kph,
        total_distance_m: r.total_distance_m.map(|v| v as f64),
        heart_rate_bpm: r.heart_rate_bpm,
        total_energy_kcal: r.total_energy_kcal.map(|v| v as u32),
        elapsed_time_s: r.elapsed_time_s.map(|v| v as u32),
        resistance_level: r.resistance_level,
    }
}

// ===========================================================================
// Fragmentation + codec
// ===========================================================================

#[derive(Debug, Default)]
struct FragmentBuffer {
    bytes: Option<Vec<u8>>,
}

/// Stateful codec: buffers fragmented records per characteristic and stamps
/// completed records with a strictly increasing `t`. One instance per BLE
/// connection; `reset` clears fragmentation state on disconnect.
pub struct FmsCodec {
    ibd: FragmentBuffer,
    rd: FragmentBuffer,
    clock: MonotonicClock,
    pub malformed_records: u64,
}

impl FmsCodec {
    pub fn new() -> Self {
        Self {
            ibd: FragmentBuffer::default(),
            rd: FragmentBuffer::default(),
            clock: MonotonicClock::new(),
            malformed_records: 0,
        }
    }

    /// Reset fragmentation state (but not the monotonic clock or malformed
    /// counter) on disconnect.
    pub fn reset(&mut self) {
        self.ibd.bytes = None;
        self.rd.bytes = None;
    }

    /// Feed one notification's raw bytes in. Returns `Some(Sample)` once a
    /// complete record has been assembled and decoded.
    ///
    /// The first two bytes of every notification are a flags field. While
    /// `More Data` (bit 0) is set, the remaining bytes are a buffered prefix
    /// and no sample is produced yet. The completing notification (`More
    /// Data` = 0) supplies the record's real flags; the assembled record is
    /// `[completing flags] ++ [buffered prefix] ++ [completing body]`. A
    /// second `More Data = 1` notification arriving while a buffer is
    /// already open can only mean a new record started before the prior one
    /// completed, so the stale buffer is discarded and `malformed_records`
    /// is bumped.
    pub fn on_notification(&mut self, characteristic: Characteristic, bytes: &[u8]) -> Option<Sample> {
        if bytes.len() < 2 {
            self.malformed_records += 1;
            return None;
        }
        let flags = u16::from_le_bytes([bytes[0], bytes[1]]);
        let more_data = flags & 0x0001 != 0;
        let body = &bytes[2..];

        let buf = match characteristic {
            Characteristic::IndoorBikeData => &mut self.ibd,
            Characteristic::RowerData => &mut self.rd,
        };

        if more_data {
            if buf.bytes.take().is_some() {
                self.malformed_records += 1;
            }
            buf.bytes = Some(body.to_vec());
            return None;
        }

        let mut assembled = Vec::with_capacity(2 + body.len());
        assembled.extend_from_slice(&bytes[0..2]);
        if let Some(pending) = buf.bytes.take() {
            assembled.extend_from_slice(&pending);
        }
        assembled.extend_from_slice(body);

        let t = self.clock.next();
        let result = match characteristic {
            Characteristic::IndoorBikeData => parse_ibd_record(&assembled).map(|r| ibd_to_sample(r, t)),
            Characteristic::RowerData => parse_rd_record(&assembled).map(|r| rd_to_sample(r, t)),
        };

        match result {
            Ok(sample) => Some(sample),
            Err(_) => {
                self.malformed_records += 1;
                None
            }
        }
    }
}

impl Default for FmsCodec {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ibd_instant_speed_only() {
        // flags = 0x0000 (more_data=0, nothing else) + speed 1000 (10.00 km/h)
        let bytes = [0x00, 0x00, 0xE8, 0x03];
        let r = parse_ibd_record(&bytes).unwrap();
        assert_eq!(r.instant_speed_kph, Some(10.00));
        assert!(r.instant_power_w.is_none());
    }

    #[test]
    fn ibd_fragmented_record_assembles_to_one_sample() {
        let mut codec = FmsCodec::new();
        // First notification: more_data=1, carrying the eventual speed bytes
        // ahead of the completing flags.
        let frag1 = [0x01, 0x00, 0xE8, 0x03];
        assert!(codec
            .on_notification(Characteristic::IndoorBikeData, &frag1)
            .is_none());
        // Completing notification: more_data=0, no further payload bytes.
        // Assembled record is [0x00, 0x00, 0xE8, 0x03] -> speed 10.00 km/h.
        let frag2 = [0x00, 0x00];
        let sample = codec
            .on_notification(Characteristic::IndoorBikeData, &frag2)
            .expect("assembled sample");
        assert_eq!(sample.instant_speed_kph, Some(10.00));
        assert_eq!(sample.kind, Kind::Bike);
    }

    #[test]
    fn ibd_new_fragment_while_pending_discards_and_counts_malformed() {
        let mut codec = FmsCodec::new();
        let frag1 = [0x01, 0x00, 0xE8, 0x03];
        assert!(codec
            .on_notification(Characteristic::IndoorBikeData, &frag1)
            .is_none());
        // A second more_data=1 notification arrives before completion: the
        // first buffer is stale and gets discarded.
        let frag1_again = [0x01, 0x00, 0xD0, 0x07];
        assert!(codec
            .on_notification(Characteristic::IndoorBikeData, &frag1_again)
            .is_none());
        assert_eq!(codec.malformed_records, 1);

        let frag2 = [0x00, 0x00];
        let sample = codec
            .on_notification(Characteristic::IndoorBikeData, &frag2)
            .expect("assembled sample");
        assert_eq!(sample.instant_speed_kph, Some(20.00));
    }

    #[test]
    fn ibd_truncated_payload_increments_malformed_counter() {
        let mut codec = FmsCodec::new();
        // flags indicate power present but payload cut short.
        let bytes = [0x40, 0x00]; // INST_POWER bit set, no data bytes follow
        assert!(codec
            .on_notification(Characteristic::IndoorBikeData, &bytes)
            .is_none());
        assert_eq!(codec.malformed_records, 1);
    }

    #[test]
    fn ibd_unknown_flag_bits_are_ignored() {
        // Set an unknown high bit (bit 15) alongside a known one (speed via
        // more_data=0); parsing must still succeed using only known bits.
        let unknown_bit: u16 = 1 << 15;
        let mut bytes = unknown_bit.to_le_bytes().to_vec();
        bytes.extend_from_slice(&1000u16.to_le_bytes());
        let r = parse_ibd_record(&bytes).unwrap();
        assert_eq!(r.instant_speed_kph, Some(10.00));
    }

    #[test]
    fn ibd_round_trip_subset_of_supported_bits() {
        let r = RawIbd {
            instant_speed_kph: Some(25.30),
            instant_cadence_rpm: Some(82.5),
            total_distance_m: Some(1234),
            instant_power_w: Some(210),
            heart_rate_bpm: Some(142),
            elapsed_time_s: Some(300),
            ..Default::default()
        };
        let bytes = encode_ibd_record(&r);
        let decoded = parse_ibd_record(&bytes).unwrap();
        assert_eq!(decoded, r);
    }

    #[test]
    fn ibd_energy_not_available_sentinel_maps_to_absent() {
        let r = RawIbd {
            instant_speed_kph: Some(0.0),
            total_energy_kcal: None,
            energy_per_hour_kcal: None,
            energy_per_minute_kcal: None,
            ..Default::default()
        };
        // Force the EXPENDED_ENERGY flag manually to validate sentinel
        // handling end to end.
        let mut bytes = (ibd_flags::EXPENDED_ENERGY).to_le_bytes().to_vec();
        bytes.extend_from_slice(&IBD_DATA_NOT_AVAILABLE_U16.to_le_bytes());
        bytes.extend_from_slice(&IBD_DATA_NOT_AVAILABLE_U16.to_le_bytes());
        bytes.push(RD_ENERGY_PER_MINUTE_NA);
        let decoded = parse_ibd_record(&bytes).unwrap();
        assert!(decoded.total_energy_kcal.is_none());
        assert!(decoded.energy_per_hour_kcal.is_none());
        assert!(decoded.energy_per_minute_kcal.is_none());
        let _ = r;
    }

    #[test]
    fn rd_stroke_rate_and_pace_to_speed() {
        // more_data=0: stroke rate (0.5 spm units) + stroke count, then pace.
        let mut bytes = vec![0x00, 0x00];
        bytes.push(50); // 25.0 spm
        bytes.extend_from_slice(&100u16.to_le_bytes()); // stroke count
        let r = parse_rd_record(&bytes).unwrap();
        assert_eq!(r.stroke_rate_spm, Some(25.0));
        assert_eq!(r.stroke_count, Some(100));
    }

    #[test]
    fn monotonic_clock_bumps_on_equal_timestamps() {
        let mut clock = MonotonicClock::new();
        let a = clock.next();
        let b = clock.next();
        assert!(b > a);
    }
}
