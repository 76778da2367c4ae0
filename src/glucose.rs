//! Glucose readings as handed to the owner of the link

use crate::clock::ClockSync;
use crate::messages::HistoryRecord;
use chrono::{DateTime, TimeDelta, Utc};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Lowest value the receiver reports as an actual reading (mg/dL)
pub const MIN_VALID_GLUCOSE: u16 = 20;

/// Trend arrow shown by the receiver for a reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TrendArrow {
    None = 0,
    DoubleUp = 1,
    SingleUp = 2,
    FortyFiveUp = 3,
    Flat = 4,
    FortyFiveDown = 5,
    SingleDown = 6,
    DoubleDown = 7,
    NotComputable = 8,
    RateOutOfRange = 9,
}

impl TrendArrow {
    /// Convert a 4-bit trend code; codes 10-15 are unassigned
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(TrendArrow::None),
            1 => Some(TrendArrow::DoubleUp),
            2 => Some(TrendArrow::SingleUp),
            3 => Some(TrendArrow::FortyFiveUp),
            4 => Some(TrendArrow::Flat),
            5 => Some(TrendArrow::FortyFiveDown),
            6 => Some(TrendArrow::SingleDown),
            7 => Some(TrendArrow::DoubleDown),
            8 => Some(TrendArrow::NotComputable),
            9 => Some(TrendArrow::RateOutOfRange),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for TrendArrow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            TrendArrow::None => "",
            TrendArrow::DoubleUp => "⇈",
            TrendArrow::SingleUp => "↑",
            TrendArrow::FortyFiveUp => "↗︎",
            TrendArrow::Flat => "→",
            TrendArrow::FortyFiveDown => "↘︎",
            TrendArrow::SingleDown => "↓",
            TrendArrow::DoubleDown => "⇊",
            TrendArrow::NotComputable => "?",
            TrendArrow::RateOutOfRange => "-",
        };
        write!(f, "{}", symbol)
    }
}

/// Sentinel values the receiver stores in place of a reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialGlucose {
    None,
    SensorNotActive,
    MinimalDeviation,
    NoAntenna,
    SensorNotCalibrated,
    CountsDeviation,
    AbsoluteDeviation,
    PowerDeviation,
    BadRf,
}

impl SpecialGlucose {
    pub fn from_value(value: u16) -> Option<Self> {
        match value {
            0 => Some(SpecialGlucose::None),
            1 => Some(SpecialGlucose::SensorNotActive),
            2 => Some(SpecialGlucose::MinimalDeviation),
            3 => Some(SpecialGlucose::NoAntenna),
            5 => Some(SpecialGlucose::SensorNotCalibrated),
            6 => Some(SpecialGlucose::CountsDeviation),
            9 => Some(SpecialGlucose::AbsoluteDeviation),
            10 => Some(SpecialGlucose::PowerDeviation),
            12 => Some(SpecialGlucose::BadRf),
            _ => None,
        }
    }
}

/// A glucose reading with its device and host timestamps.
///
/// Two records are the same reading when their sequence numbers match,
/// whatever their other fields say.
#[derive(Debug, Clone)]
pub struct GlucoseRecord {
    sequence: u32,
    glucose: u16,
    is_display_only: bool,
    trend: u8,
    device_time: u32,
    wall_time: DateTime<Utc>,
    corrected_time: DateTime<Utc>,
}

impl GlucoseRecord {
    /// Place a decoded history record on the host timeline
    pub fn from_history(record: &HistoryRecord, clock_offset: TimeDelta) -> Self {
        Self {
            sequence: record.sequence,
            glucose: record.glucose,
            is_display_only: record.is_display_only,
            trend: record.trend,
            device_time: record.system_time,
            wall_time: record.wall_time(),
            corrected_time: ClockSync::apply(record.system_time, clock_offset),
        }
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Glucose in mg/dL, or a sentinel code below `MIN_VALID_GLUCOSE`
    pub fn glucose(&self) -> u16 {
        self.glucose
    }

    pub fn is_display_only(&self) -> bool {
        self.is_display_only
    }

    /// Raw 4-bit trend code
    pub fn trend(&self) -> u8 {
        self.trend
    }

    pub fn trend_arrow(&self) -> Option<TrendArrow> {
        TrendArrow::from_u8(self.trend)
    }

    /// Device clock seconds at which the reading was taken
    pub fn device_time(&self) -> u32 {
        self.device_time
    }

    /// Display time as shown on the receiver
    pub fn wall_time(&self) -> DateTime<Utc> {
        self.wall_time
    }

    /// Reading time on the host clock
    pub fn corrected_time(&self) -> DateTime<Utc> {
        self.corrected_time
    }

    pub fn is_state_valid(&self) -> bool {
        self.glucose >= MIN_VALID_GLUCOSE
    }

    pub fn special_value(&self) -> Option<SpecialGlucose> {
        if self.is_state_valid() {
            None
        } else {
            SpecialGlucose::from_value(self.glucose)
        }
    }
}

impl PartialEq for GlucoseRecord {
    fn eq(&self, other: &Self) -> bool {
        self.sequence == other.sequence
    }
}

impl Eq for GlucoseRecord {}

impl Hash for GlucoseRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.sequence.hash(state);
    }
}

impl fmt::Display for GlucoseRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} mg/dL {}{} at {}",
            self.sequence,
            self.glucose,
            self.trend_arrow().map(|t| t.to_string()).unwrap_or_default(),
            if self.is_display_only { " (display only)" } else { "" },
            self.corrected_time.format("%Y-%m-%dT%H:%M:%SZ")
        )
    }
}
