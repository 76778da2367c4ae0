//! Device clock handling
//!
//! The receiver counts seconds from its own epoch, midnight Pacific on
//! 2009-01-01 (2009-01-01T08:00:00Z).
//! Its clock drifts from the host's, so the link learns an offset from the
//! first plausible clock message and uses it to place history records on
//! the host's timeline.

use chrono::{DateTime, TimeDelta, Utc};

/// Unix timestamp of the device epoch, 2009-01-01T08:00:00Z
pub const DEVICE_EPOCH_UNIX: i64 = 1_230_796_800;

/// Reinterpret device seconds against the device epoch
pub fn from_device_time(seconds: u32) -> DateTime<Utc> {
    DateTime::from_timestamp(DEVICE_EPOCH_UNIX + i64::from(seconds), 0)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Device seconds taken literally as Unix seconds.
///
/// The learned offset is defined against this value, so it absorbs both
/// the device epoch and the drift in one quantity.
fn as_unix_seconds(seconds: u32) -> DateTime<Utc> {
    DateTime::from_timestamp(i64::from(seconds), 0).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Whether `seconds` on the device clock lands within `window` of `now`
pub fn is_plausible(seconds: u32, now: DateTime<Utc>, window: TimeDelta) -> bool {
    let delta = from_device_time(seconds) - now;
    delta.abs() < window
}

/// Learned offset between the host clock and the device clock.
///
/// Lives as long as the owning receiver; it is not persisted.
#[derive(Debug, Clone, Default)]
pub struct ClockSync {
    offset: Option<TimeDelta>,
}

impl ClockSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Learn the offset from a clock message received at `received_at`
    pub fn learn(&mut self, device_seconds: u32, received_at: DateTime<Utc>) -> TimeDelta {
        let offset = received_at - as_unix_seconds(device_seconds);
        self.offset = Some(offset);
        offset
    }

    /// The current offset, once a clock message has been seen
    pub fn offset(&self) -> Option<TimeDelta> {
        self.offset
    }

    /// Host time of a device timestamp under an explicit offset
    pub fn apply(device_seconds: u32, offset: TimeDelta) -> DateTime<Utc> {
        as_unix_seconds(device_seconds) + offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_device_epoch() {
        assert_eq!(
            from_device_time(0),
            Utc.with_ymd_and_hms(2009, 1, 1, 8, 0, 0).unwrap()
        );
        assert_eq!(from_device_time(0).timestamp(), DEVICE_EPOCH_UNIX);
        assert_eq!(
            from_device_time(238_451_671),
            Utc.with_ymd_and_hms(2016, 7, 23, 4, 34, 31).unwrap()
        );
    }

    #[test]
    fn test_plausibility_window() {
        let now = Utc.with_ymd_and_hms(2016, 7, 23, 6, 0, 0).unwrap();
        let window = TimeDelta::days(3650);
        assert!(is_plausible(238_472_962, now, window));
        // Device time zero is 2009, still within ten years of 2016
        assert!(is_plausible(0, now, window));
        assert!(!is_plausible(0, now, TimeDelta::days(365)));
        assert!(!is_plausible(u32::MAX, now, window));
    }

    #[test]
    fn test_learn_and_apply() {
        let mut sync = ClockSync::new();
        assert_eq!(sync.offset(), None);

        let received_at = Utc.with_ymd_and_hms(2016, 7, 23, 6, 40, 0).unwrap();
        let clock_seconds = 238_480_500;
        let offset = sync.learn(clock_seconds, received_at);
        assert_eq!(sync.offset(), Some(offset));

        // The clock message itself maps back to its receipt time
        assert_eq!(ClockSync::apply(clock_seconds, offset), received_at);

        // Earlier device times map to proportionally earlier host times
        assert_eq!(
            ClockSync::apply(clock_seconds - 300, offset),
            received_at - TimeDelta::seconds(300)
        );
    }

    #[test]
    fn test_relearn_overwrites() {
        let mut sync = ClockSync::new();
        let t0 = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        sync.learn(1000, t0);
        let offset = sync.learn(1000, t0 + TimeDelta::seconds(5));
        assert_eq!(sync.offset(), Some(offset));
        assert_eq!(ClockSync::apply(1000, offset), t0 + TimeDelta::seconds(5));
    }
}
