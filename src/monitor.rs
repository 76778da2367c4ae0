//! Owner-side handling of decoded history
//!
//! The receiver re-sends its most recent history page every few minutes,
//! so most pages overlap what was already seen. `GlucoseMonitor` skips
//! pages with nothing new, remembers the latest reading, and passes the
//! usable samples on to a `SampleSink`.

use crate::glucose::{GlucoseRecord, TrendArrow};
use crate::receiver::ReceiverDelegate;
use crate::types::G4Error;
use chrono::{DateTime, TimeDelta, Utc};
use log::{debug, info, warn};

/// Readings younger than this count as fresh
const FRESHNESS_SECONDS: i64 = 270;

/// Slack added to the sink's filter date
const INCLUDE_AFTER_SLACK_SECONDS: i64 = 60;

/// A reading ready to be stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlucoseSample {
    /// Stable identifier for de-duplication downstream (the sequence number)
    pub sync_identifier: String,
    pub date: DateTime<Utc>,
    /// mg/dL
    pub glucose: u16,
    pub trend: Option<TrendArrow>,
    pub is_display_only: bool,
}

impl From<&GlucoseRecord> for GlucoseSample {
    fn from(record: &GlucoseRecord) -> Self {
        Self {
            sync_identifier: record.sequence().to_string(),
            date: record.corrected_time(),
            glucose: record.glucose(),
            trend: record.trend_arrow(),
            is_display_only: record.is_display_only(),
        }
    }
}

/// Destination for new samples
pub trait SampleSink: Send {
    fn add_samples(&mut self, samples: Vec<GlucoseSample>);

    /// Samples dated before this instant (plus a minute) are already stored
    fn include_after(&self) -> Option<DateTime<Utc>> {
        None
    }

    fn on_error(&mut self, error: &G4Error) {
        let _ = error;
    }
}

pub struct GlucoseMonitor<S> {
    sink: S,
    latest: Option<GlucoseRecord>,
    last_heartbeat: Option<DateTime<Utc>>,
}

impl<S: SampleSink> GlucoseMonitor<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            latest: None,
            last_heartbeat: None,
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn latest_reading(&self) -> Option<&GlucoseRecord> {
        self.latest.as_ref()
    }

    pub fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        self.last_heartbeat
    }

    /// Whether the latest reading is recent enough that fetching elsewhere is pointless
    pub fn is_data_fresh(&self, now: DateTime<Utc>) -> bool {
        self.latest.as_ref().is_some_and(|latest| {
            latest.corrected_time() > now - TimeDelta::seconds(FRESHNESS_SECONDS)
        })
    }
}

impl<S: SampleSink> ReceiverDelegate for GlucoseMonitor<S> {
    fn on_glucose_history(&mut self, records: Vec<GlucoseRecord>) {
        let Some(newest) = records.iter().max_by_key(|r| r.sequence()) else {
            return;
        };
        if self.latest.as_ref() == Some(newest) {
            debug!("No new readings (latest #{})", newest.sequence());
            return;
        }
        info!("Latest reading {}", newest);
        self.latest = Some(newest.clone());

        let include_after = self
            .sink
            .include_after()
            .map(|date| date + TimeDelta::seconds(INCLUDE_AFTER_SLACK_SECONDS));

        let samples: Vec<GlucoseSample> = records
            .iter()
            .filter(|r| r.is_state_valid())
            .filter(|r| include_after.map_or(true, |after| r.corrected_time() >= after))
            .map(GlucoseSample::from)
            .collect();

        debug!("{} of {} readings are new samples", samples.len(), records.len());
        self.sink.add_samples(samples);
    }

    fn on_error(&mut self, error: &G4Error) {
        warn!("Receiver error ({}): {}", error.kind(), error);
        self.sink.on_error(error);
    }

    fn on_diagnostic_event(&mut self, text: &str) {
        debug!("{}", text);
    }

    fn on_heartbeat(&mut self, received_at: DateTime<Utc>) {
        self.last_heartbeat = Some(received_at);
    }
}
