use crate::types::Event;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Instant;

pub const KEY_TRACKING_STATUS: &str = "TrackingStatus";
pub const KEY_RELOCALIZED: &str = "Relocalized";
pub const KEY_SENSOR_TIMEOUT: &str = "SensorTimeout";
pub const KEY_SENSOR_ERROR: &str = "SensorError";
pub const KEY_SAVE_PROGRESS: &str = "AreaDescriptionSaveProgress";

const DEFAULT_CAPACITY: usize = 64;

/// Bounded diagnostic event log. The oldest entry is evicted when full.
///
/// Timestamps are microseconds since the log was created.
pub struct EventLog {
    entries: Mutex<VecDeque<Event>>,
    capacity: usize,
    origin: Instant,
}

impl EventLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            origin: Instant::now(),
        }
    }

    pub fn push(&self, key: &str, value: impl Into<String>) {
        let event = Event {
            timestamp_us: self.origin.elapsed().as_micros() as u64,
            key: key.to_string(),
            value: value.into(),
        };
        log::debug!("Event {}", event);
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(event);
    }

    /// Remove and return all pending events, oldest first.
    pub fn drain(&self) -> Vec<Event> {
        self.entries.lock().drain(..).collect()
    }

    /// `"key: value"` of the newest event, without consuming it.
    pub fn latest_string(&self) -> Option<String> {
        self.entries.lock().back().map(|e| e.to_string())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_and_ordered() {
        let log = EventLog::with_capacity(3);
        for i in 0..5 {
            log.push(KEY_SAVE_PROGRESS, format!("{}", i * 25));
        }
        assert_eq!(log.len(), 3);
        assert_eq!(log.latest_string().as_deref(), Some("AreaDescriptionSaveProgress: 100"));

        let drained = log.drain();
        let values: Vec<_> = drained.iter().map(|e| e.value.as_str()).collect();
        assert_eq!(values, vec!["50", "75", "100"]);
        assert!(drained.windows(2).all(|w| w[0].timestamp_us <= w[1].timestamp_us));
        assert!(log.is_empty());
        assert_eq!(log.latest_string(), None);
    }
}
