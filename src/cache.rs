//! Last values produced by the most recent successful poll.

use std::time::{Duration, SystemTime};

use tokio::time::Instant;

use crate::{
    attributes::{Attribute, Value},
    error::CryoResult,
};

/// Decoded value, or the error raised while decoding it.
pub type Entry = (Attribute, CryoResult<Value>);

/// Keyed by attribute, in poll order. Replaced wholesale by every poll.
#[derive(Debug, Default)]
pub struct LastValues {
    entries: Vec<Entry>,
    polled_at: Option<SystemTime>,
    refreshed: Option<Instant>,
}

impl LastValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&mut self, entries: Vec<Entry>, polled_at: SystemTime, refreshed: Instant) {
        self.entries = entries;
        self.polled_at = Some(polled_at);
        self.refreshed = Some(refreshed);
    }

    pub fn get(&self, attribute: Attribute) -> Option<&CryoResult<Value>> {
        self.entries
            .iter()
            .find(|(a, _)| *a == attribute)
            .map(|(_, result)| result)
    }

    pub fn contains(&self, attribute: Attribute) -> bool {
        self.get(attribute).is_some()
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Marks the values stale so the next read polls, keeping them for
    /// callers that only look at the cache.
    pub fn invalidate(&mut self) {
        self.refreshed = None;
    }

    /// Attributes whose last poll failed.
    pub fn failed(&self) -> impl Iterator<Item = Attribute> + '_ {
        self.entries
            .iter()
            .filter(|(_, result)| result.is_err())
            .map(|(a, _)| *a)
    }

    /// Wall-clock time of the poll that produced these values.
    pub fn polled_at(&self) -> Option<SystemTime> {
        self.polled_at
    }

    pub fn age(&self, now: Instant) -> Option<Duration> {
        self.refreshed.map(|at| now.saturating_duration_since(at))
    }

    /// True when the values are younger than `validity`.
    pub fn is_fresh(&self, now: Instant, validity: Duration) -> bool {
        self.age(now).is_some_and(|age| age < validity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{attributes::ChannelId, error::CryoError};
    use pretty_assertions::assert_eq;

    #[tokio::test(start_paused = true)]
    async fn replace_is_wholesale_and_tracks_age() {
        let mut cache = LastValues::new();
        assert!(!cache.is_fresh(Instant::now(), Duration::from_secs(10)));
        assert_eq!(cache.polled_at(), None);

        let a = Attribute::Channel(ChannelId::A);
        let b = Attribute::Channel(ChannelId::B);
        cache.replace(
            vec![(Attribute::Control, Ok(Value::Bool(true))), (a, Ok(Value::Float(4.2)))],
            SystemTime::now(),
            Instant::now(),
        );
        assert!(cache.is_fresh(Instant::now(), Duration::from_millis(100)));
        assert_eq!(cache.get(a), Some(&Ok(Value::Float(4.2))));

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(!cache.is_fresh(Instant::now(), Duration::from_millis(100)));
        assert_eq!(cache.age(Instant::now()), Some(Duration::from_millis(150)));

        let err = CryoError::Decode {
            command: "INPUT B:TEMP?".into(),
            reply: "NAK".into(),
            reason: "'NAK' is not a number".into(),
        };
        cache.replace(
            vec![(Attribute::Control, Ok(Value::Bool(true))), (b, Err(err.clone()))],
            SystemTime::now(),
            Instant::now(),
        );
        assert!(!cache.contains(a));
        assert_eq!(cache.get(b), Some(&Err(err)));
        assert_eq!(cache.failed().collect::<Vec<_>>(), vec![b]);
        assert_eq!(cache.entries()[0].0, Attribute::Control);

        cache.invalidate();
        assert!(!cache.is_fresh(Instant::now(), Duration::from_secs(10)));
        assert_eq!(cache.get(b).map(Result::is_err), Some(true));
    }
}
