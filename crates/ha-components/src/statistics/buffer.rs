//! Time-ordered sample buffer behind the statistics sensor

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, trace};

/// One sample of the source entity
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferedState {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub valid: bool,
}

impl BufferedState {
    pub fn new(timestamp: DateTime<Utc>, value: f64) -> Self {
        Self {
            timestamp,
            value,
            valid: true,
        }
    }
}

/// Where [`StateBuffer::insert`] put a sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum InsertPosition {
    Tail = 1,
    Head = -1,
    Rejected = 0,
}

impl InsertPosition {
    pub fn as_i8(self) -> i8 {
        self as i8
    }
}

/// Samples left after pruning, oldest first
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BufferSnapshot {
    pub timestamps: Vec<DateTime<Utc>>,
    pub values: Vec<f64>,
    /// Validity of the last source update, stored or not
    pub last_valid: bool,
}

impl BufferSnapshot {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

struct Inner {
    samples: VecDeque<BufferedState>,
    last_valid: bool,
}

/// Samples ordered by timestamp, bounded by count and/or age
///
/// All access goes through one mutex, so a buffer can be shared between the
/// state listener, the expiry timer and readers on other threads.
pub struct StateBuffer {
    inner: Mutex<Inner>,
    max_size: Option<usize>,
    max_age: Option<Duration>,
    retain_anchor: bool,
}

impl StateBuffer {
    pub fn new(max_size: Option<usize>, max_age: Option<Duration>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                samples: VecDeque::new(),
                last_valid: true,
            }),
            max_size: max_size.filter(|size| *size > 0),
            max_age,
            retain_anchor: true,
        }
    }

    /// Whether pruning keeps the newest sample once everything has expired
    pub fn with_retain_anchor(mut self, retain_anchor: bool) -> Self {
        self.retain_anchor = retain_anchor;
        self
    }

    pub fn max_size(&self) -> Option<usize> {
        self.max_size
    }

    pub fn max_age(&self) -> Option<Duration> {
        self.max_age
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a sample at whichever end its timestamp belongs
    ///
    /// A sample that falls strictly inside the buffered span, or that would
    /// have to be prepended to a full buffer, is dropped.
    pub fn insert(&self, state: BufferedState) -> InsertPosition {
        let mut inner = self.lock();
        inner.last_valid = state.valid;

        let (oldest, newest) = match (inner.samples.front(), inner.samples.back()) {
            (Some(front), Some(back)) => (front.timestamp, back.timestamp),
            _ => {
                inner.samples.push_back(state);
                return InsertPosition::Tail;
            }
        };

        if state.timestamp >= newest {
            if self.max_size.is_some_and(|max| inner.samples.len() >= max) {
                inner.samples.pop_front();
            }
            inner.samples.push_back(state);
            InsertPosition::Tail
        } else if state.timestamp <= oldest
            && self.max_size.map_or(true, |max| inner.samples.len() < max)
        {
            inner.samples.push_front(state);
            InsertPosition::Head
        } else {
            error!(
                timestamp = %state.timestamp,
                %oldest,
                %newest,
                "Dropping out-of-order sample"
            );
            InsertPosition::Rejected
        }
    }

    /// Note a source update that produced no sample
    pub fn record_invalid(&self) {
        self.lock().last_valid = false;
    }

    /// Prune expired samples and return what is left
    pub fn states(&self, now: DateTime<Utc>) -> BufferSnapshot {
        let mut inner = self.lock();
        self.prune(&mut inner, now);
        BufferSnapshot {
            timestamps: inner.samples.iter().map(|s| s.timestamp).collect(),
            values: inner.samples.iter().map(|s| s.value).collect(),
            last_valid: inner.last_valid,
        }
    }

    fn prune(&self, inner: &mut Inner, now: DateTime<Utc>) {
        let Some(max_age) = self.max_age else {
            return;
        };
        let keep = usize::from(self.retain_anchor);
        let mut pruned = 0;
        while inner.samples.len() > keep {
            match inner.samples.front() {
                Some(oldest) if is_expired(oldest.timestamp, now, max_age) => {
                    inner.samples.pop_front();
                    pruned += 1;
                }
                _ => break,
            }
        }
        if pruned > 0 {
            trace!(pruned, remaining = inner.samples.len(), "Pruned expired samples");
        }
    }

    /// When the oldest prunable sample expires
    pub fn next_expiry(&self) -> Option<DateTime<Utc>> {
        let max_age = chrono::Duration::from_std(self.max_age?).ok()?;
        let inner = self.lock();
        if inner.samples.len() <= usize::from(self.retain_anchor) {
            return None;
        }
        inner.samples.front().map(|s| s.timestamp + max_age)
    }

    pub fn len(&self) -> usize {
        self.lock().samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().samples.is_empty()
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.samples.clear();
        inner.last_valid = true;
    }
}

fn is_expired(timestamp: DateTime<Utc>, now: DateTime<Utc>, max_age: Duration) -> bool {
    // A timestamp in the future has a negative age and never expires
    matches!((now - timestamp).to_std(), Ok(age) if age > max_age)
}
