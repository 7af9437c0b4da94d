use super::types::Sample;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::VecDeque;

#[derive(Clone, Debug)]
struct WindowBounds {
    max_len: usize,
    max_span: Option<ChronoDuration>,
}

/// Recent samples in strictly increasing timestamp order.
#[derive(Clone, Debug)]
pub(crate) struct SampleWindow {
    bounds: WindowBounds,
    buffer: VecDeque<Sample>,
}

impl SampleWindow {
    pub(crate) fn new(max_len: usize, max_span: Option<ChronoDuration>) -> Self {
        Self {
            bounds: WindowBounds {
                max_len: max_len.max(1),
                max_span,
            },
            buffer: VecDeque::with_capacity(max_len.clamp(1, 4096)),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.buffer.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub(crate) fn floor(&self) -> Option<DateTime<Utc>> {
        self.buffer.front().map(|s| s.timestamp)
    }

    pub(crate) fn newest(&self) -> Option<DateTime<Utc>> {
        self.buffer.back().map(|s| s.timestamp)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Sample> {
        self.buffer.iter()
    }

    /// `Ok(idx)` when a sample with this timestamp is retained, otherwise the insert position.
    pub(crate) fn locate(&self, timestamp: DateTime<Utc>) -> Result<usize, usize> {
        self.buffer.binary_search_by(|s| s.timestamp.cmp(&timestamp))
    }

    pub(crate) fn push_back(&mut self, sample: Sample) {
        debug_assert!(self.newest().map(|ts| sample.timestamp > ts).unwrap_or(true));
        self.buffer.push_back(sample);
    }

    pub(crate) fn insert(&mut self, idx: usize, sample: Sample) {
        self.buffer.insert(idx, sample);
    }

    pub(crate) fn replace_value(&mut self, idx: usize, value: f64) {
        if let Some(slot) = self.buffer.get_mut(idx) {
            slot.value = value;
        }
    }

    /// Removes the oldest sample if the window is over its length or span bound.
    pub(crate) fn pop_expired(&mut self) -> Option<Sample> {
        if self.buffer.len() > self.bounds.max_len {
            return self.buffer.pop_front();
        }
        let span = self.bounds.max_span?;
        if self.buffer.len() < 2 {
            return None;
        }
        let (front, back) = (self.buffer.front()?, self.buffer.back()?);
        if back.timestamp - front.timestamp > span {
            return self.buffer.pop_front();
        }
        None
    }
}
