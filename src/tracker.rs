//! Completion tracking for asynchronous GPU work.
//!
//! A [`Tracker`] is a set of (channel, value) pairs. It keeps at most one entry
//! per channel, the highest value, since channels complete work in order.

use crate::error::UvmResult;
use crate::gpu::channel::Channel;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// One outstanding push on one channel.
#[derive(Clone)]
pub struct TrackerEntry {
    channel: Arc<Channel>,
    value: u64,
}

impl TrackerEntry {
    #[must_use]
    pub const fn new(channel: Arc<Channel>, value: u64) -> Self {
        Self { channel, value }
    }

    #[must_use]
    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    #[must_use]
    pub const fn value(&self) -> u64 {
        self.value
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.channel.is_value_completed(self.value)
    }

    /// # Errors
    /// Propagates channel faults and timeouts.
    pub fn wait(&self, timeout: Option<Duration>) -> UvmResult<()> {
        self.channel.wait_for(self.value, timeout)
    }
}

impl fmt::Debug for TrackerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.channel.name(), self.value)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Tracker {
    entries: Vec<TrackerEntry>,
}

impl Tracker {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn add_entry(&mut self, entry: TrackerEntry) {
        match self
            .entries
            .iter_mut()
            .find(|e| Arc::ptr_eq(&e.channel, &entry.channel))
        {
            Some(existing) => existing.value = existing.value.max(entry.value),
            None => self.entries.push(entry),
        }
    }

    pub fn add_tracker(&mut self, other: &Self) {
        for entry in &other.entries {
            self.add_entry(entry.clone());
        }
    }

    /// Replaces this tracker's contents with `other`'s.
    pub fn overwrite(&mut self, other: &Self) {
        self.entries.clone_from(&other.entries);
    }

    /// Drops entries whose work has completed.
    pub fn remove_completed(&mut self) {
        self.entries.retain(|e| !e.is_completed());
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.entries.iter().all(TrackerEntry::is_completed)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> impl Iterator<Item = &TrackerEntry> {
        self.entries.iter()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Waits for every entry. Completed entries are removed even on failure.
    ///
    /// # Errors
    /// Returns the first channel fault encountered.
    pub fn wait(&mut self) -> UvmResult<()> {
        self.wait_inner(None)
    }

    /// # Errors
    /// Returns `WaitTimeout` if an entry does not complete within `timeout`.
    pub fn wait_timeout(&mut self, timeout: Duration) -> UvmResult<()> {
        self.wait_inner(Some(timeout))
    }

    fn wait_inner(&mut self, timeout: Option<Duration>) -> UvmResult<()> {
        let mut status = Ok(());
        for entry in &self.entries {
            if let Err(e) = entry.wait(timeout) {
                status = Err(e);
                break;
            }
        }
        self.remove_completed();
        status
    }

    /// Waits and releases everything the tracker holds.
    ///
    /// # Errors
    /// Same as [`Tracker::wait`].
    pub fn wait_deinit(mut self) -> UvmResult<()> {
        let status = self.wait();
        self.entries.clear();
        status
    }
}
