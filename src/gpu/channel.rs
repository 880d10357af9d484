//! GPU work channels.
//!
//! A channel is an in-order queue of pushes. Each push is identified by a
//! monotonically increasing semaphore value; a push is complete once the
//! channel's completed value reaches it. Hardware progress is modeled by the
//! channel retiring queued work whenever progress is polled, unless the channel
//! is paused, in which case only explicit [`Channel::retire`] calls advance it.

use crate::error::{UvmError, UvmResult};
use crate::lock::{LockMode, LockOrder, OrderToken};
use crate::tracker::TrackerEntry;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct ChannelState {
    queued: u64,
    completed: u64,
    paused: bool,
    /// Set by the fault/ECC layer; every later wait and push fails.
    error: Option<String>,
    pushes: u64,
}

#[derive(Debug)]
pub struct Channel {
    name: String,
    state: Mutex<ChannelState>,
    progress: Condvar,
}

struct ChannelGuard<'a> {
    state: MutexGuard<'a, ChannelState>,
    _token: OrderToken,
}

impl Channel {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            state: Mutex::new(ChannelState::default()),
            progress: Condvar::new(),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> ChannelGuard<'_> {
        let token = OrderToken::acquire(LockOrder::Channel, LockMode::Exclusive);
        ChannelGuard {
            state: self.state.lock(),
            _token: token,
        }
    }

    fn error_of(&self, reason: &str) -> UvmError {
        UvmError::ChannelError {
            channel: self.name.clone(),
            reason: reason.to_string(),
        }
    }

    /// Queues one unit of work and returns the entry that tracks it.
    ///
    /// # Errors
    /// Returns `ChannelError` if the channel has faulted.
    pub fn push(self: &Arc<Self>, description: &str) -> UvmResult<TrackerEntry> {
        let mut guard = self.lock();
        if let Some(reason) = &guard.state.error {
            return Err(self.error_of(reason));
        }
        guard.state.queued += 1;
        guard.state.pushes += 1;
        let value = guard.state.queued;
        drop(guard);

        log::trace!("{}: push {value} ({description})", self.name);
        Ok(TrackerEntry::new(Arc::clone(self), value))
    }

    /// Polls hardware progress and returns the completed value.
    pub fn update_progress(&self) -> u64 {
        let mut guard = self.lock();
        if !guard.state.paused && guard.state.error.is_none() {
            guard.state.completed = guard.state.queued;
        }
        guard.state.completed
    }

    #[must_use]
    pub fn is_value_completed(&self, value: u64) -> bool {
        self.update_progress() >= value
    }

    /// Blocks until `value` completes, the channel faults or `timeout` passes.
    ///
    /// # Errors
    /// Returns `ChannelError` on a channel fault and `WaitTimeout` on timeout.
    pub fn wait_for(&self, value: u64, timeout: Option<Duration>) -> UvmResult<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = self.lock();

        loop {
            if let Some(reason) = &guard.state.error {
                return Err(self.error_of(reason));
            }
            if !guard.state.paused {
                guard.state.completed = guard.state.queued;
            }
            if guard.state.completed >= value {
                return Ok(());
            }

            match deadline {
                Some(deadline) => {
                    if self
                        .progress
                        .wait_until(&mut guard.state, deadline)
                        .timed_out()
                    {
                        return Err(UvmError::WaitTimeout);
                    }
                }
                None => self.progress.wait(&mut guard.state),
            }
        }
    }

    /// Stops automatic progress so pushes stay outstanding.
    pub fn pause(&self) {
        self.lock().state.paused = true;
    }

    pub fn resume(&self) {
        self.lock().state.paused = false;
        self.progress.notify_all();
    }

    /// Completes outstanding work up to `value` while paused.
    pub fn retire(&self, value: u64) {
        let mut guard = self.lock();
        let value = value.min(guard.state.queued);
        guard.state.completed = guard.state.completed.max(value);
        drop(guard);
        self.progress.notify_all();
    }

    /// Marks the channel as faulted, as the ECC/RC layer would.
    pub fn set_error(&self, reason: impl Into<String>) {
        self.lock().state.error = Some(reason.into());
        self.progress.notify_all();
    }

    pub fn clear_error(&self) {
        self.lock().state.error = None;
    }

    /// # Errors
    /// Returns `ChannelError` if the channel has faulted.
    pub fn check_errors(&self) -> UvmResult<()> {
        let guard = self.lock();
        match &guard.state.error {
            Some(reason) => Err(self.error_of(reason)),
            None => Ok(()),
        }
    }

    /// Total number of pushes ever queued.
    #[must_use]
    pub fn push_count(&self) -> u64 {
        self.lock().state.pushes
    }

    #[must_use]
    pub fn queued_value(&self) -> u64 {
        self.lock().state.queued
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_push_and_complete() {
        let channel = Channel::new("ce0");
        let entry = channel.push("copy").unwrap();
        assert_eq!(entry.value(), 1);
        assert!(channel.is_value_completed(1));
        assert_eq!(channel.push_count(), 1);
    }

    #[test]
    fn test_paused_channel_keeps_work_outstanding() {
        let channel = Channel::new("ce0");
        channel.pause();
        channel.push("copy").unwrap();
        channel.push("copy").unwrap();

        assert!(!channel.is_value_completed(1));
        assert_eq!(
            channel.wait_for(2, Some(Duration::from_millis(5))),
            Err(UvmError::WaitTimeout)
        );

        channel.retire(1);
        assert!(channel.is_value_completed(1));
        assert!(!channel.is_value_completed(2));

        let waiter = Arc::clone(&channel);
        let handle = thread::spawn(move || waiter.wait_for(2, None));
        channel.resume();
        assert!(handle.join().unwrap().is_ok());
    }

    #[test]
    fn test_error_fails_waits_and_pushes() {
        let channel = Channel::new("ce1");
        channel.pause();
        channel.push("copy").unwrap();
        channel.set_error("ECC");

        assert!(matches!(
            channel.wait_for(1, None),
            Err(UvmError::ChannelError { .. })
        ));
        assert!(channel.push("copy").is_err());
        assert!(channel.check_errors().is_err());

        channel.clear_error();
        assert!(channel.check_errors().is_ok());
    }
}
