//! Background worker for work that cannot run in the caller's context, such as
//! VA-space teardown while the driver is suspended.

use crate::error::{UvmError, UvmResult};
use parking_lot::Mutex;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Job),
    Flush(mpsc::Sender<()>),
}

/// Single worker thread draining an in-order job queue.
pub struct DeferredWorker {
    tx: Mutex<Option<mpsc::Sender<Message>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for DeferredWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredWorker")
            .field("running", &self.tx.lock().is_some())
            .finish()
    }
}

impl DeferredWorker {
    /// # Errors
    /// `InvalidState` if the worker thread cannot be spawned.
    pub fn new() -> UvmResult<Self> {
        let (tx, rx) = mpsc::channel();
        let inner = InnerWorker { rx };
        let handle = thread::Builder::new()
            .name("uvm-deferred".into())
            .spawn(move || inner.work())
            .map_err(|e| UvmError::InvalidState(format!("failed to spawn deferred worker: {e}")))?;

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    fn send(&self, message: Message) -> UvmResult<()> {
        let tx = self.tx.lock();
        let tx = tx
            .as_ref()
            .ok_or_else(|| UvmError::InvalidState("deferred worker is shut down".into()))?;
        tx.send(message)
            .map_err(|_| UvmError::InvalidState("deferred worker exited".into()))
    }

    /// Queues `job` behind everything already scheduled.
    ///
    /// # Errors
    /// `InvalidState` once the worker is shut down.
    pub fn schedule<F>(&self, job: F) -> UvmResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.send(Message::Run(Box::new(job)))
    }

    /// Blocks until every job scheduled before this call has run.
    ///
    /// # Errors
    /// `InvalidState` once the worker is shut down.
    pub fn flush(&self) -> UvmResult<()> {
        let (done_tx, done_rx) = mpsc::channel();
        self.send(Message::Flush(done_tx))?;
        done_rx
            .recv()
            .map_err(|_| UvmError::InvalidState("deferred worker exited".into()))
    }

    /// Runs the remaining jobs and joins the thread.
    pub fn shutdown(&self) {
        drop(self.tx.lock().take());
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                log::error!("Deferred worker panicked");
            }
        }
    }
}

impl Drop for DeferredWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct InnerWorker {
    rx: mpsc::Receiver<Message>,
}

impl InnerWorker {
    fn work(self) {
        log::trace!("Deferred worker started");
        for message in self.rx.iter() {
            match message {
                Message::Run(job) => job(),
                Message::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        log::trace!("Deferred worker stopped");
    }
}
