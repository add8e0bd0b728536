//! The background execution context that owns all device I/O.
//!
//! An [`Executor`] runs a single-threaded Tokio runtime on a dedicated OS
//! thread.  Synchronous callers hand it futures through [`Executor::run_blocking`]
//! (submit and wait) or [`Executor::run_detached`] (submit only); the futures
//! themselves never run on the caller's thread.
//!
//! One executor may be shared by any number of sessions.  It is shut down
//! explicitly with [`Executor::shutdown`], or when the last owner drops it.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;

use crate::error::{MyoError, Result};

const THREAD_NAME: &str = "myo-io";

/// How long pending tasks get to finish when the executor is dropped without
/// an explicit [`Executor::shutdown`].
const DROP_GRACE: Duration = Duration::from_millis(500);

pub struct Executor {
    handle: Handle,
    closed: AtomicBool,
    stop: Mutex<Option<oneshot::Sender<Duration>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl Executor {
    /// Start the runtime thread.
    pub fn new() -> Result<Self> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .thread_name(THREAD_NAME)
            .build()
            .map_err(|e| MyoError::Unknown(format!("failed to build runtime: {e}")))?;
        let handle = runtime.handle().clone();
        let (stop_tx, stop_rx) = oneshot::channel::<Duration>();

        let thread = thread::Builder::new()
            .name(THREAD_NAME.into())
            .spawn(move || {
                // Spawned tasks make progress only while this block_on is active.
                let grace = runtime.block_on(async { stop_rx.await.unwrap_or(DROP_GRACE) });
                runtime.shutdown_timeout(grace);
                debug!("executor thread finished");
            })
            .map_err(|e| MyoError::Unknown(format!("failed to spawn executor thread: {e}")))?;

        Ok(Self {
            handle,
            closed: AtomicBool::new(false),
            stop: Mutex::new(Some(stop_tx)),
            thread_id: thread.thread().id(),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Run `operation` on the executor and block the calling thread until it
    /// completes or `timeout` elapses.
    ///
    /// On timeout the operation is aborted at its next suspension point and
    /// [`MyoError::ConnectionTimeout`] is returned.  Calling this from inside the
    /// executor (e.g. from a notification handler) would deadlock and is
    /// rejected with [`MyoError::Unknown`].
    pub fn run_blocking<F, T>(&self, operation: F, timeout: Option<Duration>) -> Result<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if self.is_closed() {
            return Err(MyoError::ShutdownInProgress);
        }
        if self.on_executor_thread() {
            return Err(MyoError::Unknown(
                "run_blocking called from the executor thread".into(),
            ));
        }

        let (tx, rx) = std_mpsc::sync_channel(1);
        let task = self.handle.spawn(async move {
            let _ = tx.send(operation.await);
        });

        let received = match timeout {
            Some(limit) => rx.recv_timeout(limit),
            None => rx.recv().map_err(|_| std_mpsc::RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(value) => Ok(value),
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                task.abort();
                Err(MyoError::ConnectionTimeout(format!(
                    "operation did not finish within {:?}",
                    timeout.unwrap_or_default()
                )))
            }
            // The task was dropped without finishing: the runtime is gone.
            Err(std_mpsc::RecvTimeoutError::Disconnected) => Err(MyoError::ShutdownInProgress),
        }
    }

    /// Submit `operation` without waiting for it.  Silently discarded once the
    /// executor is shut down.
    pub fn run_detached<F>(&self, operation: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_closed() {
            debug!("run_detached after shutdown: operation discarded");
            return;
        }
        self.handle.spawn(operation);
    }

    /// `true` when called from inside an operation or handler running on
    /// this executor.
    pub fn on_executor_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop the runtime, giving in-flight tasks up to `grace` to finish, and
    /// join the thread.  Idempotent.
    pub fn shutdown(&self, grace: Duration) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("executor shutting down");

        if let Some(stop) = lock(&self.stop).take() {
            let _ = stop.send(grace);
        }
        // Joining from the executor thread itself would never return.
        if self.on_executor_thread() {
            return;
        }
        if let Some(thread) = lock(&self.thread).take() {
            if thread.join().is_err() {
                warn!("executor thread panicked");
            }
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.shutdown(DROP_GRACE);
    }
}

/// Lock a std mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
