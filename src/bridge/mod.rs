// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Bridge between synchronous callers and asynchronous event loops.
//!
//! An [`ExecLoop`] is a cheap, cloneable handle to a running tokio
//! event loop. Streams bind to a loop for their timed work, and
//! synchronous code crosses into the loop with [`ExecLoop::block_on`],
//! which bounds the wait and refuses calls that would stall the loop
//! it is waiting on.

use crate::errors::{BridgeError, StreamError};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(1);

struct LoopInner {
    id: u64,
    handle: Handle,
    /// Thread the loop runs on; `None` when the loop is borrowed from an
    /// ambient multi-threaded runtime.
    thread: Option<ThreadId>,
    /// Dropping the last handle fires this and winds the loop down.
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

impl Drop for LoopInner {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.shutdown.lock() {
            if let Some(tx) = guard.take() {
                let _ = tx.send(());
            }
        }
    }
}

/// Handle to an event loop that runs stream work.
///
/// Clones share the same loop; the loop shuts down when the last clone
/// is dropped. Two handles compare equal exactly when they drive the
/// same loop, which is how graph construction detects conflicting
/// bindings.
#[derive(Clone)]
pub struct ExecLoop {
    inner: Arc<LoopInner>,
}

impl ExecLoop {
    /// Starts a dedicated event loop on a background thread.
    pub fn background() -> Result<ExecLoop, StreamError> {
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        std::thread::Builder::new()
            .name("freshet-loop".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err.to_string()));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok((runtime.handle().clone(), std::thread::current().id())));
                // Parks here until the last handle is dropped.
                let _ = runtime.block_on(shutdown_rx);
            })
            .map_err(|err| BridgeError::Spawn {
                reason: err.to_string(),
            })?;

        let (handle, thread) = ready_rx
            .recv()
            .map_err(|_| BridgeError::Spawn {
                reason: "loop thread exited before startup".into(),
            })?
            .map_err(|reason| BridgeError::Spawn { reason })?;

        Ok(ExecLoop {
            inner: Arc::new(LoopInner {
                id: NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed),
                handle,
                thread: Some(thread),
                shutdown: Mutex::new(Some(shutdown_tx)),
            }),
        })
    }

    /// Wraps the runtime the caller is already inside of, if any.
    ///
    /// The returned handle never shuts the ambient runtime down.
    pub fn from_current() -> Option<ExecLoop> {
        let handle = Handle::try_current().ok()?;
        Some(ExecLoop {
            inner: Arc::new(LoopInner {
                id: NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed),
                handle,
                thread: None,
                shutdown: Mutex::new(None),
            }),
        })
    }

    /// Stable identifier, used in diagnostics and conflict reports.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Human-readable name for conflict reports.
    pub fn name(&self) -> String {
        format!("loop-{}", self.inner.id)
    }

    /// Schedules a future on the loop without waiting for it.
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inner.handle.spawn(fut)
    }

    /// Runs a future on the loop and blocks the calling thread for the
    /// result.
    ///
    /// `timeout` bounds only the wait: on [`BridgeError::TimedOut`] the
    /// scheduled work keeps running on the loop. Passing `None` waits
    /// indefinitely.
    ///
    /// Calls from inside any async context (including this loop's own
    /// thread) fail immediately with [`BridgeError::WouldDeadlock`]
    /// rather than stalling the loop that has to produce the result.
    pub fn block_on<F, T>(&self, fut: F, timeout: Option<Duration>) -> Result<T, StreamError>
    where
        F: Future<Output = Result<T, StreamError>> + Send + 'static,
        T: Send + 'static,
    {
        if Handle::try_current().is_ok() {
            return Err(BridgeError::WouldDeadlock.into());
        }
        if self.inner.thread == Some(std::thread::current().id()) {
            return Err(BridgeError::WouldDeadlock.into());
        }

        let (tx, rx) = std::sync::mpsc::channel();
        self.inner.handle.spawn(async move {
            let _ = tx.send(fut.await);
        });

        match timeout {
            Some(timeout) => match rx.recv_timeout(timeout) {
                Ok(result) => result,
                Err(RecvTimeoutError::Timeout) => Err(BridgeError::TimedOut { timeout }.into()),
                Err(RecvTimeoutError::Disconnected) => Err(BridgeError::LoopClosed.into()),
            },
            None => match rx.recv() {
                Ok(result) => result,
                Err(_) => Err(BridgeError::LoopClosed.into()),
            },
        }
    }
}

impl PartialEq for ExecLoop {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for ExecLoop {}

impl std::fmt::Debug for ExecLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecLoop").field("id", &self.inner.id).finish()
    }
}
