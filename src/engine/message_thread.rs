//! The coordination thread.
//!
//! Owns editor and instance lifecycle work. Callers post a task and block on
//! a one-shot completion channel until it has run.

use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;

type Task = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    static ON_MESSAGE_THREAD: Cell<bool> = const { Cell::new(false) };
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Failed to spawn message thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Message thread has shut down")]
    Closed,

    #[error("Task panicked on the message thread")]
    Panicked,

    #[error("Message thread did not complete the task within {0:?}")]
    TimedOut(Duration),
}

pub struct MessageThread {
    sender: Option<Sender<Task>>,
    handle: Option<JoinHandle<()>>,
    /// Set when a task overran its timeout; the thread may never return.
    stuck: AtomicBool,
}

impl MessageThread {
    pub fn spawn() -> Result<Self, DispatchError> {
        let (sender, receiver) = mpsc::channel::<Task>();
        let handle = thread::Builder::new()
            .name("plugcheck-message".to_string())
            .spawn(move || {
                ON_MESSAGE_THREAD.with(|flag| flag.set(true));
                while let Ok(task) = receiver.recv() {
                    // A panicking task drops its completion sender, which the
                    // caller observes; the loop keeps serving.
                    let _ = catch_unwind(AssertUnwindSafe(task));
                }
            })?;

        Ok(Self {
            sender: Some(sender),
            handle: Some(handle),
            stuck: AtomicBool::new(false),
        })
    }

    /// Whether the calling thread is a message thread.
    pub fn is_current() -> bool {
        ON_MESSAGE_THREAD.with(Cell::get)
    }

    /// Run `task` on the message thread and wait for its result.
    ///
    /// Runs inline when already on the message thread.
    pub fn call<R, F>(&self, task: F, timeout: Option<Duration>) -> Result<R, DispatchError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if Self::is_current() {
            return Ok(task());
        }

        let sender = self.sender.as_ref().ok_or(DispatchError::Closed)?;
        let (done_tx, done_rx) = mpsc::sync_channel::<R>(1);
        let wrapped: Task = Box::new(move || {
            let _ = done_tx.send(task());
        });
        sender.send(wrapped).map_err(|_| DispatchError::Closed)?;

        match timeout {
            None => done_rx.recv().map_err(|_| DispatchError::Panicked),
            Some(limit) => done_rx.recv_timeout(limit).map_err(|e| match e {
                RecvTimeoutError::Timeout => {
                    self.stuck.store(true, Ordering::Release);
                    DispatchError::TimedOut(limit)
                }
                RecvTimeoutError::Disconnected => DispatchError::Panicked,
            }),
        }
    }
}

impl Drop for MessageThread {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            if self.stuck.load(Ordering::Acquire) {
                tracing::warn!("message thread is stuck; detaching it");
            } else if handle.join().is_err() {
                tracing::warn!("message thread exited with a panic");
            }
        }
    }
}
