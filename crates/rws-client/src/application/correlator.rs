//! Request/response correlation for `question()`.
//!
//! The relay answers a question with an envelope carrying the same `cmd` but
//! does not echo the request id, so pending questions are keyed by command
//! name.  Each command keeps a FIFO of waiters: when several questions with
//! the same command are in flight, replies are handed out oldest-first, one
//! reply per waiter.
//!
//! A waiter is removed when it is answered, when it times out, or when the
//! caller drops its [`PendingQuestion`], so no entry outlives its question.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rws_core::Envelope;
use tokio::sync::oneshot;
use tokio::time;
use tracing::debug;

use crate::error::ClientError;

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Envelope>,
}

type PendingMap = HashMap<String, VecDeque<Waiter>>;

/// Table of questions waiting for an answer.
#[derive(Default)]
pub struct QuestionCorrelator {
    pending: Arc<Mutex<PendingMap>>,
    next_waiter: AtomicU64,
}

/// A registered question.  Await it with [`QuestionCorrelator::wait`].
///
/// Dropping it unregisters the waiter.
pub struct PendingQuestion {
    cmd: String,
    id: u64,
    rx: Option<oneshot::Receiver<Envelope>>,
    pending: Arc<Mutex<PendingMap>>,
}

impl PendingQuestion {
    pub fn cmd(&self) -> &str {
        &self.cmd
    }
}

impl Drop for PendingQuestion {
    fn drop(&mut self) {
        remove_waiter(&mut lock(&self.pending), &self.cmd, self.id);
    }
}

fn lock(pending: &Mutex<PendingMap>) -> MutexGuard<'_, PendingMap> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

fn remove_waiter(map: &mut PendingMap, cmd: &str, id: u64) {
    if let Some(queue) = map.get_mut(cmd) {
        queue.retain(|w| w.id != id);
        if queue.is_empty() {
            map.remove(cmd);
        }
    }
}

impl QuestionCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter for the next envelope with `cmd`.
    ///
    /// Register before sending the question so a fast reply cannot be missed.
    pub fn register(&self, cmd: &str) -> PendingQuestion {
        let id = self.next_waiter.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending)
            .entry(cmd.to_string())
            .or_default()
            .push_back(Waiter { id, tx });
        PendingQuestion {
            cmd: cmd.to_string(),
            id,
            rx: Some(rx),
            pending: Arc::clone(&self.pending),
        }
    }

    /// Hands `envelope` to the oldest live waiter for its command.
    ///
    /// Returns `true` if a waiter took it, in which case the envelope must not
    /// be emitted as a regular message.
    pub fn resolve(&self, envelope: &Envelope) -> bool {
        let mut map = lock(&self.pending);
        let Some(queue) = map.get_mut(&envelope.cmd) else {
            return false;
        };

        let mut delivered = false;
        while let Some(waiter) = queue.pop_front() {
            if waiter.tx.send(envelope.clone()).is_ok() {
                debug!(cmd = %envelope.cmd, waiter = waiter.id, "question answered");
                delivered = true;
                break;
            }
        }
        if queue.is_empty() {
            map.remove(&envelope.cmd);
        }
        delivered
    }

    /// Waits for the answer to `question`, at most `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Timeout`] when no answer arrives in time.  The
    /// waiter is removed either way.
    pub async fn wait(&self, mut question: PendingQuestion, timeout: Duration) -> Result<Envelope, ClientError> {
        let timed_out = || ClientError::Timeout {
            cmd: question.cmd.clone(),
        };
        let Some(rx) = question.rx.take() else {
            return Err(timed_out());
        };
        match time::timeout(timeout, rx).await {
            Ok(Ok(answer)) => Ok(answer),
            Ok(Err(_)) | Err(_) => {
                debug!(cmd = %question.cmd, "question timed out");
                Err(timed_out())
            }
        }
    }

    /// Number of waiters across all commands.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).values().map(VecDeque::len).sum()
    }

    /// Number of waiters for `cmd`.
    pub fn pending_for(&self, cmd: &str) -> usize {
        lock(&self.pending).get(cmd).map_or(0, VecDeque::len)
    }
}
