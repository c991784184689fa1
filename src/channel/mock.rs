//! Scripted in-memory channel for tests and the demo binary.
//!
//! The mock records every command line sent to it, in order, so tests can
//! assert FIFO delivery and the absence of unexpected I/O. Replies come from,
//! in priority order: a queue of scripted one-shot results (including injected
//! transport failures), a dynamic handler closure (for stateful device
//! simulation), and a static request→reply table. Unknown requests answer
//! "OK".

use crate::channel::DeviceChannel;
use crate::error::IoError;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

type Handler = dyn Fn(&str) -> Option<String> + Send + Sync;

#[derive(Default)]
struct MockInner {
    replies: Mutex<HashMap<String, String>>,
    script: Mutex<VecDeque<Result<String, IoError>>>,
    handler: Mutex<Option<Box<Handler>>>,
    raw_input: Mutex<VecDeque<Vec<u8>>>,
    sent: Mutex<Vec<String>>,
    open: AtomicBool,
}

/// In-memory [`DeviceChannel`] with scripted replies.
///
/// Cloning is cheap and shares state, so a test can hand one clone to a
/// controller and keep another to inspect the traffic afterwards.
#[derive(Clone, Default)]
pub struct MockChannel {
    inner: Arc<MockInner>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl MockChannel {
    /// Create an open mock channel with no canned replies.
    pub fn new() -> Self {
        let channel = Self::default();
        channel.inner.open.store(true, Ordering::SeqCst);
        channel
    }

    /// Register a static reply for an exact request line.
    pub fn with_reply(self, request: impl Into<String>, reply: impl Into<String>) -> Self {
        lock(&self.inner.replies).insert(request.into(), reply.into());
        self
    }

    /// Install a dynamic handler consulted for every request line.
    ///
    /// Returning `None` falls through to the static reply table.
    pub fn with_handler(self, handler: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        *lock(&self.inner.handler) = Some(Box::new(handler));
        self
    }

    /// Queue a one-shot reply consumed by the next request, ahead of the
    /// handler and the reply table.
    pub fn push_reply(&self, reply: impl Into<String>) {
        lock(&self.inner.script).push_back(Ok(reply.into()));
    }

    /// Queue a one-shot transport failure for the next request.
    pub fn push_failure(&self, error: IoError) {
        lock(&self.inner.script).push_back(Err(error));
    }

    /// Queue raw bytes returned by the next `receive` call.
    pub fn push_raw(&self, bytes: Vec<u8>) {
        lock(&self.inner.raw_input).push_back(bytes);
    }

    /// Every command line sent so far, in submission order.
    pub fn sent(&self) -> Vec<String> {
        lock(&self.inner.sent).clone()
    }

    /// Number of command lines sent so far.
    pub fn sent_count(&self) -> usize {
        lock(&self.inner.sent).len()
    }

    /// Whether the channel has been closed.
    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    /// Re-open a closed channel, the way a fresh enable attempt re-opens a
    /// real endpoint. Scripted state and recorded traffic are kept.
    pub fn reopen(&self) {
        self.inner.open.store(true, Ordering::SeqCst);
    }

    fn check_open(&self) -> Result<(), IoError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(IoError::Disconnected)
        }
    }

    fn reply_for(&self, line: &str) -> Result<String, IoError> {
        if let Some(scripted) = lock(&self.inner.script).pop_front() {
            return scripted;
        }
        if let Some(handler) = lock(&self.inner.handler).as_ref() {
            if let Some(reply) = handler(line) {
                return Ok(reply);
            }
        }
        if let Some(reply) = lock(&self.inner.replies).get(line) {
            return Ok(reply.clone());
        }
        Ok("OK".to_string())
    }
}

#[async_trait]
impl DeviceChannel for MockChannel {
    async fn send(&self, bytes: &[u8]) -> Result<(), IoError> {
        self.check_open()?;
        lock(&self.inner.sent).push(String::from_utf8_lossy(bytes).into_owned());
        Ok(())
    }

    async fn receive(&self, max_len: usize, _timeout: Duration) -> Result<Vec<u8>, IoError> {
        self.check_open()?;
        match lock(&self.inner.raw_input).pop_front() {
            Some(mut bytes) => {
                bytes.truncate(max_len);
                Ok(bytes)
            }
            None => Err(IoError::Timeout),
        }
    }

    async fn send_line(&self, line: &str) -> Result<(), IoError> {
        self.check_open()?;
        lock(&self.inner.sent).push(line.to_string());
        // Consume any scripted failure so injected faults also hit
        // fire-and-forget commands.
        match self.reply_for(line) {
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn query(&self, line: &str) -> Result<String, IoError> {
        self.check_open()?;
        lock(&self.inner.sent).push(line.to_string());
        self.reply_for(line)
    }

    async fn close(&self) {
        self.inner.open.store(false, Ordering::SeqCst);
    }
}
