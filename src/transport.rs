//! Abstract message transport and an in-memory paired implementation.
//!
//! The dispatcher only assumes datagram semantics: `send` hands off one
//! message-oriented byte blob, `on_message` fires once per received blob,
//! and no framing is added on either side.

use crate::error::{Error, Result};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// Callback invoked once per inbound datagram
pub type MessageCallback = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// Duplex byte-blob channel with lifecycle and inbound callback
///
/// `send` may enqueue or block depending on the implementation; the
/// in-memory transport below is enqueue-only. `stop` must be idempotent
/// and must not leak threads.
pub trait Transport: Send + Sync {
    /// Begin delivering inbound datagrams to the registered callback
    fn start(&self);

    /// Cooperatively shut down; joins any worker threads
    fn stop(&self);

    /// Deliver one datagram to the peer
    fn send(&self, bytes: Vec<u8>) -> Result<()>;

    /// Install the inbound callback, replacing any previous one
    fn set_on_message(&self, callback: MessageCallback);
}

enum Frame {
    Data(Vec<u8>),
    Shutdown,
}

/// In-memory transport endpoint, created in connected pairs
///
/// Each endpoint owns an unbounded inbound queue; `send` enqueues into
/// the peer's queue without blocking, and a worker thread started by
/// `start` drains the queue into the registered callback. The lifecycle
/// is single-shot: once stopped, an endpoint cannot be restarted and
/// sends towards it fail.
pub struct MemoryTransport {
    label: &'static str,
    self_tx: Sender<Frame>,
    peer_tx: Sender<Frame>,
    inbox: Mutex<Option<Receiver<Frame>>>,
    on_message: Arc<Mutex<Option<MessageCallback>>>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryTransport {
    /// Create two connected endpoints
    ///
    /// Everything either endpoint sends is delivered to the other. The
    /// pair is owned by the caller (typically a test harness); there is
    /// no global registry.
    #[must_use]
    pub fn pair() -> (MemoryTransport, MemoryTransport) {
        let (left_tx, left_rx) = channel();
        let (right_tx, right_rx) = channel();

        let left = MemoryTransport::endpoint("left", left_tx.clone(), right_tx.clone(), left_rx);
        let right = MemoryTransport::endpoint("right", right_tx, left_tx, right_rx);
        (left, right)
    }

    fn endpoint(
        label: &'static str,
        self_tx: Sender<Frame>,
        peer_tx: Sender<Frame>,
        inbox: Receiver<Frame>,
    ) -> Self {
        Self {
            label,
            self_tx,
            peer_tx,
            inbox: Mutex::new(Some(inbox)),
            on_message: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }
}

fn relock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Transport for MemoryTransport {
    fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!(label = self.label, "transport already started");
            return;
        }

        let Some(inbox) = relock(&self.inbox).take() else {
            warn!(label = self.label, "transport cannot restart after stop");
            self.running.store(false, Ordering::SeqCst);
            return;
        };

        let label = self.label;
        let on_message = Arc::clone(&self.on_message);

        // drains queued datagrams in order; the shutdown sentinel is
        // enqueued behind them, so nothing sent before stop() is lost
        let handle = std::thread::spawn(move || {
            debug!(label, "transport worker started");
            while let Ok(frame) = inbox.recv() {
                match frame {
                    Frame::Data(bytes) => {
                        let callback = relock(&on_message).clone();
                        match callback {
                            Some(callback) => callback(bytes),
                            None => warn!(label, "inbound datagram dropped: no callback"),
                        }
                    }
                    Frame::Shutdown => break,
                }
            }
            debug!(label, "transport worker exiting");
        });

        *relock(&self.worker) = Some(handle);
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        // wake the worker; the queue may already be gone on repeat calls
        let _ = self.self_tx.send(Frame::Shutdown);
        if let Some(handle) = relock(&self.worker).take() {
            let _ = handle.join();
        }
    }

    fn send(&self, bytes: Vec<u8>) -> Result<()> {
        self.peer_tx
            .send(Frame::Data(bytes))
            .map_err(|_| Error::SendFailed)
    }

    fn set_on_message(&self, callback: MessageCallback) {
        *relock(&self.on_message) = Some(callback);
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("label", &self.label)
            .field("running", &self.running.load(Ordering::SeqCst))
            .finish()
    }
}
