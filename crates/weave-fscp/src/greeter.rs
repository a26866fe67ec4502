//! HELLO bookkeeping
//!
//! Tracks outstanding HELLO_REQUESTs by their unique number so a matching
//! HELLO_RESPONSE can resolve the waiting `greet` call with the measured
//! round-trip time.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Mutex};

struct PendingGreet {
    target: SocketAddr,
    started_at: Instant,
    reply: oneshot::Sender<Duration>,
}

struct GreeterState {
    next_unique_number: u32,
    pending: HashMap<u32, PendingGreet>,
}

/// The table of outstanding HELLO exchanges
pub struct Greeter {
    state: Mutex<GreeterState>,
}

impl Greeter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GreeterState {
                next_unique_number: rand::random(),
                pending: HashMap::new(),
            }),
        }
    }

    /// Register a new wait and hand back its unique number and receiver
    pub async fn register(&self, target: SocketAddr) -> (u32, oneshot::Receiver<Duration>) {
        let mut state = self.state.lock().await;
        let unique_number = state.next_unique_number;
        state.next_unique_number = state.next_unique_number.wrapping_add(1);

        let (reply, wait) = oneshot::channel();
        state.pending.insert(
            unique_number,
            PendingGreet {
                target,
                started_at: Instant::now(),
                reply,
            },
        );
        (unique_number, wait)
    }

    /// Resolve a wait from a HELLO_RESPONSE.
    ///
    /// The response only counts when it comes from the endpoint the request
    /// went to; unique numbers alone are not an authenticator.
    pub async fn complete(&self, sender: SocketAddr, unique_number: u32) {
        let mut state = self.state.lock().await;
        let matches = state
            .pending
            .get(&unique_number)
            .map(|pending| pending.target == sender)
            .unwrap_or(false);
        if matches {
            if let Some(pending) = state.pending.remove(&unique_number) {
                let _ = pending.reply.send(pending.started_at.elapsed());
            }
        }
    }

    /// Forget a wait that timed out
    pub async fn forget(&self, unique_number: u32) {
        self.state.lock().await.pending.remove(&unique_number);
    }

    /// Drop every outstanding wait; their `greet` callers resolve with
    /// cancellation (the oneshot sender side is dropped)
    pub async fn cancel_all(&self) {
        self.state.lock().await.pending.clear();
    }
}

impl Default for Greeter {
    fn default() -> Self {
        Self::new()
    }
}
