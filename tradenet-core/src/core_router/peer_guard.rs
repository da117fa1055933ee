/*
    PeerGuard - per-peer budget for undecodable traffic

    A peer running a newer protocol version, or a buggy one, will occasionally
    send envelopes this node cannot decode. Those are dropped without penalty
    until the peer exhausts its error budget (a token bucket: `error_burst`
    tokens, refilled at `refill_per_sec`). A peer that runs dry is reported for
    disconnection.
*/

use std::collections::HashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::transport::PeerId;

#[derive(Debug, Clone)]
pub struct PeerGuardConfig {
    /// Decode errors tolerated in a burst
    pub error_burst: u32,
    /// Budget regained per second
    pub refill_per_sec: f64,
}

impl Default for PeerGuardConfig {
    fn default() -> Self {
        PeerGuardConfig {
            error_burst: 20,
            refill_per_sec: 0.5,
        }
    }
}

/// Decision after charging a decode error
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GuardVerdict {
    Tolerated { remaining: f64 },
    Disconnect,
}

/// Token bucket for a single peer
#[derive(Debug)]
struct ErrorBudget {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl ErrorBudget {
    fn new(capacity: u32, refill_rate: f64) -> Self {
        ErrorBudget {
            tokens: capacity as f64,
            capacity: capacity as f64,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Spend one token. Returns false once the budget is exhausted.
    fn charge(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

pub struct PeerGuard {
    config: PeerGuardConfig,
    budgets: Mutex<HashMap<PeerId, ErrorBudget>>,
}

impl PeerGuard {
    pub fn new(config: PeerGuardConfig) -> Self {
        Self {
            config,
            budgets: Mutex::new(HashMap::new()),
        }
    }

    pub async fn record_decode_error(&self, peer: &PeerId) -> GuardVerdict {
        let mut budgets = self.budgets.lock().await;
        let budget = budgets
            .entry(peer.clone())
            .or_insert_with(|| ErrorBudget::new(self.config.error_burst, self.config.refill_per_sec));

        if budget.charge() {
            debug!(peer = %peer, remaining = budget.tokens, "Decode error tolerated");
            GuardVerdict::Tolerated {
                remaining: budget.tokens,
            }
        } else {
            warn!(peer = %peer, burst = self.config.error_burst, "Peer exceeded decode error budget");
            budgets.remove(peer);
            GuardVerdict::Disconnect
        }
    }

    /// Forget a peer's budget (on disconnect)
    pub async fn remove_peer(&self, peer: &PeerId) {
        self.budgets.lock().await.remove(peer);
    }

    pub async fn tracked_peers(&self) -> usize {
        self.budgets.lock().await.len()
    }
}
