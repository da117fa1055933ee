//! Staggered re-broadcast of this node's recent trade statistics
//!
//! After startup a node republishes the trades it published itself in the
//! recent past; statistics learned from peers are left to their own nodes.
//! Trade `i` (oldest first) goes out at a random point in
//! `[step * (i + 1), step * (i + 2)]`, so a node with a large backlog trickles
//! it out instead of flooding its peers.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::StatisticsConfig;
use crate::core_router::{BroadcastRouter, RouterResult};
use crate::core_store::clock::Clock;
use crate::core_store::model::payload::PersistablePayload;
use crate::core_store::store::AppendOnlyLedger;

pub struct TradeStatisticsPublisher {
    ledger: Arc<AppendOnlyLedger>,
    router: Arc<BroadcastRouter>,
    clock: Arc<dyn Clock>,
    config: StatisticsConfig,
}

impl TradeStatisticsPublisher {
    pub fn new(
        ledger: Arc<AppendOnlyLedger>,
        router: Arc<BroadcastRouter>,
        clock: Arc<dyn Clock>,
        config: StatisticsConfig,
    ) -> Self {
        Self {
            ledger,
            router,
            clock,
            config,
        }
    }

    /// Schedule every local trade younger than the republish window. Returns the count.
    pub async fn republish_recent(&self) -> RouterResult<usize> {
        let now = self.clock.now_millis();
        let cutoff = now.saturating_sub(duration_millis(self.config.republish_window));

        let mut recent: Vec<_> = self
            .ledger
            .all()
            .filter(|(identity, _)| self.ledger.is_local(identity))
            .filter_map(|(identity, payload)| match payload.as_ref() {
                PersistablePayload::TradeStatistics(stats) if stats.trade_date >= cutoff => {
                    Some((stats.trade_date, identity, payload.clone()))
                }
                _ => None,
            })
            .collect();
        recent.sort_by_key(|(trade_date, identity, _)| (*trade_date, *identity.as_bytes()));

        let window = self.config.delay_window();
        for (batch_index, (_, identity, payload)) in recent.iter().enumerate() {
            let delay = self
                .router
                .schedule_immutable(*identity, payload.as_ref().clone(), batch_index, Some(window))
                .await?;
            debug!(identity = %identity, batch_index, delay_ms = delay.as_millis() as u64, "Trade republication scheduled");
        }

        info!(count = recent.len(), "Recent trade statistics scheduled for republication");
        Ok(recent.len())
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
