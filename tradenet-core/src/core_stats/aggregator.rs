//! Per-offer view of completed trades, fed by ledger events

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};
use tracing::trace;

use crate::core_store::listeners::{StoreEvent, StoreListener};
use crate::core_store::model::payload::{PersistablePayload, TradeStatistics};
use crate::core_store::store::AppendOnlyLedger;

#[derive(Default)]
pub struct TradeStatisticsAggregator {
    by_offer: RwLock<HashMap<String, TradeStatistics>>,
}

impl TradeStatisticsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load what the ledger already holds (restored data produces no events)
    pub fn seed_from_ledger(&self, ledger: &AppendOnlyLedger) -> usize {
        let mut added = 0;
        for (_, payload) in ledger.all() {
            if let PersistablePayload::TradeStatistics(stats) = payload.as_ref() {
                if self.insert(stats) {
                    added += 1;
                }
            }
        }
        added
    }

    fn insert(&self, stats: &TradeStatistics) -> bool {
        let mut by_offer = self.by_offer.write().unwrap_or_else(PoisonError::into_inner);
        if by_offer.contains_key(&stats.offer_id) {
            return false;
        }
        by_offer.insert(stats.offer_id.clone(), stats.clone());
        true
    }

    pub fn len(&self) -> usize {
        self.by_offer.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, offer_id: &str) -> Option<TradeStatistics> {
        self.by_offer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(offer_id)
            .cloned()
    }

    /// Trade count per counter currency
    pub fn count_by_currency(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for stats in self.by_offer.read().unwrap_or_else(PoisonError::into_inner).values() {
            *counts.entry(stats.counter_currency.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Price of the most recent trade in `counter_currency`
    pub fn latest_trade_price(&self, counter_currency: &str) -> Option<u64> {
        self.by_offer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|s| s.counter_currency == counter_currency)
            .max_by_key(|s| (s.trade_date, s.offer_id.clone()))
            .map(|s| s.trade_price)
    }

    /// Trades with `trade_date >= since`, oldest first
    pub fn trades_since(&self, since: u64) -> Vec<TradeStatistics> {
        let mut trades: Vec<_> = self
            .by_offer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|s| s.trade_date >= since)
            .cloned()
            .collect();
        trades.sort_by(|a, b| (a.trade_date, &a.offer_id).cmp(&(b.trade_date, &b.offer_id)));
        trades
    }
}

impl StoreListener for TradeStatisticsAggregator {
    fn on_event(&self, event: &StoreEvent) {
        if let StoreEvent::Appended { identity, payload } = event {
            if let PersistablePayload::TradeStatistics(stats) = payload.as_ref() {
                if self.insert(stats) {
                    trace!(identity = %identity, offer_id = %stats.offer_id, "Trade recorded");
                }
            }
        }
    }
}
