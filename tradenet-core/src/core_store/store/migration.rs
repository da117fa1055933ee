//! One-time conversion of legacy payload shapes at ingestion
//!
//! Older nodes still gossip trade statistics in the legacy shape. The ledger
//! never stores that shape: it is converted here before hashing, so a legacy
//! statistic and its converted form share one identity and one offer-ID claim.

use crate::core_store::model::payload::{
    LegacyTradeStatistics, PersistablePayload, TradeStatistics,
};

/// Convert legacy shapes; anything else passes through untouched.
///
/// Returns the payload to store and whether a conversion happened.
pub fn migrate(payload: PersistablePayload) -> (PersistablePayload, bool) {
    match payload {
        PersistablePayload::LegacyTradeStatistics(legacy) => {
            (PersistablePayload::TradeStatistics(convert_trade_statistics(legacy)), true)
        }
        other => (other, false),
    }
}

/// The legacy owner key is dropped: statistics are no longer owner-bound.
pub fn convert_trade_statistics(legacy: LegacyTradeStatistics) -> TradeStatistics {
    TradeStatistics {
        direction: legacy.direction,
        base_currency: legacy.base_currency,
        counter_currency: legacy.counter_currency,
        payment_method_id: legacy.offer_payment_method,
        offer_date: legacy.offer_date,
        use_market_based_price: legacy.offer_use_market_based_price,
        market_price_margin_bps: legacy.offer_market_price_margin,
        offer_amount: legacy.offer_amount.value,
        offer_min_amount: legacy.offer_min_amount.value,
        offer_id: legacy.offer_id,
        trade_price: legacy.trade_price.value,
        trade_amount: legacy.trade_amount.value,
        trade_date: legacy.trade_date,
        deposit_tx_id: legacy.deposit_tx_id,
        extra_data: legacy.extra_data.unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::fixtures::legacy_trade_statistics;

    #[test]
    fn test_legacy_is_converted() {
        let legacy = legacy_trade_statistics("offer-1", 5_000);
        let (migrated, converted) = migrate(PersistablePayload::LegacyTradeStatistics(legacy));

        assert!(converted);
        match migrated {
            PersistablePayload::TradeStatistics(stats) => {
                assert_eq!(stats.offer_id, "offer-1");
                assert_eq!(stats.trade_price, 5_000);
                assert!(stats.extra_data.is_empty());
            }
            other => panic!("expected trade statistics, got {:?}", other),
        }
    }

    #[test]
    fn test_current_shape_passes_through() {
        let payload = PersistablePayload::Unknown {
            type_tag: "x".into(),
            bytes: vec![1],
        };
        let (out, converted) = migrate(payload.clone());
        assert!(!converted);
        assert_eq!(out, payload);
    }
}
