/*
    core_stats - trade statistics on top of the append-only ledger

    - aggregator: ListenerHub subscriber keeping a per-offer view of completed
      trades (one entry per offer ID), with per-currency counts and latest prices
    - publisher: re-broadcasts recent trades after startup, spread out over time
      so peers that missed them catch up without a burst
*/

pub mod aggregator;
pub mod publisher;

pub use aggregator::TradeStatisticsAggregator;
pub use publisher::TradeStatisticsPublisher;
