/*
    tradenet-core - replicated data store and broadcast protocol for a P2P
    trading network

    Subsystems:
    - core_store: sequence tracking, append-only ledger, mutable record store,
      listener hub and on-disk snapshots
    - core_router: envelope codec, delayed broadcast scheduling, relaying and
      per-peer outboxes
    - core_stats: trade statistics built from the ledger
    - core_node: the wired-up node and its lifecycle
*/

pub mod config;
pub mod core_node;
pub mod core_router;
pub mod core_stats;
pub mod core_store;
pub mod logging;
pub mod metrics;
pub mod shutdown;
pub mod test_utils;

pub use config::Config;
pub use core_node::{Collaborators, DataNode, NodeError, NodeResult};
pub use logging::{init_logging, LogLevel};
