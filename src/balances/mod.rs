//! Balance Module
//!
//! Confirmed / pending / spendable / stakable aggregation over the ledger.

pub mod aggregator;

pub use aggregator::*;
