//! The weir StatsD-protocol metrics aggregation daemon.
//!
//! Weir accepts a continuous stream of small textual metric updates over
//! UDP, aggregates them in memory under per-metric-type semantics --
//! counter differential accounting, gauge set/delta, timer latency
//! statistics with percentiles, set cardinality -- and periodically hands
//! summarized values to a downstream sink.
//!
//! This library supports the weir binary found elsewhere in this project,
//! although the engine is usable embedded: construct an
//! [`engine::Engine`], start it, and drive [`engine::Engine::flush_into`]
//! from your own scheduler.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

pub mod config;
pub mod engine;
pub mod flush;
pub mod latency;
pub mod listener;
pub mod parser;
pub mod sample;
pub mod signals;
pub mod sink;
pub mod store;
