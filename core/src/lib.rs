#![deny(missing_docs)]
//! ping_core: shared building blocks (config, KV, logging, job model,
//! delivery unit, scheduler).

/// Configuration helpers (AppId, dirs, load_or_init, etc.)
pub mod cfg;
/// Simple file-backed KV store with serde helpers.
pub mod store;
/// Tracing/log initialization helpers.
pub mod logx;
/// Job model shared by the scheduler, the status surface and tools.
pub mod job;
/// Error types surfaced by the scheduler and ping senders.
pub mod error;
/// Ping message plus the sender and device-id capabilities.
pub mod ping;
/// One delivery cycle: bounded attempts with exponential backoff.
pub mod delivery;
/// Named job registry arbitrating enqueue/cancel/query/on_due.
pub mod scheduler;
/// Timer substrate that fires `on_due` at the job's cadence.
pub mod driver;
