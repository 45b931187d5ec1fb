//! Uppe probe orchestration core.
//!
//! Fans pipelines out across datacenter agents, aggregates the legs into
//! sessions, diffs consecutive sessions into transition events and keeps
//! the task queue, periodic schedule and heartbeat workers running.

pub mod config;
pub mod database;
pub mod diff;
pub mod dispatch;
pub mod error;
pub mod fanout;
pub mod handlers;
pub mod heartbeat;
pub mod metrics;
pub mod models;
pub mod notify;
pub mod pool;
pub mod probe;
pub mod queue;
pub mod registry;
pub mod retention;
pub mod session;
pub mod store;
pub mod worker;
