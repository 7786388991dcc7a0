//! # runner-rs
//!
//! Dispatch shell commands to pools of workers over a shared message broker.
//!
//! Submitters enqueue [`protocol::WorkItem`]s on a named queue; each item is
//! run by exactly one worker of some [`pool::Pool`] serving that queue, and
//! the [`protocol::WorkResult`] is broadcast on `<queue>:results` and, when a
//! correlation id is set, on `<queue>:results:<id>`. Pools listen on
//! `<queue>:control` for stop commands.
//!
//! Transports implement [`broker::Broker`]: an in-process hub for tests and
//! embedding, and Postgres (pgmq plus LISTEN/NOTIFY) for production.

pub mod broker;
pub mod client;
pub mod config;
pub mod error;
pub mod identity;
pub mod pool;
pub mod protocol;
pub mod telemetry;
pub mod worker;
