//! sqlgate driver protocol
//!
//! Every SQL dialect sqlgate can manage is served by a driver backend that
//! speaks one small protocol: open a connection, split SQL into typed
//! statements, audit them against rules, generate compensating statements
//! and execute them singly or in a transaction.
//!
//! ## Modules
//!
//! - [`driver`]: The [`Driver`] contract and the [`DriverFactory`] that creates sessions
//! - [`protocol`]: Wire messages shared by every backend
//! - [`error`]: Driver error kinds and their wire form
//! - [`client`]: HTTP transport used by the orchestrator to reach a backend
//! - [`server`]: HTTP host that exposes any backend over the protocol
//! - [`memory`]: In-process backend used for local runs and tests

pub mod client;
pub mod driver;
pub mod error;
pub mod memory;
pub mod protocol;
pub mod server;

pub use client::{RemoteDriver, RemoteDriverFactory};
pub use driver::{Driver, DriverFactory};
pub use error::{DriverError, DriverResult};
pub use memory::{MemoryDriver, MemoryDriverFactory, MemoryState};
