//! sqlgate orchestrator
//!
//! Takes SQL change requests (tasks) for managed database instances and
//! drives them through their lifecycle:
//!
//! - **Audit**: statements are checked against the instance's rules and
//!   compensating statements are generated
//! - **Commit**: statements are executed, DML in one transaction and DDL one by one
//! - **Rollback**: compensating statements are executed in order
//!
//! Dialect specifics live behind the driver protocol of the `sqlgate-driver`
//! crate; this crate only talks to the [`sqlgate_driver::Driver`] trait.
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading from environment variables
//! - [`drivers`]: Driver backends by database type and workflow sessions
//! - [`error`]: Error type with Axum integration
//! - [`handlers`]: HTTP route handlers
//! - [`model`]: Tasks, statements and their statuses
//! - [`scheduler`]: At most one in-flight action per task, queued dispatch
//! - [`state`]: Shared application state
//! - [`store`]: Task persistence (in memory or PostgreSQL)
//! - [`submission`]: Task creation and instance metadata
//! - [`workflow`]: The audit, commit and rollback workflows
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use sqlgate_orchestrator::{
//!     drivers::DriverRegistry, scheduler::Scheduler, store::MemoryTaskStore,
//!     workflow::Workflows, model::ActionKind,
//! };
//!
//! let store = Arc::new(MemoryTaskStore::new());
//! let drivers = DriverRegistry::new();
//! let workflows = Arc::new(Workflows::new(store.clone(), drivers));
//! let scheduler = Scheduler::new(store, workflows, 1024, std::time::Duration::from_secs(5));
//! scheduler.start()?;
//! let task = scheduler.enqueue_and_wait(1, ActionKind::Audit).await?.into_result()?;
//! ```

pub mod config;
pub mod drivers;
pub mod error;
pub mod handlers;
pub mod model;
pub mod result_ext;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod submission;
pub mod workflow;

pub use error::{OrchestratorError, OrchestratorResult};
pub use scheduler::{ActionHandler, Completed, Scheduler};
pub use workflow::Workflows;
