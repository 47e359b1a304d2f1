//! Configuration loaded from environment variables with `envy`.

mod app;
mod database;

pub use app::{AppConfig, StoreKind};
pub use database::DatabaseConfig;
