//! Media share catalog core
//!
//! Watches media shares for changes, classifies directories, schedules
//! analysis by priority, enriches items from external metadata providers
//! and keeps everything in a SQLite catalog. [CatalogManager] ties the
//! pieces together.

pub mod config;
pub mod db;
pub mod error;
pub mod services;

pub use config::{Config, WatchedRoot};
pub use db::Database;
pub use error::{CatalogError, Result};
pub use services::CatalogManager;
