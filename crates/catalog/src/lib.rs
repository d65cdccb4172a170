//! Durable task/upload/block catalogue.
//!
//! One SQLite database holds everything a resumable upload needs to survive
//! a process crash: the task queue, one upload row per archived task, and a
//! numbered block row per multipart part. All writes go through a single
//! serialized connection; block-state transitions are atomic claim/mark
//! primitives.

pub mod error;
pub mod models;
pub mod repos;
pub mod store;

pub use error::{CatalogError, CatalogResult};
pub use repos::{BlockRepo, Catalog, FileCatalogRepo, TaskRepo, UploadRepo};
pub use store::SqliteCatalog;
