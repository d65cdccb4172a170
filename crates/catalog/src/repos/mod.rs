//! Repository traits over the catalogue tables.

pub mod blocks;
pub mod files;
pub mod tasks;
pub mod uploads;

pub use blocks::BlockRepo;
pub use files::FileCatalogRepo;
pub use tasks::TaskRepo;
pub use uploads::UploadRepo;

use crate::error::CatalogResult;
use async_trait::async_trait;

/// Combined catalogue trait: everything the engine needs from storage.
#[async_trait]
pub trait Catalog: TaskRepo + UploadRepo + BlockRepo + FileCatalogRepo + Send + Sync {
    /// Apply the schema idempotently.
    async fn migrate(&self) -> CatalogResult<()>;
}
