//! Persistence layer for the durable work queue.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

use std::sync::Arc;

pub use libsql_backend::LibSqlBackend;
pub use traits::ItemStore;

use crate::config::StoreConfig;
use crate::error::DatabaseError;

/// Open the store described by `config`.
pub async fn connect(config: &StoreConfig) -> Result<Arc<dyn ItemStore>, DatabaseError> {
    let backend = match config {
        StoreConfig::Local(path) => LibSqlBackend::new_local(path).await?,
        StoreConfig::Remote { url, token } => LibSqlBackend::new_remote(url, token).await?,
    };
    Ok(Arc::new(backend))
}
