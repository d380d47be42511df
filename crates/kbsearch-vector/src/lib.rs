//! Vector index backends.
//!
//! [`LanceVectorIndex`] stores one LanceDB table per dimensionality and uses
//! the native cosine operator when allowed, falling back to a software scan.
//! [`MemoryVectorIndex`] keeps packed vectors in process and always scans.

pub mod blob;
pub mod locks;
pub mod memory;
pub mod schema;
pub mod search;
pub mod similarity;
pub mod table;
pub mod writer;

use std::path::Path;
use std::sync::Arc;

use kbsearch_core::config::{StorageSettings, VectorBackendKind};
use kbsearch_core::error::Result;
use kbsearch_core::traits::VectorIndex;

pub use memory::MemoryVectorIndex;
pub use similarity::cosine_similarity;
pub use writer::LanceVectorIndex;

/// Build the vector backend named by `settings`, rooted at `dir`.
pub async fn open_vector_index(settings: &StorageSettings, dir: &Path) -> Result<Arc<dyn VectorIndex>> {
    match settings.vector_backend {
        VectorBackendKind::Lance => {
            let index = LanceVectorIndex::open(dir).await?.with_accelerated(settings.accelerated);
            Ok(Arc::new(index))
        }
        VectorBackendKind::Memory => Ok(Arc::new(MemoryVectorIndex::new())),
    }
}
