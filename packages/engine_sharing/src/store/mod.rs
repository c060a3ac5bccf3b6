//! Shared key/value media.
//!
//! Every context of the same origin sees the same store. The medium is slow,
//! text-only and has no transactions, so everything layered on top must
//! tolerate missing, partial and stale data.
//!
//! - `memory`: [`MemoryStore`] (in-process, shared by clone) and [`NullStore`]
//! - `file`: [`FileStore`], high-capacity, one file per key, shared by processes
//! - `cookie`: [`CookieStore`], fallback with cookie-like name and size limits
//! - `status`: the composed-value codec for presence records and id lists

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ConfigError, StoreError};

mod cookie;
mod file;
mod memory;
pub mod status;

pub use cookie::CookieStore;
pub use file::FileStore;
pub use memory::{MemoryStore, NullStore};

/// Flat string key/value store.
pub trait SharedStore: Send + Sync + fmt::Debug {
    fn read(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn write(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn clean(&self, key: &str) -> Result<(), StoreError>;
    fn keys(&self) -> Result<Vec<String>, StoreError>;
}

/// Selectable store implementations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    File,
    Cookie,
    #[default]
    Memory,
    None,
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::File => "file",
            Self::Cookie => "cookie",
            Self::Memory => "memory",
            Self::None => "none",
        };
        f.write_str(name)
    }
}

/// Open the store of the given kind. File and cookie stores need a path.
pub fn open_store(
    kind: StoreKind,
    path: Option<&Path>,
) -> Result<Arc<dyn SharedStore>, ConfigError> {
    match kind {
        StoreKind::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreKind::None => Ok(Arc::new(NullStore)),
        StoreKind::File => {
            let path = path.ok_or_else(|| ConfigError::MissingStorePath(kind.to_string()))?;
            Ok(Arc::new(FileStore::new(path)))
        }
        StoreKind::Cookie => {
            let path = path.ok_or_else(|| ConfigError::MissingStorePath(kind.to_string()))?;
            Ok(Arc::new(CookieStore::new(path)))
        }
    }
}

/// Open the best available store under `dir`: the file store when the
/// directory is usable, else a cookie jar next to it, else the null store.
pub fn open_with_fallback(dir: &Path) -> Arc<dyn SharedStore> {
    match FileStore::create(dir) {
        Ok(store) => return Arc::new(store),
        Err(e) => warn!(path = %dir.display(), error = %e, "file store unavailable, trying cookie jar"),
    }

    let jar = dir.with_extension("cookies");
    let cookies = CookieStore::new(&jar);
    match cookies.keys() {
        Ok(_) => Arc::new(cookies),
        Err(e) => {
            warn!(path = %jar.display(), error = %e, "cookie jar unavailable, sharing disabled");
            Arc::new(NullStore)
        }
    }
}
