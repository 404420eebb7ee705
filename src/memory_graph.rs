//! Memory-graph delegate (spec Non-goals: embedding search internals are out
//! of scope here; this module only owns the process-wide handle and passes
//! calls through, mirroring the teacher's `memory/store.rs` singleton).

use once_cell::sync::OnceCell;
use qmd::Store;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

static STORE: OnceCell<Mutex<Store>> = OnceCell::new();

/// Dimensionality of the embedding vectors the caller's memory pipeline
/// produces; fixed here since `ensure_vector_table` needs it up front.
const EMBEDDING_DIM: usize = 768;

#[derive(Debug, thiserror::Error)]
pub enum MemoryGraphError {
    #[error("memory store error: {0}")]
    Store(String),
}

/// Gets (or lazily opens) the shared `qmd` store backing the memory graph.
pub fn get_store(db_path: &Path) -> Result<&'static Mutex<Store>, MemoryGraphError> {
    STORE.get_or_try_init(|| {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| MemoryGraphError::Store(e.to_string()))?;
        }
        let store = Store::open(db_path).map_err(|e| MemoryGraphError::Store(e.to_string()))?;
        store
            .ensure_vector_table(EMBEDDING_DIM)
            .map_err(|e| MemoryGraphError::Store(e.to_string()))?;
        Ok(Mutex::new(store))
    })
}

pub fn default_memory_db_path(clawcore_home: &Path) -> PathBuf {
    clawcore_home.join("memory").join("memory.db")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_path_lives_under_memory_subdir() {
        let home = Path::new("/tmp/clawcore-test-home");
        let path = default_memory_db_path(home);
        assert!(path.ends_with("memory/memory.db"));
    }
}
