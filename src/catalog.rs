use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::info;

use crate::error::LoadError;
use crate::model::SemanticModel;

/// Long-lived holder of the current semantic model.
///
/// Readers take an `Arc` snapshot with [`ModelStore::current`] and keep using
/// it for the rest of their request. [`ModelStore::reload`] re-parses the
/// source into a brand new model and swaps the pointer; models are never
/// mutated in place, so a reader only ever sees a fully loaded model.
#[derive(Debug)]
pub struct ModelStore {
    path: PathBuf,
    current: RwLock<Arc<SemanticModel>>,
}

impl ModelStore {
    /// Load the model at `path`. Fails if the initial load fails; there is no
    /// empty fallback model.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LoadError> {
        let path = path.into();
        let model = SemanticModel::load(&path)?;
        info!(
            path = %path.display(),
            metrics = model.metrics().len(),
            dimensions = model.dimensions().len(),
            joins = model.joins().len(),
            "semantic model loaded"
        );
        Ok(Self {
            path,
            current: RwLock::new(Arc::new(model)),
        })
    }

    /// Wrap an already-built model. [`ModelStore::reload`] will read `path`.
    pub fn from_model(path: impl Into<PathBuf>, model: SemanticModel) -> Self {
        Self {
            path: path.into(),
            current: RwLock::new(Arc::new(model)),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of the current model.
    #[must_use]
    pub fn current(&self) -> Arc<SemanticModel> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Re-read the source and install the result as the current model.
    ///
    /// On failure the previous model stays installed and the error is
    /// returned. Snapshots taken before the call are unaffected either way.
    pub fn reload(&self) -> Result<Arc<SemanticModel>, LoadError> {
        let model = Arc::new(SemanticModel::load(&self.path)?);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&model);
        info!(path = %self.path.display(), "semantic model reloaded");
        Ok(model)
    }
}
