//! Reservoir embeddings and their on-disk cache.
//!
//! An [`EmbeddingSource`] turns a named dataset into an [`EmbeddingBundle`].
//! [`EmbeddingCache`] keys bundles by dataset, reduction flag and reservoir
//! size, so each combination is computed once and loaded afterwards.

/// Validated split arrays.
pub mod bundle;
/// Echo-state reservoir.
pub mod esn;
/// Principal component projection.
pub mod pca;

use std::{
    fs,
    path::{Path, PathBuf},
};

use thiserror::Error;

use crate::dataset::DatasetError;
use bundle::{BundleError, EmbeddingBundle};

/// Errors raised while computing, storing or loading embeddings.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// Raw series could not be prepared.
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    /// Arrays did not line up.
    #[error(transparent)]
    Bundle(#[from] BundleError),
    /// Cache or hyper-parameter file IO.
    #[error("embedding cache IO at {path}: {source}")]
    Io {
        /// File or directory.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// Cache or hyper-parameter file is not valid JSON.
    #[error("malformed embedding file {path}: {source}")]
    Json {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
    /// Reservoir could not be built or driven.
    #[error("reservoir: {0}")]
    Reservoir(String),
}

/// Produces the embedding bundle of a dataset.
pub trait EmbeddingSource: Send + Sync {
    /// Reservoir size, part of the cache key.
    fn reservoir_units(&self) -> usize;

    /// Computes the bundle from scratch.
    fn compute(&self, dataset: &str, dim_reduction: bool) -> Result<EmbeddingBundle, EmbeddingError>;
}

/// Filesystem cache in front of an [`EmbeddingSource`].
#[derive(Debug, Clone)]
pub struct EmbeddingCache<S> {
    root: PathBuf,
    source: S,
}

impl<S: EmbeddingSource> EmbeddingCache<S> {
    /// Cache rooted at `root`.
    pub fn new(root: impl Into<PathBuf>, source: S) -> Self {
        Self {
            root: root.into(),
            source,
        }
    }

    /// `<root>/<dataset>/dim_red_<flag>/esn_states_<units>units.json`.
    #[must_use]
    pub fn path_for(&self, dataset: &str, dim_reduction: bool) -> PathBuf {
        self.root
            .join(dataset)
            .join(format!("dim_red_{dim_reduction}"))
            .join(format!("esn_states_{}units.json", self.source.reservoir_units()))
    }

    /// Loads the cached bundle, computing and persisting it on a miss.
    pub fn load_or_compute(
        &self,
        dataset: &str,
        dim_reduction: bool,
    ) -> Result<EmbeddingBundle, EmbeddingError> {
        let path = self.path_for(dataset, dim_reduction);
        if path.is_file() {
            return read_bundle(&path);
        }
        let bundle = self.source.compute(dataset, dim_reduction)?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|source| EmbeddingError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        let encoded = serde_json::to_vec(&bundle).map_err(|source| EmbeddingError::Json {
            path: path.clone(),
            source,
        })?;
        fs::write(&path, encoded).map_err(|source| EmbeddingError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(bundle)
    }

    /// Wrapped source.
    #[must_use]
    pub fn source(&self) -> &S {
        &self.source
    }
}

fn read_bundle(path: &Path) -> Result<EmbeddingBundle, EmbeddingError> {
    let raw = fs::read(path).map_err(|source| EmbeddingError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&raw).map_err(|source| EmbeddingError::Json {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, Array2};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct CountingSource {
        calls: AtomicUsize,
    }

    impl EmbeddingSource for CountingSource {
        fn reservoir_units(&self) -> usize {
            8
        }

        fn compute(&self, _dataset: &str, _dim_reduction: bool) -> Result<EmbeddingBundle, EmbeddingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let rows = |n: usize| Array2::from_shape_fn((n, 3), |(i, j)| (i as f64 + 0.1).ln() / (j as f64 + 3.0));
            Ok(EmbeddingBundle::new(
                Array1::from_shape_fn(5, |i| 1.0 / (i as f64 + 7.0)),
                rows(5),
                Array1::from_shape_fn(2, |i| (i as f64).sqrt() * 0.3),
                rows(2),
                Array1::from_shape_fn(3, |i| std::f64::consts::PI * i as f64),
                rows(3),
            )?)
        }
    }

    #[test]
    fn cache_path_is_keyed_by_dataset_flag_and_units() {
        let cache = EmbeddingCache::new("/tmp/cache", CountingSource { calls: AtomicUsize::new(0) });
        assert_eq!(
            cache.path_for("acea", true),
            PathBuf::from("/tmp/cache/acea/dim_red_true/esn_states_8units.json")
        );
    }

    #[test]
    fn second_load_is_bit_identical_and_skips_compute() {
        let dir = tempdir().unwrap();
        let cache = EmbeddingCache::new(dir.path().join("nested"), CountingSource { calls: AtomicUsize::new(0) });
        let first = cache.load_or_compute("spain", false).unwrap();
        let second = cache.load_or_compute("spain", false).unwrap();
        assert_eq!(cache.source().calls.load(Ordering::SeqCst), 1);
        let (a, _) = first.split(bundle::SplitKind::Train);
        let (b, _) = second.split(bundle::SplitKind::Train);
        assert!(a.iter().zip(b.iter()).all(|(x, y)| x.to_bits() == y.to_bits()));
        assert_eq!(first, second);
        assert!(cache.path_for("spain", false).is_file());
    }

    #[test]
    fn corrupt_cache_file_is_reported() {
        let dir = tempdir().unwrap();
        let cache = EmbeddingCache::new(dir.path(), CountingSource { calls: AtomicUsize::new(0) });
        let path = cache.path_for("acea", false);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{").unwrap();
        assert!(matches!(
            cache.load_or_compute("acea", false),
            Err(EmbeddingError::Json { .. })
        ));
    }
}
