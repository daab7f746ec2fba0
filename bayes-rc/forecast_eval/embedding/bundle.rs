use std::fmt;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One of the three aligned splits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SplitKind {
    /// Training rows.
    Train,
    /// Validation rows.
    Validation,
    /// Test rows.
    Test,
}

impl fmt::Display for SplitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Train => write!(f, "train"),
            Self::Validation => write!(f, "validation"),
            Self::Test => write!(f, "test"),
        }
    }
}

/// Shape violations detected when a bundle is assembled or loaded.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BundleError {
    /// Embedding rows and targets disagree within a split.
    #[error("{split} split has {embeddings} embedding rows but {targets} targets")]
    RowMismatch {
        /// Offending split.
        split: SplitKind,
        /// Embedding rows.
        embeddings: usize,
        /// Target count.
        targets: usize,
    },
    /// Embedding width differs from the training split.
    #[error("{split} embeddings have width {actual}, train has {expected}")]
    WidthMismatch {
        /// Offending split.
        split: SplitKind,
        /// Training width.
        expected: usize,
        /// Split width.
        actual: usize,
    },
    /// Train or test split without rows.
    #[error("{0} split is empty")]
    Empty(SplitKind),
}

/// Targets and embeddings of the train, validation and test splits.
///
/// Rows are aligned within each split. A bundle is validated on construction
/// and on deserialization, and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "BundleParts", into = "BundleParts")]
pub struct EmbeddingBundle {
    parts: BundleParts,
}

/// On-disk layout of an [`EmbeddingBundle`]; converted through validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleParts {
    train_targets: Array1<f64>,
    train_embeddings: Array2<f64>,
    val_targets: Array1<f64>,
    val_embeddings: Array2<f64>,
    test_targets: Array1<f64>,
    test_embeddings: Array2<f64>,
}

impl TryFrom<BundleParts> for EmbeddingBundle {
    type Error = BundleError;

    fn try_from(parts: BundleParts) -> Result<Self, Self::Error> {
        let width = parts.train_embeddings.ncols();
        for (split, embeddings, targets) in [
            (SplitKind::Train, &parts.train_embeddings, &parts.train_targets),
            (SplitKind::Validation, &parts.val_embeddings, &parts.val_targets),
            (SplitKind::Test, &parts.test_embeddings, &parts.test_targets),
        ] {
            if embeddings.nrows() != targets.len() {
                return Err(BundleError::RowMismatch {
                    split,
                    embeddings: embeddings.nrows(),
                    targets: targets.len(),
                });
            }
            if embeddings.ncols() != width {
                return Err(BundleError::WidthMismatch {
                    split,
                    expected: width,
                    actual: embeddings.ncols(),
                });
            }
        }
        if parts.train_targets.is_empty() {
            return Err(BundleError::Empty(SplitKind::Train));
        }
        if parts.test_targets.is_empty() {
            return Err(BundleError::Empty(SplitKind::Test));
        }
        Ok(Self { parts })
    }
}

impl From<EmbeddingBundle> for BundleParts {
    fn from(bundle: EmbeddingBundle) -> Self {
        bundle.parts
    }
}

impl EmbeddingBundle {
    /// Validates and assembles the six arrays.
    pub fn new(
        train_targets: Array1<f64>,
        train_embeddings: Array2<f64>,
        val_targets: Array1<f64>,
        val_embeddings: Array2<f64>,
        test_targets: Array1<f64>,
        test_embeddings: Array2<f64>,
    ) -> Result<Self, BundleError> {
        BundleParts {
            train_targets,
            train_embeddings,
            val_targets,
            val_embeddings,
            test_targets,
            test_embeddings,
        }
        .try_into()
    }

    /// Embeddings and targets of a split.
    #[must_use]
    pub fn split(&self, kind: SplitKind) -> (ArrayView2<'_, f64>, ArrayView1<'_, f64>) {
        let p = &self.parts;
        match kind {
            SplitKind::Train => (p.train_embeddings.view(), p.train_targets.view()),
            SplitKind::Validation => (p.val_embeddings.view(), p.val_targets.view()),
            SplitKind::Test => (p.test_embeddings.view(), p.test_targets.view()),
        }
    }

    /// Embedding width shared by every split.
    #[must_use]
    pub fn embedding_dim(&self) -> usize {
        self.parts.train_embeddings.ncols()
    }

    /// Row count of a split.
    #[must_use]
    pub fn rows(&self, kind: SplitKind) -> usize {
        self.split(kind).1.len()
    }
}
