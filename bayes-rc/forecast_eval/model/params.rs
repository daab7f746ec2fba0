use indexmap::IndexMap;
use ndarray::{Array1, Array2};
use thiserror::Error;

/// Value held by the parameter store.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    /// Vector parameter (locations, log-scales).
    Vector(Array1<f64>),
    /// Matrix parameter (layer weights, covariance factors).
    Matrix(Array2<f64>),
}

impl From<Array1<f64>> for Param {
    fn from(value: Array1<f64>) -> Self {
        Self::Vector(value)
    }
}

impl From<Array2<f64>> for Param {
    fn from(value: Array2<f64>) -> Self {
        Self::Matrix(value)
    }
}

/// Errors raised by [`ParamStore`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParamStoreError {
    /// A parameter with that name is already registered in this trial.
    #[error("parameter `{0}` already registered")]
    Duplicate(String),
    /// Lookup of an unregistered name.
    #[error("parameter `{0}` not registered")]
    Missing(String),
    /// Stored value has the other shape kind.
    #[error("parameter `{name}` is not a {expected}")]
    Kind {
        /// Parameter name.
        name: String,
        /// Expected kind (`vector` or `matrix`).
        expected: &'static str,
    },
}

/// Named parameters owned by a single trial.
///
/// A fresh store is created per seed and dropped when the trial ends, so no
/// fitted value can leak into the next trial.
#[derive(Debug, Default)]
pub struct ParamStore {
    params: IndexMap<String, Param>,
}

impl ParamStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new parameter.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        value: impl Into<Param>,
    ) -> Result<(), ParamStoreError> {
        let name = name.into();
        if self.params.contains_key(&name) {
            return Err(ParamStoreError::Duplicate(name));
        }
        self.params.insert(name, value.into());
        Ok(())
    }

    /// Replaces the value of an existing parameter.
    pub fn set(&mut self, name: &str, value: impl Into<Param>) -> Result<(), ParamStoreError> {
        let slot = self
            .params
            .get_mut(name)
            .ok_or_else(|| ParamStoreError::Missing(name.to_string()))?;
        *slot = value.into();
        Ok(())
    }

    /// Vector parameter by name.
    pub fn vector(&self, name: &str) -> Result<&Array1<f64>, ParamStoreError> {
        match self.params.get(name) {
            Some(Param::Vector(v)) => Ok(v),
            Some(Param::Matrix(_)) => Err(ParamStoreError::Kind {
                name: name.to_string(),
                expected: "vector",
            }),
            None => Err(ParamStoreError::Missing(name.to_string())),
        }
    }

    /// Matrix parameter by name.
    pub fn matrix(&self, name: &str) -> Result<&Array2<f64>, ParamStoreError> {
        match self.params.get(name) {
            Some(Param::Matrix(m)) => Ok(m),
            Some(Param::Vector(_)) => Err(ParamStoreError::Kind {
                name: name.to_string(),
                expected: "matrix",
            }),
            None => Err(ParamStoreError::Missing(name.to_string())),
        }
    }

    /// Whether a name is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.params.contains_key(name)
    }

    /// Registered names in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.params.keys().map(String::as_str)
    }

    /// Number of registered parameters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// Whether nothing is registered yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}
