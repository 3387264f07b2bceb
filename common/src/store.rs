use std::collections::BTreeMap;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::{config::CONFIG_VERSION, error::StoreError, params::ParameterSet};

/// Persisted layout: every parameter buffer keyed by its persisted key, plus
/// the layout version tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredParameters {
    pub version: String,
    pub values: BTreeMap<String, String>,
}

impl StoredParameters {
    pub fn capture(params: &ParameterSet) -> Self {
        Self {
            version: CONFIG_VERSION.to_string(),
            values: params
                .iter()
                .map(|param| (param.key().to_string(), param.value().to_string()))
                .collect(),
        }
    }
}

pub trait ParameterStore {
    /// `Ok(None)` when nothing has been stored yet.
    fn load(&mut self) -> Result<Option<StoredParameters>, StoreError>;

    fn save(&mut self, stored: &StoredParameters) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded,
    Empty,
    VersionMismatch,
    Failed,
}

/// Fills `params` from `store`.
///
/// Anything other than a document with the current version tag leaves every
/// parameter at its default; a stored document is never partially applied
/// across versions. Keys missing from a current-version document keep their
/// defaults, unknown stored keys are ignored.
pub fn load_parameters(store: &mut dyn ParameterStore, params: &mut ParameterSet) -> LoadOutcome {
    params.reset_all();

    let stored = match store.load() {
        Ok(Some(stored)) => stored,
        Ok(None) => {
            info!("no stored parameters; using defaults");
            return LoadOutcome::Empty;
        }
        Err(err) => {
            warn!("failed to load stored parameters, using defaults: {err}");
            return LoadOutcome::Failed;
        }
    };

    if stored.version != CONFIG_VERSION {
        warn!(
            "stored parameter version `{}` does not match `{}`; resetting to defaults",
            stored.version, CONFIG_VERSION
        );
        return LoadOutcome::VersionMismatch;
    }

    for param in params.iter_mut() {
        if let Some(value) = stored.values.get(param.key()) {
            param.set_value(value);
        }
    }

    info!("loaded {} stored parameters", stored.values.len());
    LoadOutcome::Loaded
}

pub fn save_parameters(store: &mut dyn ParameterStore, params: &ParameterSet) -> Result<(), StoreError> {
    store.save(&StoredParameters::capture(params))
}

/// Volatile store, also used to exercise persistence paths in tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    pub stored: Option<StoredParameters>,
    pub saves: usize,
    pub fail_saves: bool,
}

impl ParameterStore for MemoryStore {
    fn load(&mut self) -> Result<Option<StoredParameters>, StoreError> {
        Ok(self.stored.clone())
    }

    fn save(&mut self, stored: &StoredParameters) -> Result<(), StoreError> {
        if self.fail_saves {
            return Err(StoreError::Io("simulated write failure".to_string()));
        }
        self.stored = Some(stored.clone());
        self.saves += 1;
        Ok(())
    }
}
