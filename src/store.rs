use std::fs::{self, File, TryLockError};
use std::io::Write;
use std::sync::{Mutex, MutexGuard};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tempfile::Builder;

use crate::domain::{
    DataFile, DataFileId, Dataset, DatasetId, Experiment, ExperimentAcl, ExperimentId,
    NewDataFile, NewDataset, NewExperiment, NewParameterSet, NewUser, ParameterSet,
    ParameterSetId, ParameterTarget, ParameterType, ParameterValue, Schema, User, UserId,
};
use crate::error::IngestError;

/// Outcome of a conditional insert against a uniqueness constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Insert<T> {
    Created(T),
    Existing(T),
}

impl<T> Insert<T> {
    pub fn is_created(&self) -> bool {
        matches!(self, Insert::Created(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            Insert::Created(value) | Insert::Existing(value) => value,
        }
    }
}

/// Record storage consumed by the ingester.
///
/// Inserts that carry a uniqueness key (schema namespace, username, or a
/// parameter declared `unique` by its schema) must be atomic: a losing
/// writer gets `Insert::Existing` with the winner's record.
pub trait RecordStore: Send + Sync {
    fn schemas(&self, namespace_prefix: &str) -> Result<Vec<Schema>, IngestError>;
    fn install_schema(&self, schema: Schema) -> Result<Insert<Schema>, IngestError>;

    fn user_by_email(&self, email: &str) -> Result<Option<User>, IngestError>;
    fn user_by_username(&self, username: &str) -> Result<Option<User>, IngestError>;
    fn insert_user(&self, user: NewUser) -> Result<Insert<User>, IngestError>;

    /// Record owning a string parameter `name == value` under `schema`.
    fn find_parameter_target(
        &self,
        schema: &str,
        name: &str,
        value: &str,
    ) -> Result<Option<ParameterTarget>, IngestError>;
    fn parameter_sets(&self, target: ParameterTarget) -> Result<Vec<ParameterSet>, IngestError>;

    fn experiment(&self, id: ExperimentId) -> Result<Option<Experiment>, IngestError>;
    fn insert_experiment(
        &self,
        experiment: NewExperiment,
    ) -> Result<Insert<Experiment>, IngestError>;
    fn experiment_acls(&self, id: ExperimentId) -> Result<Vec<ExperimentAcl>, IngestError>;

    fn dataset(&self, id: DatasetId) -> Result<Option<Dataset>, IngestError>;
    fn insert_dataset(&self, dataset: NewDataset) -> Result<Insert<Dataset>, IngestError>;

    fn insert_datafile(&self, file: NewDataFile) -> Result<DataFile, IngestError>;
    fn datafiles(&self, dataset: DatasetId) -> Result<Vec<DataFile>, IngestError>;
}

/// Record store kept in memory and, when opened on a path, snapshotted to a
/// JSON file after every write.
///
/// A file-backed store holds an exclusive lock on `<path>.lock` for its whole
/// lifetime. Each snapshot is the full state of one process, so a second
/// process opening the same path is refused rather than allowed to overwrite
/// the first one's records.
#[derive(Debug)]
pub struct JsonStore {
    path: Option<Utf8PathBuf>,
    state: Mutex<StoreState>,
    _lock: Option<File>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreState {
    next_id: u64,
    #[serde(default)]
    schemas: Vec<Schema>,
    #[serde(default)]
    users: Vec<User>,
    #[serde(default)]
    experiments: Vec<Experiment>,
    #[serde(default)]
    acls: Vec<ExperimentAcl>,
    #[serde(default)]
    datasets: Vec<Dataset>,
    #[serde(default)]
    datafiles: Vec<DataFile>,
    #[serde(default)]
    parameter_sets: Vec<ParameterSet>,
}

impl JsonStore {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(StoreState::default()),
            _lock: None,
        }
    }

    pub fn open(path: impl Into<Utf8PathBuf>) -> Result<Self, IngestError> {
        let path = path.into();
        let lock = acquire_lock(&path)?;
        let state = if path.as_std_path().exists() {
            let content = fs::read_to_string(path.as_std_path())
                .map_err(|err| IngestError::Filesystem(err.to_string()))?;
            serde_json::from_str(&content).map_err(|err| IngestError::StoreCorrupt {
                path: path.to_string(),
                message: err.to_string(),
            })?
        } else {
            StoreState::default()
        };
        Ok(Self {
            path: Some(path),
            state: Mutex::new(state),
            _lock: Some(lock),
        })
    }

    pub fn path(&self) -> Option<&Utf8Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreState>, IngestError> {
        self.state
            .lock()
            .map_err(|_| IngestError::Storage("record store lock poisoned".to_string()))
    }

    fn commit(&self, state: &StoreState) -> Result<(), IngestError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let content = serde_json::to_vec_pretty(state)
            .map_err(|err| IngestError::Storage(err.to_string()))?;
        write_atomic(path, &content)
    }

    /// Runs `change` against a copy of `state` and keeps the copy only once
    /// its snapshot is on disk, so a failed write leaves no trace in memory.
    fn apply<T>(
        &self,
        state: &mut StoreState,
        change: impl FnOnce(&mut StoreState) -> T,
    ) -> Result<T, IngestError> {
        if self.path.is_none() {
            return Ok(change(state));
        }
        let mut next = state.clone();
        let value = change(&mut next);
        self.commit(&next)?;
        *state = next;
        Ok(value)
    }
}

fn acquire_lock(path: &Utf8Path) -> Result<File, IngestError> {
    let lock_path = Utf8PathBuf::from(format!("{path}.lock"));
    if let Some(parent) = lock_path.parent().filter(|parent| !parent.as_str().is_empty()) {
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
    }
    let file = File::options()
        .create(true)
        .write(true)
        .truncate(false)
        .open(lock_path.as_std_path())
        .map_err(|err| IngestError::Filesystem(err.to_string()))?;
    match file.try_lock() {
        Ok(()) => Ok(file),
        Err(TryLockError::WouldBlock) => Err(IngestError::StoreLocked(path.to_string())),
        Err(TryLockError::Error(err)) => Err(IngestError::Filesystem(err.to_string())),
    }
}

impl StoreState {
    fn allocate(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn schema(&self, namespace: &str) -> Result<&Schema, IngestError> {
        self.schemas
            .iter()
            .find(|schema| schema.namespace == namespace)
            .ok_or_else(|| IngestError::SchemaMissing(namespace.to_string()))
    }

    fn validate(&self, set: &NewParameterSet) -> Result<(), IngestError> {
        let schema = self.schema(&set.schema)?;
        for param in &set.parameters {
            let definition = schema.parameter(&param.name).ok_or_else(|| {
                IngestError::Storage(format!(
                    "unknown parameter {} for schema {}",
                    param.name, set.schema
                ))
            })?;
            let matches_type = matches!(
                (definition.data_type, &param.value),
                (ParameterType::String, ParameterValue::String(_))
                    | (ParameterType::DateTime, ParameterValue::DateTime(_))
            );
            if !matches_type {
                return Err(IngestError::Storage(format!(
                    "parameter {} expects {:?}",
                    param.name, definition.data_type
                )));
            }
        }
        Ok(())
    }

    fn find_parameter_target(&self, schema: &str, name: &str, value: &str) -> Option<ParameterTarget> {
        self.parameter_sets
            .iter()
            .filter(|set| set.schema == schema)
            .find(|set| {
                set.parameters
                    .iter()
                    .any(|param| param.name == name && param.value.as_string() == Some(value))
            })
            .map(|set| set.target)
    }

    /// Owner of an existing value for any parameter the schema marks unique.
    fn unique_conflict(&self, set: &NewParameterSet) -> Result<Option<ParameterTarget>, IngestError> {
        let schema = self.schema(&set.schema)?;
        for param in &set.parameters {
            let unique = schema
                .parameter(&param.name)
                .map(|definition| definition.unique)
                .unwrap_or(false);
            let Some(value) = param.value.as_string() else {
                continue;
            };
            if unique {
                if let Some(target) = self.find_parameter_target(&set.schema, &param.name, value) {
                    return Ok(Some(target));
                }
            }
        }
        Ok(None)
    }

    fn attach(&mut self, target: ParameterTarget, set: NewParameterSet) {
        let id = ParameterSetId::new(self.allocate());
        self.parameter_sets.push(ParameterSet {
            id,
            schema: set.schema,
            target,
            parameters: set.parameters,
        });
    }

    fn experiment(&self, id: ExperimentId) -> Option<&Experiment> {
        self.experiments.iter().find(|experiment| experiment.id == id)
    }

    fn dataset(&self, id: DatasetId) -> Option<&Dataset> {
        self.datasets.iter().find(|dataset| dataset.id == id)
    }
}

impl RecordStore for JsonStore {
    fn schemas(&self, namespace_prefix: &str) -> Result<Vec<Schema>, IngestError> {
        let state = self.lock()?;
        Ok(state
            .schemas
            .iter()
            .filter(|schema| schema.namespace.starts_with(namespace_prefix))
            .cloned()
            .collect())
    }

    fn install_schema(&self, schema: Schema) -> Result<Insert<Schema>, IngestError> {
        let mut state = self.lock()?;
        if let Some(existing) = state
            .schemas
            .iter()
            .find(|installed| installed.namespace == schema.namespace)
        {
            return Ok(Insert::Existing(existing.clone()));
        }
        let installed = schema.clone();
        self.apply(&mut state, |next| next.schemas.push(installed))?;
        Ok(Insert::Created(schema))
    }

    fn user_by_email(&self, email: &str) -> Result<Option<User>, IngestError> {
        let state = self.lock()?;
        Ok(state
            .users
            .iter()
            .find(|user| user.email.as_deref() == Some(email))
            .cloned())
    }

    fn user_by_username(&self, username: &str) -> Result<Option<User>, IngestError> {
        let state = self.lock()?;
        Ok(state
            .users
            .iter()
            .find(|user| user.username == username)
            .cloned())
    }

    fn insert_user(&self, user: NewUser) -> Result<Insert<User>, IngestError> {
        let mut state = self.lock()?;
        if let Some(existing) = state.users.iter().find(|u| u.username == user.username) {
            return Ok(Insert::Existing(existing.clone()));
        }
        let created = self.apply(&mut state, |next| {
            let created = User {
                id: UserId::new(next.allocate()),
                username: user.username,
                email: user.email,
            };
            next.users.push(created.clone());
            created
        })?;
        Ok(Insert::Created(created))
    }

    fn find_parameter_target(
        &self,
        schema: &str,
        name: &str,
        value: &str,
    ) -> Result<Option<ParameterTarget>, IngestError> {
        let state = self.lock()?;
        Ok(state.find_parameter_target(schema, name, value))
    }

    fn parameter_sets(&self, target: ParameterTarget) -> Result<Vec<ParameterSet>, IngestError> {
        let state = self.lock()?;
        Ok(state
            .parameter_sets
            .iter()
            .filter(|set| set.target == target)
            .cloned()
            .collect())
    }

    fn experiment(&self, id: ExperimentId) -> Result<Option<Experiment>, IngestError> {
        let state = self.lock()?;
        Ok(state.experiment(id).cloned())
    }

    fn insert_experiment(
        &self,
        experiment: NewExperiment,
    ) -> Result<Insert<Experiment>, IngestError> {
        let mut state = self.lock()?;
        state.validate(&experiment.parameters)?;
        match state.unique_conflict(&experiment.parameters)? {
            Some(ParameterTarget::Experiment(id)) => {
                let existing = state.experiment(id).cloned().ok_or_else(|| {
                    IngestError::Storage(format!("dangling parameter set for experiment {id}"))
                })?;
                return Ok(Insert::Existing(existing));
            }
            Some(ParameterTarget::Dataset(id)) => {
                return Err(IngestError::Storage(format!(
                    "experiment parameter already owned by dataset {id}"
                )));
            }
            None => {}
        }

        let created = self.apply(&mut state, |next| {
            let created = Experiment {
                id: ExperimentId::new(next.allocate()),
                title: experiment.title,
                created_by: experiment.created_by,
                created_at: Utc::now(),
            };
            next.experiments.push(created.clone());
            next.acls.push(ExperimentAcl {
                experiment: created.id,
                grant: experiment.acl,
            });
            next.attach(ParameterTarget::Experiment(created.id), experiment.parameters);
            created
        })?;
        Ok(Insert::Created(created))
    }

    fn experiment_acls(&self, id: ExperimentId) -> Result<Vec<ExperimentAcl>, IngestError> {
        let state = self.lock()?;
        Ok(state
            .acls
            .iter()
            .filter(|acl| acl.experiment == id)
            .cloned()
            .collect())
    }

    fn dataset(&self, id: DatasetId) -> Result<Option<Dataset>, IngestError> {
        let state = self.lock()?;
        Ok(state.dataset(id).cloned())
    }

    fn insert_dataset(&self, dataset: NewDataset) -> Result<Insert<Dataset>, IngestError> {
        let mut state = self.lock()?;
        if state.experiment(dataset.experiment).is_none() {
            return Err(IngestError::Storage(format!(
                "experiment {} does not exist",
                dataset.experiment
            )));
        }
        state.validate(&dataset.parameters)?;
        match state.unique_conflict(&dataset.parameters)? {
            Some(ParameterTarget::Dataset(id)) => {
                let existing = state.dataset(id).cloned().ok_or_else(|| {
                    IngestError::Storage(format!("dangling parameter set for dataset {id}"))
                })?;
                return Ok(Insert::Existing(existing));
            }
            Some(ParameterTarget::Experiment(id)) => {
                return Err(IngestError::Storage(format!(
                    "dataset parameter already owned by experiment {id}"
                )));
            }
            None => {}
        }

        let created = self.apply(&mut state, |next| {
            let created = Dataset {
                id: DatasetId::new(next.allocate()),
                experiment: dataset.experiment,
                description: dataset.description,
                created_at: Utc::now(),
            };
            next.datasets.push(created.clone());
            next.attach(ParameterTarget::Dataset(created.id), dataset.parameters);
            created
        })?;
        Ok(Insert::Created(created))
    }

    fn insert_datafile(&self, file: NewDataFile) -> Result<DataFile, IngestError> {
        let mut state = self.lock()?;
        if state.dataset(file.dataset).is_none() {
            return Err(IngestError::Storage(format!(
                "dataset {} does not exist",
                file.dataset
            )));
        }
        self.apply(&mut state, |next| {
            let created = DataFile {
                id: DataFileId::new(next.allocate()),
                dataset: file.dataset,
                url: file.url,
                filename: file.filename,
                mimetype: file.mimetype,
            };
            next.datafiles.push(created.clone());
            created
        })
    }

    fn datafiles(&self, dataset: DatasetId) -> Result<Vec<DataFile>, IngestError> {
        let state = self.lock()?;
        Ok(state
            .datafiles
            .iter()
            .filter(|file| file.dataset == dataset)
            .cloned()
            .collect())
    }
}

/// Writes `content` through a sibling temp file so readers never see a
/// partial snapshot.
pub fn write_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), IngestError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent.to_path_buf(),
        _ => Utf8PathBuf::from("."),
    };
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| IngestError::Filesystem(err.to_string()))?;
    let mut temp = Builder::new()
        .prefix("atom-ingest")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| IngestError::Filesystem(err.to_string()))?;
    temp.write_all(content)
        .map_err(|err| IngestError::Filesystem(err.to_string()))?;
    temp.persist(path.as_std_path())
        .map_err(|err| IngestError::Filesystem(err.to_string()))?;
    Ok(())
}
