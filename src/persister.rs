use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::domain::{
    DataFile, Dataset, NewDataFile, NewDataset, NewParameterSet, Parameter, ParameterTarget,
    SchemaKind,
};
use crate::error::IngestError;
use crate::feed::{Enclosure, FeedContext, FeedEntry, MediaContent};
use crate::identity;
use crate::retrieval::FileRetriever;
use crate::schema::{PARAM_ENTRY_ID, PARAM_UPDATED, SchemaRegistry};
use crate::store::{Insert, RecordStore};

/// Turns feed entries into datasets, at most once per entry id.
pub trait EntryPersister {
    /// True when no dataset carries `entry.id` as its EntryID yet.
    fn is_new(&self, feed: &FeedContext, entry: &FeedEntry) -> Result<bool, IngestError>;

    /// Dataset for `entry`, created (with experiment and data files) on first
    /// sight and returned untouched afterwards.
    fn process(&self, feed: &FeedContext, entry: &FeedEntry) -> Result<Dataset, IngestError>;

    /// Data files registered under `dataset`.
    fn data_files(&self, dataset: &Dataset) -> Result<Vec<DataFile>, IngestError>;
}

pub struct AtomPersister<S, R> {
    store: Arc<S>,
    retriever: R,
}

impl<S: RecordStore, R: FileRetriever> AtomPersister<S, R> {
    pub fn new(store: Arc<S>, retriever: R) -> Self {
        Self { store, retriever }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn retriever(&self) -> &R {
        &self.retriever
    }

    fn find_dataset(&self, entry: &FeedEntry) -> Result<Option<Dataset>, IngestError> {
        let schema = SchemaRegistry::get_schema(self.store.as_ref(), SchemaKind::Dataset)?;
        let target = self
            .store
            .find_parameter_target(&schema.namespace, PARAM_ENTRY_ID, &entry.id)?;
        match target {
            Some(ParameterTarget::Dataset(id)) => self.store.dataset(id),
            Some(ParameterTarget::Experiment(_)) | None => Ok(None),
        }
    }

    fn process_enclosure(
        &self,
        dataset: &Dataset,
        enclosure: &Enclosure,
    ) -> Result<DataFile, IngestError> {
        self.register(NewDataFile {
            dataset: dataset.id,
            url: enclosure.href.clone(),
            filename: enclosure.filename(),
            mimetype: enclosure.mime.clone(),
        })
    }

    fn process_media_content(
        &self,
        dataset: &Dataset,
        media: &MediaContent,
    ) -> Result<DataFile, IngestError> {
        self.register(NewDataFile {
            dataset: dataset.id,
            url: media.url.clone(),
            filename: media.filename(),
            mimetype: media.mime.clone(),
        })
    }

    fn register(&self, file: NewDataFile) -> Result<DataFile, IngestError> {
        let file = self.store.insert_datafile(file)?;
        debug!(dataset = %file.dataset, filename = %file.filename, url = %file.url, "datafile.registered");
        self.retriever.enqueue(&file);
        Ok(file)
    }
}

impl<S: RecordStore, R: FileRetriever> EntryPersister for AtomPersister<S, R> {
    fn is_new(&self, _feed: &FeedContext, entry: &FeedEntry) -> Result<bool, IngestError> {
        Ok(self.find_dataset(entry)?.is_none())
    }

    fn process(&self, feed: &FeedContext, entry: &FeedEntry) -> Result<Dataset, IngestError> {
        let store = self.store.as_ref();
        let user = identity::resolve_user(store, feed, entry)?;
        debug!(entry = %entry.id, user = %user.username, "entry.process");

        if let Some(dataset) = self.find_dataset(entry)? {
            debug!(entry = %entry.id, dataset = %dataset.id, "dataset.exists");
            return Ok(dataset);
        }

        let experiment = identity::resolve_experiment(store, entry, &user)?;
        let schema = SchemaRegistry::get_schema(store, SchemaKind::Dataset)?;
        let updated = entry.updated.or(feed.updated).unwrap_or_else(Utc::now);
        let description = entry
            .title
            .as_deref()
            .map(str::trim)
            .filter(|title| !title.is_empty())
            .unwrap_or(entry.id.as_str())
            .to_string();

        let inserted = store.insert_dataset(NewDataset {
            experiment: experiment.id,
            description,
            parameters: NewParameterSet {
                schema: schema.namespace,
                parameters: vec![
                    Parameter::string(PARAM_ENTRY_ID, entry.id.clone()),
                    Parameter::datetime(PARAM_UPDATED, updated),
                ],
            },
        })?;
        let dataset = match inserted {
            Insert::Created(dataset) => dataset,
            Insert::Existing(dataset) => {
                warn!(entry = %entry.id, dataset = %dataset.id, "dataset.created_concurrently");
                return Ok(dataset);
            }
        };

        for enclosure in &entry.enclosures {
            self.process_enclosure(&dataset, enclosure)?;
        }
        for media in &entry.media_content {
            self.process_media_content(&dataset, media)?;
        }

        info!(
            entry = %entry.id,
            dataset = %dataset.id,
            experiment = %experiment.id,
            files = entry.enclosures.len() + entry.media_content.len(),
            "dataset.created"
        );
        Ok(dataset)
    }

    fn data_files(&self, dataset: &Dataset) -> Result<Vec<DataFile>, IngestError> {
        self.store.datafiles(dataset.id)
    }
}
