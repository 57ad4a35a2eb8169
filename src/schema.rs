//! Ingestion metadata schemas, bootstrapped from a built-in fixture.

use tracing::{debug, info};

use crate::domain::{Schema, SchemaKind};
use crate::error::IngestError;
use crate::store::{Insert, RecordStore};

pub const BASE_NAMESPACE: &str = "http://mytardis.org/schemas/atom-import";

pub const PARAM_ENTRY_ID: &str = "EntryID";
pub const PARAM_UPDATED: &str = "Updated";
pub const PARAM_EXPERIMENT_ID: &str = "ExperimentID";
pub const PARAM_EXPERIMENT_TITLE: &str = "ExperimentTitle";

const FIXTURE: &str = include_str!("../fixtures/atom_ingest_schema.json");

pub struct SchemaRegistry;

impl SchemaRegistry {
    /// All schemas under [`BASE_NAMESPACE`], installing the fixture first if needed.
    pub fn get_schemas<S: RecordStore + ?Sized>(store: &S) -> Result<Vec<Schema>, IngestError> {
        Self::load_fixture_if_necessary(store)?;
        store.schemas(BASE_NAMESPACE)
    }

    pub fn get_schema<S: RecordStore + ?Sized>(
        store: &S,
        kind: SchemaKind,
    ) -> Result<Schema, IngestError> {
        Self::get_schemas(store)?
            .into_iter()
            .find(|schema| schema.kind == kind)
            .ok_or_else(|| IngestError::SchemaMissing(kind.to_string()))
    }

    pub fn builtin() -> Result<Vec<Schema>, IngestError> {
        serde_json::from_str(FIXTURE)
            .map_err(|err| IngestError::Storage(format!("invalid schema fixture: {err}")))
    }

    fn load_fixture_if_necessary<S: RecordStore + ?Sized>(store: &S) -> Result<(), IngestError> {
        let installed = store.schemas(BASE_NAMESPACE)?;
        let builtin = Self::builtin()?;
        let missing = builtin
            .into_iter()
            .filter(|schema| {
                !installed
                    .iter()
                    .any(|existing| existing.namespace == schema.namespace)
            })
            .collect::<Vec<_>>();
        if missing.is_empty() {
            return Ok(());
        }

        // install_schema is insert-if-absent, so a concurrent first run is harmless.
        for schema in missing {
            match store.install_schema(schema)? {
                Insert::Created(schema) => {
                    info!(namespace = %schema.namespace, "schema.installed");
                }
                Insert::Existing(schema) => {
                    debug!(namespace = %schema.namespace, "schema.already_installed");
                }
            }
        }
        Ok(())
    }
}
