//! Mapping feed entries onto users and experiments.

use tracing::{debug, info};

use crate::domain::{
    AclGrant, Experiment, NewExperiment, NewParameterSet, NewUser, Parameter, ParameterTarget,
    SchemaKind, User,
};
use crate::error::IngestError;
use crate::feed::{FeedContext, FeedEntry};
use crate::schema::{PARAM_EXPERIMENT_ID, PARAM_EXPERIMENT_TITLE, SchemaRegistry};
use crate::store::{Insert, RecordStore};

/// Username used when neither the entry nor the feed names an author.
pub const FALLBACK_USERNAME: &str = "anonymous";
pub const DEFAULT_EXPERIMENT_TITLE: &str = "Uncategorized Data";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperimentDetails {
    pub experiment_id: String,
    pub title: String,
}

/// Finds the entry's user by author email, then by author name as username,
/// and creates one when both miss.
pub fn resolve_user<S: RecordStore + ?Sized>(
    store: &S,
    feed: &FeedContext,
    entry: &FeedEntry,
) -> Result<User, IngestError> {
    let email = entry
        .author
        .as_ref()
        .and_then(|author| author.email.as_deref());
    if let Some(email) = email {
        if let Some(user) = store.user_by_email(email)? {
            return Ok(user);
        }
    }

    let username = author_username(feed, entry);
    if let Some(user) = store.user_by_username(&username)? {
        return Ok(user);
    }

    let inserted = store.insert_user(NewUser {
        username,
        email: email.map(str::to_string),
    })?;
    match inserted {
        Insert::Created(user) => {
            info!(user = %user.username, "user.created");
            Ok(user)
        }
        Insert::Existing(user) => Ok(user),
    }
}

fn author_username(feed: &FeedContext, entry: &FeedEntry) -> String {
    [entry.author.as_ref(), feed.author.as_ref()]
        .into_iter()
        .flatten()
        .map(|author| author.name.trim())
        .find(|name| !name.is_empty())
        .unwrap_or(FALLBACK_USERNAME)
        .to_string()
}

/// Experiment identity for an entry: album tags, then the
/// `...ExperimentID` / `...ExperimentTitle` category pair, then a per-user
/// default. An album id without a title goes straight to the default.
pub fn experiment_details(entry: &FeedEntry, user: &User) -> ExperimentDetails {
    if let Some(album) = &entry.album {
        return match &album.title {
            Some(title) => ExperimentDetails {
                experiment_id: album.id.clone(),
                title: title.clone(),
            },
            None => default_experiment(user),
        };
    }

    let mut experiment_id = None;
    let mut title = None;
    for category in &entry.categories {
        let Some(scheme) = category.scheme.as_deref() else {
            continue;
        };
        if scheme.ends_with(PARAM_EXPERIMENT_ID) {
            experiment_id = Some(category.term.clone());
        }
        if scheme.ends_with(PARAM_EXPERIMENT_TITLE) {
            title = Some(category.term.clone());
        }
    }

    match (experiment_id, title) {
        (Some(experiment_id), Some(title)) => ExperimentDetails {
            experiment_id,
            title,
        },
        _ => default_experiment(user),
    }
}

fn default_experiment(user: &User) -> ExperimentDetails {
    ExperimentDetails {
        experiment_id: format!("{}-default", user.username),
        title: DEFAULT_EXPERIMENT_TITLE.to_string(),
    }
}

/// Experiment carrying the entry's derived `ExperimentID`, created with an
/// owner ACL for `user` when none exists yet.
pub fn resolve_experiment<S: RecordStore + ?Sized>(
    store: &S,
    entry: &FeedEntry,
    user: &User,
) -> Result<Experiment, IngestError> {
    let details = experiment_details(entry, user);
    let schema = SchemaRegistry::get_schema(store, SchemaKind::Experiment)?;

    let target =
        store.find_parameter_target(&schema.namespace, PARAM_EXPERIMENT_ID, &details.experiment_id)?;
    if let Some(ParameterTarget::Experiment(id)) = target {
        if let Some(experiment) = store.experiment(id)? {
            debug!(experiment_id = %details.experiment_id, id = %experiment.id, "experiment.found");
            return Ok(experiment);
        }
    }

    let inserted = store.insert_experiment(NewExperiment {
        title: details.title,
        created_by: user.id,
        acl: AclGrant::owner(user.id),
        parameters: NewParameterSet {
            schema: schema.namespace,
            parameters: vec![Parameter::string(
                PARAM_EXPERIMENT_ID,
                details.experiment_id.clone(),
            )],
        },
    })?;
    match inserted {
        Insert::Created(experiment) => {
            info!(
                experiment_id = %details.experiment_id,
                id = %experiment.id,
                owner = %user.username,
                "experiment.created"
            );
            Ok(experiment)
        }
        Insert::Existing(experiment) => Ok(experiment),
    }
}
