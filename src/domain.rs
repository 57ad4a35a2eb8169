use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::IngestError;

macro_rules! record_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            pub fn new(value: u64) -> Self {
                Self(value)
            }

            pub fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

record_id!(UserId);
record_id!(ExperimentId);
record_id!(DatasetId);
record_id!(DataFileId);
record_id!(ParameterSetId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SchemaKind {
    Dataset,
    Experiment,
}

impl fmt::Display for SchemaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaKind::Dataset => write!(f, "dataset"),
            SchemaKind::Experiment => write!(f, "experiment"),
        }
    }
}

impl FromStr for SchemaKind {
    type Err = IngestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "dataset" => Ok(SchemaKind::Dataset),
            "experiment" => Ok(SchemaKind::Experiment),
            _ => Err(IngestError::InvalidSchemaKind(value.to_string())),
        }
    }
}

/// Location of a feed document: an `http(s)://` URL or a local path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FeedUrl(String);

impl FeedUrl {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_http(&self) -> bool {
        self.0.starts_with("http://") || self.0.starts_with("https://")
    }
}

impl fmt::Display for FeedUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for FeedUrl {
    type Err = IngestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() || trimmed.chars().any(char::is_whitespace) {
            return Err(IngestError::InvalidFeedUrl(value.to_string()));
        }
        if let Some((scheme, rest)) = trimmed.split_once("://") {
            let known = matches!(scheme, "http" | "https" | "file");
            if !known || rest.is_empty() {
                return Err(IngestError::InvalidFeedUrl(value.to_string()));
            }
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl TryFrom<String> for FeedUrl {
    type Error = IngestError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FeedUrl> for String {
    fn from(value: FeedUrl) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub username: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AclOwnership {
    OwnerOwned,
    SystemOwned,
}

/// Permissions granted to one user, before they are bound to an experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclGrant {
    pub plugin_id: String,
    pub entity_id: UserId,
    pub can_read: bool,
    pub can_write: bool,
    pub can_delete: bool,
    pub is_owner: bool,
    pub ownership: AclOwnership,
}

impl AclGrant {
    pub const LOCAL_USER_PLUGIN: &'static str = "local_user";

    pub fn owner(user: UserId) -> Self {
        Self {
            plugin_id: Self::LOCAL_USER_PLUGIN.to_string(),
            entity_id: user,
            can_read: true,
            can_write: true,
            can_delete: true,
            is_owner: true,
            ownership: AclOwnership::OwnerOwned,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentAcl {
    pub experiment: ExperimentId,
    #[serde(flatten)]
    pub grant: AclGrant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: ExperimentId,
    pub title: String,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewExperiment {
    pub title: String,
    pub created_by: UserId,
    pub acl: AclGrant,
    pub parameters: NewParameterSet,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: DatasetId,
    pub experiment: ExperimentId,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewDataset {
    pub experiment: ExperimentId,
    pub description: String,
    pub parameters: NewParameterSet,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFile {
    pub id: DataFileId,
    pub dataset: DatasetId,
    pub url: String,
    pub filename: String,
    pub mimetype: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDataFile {
    pub dataset: DatasetId,
    pub url: String,
    pub filename: String,
    pub mimetype: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    String,
    DateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterName {
    pub name: String,
    pub full_name: String,
    pub data_type: ParameterType,
    /// Values must not repeat across parameter sets of this schema.
    #[serde(default)]
    pub unique: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub namespace: String,
    pub kind: SchemaKind,
    pub name: String,
    pub parameters: Vec<ParameterName>,
}

impl Schema {
    pub fn parameter(&self, name: &str) -> Option<&ParameterName> {
        self.parameters.iter().find(|param| param.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum ParameterValue {
    String(String),
    DateTime(DateTime<Utc>),
}

impl ParameterValue {
    pub fn as_string(&self) -> Option<&str> {
        match self {
            ParameterValue::String(value) => Some(value),
            ParameterValue::DateTime(_) => None,
        }
    }

    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            ParameterValue::String(_) => None,
            ParameterValue::DateTime(value) => Some(*value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub value: ParameterValue,
}

impl Parameter {
    pub fn string(name: &str, value: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            value: ParameterValue::String(value.into()),
        }
    }

    pub fn datetime(name: &str, value: DateTime<Utc>) -> Self {
        Self {
            name: name.to_string(),
            value: ParameterValue::DateTime(value),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum ParameterTarget {
    Dataset(DatasetId),
    Experiment(ExperimentId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewParameterSet {
    pub schema: String,
    pub parameters: Vec<Parameter>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSet {
    pub id: ParameterSetId,
    pub schema: String,
    pub target: ParameterTarget,
    pub parameters: Vec<Parameter>,
}

impl ParameterSet {
    pub fn get(&self, name: &str) -> Option<&ParameterValue> {
        self.parameters
            .iter()
            .find(|param| param.name == name)
            .map(|param| &param.value)
    }
}
