use std::fs;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::domain::FeedUrl;
use crate::error::IngestError;
use crate::transport::{Credential, Credentials};

pub const DEFAULT_CONFIG_FILE: &str = "atom-ingest.json";
pub const DEFAULT_STORE_PATH: &str = ".atom-ingest/records.json";
pub const DEFAULT_FILES_DIR: &str = ".atom-ingest/files";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub store: Option<String>,
    #[serde(default)]
    pub files_dir: Option<String>,
    #[serde(default)]
    pub feeds: Vec<FeedEntry>,
    #[serde(default)]
    pub credentials: Vec<CredentialEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum FeedEntry {
    Shorthand(String),
    Detailed(FeedEntryObject),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct FeedEntryObject {
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// `[url, username, password]`, or the same as an object.
#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum CredentialEntry {
    Triple(String, String, String),
    Detailed(Credential),
}

#[derive(Debug, Clone)]
pub struct FeedRequest {
    pub url: FeedUrl,
    pub name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub store_path: Utf8PathBuf,
    pub files_dir: Utf8PathBuf,
    pub feeds: Vec<FeedRequest>,
    pub credentials: Credentials,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, IngestError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Err(IngestError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| IngestError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| IngestError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, IngestError> {
        let schema_version = config.schema_version.unwrap_or(1);

        let feeds = config
            .feeds
            .into_iter()
            .map(|entry| match entry {
                FeedEntry::Shorthand(value) => Ok(FeedRequest {
                    url: value.parse()?,
                    name: None,
                }),
                FeedEntry::Detailed(obj) => Ok(FeedRequest {
                    url: obj.url.parse()?,
                    name: obj.name,
                }),
            })
            .collect::<Result<Vec<_>, IngestError>>()?;

        let credentials = config
            .credentials
            .into_iter()
            .map(|entry| match entry {
                CredentialEntry::Triple(url, username, password) => Credential {
                    url,
                    username,
                    password,
                },
                CredentialEntry::Detailed(credential) => credential,
            })
            .collect();

        Ok(ResolvedConfig {
            schema_version,
            store_path: Utf8PathBuf::from(
                config.store.unwrap_or_else(|| DEFAULT_STORE_PATH.to_string()),
            ),
            files_dir: Utf8PathBuf::from(
                config
                    .files_dir
                    .unwrap_or_else(|| DEFAULT_FILES_DIR.to_string()),
            ),
            feeds,
            credentials: Credentials::new(credentials),
        })
    }
}
