//! Out-of-band retrieval of data file contents.
//!
//! The persister only registers a [`DataFile`] and hands it to a
//! [`FileRetriever`]; nothing it does waits on, or learns about, the copy.

use std::fs;
use std::io;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use reqwest::blocking::Client;
use serde::Serialize;
use tempfile::Builder;
use tracing::{debug, info, warn};

use crate::domain::DataFile;
use crate::error::IngestError;
use crate::transport::{Credentials, http_client, is_http};

pub trait FileRetriever: Send + Sync {
    /// Schedules a copy of `file`. Fire-and-forget.
    fn enqueue(&self, file: &DataFile);
}

impl<T: FileRetriever + ?Sized> FileRetriever for Arc<T> {
    fn enqueue(&self, file: &DataFile) {
        (**self).enqueue(file);
    }
}

/// Registers files without copying them.
#[derive(Debug, Clone, Copy, Default)]
pub struct SkipRetriever;

impl FileRetriever for SkipRetriever {
    fn enqueue(&self, file: &DataFile) {
        debug!(url = %file.url, "retrieval.skipped");
    }
}

/// Handle feeding a background download worker.
#[derive(Clone)]
pub struct QueueRetriever {
    sender: Sender<DataFile>,
}

/// Owner of the download thread; see [`RetrievalWorker::finish`].
pub struct RetrievalWorker {
    handle: JoinHandle<RetrievalSummary>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetrievalSummary {
    pub completed: usize,
    pub failed: usize,
}

impl QueueRetriever {
    pub fn spawn(
        files_dir: Utf8PathBuf,
        credentials: Credentials,
    ) -> Result<(Self, RetrievalWorker), IngestError> {
        let client =
            http_client(Duration::from_secs(300)).map_err(IngestError::Retrieval)?;
        let downloader = Downloader {
            client,
            credentials,
            files_dir,
        };
        let (sender, receiver) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("atom-ingest-retrieval".to_string())
            .spawn(move || downloader.run(receiver))
            .map_err(|err| IngestError::Retrieval(err.to_string()))?;
        Ok((Self { sender }, RetrievalWorker { handle }))
    }
}

impl FileRetriever for QueueRetriever {
    fn enqueue(&self, file: &DataFile) {
        if self.sender.send(file.clone()).is_err() {
            warn!(url = %file.url, "retrieval.queue_closed");
        }
    }
}

impl RetrievalWorker {
    /// Waits for queued downloads. Returns once every [`QueueRetriever`]
    /// handle has been dropped and the queue is drained.
    pub fn finish(self) -> Result<RetrievalSummary, IngestError> {
        self.handle
            .join()
            .map_err(|_| IngestError::Retrieval("retrieval worker panicked".to_string()))
    }
}

struct Downloader {
    client: Client,
    credentials: Credentials,
    files_dir: Utf8PathBuf,
}

impl Downloader {
    fn run(self, receiver: Receiver<DataFile>) -> RetrievalSummary {
        let mut summary = RetrievalSummary::default();
        for file in receiver {
            match self.download(&file) {
                Ok(path) => {
                    summary.completed += 1;
                    info!(url = %file.url, path = %path, "retrieval.done");
                }
                Err(err) => {
                    summary.failed += 1;
                    warn!(url = %file.url, error = %err, "retrieval.failed");
                }
            }
        }
        summary
    }

    fn download(&self, file: &DataFile) -> Result<Utf8PathBuf, IngestError> {
        if !is_http(&file.url) {
            return Err(IngestError::Retrieval(format!(
                "unsupported url: {}",
                file.url
            )));
        }
        let target = local_path(&self.files_dir, file);
        let parent = target
            .parent()
            .ok_or_else(|| IngestError::Filesystem("invalid destination path".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;

        let request = self
            .credentials
            .apply(&file.url, self.client.get(&file.url));
        let mut response = request
            .send()
            .map_err(|err| IngestError::Retrieval(err.to_string()))?;
        if !response.status().is_success() {
            return Err(IngestError::Retrieval(format!(
                "{} returned status {}",
                file.url,
                response.status().as_u16()
            )));
        }

        let mut temp = Builder::new()
            .prefix("atom-ingest-file")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        io::copy(&mut response, &mut temp)
            .map_err(|err| IngestError::Retrieval(err.to_string()))?;
        temp.persist(target.as_std_path())
            .map_err(|err| IngestError::Filesystem(err.to_string()))?;
        Ok(target)
    }
}

/// `<files_dir>/<dataset id>/<file id>-<filename>`; the filename is reduced
/// to its last path component.
pub fn local_path(files_dir: &Utf8Path, file: &DataFile) -> Utf8PathBuf {
    let name = Utf8Path::new(&file.filename)
        .file_name()
        .filter(|name| !name.is_empty())
        .unwrap_or(crate::feed::FALLBACK_FILENAME);
    files_dir
        .join(file.dataset.to_string())
        .join(format!("{}-{}", file.id, name))
}
