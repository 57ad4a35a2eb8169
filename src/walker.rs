//! Pagination-aware walk over a feed.
//!
//! Feeds are assumed to list entries newest first and to only ever grow at
//! the head. Under that assumption, a page containing any already ingested
//! entry means every later page was ingested too, so the walk stops there
//! instead of fetching the whole archive. Feeds that reorder or backfill old
//! entries break this assumption.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::domain::{DatasetId, ExperimentId, FeedUrl};
use crate::error::IngestError;
use crate::feed::{FeedContext, FeedEntry};
use crate::persister::EntryPersister;
use crate::transport::{FeedSource, resolve_href};

/// An unseen entry together with the feed page it was found on.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub feed: Arc<FeedContext>,
    pub entry: FeedEntry,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub feed: String,
    pub pages_fetched: usize,
    pub entries: Vec<IngestedEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestedEntry {
    pub entry_id: String,
    pub dataset_id: DatasetId,
    pub experiment_id: ExperimentId,
    pub data_files: usize,
}

pub struct FeedWalker<F, P> {
    root: FeedUrl,
    source: F,
    persister: P,
}

struct Walk {
    pending: Vec<PendingEntry>,
    pages: usize,
}

impl<F: FeedSource, P: EntryPersister> FeedWalker<F, P> {
    pub fn new(root: FeedUrl, source: F, persister: P) -> Self {
        Self {
            root,
            source,
            persister,
        }
    }

    pub fn root(&self) -> &FeedUrl {
        &self.root
    }

    pub fn source(&self) -> &F {
        &self.source
    }

    pub fn persister(&self) -> &P {
        &self.persister
    }

    /// Processes every unseen entry of the feed, oldest first.
    pub fn ingest(&self) -> Result<IngestReport, IngestError> {
        let walk = self.walk()?;
        info!(
            feed = %self.root,
            pages = walk.pages,
            new_entries = walk.pending.len(),
            "feed.walked"
        );

        let mut entries = Vec::with_capacity(walk.pending.len());
        for pending in walk.pending {
            let dataset = self.persister.process(&pending.feed, &pending.entry)?;
            let data_files = self.persister.data_files(&dataset)?.len();
            entries.push(IngestedEntry {
                entry_id: pending.entry.id,
                dataset_id: dataset.id,
                experiment_id: dataset.experiment,
                data_files,
            });
        }

        Ok(IngestReport {
            feed: self.root.to_string(),
            pages_fetched: walk.pages,
            entries,
        })
    }

    /// Unseen entries paired with their feed context, oldest first.
    pub fn get_entries(&self) -> Result<Vec<PendingEntry>, IngestError> {
        Ok(self.walk()?.pending)
    }

    fn walk(&self) -> Result<Walk, IngestError> {
        let mut url = self.root.as_str().to_string();
        let mut visited = HashSet::new();
        let mut pending = Vec::new();
        let mut pages = 0usize;

        loop {
            debug!(url = %url, "feed.fetch");
            let doc = self.source.fetch(&url)?;
            pages += 1;
            visited.insert(url.clone());

            let total = doc.entries.len();
            let next = doc.next_href().map(|href| resolve_href(&url, href));
            let feed = Arc::new(doc.feed);
            let mut fresh = 0usize;
            for entry in doc.entries {
                if self.persister.is_new(&feed, &entry)? {
                    fresh += 1;
                    pending.push(PendingEntry {
                        feed: Arc::clone(&feed),
                        entry,
                    });
                }
            }
            debug!(url = %url, total, fresh, "feed.page");

            if fresh != total {
                debug!(url = %url, "feed.stop reason=seen_entry");
                break;
            }
            let Some(next) = next else {
                debug!(url = %url, "feed.stop reason=last_page");
                break;
            };
            if visited.contains(&next) {
                warn!(url = %url, next = %next, "feed.stop reason=pagination_cycle");
                break;
            }
            url = next;
        }

        pending.reverse();
        Ok(Walk { pending, pages })
    }
}

/// Ingests every feed in turn. A failing feed is logged and skipped so the
/// others still run; the reports of those that succeeded come back together
/// with the first failure.
pub fn ingest_all<F, P, I>(walkers: I) -> (Vec<IngestReport>, Option<IngestError>)
where
    F: FeedSource,
    P: EntryPersister,
    I: IntoIterator<Item = FeedWalker<F, P>>,
{
    let mut reports = Vec::new();
    let mut first_error = None;
    for walker in walkers {
        match walker.ingest() {
            Ok(report) => reports.push(report),
            Err(err) => {
                error!(feed = %walker.root(), error = %err, "feed.failed");
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
    }
    (reports, first_error)
}
