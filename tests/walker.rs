use std::collections::HashMap;
use std::fs;
use std::sync::{Arc, Mutex};

use assert_matches::assert_matches;

use atom_dataset_ingest::domain::FeedUrl;
use atom_dataset_ingest::error::IngestError;
use atom_dataset_ingest::feed::{FeedContext, FeedDocument, FeedEntry, Link};
use atom_dataset_ingest::persister::{AtomPersister, EntryPersister};
use atom_dataset_ingest::retrieval::SkipRetriever;
use atom_dataset_ingest::store::{JsonStore, RecordStore};
use atom_dataset_ingest::transport::{Credentials, FeedSource, HttpFeedSource};
use atom_dataset_ingest::walker::{self, FeedWalker};

#[derive(Default)]
struct MockSource {
    pages: HashMap<String, FeedDocument>,
    fetched: Mutex<Vec<String>>,
}

impl MockSource {
    fn page(mut self, url: &str, next: Option<&str>, ids: &[&str]) -> Self {
        let mut links = vec![link(url, "self")];
        if let Some(next) = next {
            links.push(link(next, "next"));
        }
        let doc = FeedDocument {
            feed: FeedContext {
                id: "urn:feed:mock".to_string(),
                links,
                ..FeedContext::default()
            },
            entries: ids.iter().map(|id| FeedEntry::new(*id)).collect(),
        };
        self.pages.insert(url.to_string(), doc);
        self
    }

    fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }
}

impl FeedSource for MockSource {
    fn fetch(&self, url: &str) -> Result<FeedDocument, IngestError> {
        self.fetched.lock().unwrap().push(url.to_string());
        self.pages.get(url).cloned().ok_or(IngestError::FeedStatus {
            status: 404,
            message: url.to_string(),
        })
    }
}

fn link(href: &str, rel: &str) -> Link {
    Link {
        href: href.to_string(),
        rel: Some(rel.to_string()),
        title: None,
        media_type: None,
    }
}

fn root() -> FeedUrl {
    "http://example.org/feed".parse().unwrap()
}

fn three_pages() -> MockSource {
    MockSource::default()
        .page("http://example.org/feed", Some("http://example.org/feed?page=2"), &[
            "urn:e:6", "urn:e:5",
        ])
        .page("http://example.org/feed?page=2", Some("http://example.org/feed?page=3"), &[
            "urn:e:4", "urn:e:3",
        ])
        .page("http://example.org/feed?page=3", None, &["urn:e:2", "urn:e:1"])
}

fn persister(store: &Arc<JsonStore>) -> AtomPersister<JsonStore, SkipRetriever> {
    AtomPersister::new(Arc::clone(store), SkipRetriever)
}

#[test]
fn walk_stops_at_first_seen_entry() {
    let store = Arc::new(JsonStore::in_memory());
    let seed = persister(&store);
    for id in ["urn:e:1", "urn:e:2", "urn:e:3"] {
        seed.process(&FeedContext::default(), &FeedEntry::new(id)).unwrap();
    }

    let walker = FeedWalker::new(root(), three_pages(), persister(&store));
    let pending = walker.get_entries().unwrap();

    let ids = pending.iter().map(|p| p.entry.id.as_str()).collect::<Vec<_>>();
    assert_eq!(ids, vec!["urn:e:4", "urn:e:5", "urn:e:6"]);
    assert_eq!(
        walker.source().fetched(),
        vec!["http://example.org/feed", "http://example.org/feed?page=2"]
    );
}

#[test]
fn first_run_walks_every_page_oldest_first() {
    let store = Arc::new(JsonStore::in_memory());
    let walker = FeedWalker::new(root(), three_pages(), persister(&store));

    let report = walker.ingest().unwrap();
    assert_eq!(report.pages_fetched, 3);
    let ids = report
        .entries
        .iter()
        .map(|e| e.entry_id.as_str())
        .collect::<Vec<_>>();
    assert_eq!(
        ids,
        vec!["urn:e:1", "urn:e:2", "urn:e:3", "urn:e:4", "urn:e:5", "urn:e:6"]
    );
    assert!(
        report
            .entries
            .windows(2)
            .all(|pair| pair[0].dataset_id.get() < pair[1].dataset_id.get())
    );
}

#[test]
fn second_run_fetches_one_page_and_ingests_nothing() {
    let store = Arc::new(JsonStore::in_memory());
    FeedWalker::new(root(), three_pages(), persister(&store))
        .ingest()
        .unwrap();

    let walker = FeedWalker::new(root(), three_pages(), persister(&store));
    let report = walker.ingest().unwrap();
    assert!(report.entries.is_empty());
    assert_eq!(walker.source().fetched(), vec!["http://example.org/feed"]);
}

#[test]
fn pagination_cycle_is_broken() {
    let source = MockSource::default()
        .page("http://example.org/feed", Some("http://example.org/feed?page=2"), &["urn:a"])
        .page("http://example.org/feed?page=2", Some("http://example.org/feed"), &["urn:b"]);
    let store = Arc::new(JsonStore::in_memory());
    let walker = FeedWalker::new(root(), source, persister(&store));

    let pending = walker.get_entries().unwrap();
    assert_eq!(pending.len(), 2);
    assert_eq!(walker.source().fetched().len(), 2);
}

#[test]
fn transport_failure_aborts_walk() {
    let source = MockSource::default().page(
        "http://example.org/feed",
        Some("http://example.org/missing"),
        &["urn:a"],
    );
    let store = Arc::new(JsonStore::in_memory());
    let walker = FeedWalker::new(root(), source, persister(&store));

    let err = walker.ingest().unwrap_err();
    assert_matches!(err, IngestError::FeedStatus { status: 404, .. });
    let persister = walker.persister();
    assert!(
        persister
            .is_new(&FeedContext::default(), &FeedEntry::new("urn:a"))
            .unwrap()
    );
}

#[test]
fn failing_feed_does_not_stop_the_others() {
    let store = Arc::new(JsonStore::in_memory());
    let urls = [
        "http://a.example.org/feed",
        "http://b.example.org/feed",
        "http://c.example.org/feed",
    ];
    // b serves nothing, so fetching it fails with 404.
    let walkers = urls.into_iter().map(|url| {
        let source = if url.contains("//b.") {
            MockSource::default()
        } else {
            MockSource::default().page(url, None, &[url])
        };
        FeedWalker::new(url.parse().unwrap(), source, persister(&store))
    });

    let (reports, first_error) = walker::ingest_all(walkers);

    let feeds = reports.iter().map(|r| r.feed.as_str()).collect::<Vec<_>>();
    assert_eq!(feeds, vec!["http://a.example.org/feed", "http://c.example.org/feed"]);
    assert!(reports.iter().all(|r| r.entries.len() == 1));
    assert_matches!(first_error, Some(IngestError::FeedStatus { status: 404, .. }));
}

const PAGE_ONE: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <id>urn:feed:local</id>
  <title>Local</title>
  <updated>2011-03-02T10:00:00Z</updated>
  <author><name>facility</name></author>
  <link rel="next" href="page2.xml"/>
  <entry>
    <id>urn:local:2</id>
    <title>Second</title>
    <updated>2011-03-02T10:00:00Z</updated>
    <link rel="enclosure" href="http://example.org/data/second.tif"/>
  </entry>
</feed>"#;

const PAGE_TWO: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <id>urn:feed:local</id>
  <title>Local</title>
  <updated>2011-03-02T10:00:00Z</updated>
  <entry>
    <id>urn:local:1</id>
    <title>First</title>
    <updated>2011-03-01T10:00:00Z</updated>
    <author><name>alice</name><email>alice@example.org</email></author>
  </entry>
</feed>"#;

#[test]
fn local_feed_files_are_walked() {
    let temp = tempfile::tempdir().unwrap();
    fs::write(temp.path().join("page1.xml"), PAGE_ONE).unwrap();
    fs::write(temp.path().join("page2.xml"), PAGE_TWO).unwrap();
    let root: FeedUrl = temp
        .path()
        .join("page1.xml")
        .to_str()
        .unwrap()
        .parse()
        .unwrap();

    let store = Arc::new(JsonStore::in_memory());
    let source = HttpFeedSource::new(Credentials::default()).unwrap();
    let walker = FeedWalker::new(root, source, persister(&store));
    let report = walker.ingest().unwrap();

    let ids = report
        .entries
        .iter()
        .map(|e| e.entry_id.as_str())
        .collect::<Vec<_>>();
    assert_eq!(ids, vec!["urn:local:1", "urn:local:2"]);
    assert_eq!(report.pages_fetched, 2);

    assert_eq!(report.entries[0].data_files, 0);
    let second = &report.entries[1];
    assert_eq!(second.data_files, 1);
    let files = store.datafiles(second.dataset_id).unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].filename, "second.tif");
    assert!(store.user_by_username("facility").unwrap().is_some());
    assert!(store.user_by_email("alice@example.org").unwrap().is_some());
}
