use std::sync::{Arc, Mutex};

use chrono::{TimeZone, Utc};

use atom_dataset_ingest::domain::{AclOwnership, DataFile, ParameterTarget, ParameterValue};
use atom_dataset_ingest::feed::{
    Album, Author, Category, Enclosure, FeedContext, FeedEntry, MediaContent,
};
use atom_dataset_ingest::identity::DEFAULT_EXPERIMENT_TITLE;
use atom_dataset_ingest::persister::{AtomPersister, EntryPersister};
use atom_dataset_ingest::retrieval::FileRetriever;
use atom_dataset_ingest::schema::{PARAM_ENTRY_ID, PARAM_UPDATED};
use atom_dataset_ingest::store::{JsonStore, RecordStore};

#[derive(Default)]
struct RecordingRetriever {
    queued: Mutex<Vec<DataFile>>,
}

impl RecordingRetriever {
    fn urls(&self) -> Vec<String> {
        self.queued
            .lock()
            .unwrap()
            .iter()
            .map(|file| file.url.clone())
            .collect()
    }
}

impl FileRetriever for RecordingRetriever {
    fn enqueue(&self, file: &DataFile) {
        self.queued.lock().unwrap().push(file.clone());
    }
}

fn persister() -> AtomPersister<JsonStore, RecordingRetriever> {
    AtomPersister::new(Arc::new(JsonStore::in_memory()), RecordingRetriever::default())
}

fn author(name: &str, email: Option<&str>) -> Option<Author> {
    Some(Author {
        name: name.to_string(),
        email: email.map(str::to_string),
    })
}

fn enclosure(href: &str, title: Option<&str>) -> Enclosure {
    Enclosure {
        href: href.to_string(),
        title: title.map(str::to_string),
        mime: Some("image/tiff".to_string()),
    }
}

fn categorized(id: &str, experiment_id: &str, title: &str) -> FeedEntry {
    let mut entry = FeedEntry::new(id);
    entry.title = Some(format!("Entry {id}"));
    entry.author = author("alice", Some("alice@example.org"));
    entry.categories = vec![
        Category {
            scheme: Some("http://example.org/schemes#ExperimentID".to_string()),
            term: experiment_id.to_string(),
        },
        Category {
            scheme: Some("http://example.org/schemes#ExperimentTitle".to_string()),
            term: title.to_string(),
        },
    ];
    entry
}

#[test]
fn process_is_idempotent() {
    let persister = persister();
    let feed = FeedContext::default();
    let mut entry = categorized("urn:entry:1", "exp-1", "Crystal growth");
    entry.enclosures = vec![enclosure("http://example.org/data/a.tif", None)];

    assert!(persister.is_new(&feed, &entry).unwrap());
    let first = persister.process(&feed, &entry).unwrap();
    assert!(!persister.is_new(&feed, &entry).unwrap());
    let second = persister.process(&feed, &entry).unwrap();

    assert_eq!(first, second);
    assert_eq!(persister.store().datafiles(first.id).unwrap().len(), 1);
    assert_eq!(persister.retriever().urls(), vec!["http://example.org/data/a.tif"]);
}

#[test]
fn dataset_carries_entry_parameters() {
    let persister = persister();
    let updated = Utc.with_ymd_and_hms(2011, 3, 2, 10, 0, 0).unwrap();
    let mut entry = categorized("urn:entry:params", "exp-1", "Crystal growth");
    entry.updated = Some(updated);

    let dataset = persister.process(&FeedContext::default(), &entry).unwrap();
    assert_eq!(dataset.description, "Entry urn:entry:params");

    let sets = persister
        .store()
        .parameter_sets(ParameterTarget::Dataset(dataset.id))
        .unwrap();
    assert_eq!(sets.len(), 1);
    assert_eq!(
        sets[0].get(PARAM_ENTRY_ID),
        Some(&ParameterValue::String("urn:entry:params".to_string()))
    );
    assert_eq!(
        sets[0].get(PARAM_UPDATED).and_then(ParameterValue::as_datetime),
        Some(updated)
    );
}

#[test]
fn updated_falls_back_to_feed_timestamp() {
    let persister = persister();
    let feed_updated = Utc.with_ymd_and_hms(2012, 1, 1, 0, 0, 0).unwrap();
    let feed = FeedContext {
        updated: Some(feed_updated),
        ..FeedContext::default()
    };

    let dataset = persister
        .process(&feed, &FeedEntry::new("urn:entry:rss-item"))
        .unwrap();
    let sets = persister
        .store()
        .parameter_sets(ParameterTarget::Dataset(dataset.id))
        .unwrap();
    assert_eq!(
        sets[0].get(PARAM_UPDATED).and_then(ParameterValue::as_datetime),
        Some(feed_updated)
    );
}

#[test]
fn one_experiment_per_derived_id() {
    let persister = persister();
    let feed = FeedContext::default();

    let a = persister
        .process(&feed, &categorized("urn:entry:a", "exp-7", "Shared"))
        .unwrap();
    let b = persister
        .process(&feed, &categorized("urn:entry:b", "exp-7", "Shared"))
        .unwrap();
    let c = persister
        .process(&feed, &categorized("urn:entry:c", "exp-8", "Other"))
        .unwrap();

    assert_ne!(a.id, b.id);
    assert_eq!(a.experiment, b.experiment);
    assert_ne!(a.experiment, c.experiment);

    let experiment = persister.store().experiment(a.experiment).unwrap().unwrap();
    assert_eq!(experiment.title, "Shared");
}

#[test]
fn experiment_gets_single_owner_acl() {
    let persister = persister();
    let feed = FeedContext::default();
    let first = persister
        .process(&feed, &categorized("urn:entry:1", "exp-1", "Acl"))
        .unwrap();
    persister
        .process(&feed, &categorized("urn:entry:2", "exp-1", "Acl"))
        .unwrap();

    let experiment = persister.store().experiment(first.experiment).unwrap().unwrap();
    let acls = persister.store().experiment_acls(experiment.id).unwrap();
    assert_eq!(acls.len(), 1);
    let grant = &acls[0].grant;
    assert_eq!(grant.entity_id, experiment.created_by);
    assert!(grant.can_read && grant.can_write && grant.can_delete && grant.is_owner);
    assert_eq!(grant.ownership, AclOwnership::OwnerOwned);
}

#[test]
fn album_takes_priority_over_categories() {
    let persister = persister();
    let mut entry = categorized("urn:entry:photo", "exp-1", "Categories");
    entry.album = Some(Album {
        id: "5512".to_string(),
        title: Some("Field trip".to_string()),
    });

    let dataset = persister.process(&FeedContext::default(), &entry).unwrap();
    let experiment = persister.store().experiment(dataset.experiment).unwrap().unwrap();
    assert_eq!(experiment.title, "Field trip");
}

#[test]
fn partial_categories_use_default_experiment() {
    let persister = persister();
    let mut entry = categorized("urn:entry:partial", "exp-1", "Ignored");
    entry.categories.truncate(1);

    let dataset = persister.process(&FeedContext::default(), &entry).unwrap();
    let experiment = persister.store().experiment(dataset.experiment).unwrap().unwrap();
    assert_eq!(experiment.title, DEFAULT_EXPERIMENT_TITLE);
}

#[test]
fn filenames_come_from_title_or_url() {
    let persister = persister();
    let mut entry = categorized("urn:entry:files", "exp-1", "Files");
    entry.enclosures = vec![
        enclosure("http://example.org/data/frame_001.tif", None),
        enclosure("http://example.org/data/frame_002.tif", Some("Second frame")),
    ];
    entry.media_content = vec![MediaContent {
        url: "http://example.org/media/preview.jpg?size=large".to_string(),
        mime: Some("image/jpeg".to_string()),
    }];

    let dataset = persister.process(&FeedContext::default(), &entry).unwrap();
    let files = persister.store().datafiles(dataset.id).unwrap();
    let names = files.iter().map(|f| f.filename.as_str()).collect::<Vec<_>>();
    assert_eq!(names, vec!["frame_001.tif", "Second frame", "preview.jpg"]);
    assert_eq!(files[2].mimetype.as_deref(), Some("image/jpeg"));
}

#[test]
fn repeated_urls_are_not_deduplicated() {
    let persister = persister();
    let mut entry = categorized("urn:entry:dupes", "exp-1", "Dupes");
    entry.enclosures = vec![
        enclosure("http://example.org/data/same.tif", None),
        enclosure("http://example.org/data/same.tif", None),
    ];

    let dataset = persister.process(&FeedContext::default(), &entry).unwrap();
    assert_eq!(persister.store().datafiles(dataset.id).unwrap().len(), 2);
    assert_eq!(persister.retriever().urls().len(), 2);
}

#[test]
fn same_url_in_enclosure_and_media_yields_two_files() {
    let persister = persister();
    let mut entry = categorized("urn:entry:both", "exp-1", "Both");
    entry.enclosures = vec![enclosure("http://example.org/data/scan.tif", None)];
    entry.media_content = vec![MediaContent {
        url: "http://example.org/data/scan.tif".to_string(),
        mime: Some("image/tiff".to_string()),
    }];

    let dataset = persister.process(&FeedContext::default(), &entry).unwrap();
    let files = persister.store().datafiles(dataset.id).unwrap();
    assert_eq!(files.len(), 2);
    assert_ne!(files[0].id, files[1].id);
    assert!(files.iter().all(|file| file.url == "http://example.org/data/scan.tif"));
    assert_eq!(persister.retriever().urls().len(), 2);
}

#[test]
fn reprocessing_ignores_advanced_updated() {
    let persister = persister();
    let feed = FeedContext::default();
    let original = Utc.with_ymd_and_hms(2011, 3, 2, 10, 0, 0).unwrap();
    let mut entry = categorized("urn:entry:revised", "exp-1", "Revised");
    entry.updated = Some(original);
    entry.enclosures = vec![enclosure("http://example.org/data/v1.tif", None)];
    let first = persister.process(&feed, &entry).unwrap();

    entry.updated = Some(Utc.with_ymd_and_hms(2011, 4, 1, 0, 0, 0).unwrap());
    entry.title = Some("Revised title".to_string());
    entry.enclosures = vec![enclosure("http://example.org/data/v2.tif", None)];
    assert!(!persister.is_new(&feed, &entry).unwrap());
    let second = persister.process(&feed, &entry).unwrap();

    assert_eq!(first, second);
    assert_eq!(second.description, "Entry urn:entry:revised");
    let sets = persister
        .store()
        .parameter_sets(ParameterTarget::Dataset(second.id))
        .unwrap();
    assert_eq!(sets.len(), 1);
    assert_eq!(
        sets[0].get(PARAM_UPDATED).and_then(ParameterValue::as_datetime),
        Some(original)
    );
    assert_eq!(persister.store().datafiles(second.id).unwrap().len(), 1);
    assert_eq!(persister.retriever().urls(), vec!["http://example.org/data/v1.tif"]);
}
