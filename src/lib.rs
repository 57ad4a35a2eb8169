//! Idempotent ingestion of Atom/RSS feeds describing scientific datasets.
//!
//! A [`walker::FeedWalker`] pages through a feed until it meets an entry it
//! has already ingested, then hands the unseen entries, oldest first, to an
//! [`persister::AtomPersister`]. Each entry becomes one dataset, filed under
//! an experiment derived from the entry's metadata, with its enclosures
//! registered as data files and queued for retrieval.

pub mod config;
pub mod domain;
pub mod error;
pub mod feed;
pub mod identity;
pub mod output;
pub mod persister;
pub mod retrieval;
pub mod schema;
pub mod store;
pub mod transport;
pub mod walker;
