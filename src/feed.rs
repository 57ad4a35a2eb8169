//! Feed documents as seen by the ingester.
//!
//! Parsing is delegated to `feed-rs`; this module narrows its model down to
//! the fields ingestion reads, with every optional attribute spelled out as an
//! `Option` instead of being looked up at runtime.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;

use crate::error::IngestError;

/// Filename used when a URL ends in a slash.
pub const FALLBACK_FILENAME: &str = "download";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedDocument {
    pub feed: FeedContext,
    pub entries: Vec<FeedEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FeedContext {
    pub id: String,
    pub title: Option<String>,
    pub author: Option<Author>,
    pub updated: Option<DateTime<Utc>>,
    pub links: Vec<Link>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FeedEntry {
    pub id: String,
    pub title: Option<String>,
    pub updated: Option<DateTime<Utc>>,
    pub author: Option<Author>,
    pub enclosures: Vec<Enclosure>,
    pub media_content: Vec<MediaContent>,
    pub categories: Vec<Category>,
    pub album: Option<Album>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Link {
    pub href: String,
    pub rel: Option<String>,
    pub title: Option<String>,
    pub media_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Author {
    pub name: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Enclosure {
    pub href: String,
    pub title: Option<String>,
    pub mime: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MediaContent {
    pub url: String,
    pub mime: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Category {
    pub scheme: Option<String>,
    pub term: String,
}

/// Photo-service album tags (`gphoto:albumid` / `gphoto:albumtitle`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Album {
    pub id: String,
    pub title: Option<String>,
}

impl FeedDocument {
    pub fn parse(source: &str, body: &[u8]) -> Result<Self, IngestError> {
        let parsed = feed_rs::parser::parse(body).map_err(|err| IngestError::FeedParse {
            url: source.to_string(),
            message: err.to_string(),
        })?;

        let mut entries = parsed
            .entries
            .into_iter()
            .map(FeedEntry::from)
            .collect::<Vec<_>>();

        // feed-rs drops extension elements, so albums are matched back by position.
        let albums = extract_albums(source, body)?;
        if albums.len() == entries.len() {
            for (entry, album) in entries.iter_mut().zip(albums) {
                entry.album = album;
            }
        }

        let feed = FeedContext {
            id: parsed.id,
            title: parsed.title.map(|text| text.content),
            author: parsed.authors.into_iter().find_map(Author::from_person),
            updated: parsed.updated,
            links: parsed.links.into_iter().map(Link::from).collect(),
        };

        Ok(Self { feed, entries })
    }

    /// Target of the first feed-level link with `rel="next"`.
    pub fn next_href(&self) -> Option<&str> {
        self.feed
            .links
            .iter()
            .find(|link| link.rel.as_deref() == Some("next"))
            .map(|link| link.href.as_str())
    }
}

impl FeedEntry {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }
}

impl Enclosure {
    pub fn filename(&self) -> String {
        match &self.title {
            Some(title) => title.clone(),
            None => url_basename(&self.href),
        }
    }
}

impl MediaContent {
    pub fn filename(&self) -> String {
        url_basename(&self.url)
    }
}

impl Author {
    fn from_person(person: feed_rs::model::Person) -> Option<Self> {
        let name = person.name.trim().to_string();
        let email = person
            .email
            .map(|email| email.trim().to_string())
            .filter(|email| !email.is_empty());
        if name.is_empty() && email.is_none() {
            return None;
        }
        Some(Self { name, email })
    }
}

impl From<feed_rs::model::Link> for Link {
    fn from(link: feed_rs::model::Link) -> Self {
        Self {
            href: link.href,
            rel: link.rel,
            title: link.title,
            media_type: link.media_type,
        }
    }
}

impl From<feed_rs::model::Entry> for FeedEntry {
    fn from(entry: feed_rs::model::Entry) -> Self {
        let enclosures = entry
            .links
            .iter()
            .filter(|link| link.rel.as_deref() == Some("enclosure"))
            .map(|link| Enclosure {
                href: link.href.clone(),
                title: link.title.clone(),
                mime: link.media_type.clone(),
            })
            .collect();

        let media_content = entry
            .media
            .iter()
            .flat_map(|object| object.content.iter())
            .filter_map(|content| {
                let url = content.url.as_ref()?;
                Some(MediaContent {
                    url: url.to_string(),
                    mime: content.content_type.as_ref().map(|mime| mime.to_string()),
                })
            })
            .collect();

        let categories = entry
            .categories
            .into_iter()
            .map(|category| Category {
                scheme: category.scheme,
                term: category.term,
            })
            .collect();

        Self {
            id: entry.id,
            title: entry.title.map(|text| text.content),
            updated: entry.updated.or(entry.published),
            author: entry.authors.into_iter().find_map(Author::from_person),
            enclosures,
            media_content,
            categories,
            album: None,
        }
    }
}

/// Final path segment of a URL, ignoring query string and fragment.
pub fn url_basename(url: &str) -> String {
    let path = url
        .split(['?', '#'])
        .next()
        .unwrap_or_default();
    let name = path.rsplit('/').next().unwrap_or_default();
    if name.is_empty() || path.ends_with("://") {
        return FALLBACK_FILENAME.to_string();
    }
    name.to_string()
}

const GPHOTO_NAMESPACE: &str = "http://schemas.google.com/photos/2007";

/// Album tags per `<entry>`/`<item>` block, in document order. The element
/// prefix is whatever the document binds to the photo namespace.
fn extract_albums(source: &str, body: &[u8]) -> Result<Vec<Option<Album>>, IngestError> {
    let text = String::from_utf8_lossy(body);
    if !text.contains(GPHOTO_NAMESPACE) {
        return Ok(Vec::new());
    }
    let xmlns_re = album_regex(
        source,
        &format!(
            r#"xmlns:([A-Za-z_][\w.-]*)\s*=\s*["']{}["']"#,
            regex::escape(GPHOTO_NAMESPACE)
        ),
    )?;
    let Some(prefix) = xmlns_re.captures(&text).and_then(|caps| caps.get(1)) else {
        return Ok(Vec::new());
    };
    let prefix = regex::escape(prefix.as_str());

    let block_re = album_regex(
        source,
        r"(?s)<(?:[\w.-]+:)?(?:entry|item)[\s>].*?</(?:[\w.-]+:)?(?:entry|item)>",
    )?;
    let id_re = album_regex(
        source,
        &format!(r"<{prefix}:albumid>\s*([^<]*?)\s*</{prefix}:albumid>"),
    )?;
    let title_re = album_regex(
        source,
        &format!(r"<{prefix}:albumtitle>\s*([^<]*?)\s*</{prefix}:albumtitle>"),
    )?;
    let entity_re = album_regex(source, r"&(#[xX][0-9A-Fa-f]+|#[0-9]+|lt|gt|quot|apos|amp);")?;

    Ok(block_re
        .find_iter(&text)
        .map(|block| {
            let block = block.as_str();
            let id = id_re.captures(block)?.get(1)?.as_str();
            let title = title_re
                .captures(block)
                .and_then(|caps| caps.get(1))
                .map(|title| unescape_xml(&entity_re, title.as_str()));
            Some(Album {
                id: unescape_xml(&entity_re, id),
                title,
            })
        })
        .collect())
}

fn album_regex(source: &str, pattern: &str) -> Result<Regex, IngestError> {
    Regex::new(pattern).map_err(|err| IngestError::FeedParse {
        url: source.to_string(),
        message: err.to_string(),
    })
}

fn unescape_xml(entity_re: &Regex, value: &str) -> String {
    entity_re
        .replace_all(value, |caps: &regex::Captures<'_>| {
            let entity = &caps[1];
            let decoded = match entity {
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                "amp" => Some('&'),
                _ => {
                    let hex = entity
                        .strip_prefix("#x")
                        .or_else(|| entity.strip_prefix("#X"));
                    let code = match hex {
                        Some(hex) => u32::from_str_radix(hex, 16).ok(),
                        None => entity.trim_start_matches('#').parse().ok(),
                    };
                    code.and_then(char::from_u32)
                }
            };
            decoded.map_or_else(|| caps[0].to_string(), String::from)
        })
        .into_owned()
}
