//! In-memory authoritative state: the service document, the feed map and the
//! entry map, plus every per-resource operation of the publishing protocol.
//!
//! Mutations validate first, then stage into the store and commit, then
//! update the maps, so a failed commit on a create leaves no divergence.
//! In-place updates (PUT/DELETE) mutate before committing; a commit failure
//! there leaves memory ahead of disk until the next successful commit.
//!
//! Cross-references go through paths, not pointers: entries remember the
//! `/feed/<uuid>` path of their source, collections carry it as their href,
//! and both resolve against the feed map. That keeps restart-from-store a
//! pure rebuild.

use std::collections::BTreeMap;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::atom::ingest::{prepare_plain_text, prepare_put_content};
use crate::atom::validate::ValidateError;
use crate::atom::{
    same_id, Accept, Categories, Collection, Content, DateConstruct, Entry, Feed, Service, Source,
    SourceProjection, TextConstruct, Uri, Workspace, ATOM_NS,
};
use crate::error::ApiError;
use crate::store::{GitStore, StoreError};

pub mod etag;

pub use etag::{precondition, resource_etag};

pub const WORKSPACE_TITLE: &str = "default workspace";
pub const COLLECTION_ACCEPT: &str = "text/plain";

struct EntryRecord {
    entry: Entry,
    feed_path: String,
}

pub struct Model {
    service: Service,
    feeds: BTreeMap<String, Source>,
    entries: BTreeMap<String, EntryRecord>,
    store: GitStore,
}

fn now_micros() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    let truncated = now.nanosecond() / 1_000 * 1_000;
    now.replace_nanosecond(truncated).unwrap_or(now)
}

fn now_seconds() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    now.replace_nanosecond(0).unwrap_or(now)
}

fn collection_for(href: &str, title: &TextConstruct, categories: &[crate::atom::Category]) -> Collection {
    Collection {
        href: href.to_string(),
        title: title.clone(),
        categories: vec![Categories { categories: categories.to_vec(), ..Categories::default() }],
        accepts: vec![Accept { text: COLLECTION_ACCEPT.to_string() }],
    }
}

impl Model {
    /// Rebuild the authoritative state from the store's latest commit.
    pub fn new(store: GitStore) -> Result<Self, StoreError> {
        let corpus = store.load()?;

        let mut feeds = BTreeMap::new();
        let mut collections = Vec::new();
        for (path, source) in corpus.sources {
            if !source.title.tag.is(ATOM_NS, "title") {
                return Err(StoreError::Invalid {
                    name: path,
                    source: ValidateError::BadElement("title"),
                });
            }
            collections.push(Some(collection_for(&path, &source.title, &source.categories)));
            feeds.insert(path, source);
        }

        let mut entries = BTreeMap::new();
        for (path, feed_path, mut entry) in corpus.entries {
            // the parsed <source> projection did its job during load;
            // from here on the feed map is the single source of truth
            entry.source = None;
            entries.insert(path, EntryRecord { entry, feed_path });
        }

        let service = Service {
            workspaces: vec![Workspace {
                title: TextConstruct::text("title", WORKSPACE_TITLE),
                collections,
            }],
        };

        Ok(Model { service, feeds, entries, store })
    }

    pub fn service(&self) -> &Service {
        &self.service
    }

    pub fn feed_etag(&self, path: &str) -> Result<String, ApiError> {
        let source = self.feeds.get(path).ok_or(ApiError::NotFound)?;
        resource_etag(&source.id, &source.updated).map_err(ApiError::internal)
    }

    pub fn entry_etag(&self, path: &str) -> Result<String, ApiError> {
        let record = self.entries.get(path).ok_or(ApiError::NotFound)?;
        resource_etag(&record.entry.id, &record.entry.updated).map_err(ApiError::internal)
    }

    /// Synthesize the feed view: source metadata plus every owned entry,
    /// newest first.
    pub fn feed_view(&self, path: &str) -> Result<Feed, ApiError> {
        let source = self.feeds.get(path).ok_or(ApiError::NotFound)?;
        let mut records: Vec<&EntryRecord> =
            self.entries.values().filter(|r| r.feed_path == path).collect();
        records.sort_by(|a, b| b.entry.updated.at.cmp(&a.entry.updated.at));
        Ok(Feed {
            id: Some(source.id.clone()),
            authors: source.authors.clone(),
            updated: Some(source.updated.clone()),
            rights: source.rights.clone(),
            links: source.links.clone(),
            title: Some(source.title.clone()),
            subtitle: source.subtitle.clone(),
            icon: source.icon.clone(),
            logo: source.logo.clone(),
            categories: source.categories.clone(),
            entries: records.into_iter().map(|r| r.entry.clone()).collect(),
            ..Feed::default()
        })
    }

    pub fn entry_view(&self, path: &str) -> Result<(&Entry, SourceProjection), ApiError> {
        let record = self.entries.get(path).ok_or(ApiError::NotFound)?;
        let source = self
            .feeds
            .get(&record.feed_path)
            .ok_or_else(|| ApiError::Internal("entry without a source".into()))?;
        Ok((&record.entry, source.projection()))
    }

    /// POST to the root: create a feed. A parseable client-supplied urn:uuid
    /// id is honored unless taken; anything else gets a fresh uuid.
    pub fn create_feed(
        &mut self,
        mut new_feed: Feed,
        message: &str,
    ) -> Result<(Feed, String), ApiError> {
        if new_feed.title.is_none() || new_feed.authors.is_empty() {
            return Err(ApiError::BadRequest(
                "need to set <title> and <author> for new feeds".into(),
            ));
        }

        let uuid = new_feed
            .id
            .as_ref()
            .and_then(|id| Uuid::parse_str(&id.target).ok())
            .unwrap_or_else(Uuid::new_v4);
        let feed_path = format!("/feed/{uuid}");
        if self.feeds.contains_key(&feed_path) {
            return Err(ApiError::Conflict("feed with given URI already exists".into()));
        }

        new_feed.id = Some(Uri::atom("id", format!("urn:uuid:{uuid}")));
        new_feed.updated = Some(DateConstruct::updated(now_micros()));
        let title = new_feed
            .title
            .clone()
            .ok_or_else(|| ApiError::internal("missing title"))?;
        new_feed.collection = Some(collection_for(&feed_path, &title, &new_feed.categories));
        new_feed.validate().map_err(ApiError::bad_request)?;

        let source = Source {
            id: new_feed.id.clone().ok_or_else(|| ApiError::internal("missing id"))?,
            updated: new_feed.updated.clone().ok_or_else(|| ApiError::internal("missing updated"))?,
            title,
            authors: new_feed.authors.clone(),
            links: new_feed.links.clone(),
            categories: new_feed.categories.clone(),
            contributors: new_feed.contributors.clone(),
            icon: new_feed.icon.clone(),
            logo: new_feed.logo.clone(),
            generator: None,
            subtitle: new_feed.subtitle.clone(),
            rights: new_feed.rights.clone(),
        };

        self.store.stage_source(&source)?;
        self.store.commit(message)?;
        self.feeds.insert(feed_path.clone(), source);

        if let Some(workspace) = self.service.workspaces.first_mut() {
            match workspace.collections.iter_mut().find(|slot| slot.is_none()) {
                Some(hole) => *hole = new_feed.collection.clone(),
                None => workspace.collections.push(new_feed.collection.clone()),
            }
        }
        Ok((new_feed, feed_path))
    }

    /// PUT a feed: replace the updatable metadata, mirror title and
    /// categories into the collection descriptor, bump `updated`.
    pub fn update_feed(
        &mut self,
        path: &str,
        mut new_feed: Feed,
        message: &str,
    ) -> Result<(), ApiError> {
        let stored = self.feeds.get(path).ok_or(ApiError::NotFound)?;

        // an absent or empty id inherits the stored one; a different id is
        // an attempt to change the resource URI
        match &new_feed.id {
            Some(id) if !id.target.is_empty() => {
                if !same_id(Some(&stored.id), new_feed.id.as_ref()) {
                    return Err(ApiError::BadRequest("cannot change the URI of the feed".into()));
                }
            }
            _ => new_feed.id = Some(stored.id.clone()),
        }
        if new_feed.updated.is_none() {
            new_feed.updated = Some(stored.updated.clone());
        }
        new_feed.validate().map_err(ApiError::bad_request)?;

        let source = self.feeds.get_mut(path).ok_or(ApiError::NotFound)?;
        source.title = new_feed
            .title
            .ok_or_else(|| ApiError::internal("validated feed lost its title"))?;
        source.subtitle = new_feed.subtitle;
        source.authors = new_feed.authors;
        source.contributors = new_feed.contributors;
        source.icon = new_feed.icon;
        source.logo = new_feed.logo;
        source.links = new_feed.links;
        source.rights = new_feed.rights;
        source.categories = new_feed.categories;
        source.updated.set(now_micros());

        self.refresh_collection(path);

        let source = self.feeds.get(path).ok_or(ApiError::NotFound)?;
        self.store.stage_source(source)?;
        self.store.commit(message)?;
        Ok(())
    }

    /// DELETE a feed: cascade to every owned entry and turn the collection
    /// slot into a hole. The slot list never compacts.
    pub fn delete_feed(&mut self, path: &str, message: &str) -> Result<(), ApiError> {
        let source = self.feeds.get(path).ok_or(ApiError::NotFound)?;
        let source_id = source.id.clone();
        self.store.unstage_source(&source_id)?;

        let doomed: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, record)| record.feed_path == path)
            .map(|(entry_path, _)| entry_path.clone())
            .collect();
        for entry_path in &doomed {
            if let Some(record) = self.entries.get(entry_path) {
                self.store.unstage_entry(&record.entry.id)?;
            }
            self.entries.remove(entry_path);
        }
        self.feeds.remove(path);

        if let Some(workspace) = self.service.workspaces.first_mut() {
            for slot in workspace.collections.iter_mut() {
                if slot.as_ref().is_some_and(|c| c.href == path) {
                    *slot = None;
                }
            }
        }

        self.store.commit(message)?;
        Ok(())
    }

    /// POST to a collection: run the plain-text ingestion and create an
    /// entry. The `Slug` header seeds the title; source categories whose
    /// term was extracted by the ingestion are copied onto the entry.
    pub fn create_entry(
        &mut self,
        path: &str,
        content_type: &str,
        slug: &str,
        body: &[u8],
        message: &str,
    ) -> Result<(Entry, SourceProjection, String), ApiError> {
        let mut collection_found = false;
        let mut accepted = false;
        for workspace in &self.service.workspaces {
            for collection in workspace.collections.iter().flatten() {
                if collection.href == path {
                    collection_found = true;
                    accepted = collection
                        .accepts
                        .iter()
                        .any(|a| a.text.eq_ignore_ascii_case(content_type));
                }
            }
        }
        if !collection_found {
            return Err(ApiError::NotFound);
        }
        if !accepted {
            return Err(ApiError::UnsupportedMediaType(
                "collection does not accept this content type".into(),
            ));
        }
        if !content_type.eq_ignore_ascii_case(COLLECTION_ACCEPT) {
            return Err(ApiError::Internal("backend only accepts text/plain".into()));
        }

        let (xhtml, terms) = prepare_plain_text(body);
        let uuid = Uuid::new_v4();
        let mut entry = Entry {
            id: Uri::atom("id", format!("urn:uuid:{uuid}")),
            updated: DateConstruct::updated(now_seconds()),
            title: TextConstruct::text("title", if slug.is_empty() { "Untitled" } else { slug }),
            content: Content { kind: "xhtml".into(), src: String::new(), body: xhtml },
            ..Entry::default()
        };

        let source = self
            .feeds
            .get(path)
            .ok_or_else(|| ApiError::Internal("collection without a source".into()))?;
        for term in &terms {
            for category in &source.categories {
                if &category.term == term {
                    entry.categories.push(category.clone());
                }
            }
        }
        let projection = source.projection();
        entry.validate(None, Some(&projection)).map_err(ApiError::bad_request)?;

        if let Some(source) = self.feeds.get_mut(path) {
            source.updated.set(now_micros());
        }
        let source = self
            .feeds
            .get(path)
            .ok_or_else(|| ApiError::Internal("collection without a source".into()))?;
        self.store.stage_entry(&entry, &projection)?;
        self.store.stage_source(source)?;
        self.store.commit(message)?;

        let entry_path = format!("/entry/{uuid}");
        self.entries.insert(
            entry_path.clone(),
            EntryRecord { entry: entry.clone(), feed_path: path.to_string() },
        );
        Ok((entry, projection, entry_path))
    }

    /// PUT an entry: id and source binding are immutable, the content must
    /// stay inline xhtml and pass the PUT validator, title/summary/rights
    /// must stay plain text. Bumps the entry (seconds) and the source
    /// (microseconds).
    pub fn update_entry(
        &mut self,
        path: &str,
        mut new_entry: Entry,
        message: &str,
    ) -> Result<(), ApiError> {
        let record = self.entries.get(path).ok_or(ApiError::NotFound)?;
        let feed_path = record.feed_path.clone();
        let source = self
            .feeds
            .get(&feed_path)
            .ok_or_else(|| ApiError::Internal("entry without a source".into()))?;
        let projection = source.projection();

        // the submitted <source> is discarded; the binding cannot change
        new_entry.source = None;
        new_entry
            .validate(None, Some(&projection))
            .map_err(|_| ApiError::BadRequest("invalid atom entry".into()))?;
        if !same_id(Some(&record.entry.id), Some(&new_entry.id)) {
            return Err(ApiError::BadRequest("cannot change the URI of the entry".into()));
        }
        if !(new_entry.title.kind.is_empty() || new_entry.title.kind == "text") {
            return Err(ApiError::BadRequest("title type must be \"text\"".into()));
        }
        if new_entry
            .summary
            .as_ref()
            .is_some_and(|s| !(s.kind.is_empty() || s.kind == "text"))
        {
            return Err(ApiError::BadRequest("summary type must be \"text\"".into()));
        }
        if new_entry
            .rights
            .as_ref()
            .is_some_and(|r| !(r.kind.is_empty() || r.kind == "text"))
        {
            return Err(ApiError::BadRequest("rights type must be \"text\"".into()));
        }
        if new_entry.content.kind != "xhtml" {
            return Err(ApiError::BadRequest("cannot change content type from xhtml".into()));
        }
        if !new_entry.content.src.is_empty() {
            return Err(ApiError::BadRequest("content must be inline".into()));
        }
        let prepared = prepare_put_content(&new_entry.content.body).map_err(ApiError::bad_request)?;

        let entry_now = now_seconds();
        let source_now = now_micros();
        let record = self.entries.get_mut(path).ok_or(ApiError::NotFound)?;
        let entry = &mut record.entry;
        entry.title = new_entry.title;
        entry.summary = new_entry.summary;
        entry.rights = new_entry.rights;
        entry.authors = new_entry.authors;
        entry.contributors = new_entry.contributors;
        entry.control = new_entry.control;
        entry.links = new_entry.links;
        entry.categories = new_entry.categories;
        entry.content = Content { kind: new_entry.content.kind, src: String::new(), body: prepared };
        entry.updated.set(entry_now);
        if let Some(source) = self.feeds.get_mut(&feed_path) {
            source.updated.set(source_now);
        }

        let record = self.entries.get(path).ok_or(ApiError::NotFound)?;
        let source = self
            .feeds
            .get(&feed_path)
            .ok_or_else(|| ApiError::Internal("entry without a source".into()))?;
        self.store.stage_entry(&record.entry, &source.projection())?;
        self.store.stage_source(source)?;
        self.store.commit(message)?;
        Ok(())
    }

    pub fn delete_entry(&mut self, path: &str, message: &str) -> Result<(), ApiError> {
        let record = self.entries.get(path).ok_or(ApiError::NotFound)?;
        let feed_path = record.feed_path.clone();
        let entry_id = record.entry.id.clone();

        let source = self
            .feeds
            .get_mut(&feed_path)
            .ok_or_else(|| ApiError::Internal("entry without a source".into()))?;
        source.updated.set(now_micros());

        self.store.unstage_entry(&entry_id)?;
        let source = self
            .feeds
            .get(&feed_path)
            .ok_or_else(|| ApiError::Internal("entry without a source".into()))?;
        self.store.stage_source(source)?;
        self.store.commit(message)?;
        self.entries.remove(path);
        Ok(())
    }

    fn refresh_collection(&mut self, path: &str) {
        let Some(source) = self.feeds.get(path) else { return };
        let title = source.title.clone();
        let categories = source.categories.clone();
        if let Some(workspace) = self.service.workspaces.first_mut() {
            for collection in workspace.collections.iter_mut().flatten() {
                if collection.href == path {
                    collection.title = title.clone();
                    collection.categories =
                        vec![Categories { categories: categories.clone(), ..Categories::default() }];
                }
            }
        }
    }
}
