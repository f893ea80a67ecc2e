//! Atom 1.0 + Atom Publishing Protocol wire vocabulary.
//!
//! The subset served here: feeds, entries, sources, the service document
//! (workspaces, collections, categories, accept) and publishing control.
//! Canonical serialization lives in [`write`], parsing in [`read`],
//! the validation state machine in [`validate`] and the plain-text
//! ingestion pipeline in [`ingest`].

use time::OffsetDateTime;

pub mod ingest;
pub mod read;
pub mod validate;
pub mod write;

pub const ATOM_NS: &str = "http://www.w3.org/2005/Atom";
pub const APP_NS: &str = "http://www.w3.org/2007/app";
pub const XHTML_NS: &str = "http://www.w3.org/1999/xhtml";

/// Resolved namespace + local name of a parsed element.
///
/// Kept on the constructs so validation can reject elements that arrived
/// under the wrong namespace.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct XmlName {
    pub ns: String,
    pub local: String,
}

impl XmlName {
    pub fn atom(local: &str) -> Self {
        XmlName { ns: ATOM_NS.to_string(), local: local.to_string() }
    }

    pub fn app(local: &str) -> Self {
        XmlName { ns: APP_NS.to_string(), local: local.to_string() }
    }

    pub fn is(&self, ns: &str, local: &str) -> bool {
        self.ns == ns && self.local == local
    }
}

/// `atom:id`, `atom:icon`, `atom:logo`, `atom:uri`: an element whose
/// character data is an IRI.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Uri {
    pub tag: XmlName,
    pub target: String,
}

impl Uri {
    pub fn atom(local: &str, target: impl Into<String>) -> Self {
        Uri { tag: XmlName::atom(local), target: target.into() }
    }
}

/// Id equality for "the id may never change" checks and for deciding when
/// an embedded source is redundant. Both absent counts as equal; one absent
/// does not.
pub fn same_id(a: Option<&Uri>, b: Option<&Uri>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// `atom:updated`, `atom:published`, `app:edited`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DateConstruct {
    pub tag: XmlName,
    pub at: OffsetDateTime,
}

impl Default for DateConstruct {
    fn default() -> Self {
        DateConstruct { tag: XmlName::default(), at: OffsetDateTime::UNIX_EPOCH }
    }
}

impl DateConstruct {
    pub fn updated(at: OffsetDateTime) -> Self {
        DateConstruct { tag: XmlName::atom("updated"), at }
    }

    pub fn set(&mut self, at: OffsetDateTime) {
        self.at = at;
    }
}

/// `atom:title`, `atom:subtitle`, `atom:summary`, `atom:rights`.
/// `text` holds the raw inner XML; an empty `kind` means `text`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TextConstruct {
    pub tag: XmlName,
    pub kind: String,
    pub text: String,
}

impl TextConstruct {
    pub fn text(local: &str, text: impl Into<String>) -> Self {
        TextConstruct { tag: XmlName::atom(local), kind: String::new(), text: text.into() }
    }
}

/// `atom:author` / `atom:contributor`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Person {
    pub tag: XmlName,
    pub name: String,
    pub uri: Option<Uri>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Link {
    pub href: String,
    pub rel: String,
    pub kind: String,
    pub hreflang: String,
    pub title: String,
    pub length: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Category {
    pub term: String,
    pub scheme: String,
    pub label: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Generator {
    pub uri: String,
    pub version: String,
    pub text: String,
}

/// Entry content: inline (`kind` of text/html/xhtml or a media type with the
/// raw inner XML in `body`) or out of line (`src` set, empty body).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Content {
    pub kind: String,
    pub src: String,
    pub body: Vec<u8>,
}

/// `app:control`; only `<draft>yes</draft>` is ever serialized.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PublishingControl {
    pub draft: String,
}

/// The `<source>` element embedded in a standalone entry: a projection of the
/// owning feed's metadata, never a full entity of its own.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceProjection {
    pub id: Uri,
    pub authors: Vec<Person>,
    pub rights: Option<TextConstruct>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Entry {
    pub id: Uri,
    pub updated: DateConstruct,
    pub authors: Vec<Person>,
    pub title: TextConstruct,
    pub links: Vec<Link>,
    pub content: Content,
    pub categories: Vec<Category>,
    pub contributors: Vec<Person>,
    pub published: Option<DateConstruct>,
    pub summary: Option<TextConstruct>,
    pub rights: Option<TextConstruct>,
    pub source: Option<SourceProjection>,
    pub edited: Option<DateConstruct>,
    pub control: Option<PublishingControl>,
}

/// Wire-level feed: the parse target for POST/PUT bodies and the response
/// view for GET. The validated, stored form of feed metadata is [`Source`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Feed {
    pub id: Option<Uri>,
    pub updated: Option<DateConstruct>,
    pub authors: Vec<Person>,
    pub title: Option<TextConstruct>,
    pub links: Vec<Link>,
    pub entries: Vec<Entry>,
    pub categories: Vec<Category>,
    pub contributors: Vec<Person>,
    pub icon: Option<Uri>,
    pub logo: Option<Uri>,
    pub generator: Option<Generator>,
    pub subtitle: Option<TextConstruct>,
    pub rights: Option<TextConstruct>,
    pub collection: Option<Collection>,
}

/// Feed metadata as held in the feed map and staged into the store.
/// Id, updated and title are guaranteed present once a source exists.
#[derive(Clone, Debug, PartialEq)]
pub struct Source {
    pub id: Uri,
    pub updated: DateConstruct,
    pub title: TextConstruct,
    pub authors: Vec<Person>,
    pub links: Vec<Link>,
    pub categories: Vec<Category>,
    pub contributors: Vec<Person>,
    pub icon: Option<Uri>,
    pub logo: Option<Uri>,
    pub generator: Option<Generator>,
    pub subtitle: Option<TextConstruct>,
    pub rights: Option<TextConstruct>,
}

impl Source {
    /// The `<source>` view used when validating or serializing a standalone
    /// entry that belongs to this feed.
    pub fn projection(&self) -> SourceProjection {
        SourceProjection {
            id: self.id.clone(),
            authors: self.authors.clone(),
            rights: self.rights.clone(),
        }
    }
}

/// APP service document.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Service {
    pub workspaces: Vec<Workspace>,
}

/// A named group of collection slots. Deleted collections leave holes;
/// creation fills the first hole before appending.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Workspace {
    pub title: TextConstruct,
    pub collections: Vec<Option<Collection>>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Collection {
    pub href: String,
    pub title: TextConstruct,
    pub categories: Vec<Categories>,
    pub accepts: Vec<Accept>,
}

/// `app:categories`: inline (scheme/fixed + category children) or
/// out of line (`href` set).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Categories {
    pub fixed: String,
    pub scheme: String,
    pub href: String,
    pub categories: Vec<Category>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Accept {
    pub text: String,
}
