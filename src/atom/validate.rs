//! Validation state machine for feeds, entries, links and content.
//!
//! Rules follow RFC 4287/5023 as narrowed by this server: namespaced id and
//! updated are mandatory, feeds need a self link, author coverage may come
//! from the entry or its source, and content decides whether a summary is
//! required.

use thiserror::Error;
use url::Url;

use super::{same_id, Content, Entry, Feed, Link, Person, SourceProjection, Uri, APP_NS, ATOM_NS};

#[derive(Debug, Error)]
pub enum ValidateError {
    #[error("error: empty title")]
    EmptyTitle,

    #[error("error: bad {0} element")]
    BadElement(&'static str),

    #[error("error: feed needs author")]
    FeedNeedsAuthor,

    #[error("error: entry needs author")]
    EntryNeedsAuthor,

    #[error("needs link with self relation")]
    NeedsSelfLink,

    #[error("needs link with rel=alternate")]
    NeedsAlternateLink,

    #[error("needs summary")]
    NeedsSummary,

    #[error("empty href")]
    EmptyHref,

    #[error("cannot parse url {0}")]
    InvalidUrl(String),

    #[error("unknown link relation")]
    UnknownRelation,

    #[error("cannot parse media type {0}")]
    InvalidMediaType(String),

    #[error("body must be empty if src is set")]
    BodyWithSrc,

    #[error("Category is missing term")]
    MissingCategoryTerm,
}

/// Accepts any absolute URL plus relative references (collection hrefs and
/// entry paths are server-relative).
pub(crate) fn check_url(s: &str) -> Result<(), ValidateError> {
    match Url::parse(s) {
        Ok(_) | Err(url::ParseError::RelativeUrlWithoutBase) => Ok(()),
        Err(_) => Err(ValidateError::InvalidUrl(s.to_string())),
    }
}

pub(crate) fn check_media_type(s: &str) -> Result<mime::Mime, ValidateError> {
    s.parse::<mime::Mime>()
        .map_err(|_| ValidateError::InvalidMediaType(s.to_string()))
}

fn check_person(p: &Person, expected: &'static str) -> Result<(), ValidateError> {
    if !p.tag.is(ATOM_NS, expected) {
        return Err(ValidateError::BadElement(expected));
    }
    Ok(())
}

impl Feed {
    pub fn validate(&self) -> Result<(), ValidateError> {
        match &self.title {
            Some(t) if !t.text.is_empty() => {}
            _ => return Err(ValidateError::EmptyTitle),
        }
        match &self.updated {
            Some(u) if u.tag.is(ATOM_NS, "updated") => {}
            _ => return Err(ValidateError::BadElement("updated")),
        }
        match &self.id {
            Some(id) if id.tag.is(ATOM_NS, "id") => {}
            _ => return Err(ValidateError::BadElement("id")),
        }
        if let Some(n) = &self.icon {
            if !n.tag.is(ATOM_NS, "icon") {
                return Err(ValidateError::BadElement("icon"));
            }
        }
        if let Some(n) = &self.logo {
            if !n.tag.is(ATOM_NS, "logo") {
                return Err(ValidateError::BadElement("logo"));
            }
        }
        if let Some(n) = &self.rights {
            if !n.tag.is(ATOM_NS, "rights") {
                return Err(ValidateError::BadElement("rights"));
            }
        }
        if let Some(n) = &self.subtitle {
            if !n.tag.is(ATOM_NS, "subtitle") {
                return Err(ValidateError::BadElement("subtitle"));
            }
        }
        if let Some(t) = &self.title {
            if !t.tag.is(ATOM_NS, "title") {
                return Err(ValidateError::BadElement("title"));
            }
        }

        let mut needs_author = false;
        for entry in &self.entries {
            if !entry.validate(self.id.as_ref(), entry.source.as_ref())? {
                needs_author = true;
            }
        }
        if needs_author && self.authors.is_empty() {
            return Err(ValidateError::FeedNeedsAuthor);
        }
        for a in &self.authors {
            check_person(a, "author")?;
        }
        for c in &self.contributors {
            check_person(c, "contributor")?;
        }

        let mut needs_self = true;
        for l in &self.links {
            if l.validate()? == "self" {
                needs_self = false;
            }
        }
        if needs_self {
            return Err(ValidateError::NeedsSelfLink);
        }
        Ok(())
    }
}

/// Validate the `<source>` projection of an entry. Returns whether the
/// projection contributes author coverage. A projection whose id equals the
/// containing feed's id is elided from serialization and contributes nothing.
fn validate_source(
    feed_id: Option<&Uri>,
    source: Option<&SourceProjection>,
) -> Result<bool, ValidateError> {
    let Some(source) = source else { return Ok(false) };
    if same_id(feed_id, Some(&source.id)) {
        return Ok(false);
    }
    if !source.id.tag.is(ATOM_NS, "id") {
        return Err(ValidateError::BadElement("id"));
    }
    if let Some(r) = &source.rights {
        if !r.tag.is(ATOM_NS, "rights") {
            return Err(ValidateError::BadElement("rights"));
        }
    }
    let mut has_author = false;
    for a in &source.authors {
        check_person(a, "author")?;
        has_author = true;
    }
    Ok(has_author)
}

impl Entry {
    /// Validate the entry; returns whether it has author coverage.
    ///
    /// `feed_id` is the id of the containing feed when validating inside a
    /// feed document; standalone entries (`None`) must carry author coverage
    /// themselves (possibly via `source`).
    pub fn validate(
        &self,
        feed_id: Option<&Uri>,
        source: Option<&SourceProjection>,
    ) -> Result<bool, ValidateError> {
        if self.title.text.is_empty() {
            return Err(ValidateError::EmptyTitle);
        }
        if !self.updated.tag.is(ATOM_NS, "updated") {
            return Err(ValidateError::BadElement("updated"));
        }
        if !self.id.tag.is(ATOM_NS, "id") {
            return Err(ValidateError::BadElement("id"));
        }
        if let Some(p) = &self.published {
            if !p.tag.is(ATOM_NS, "published") {
                return Err(ValidateError::BadElement("published"));
            }
        }
        if let Some(e) = &self.edited {
            if !e.tag.is(APP_NS, "edited") {
                return Err(ValidateError::BadElement("edited"));
            }
        }
        let mut has_author = validate_source(feed_id, source)?;
        let (mut needs_alternate, needs_summary) = self.content.validate()?;
        if self.summary.is_none() && needs_summary {
            return Err(ValidateError::NeedsSummary);
        }
        for l in &self.links {
            if l.validate()? == "alternate" {
                needs_alternate = false;
            }
        }
        if needs_alternate {
            return Err(ValidateError::NeedsAlternateLink);
        }
        for a in &self.authors {
            check_person(a, "author")?;
            has_author = true;
        }
        for c in &self.contributors {
            check_person(c, "contributor")?;
        }
        if feed_id.is_none() && !has_author {
            return Err(ValidateError::EntryNeedsAuthor);
        }
        Ok(has_author)
    }
}

impl Content {
    /// Returns `(needs_alternate_link, needs_summary)`.
    pub fn validate(&self) -> Result<(bool, bool), ValidateError> {
        if !self.src.is_empty() {
            // out-of-line content
            check_url(&self.src)?;
            check_media_type(&self.kind)?;
            if !self.body.is_empty() {
                return Err(ValidateError::BodyWithSrc);
            }
            return Ok((false, true));
        }
        match self.kind.as_str() {
            "" | "text" | "html" | "xhtml" => Ok((false, false)),
            other => {
                let mt = check_media_type(other)?;
                if mt.type_() == mime::TEXT {
                    Ok((false, false))
                } else if mt.subtype() == "xml" || mt.suffix().is_some_and(|s| s == "xml") {
                    Ok((false, false))
                } else {
                    // opaque media would be base64; a summary must stand in
                    Ok((false, true))
                }
            }
        }
    }
}

impl Link {
    /// Returns the effective relation (empty rel means `alternate`).
    pub fn validate(&self) -> Result<&str, ValidateError> {
        if self.href.is_empty() {
            return Err(ValidateError::EmptyHref);
        }
        check_url(&self.href)?;
        match self.rel.as_str() {
            "" => Ok("alternate"),
            "self" | "related" | "alternate" | "enclosure" | "via" | "edit" | "edit-media" => {
                Ok(self.rel.as_str())
            }
            _ => Err(ValidateError::UnknownRelation),
        }
    }
}
