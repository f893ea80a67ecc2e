//! Canonical ordered serialization.
//!
//! Element order, attribute order and the self-closing rules here are the
//! contract: the store hashes these bytes and ETags are derived from the
//! `<id>` + `<updated>` serialization, so the writer is deterministic down
//! to the byte. Text constructs and content bodies hold raw inner XML and
//! are written through untouched.

use thiserror::Error;
use time::format_description::well_known::Rfc3339;

use super::validate::{check_media_type, check_url, ValidateError};
use super::{
    Accept, Categories, Category, Collection, Content, DateConstruct, Entry, Feed, Generator,
    Link, Person, PublishingControl, Service, Source, SourceProjection, TextConstruct, Uri,
    APP_NS, ATOM_NS,
};

pub const XML_PROLOG: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n";

/// Namespace of the element enclosing the one being written; decides
/// whether atom-vocabulary children need an `atom:` prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Parent {
    Atom,
    App,
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("unknown {0} xmlns")]
    UnknownXmlns(&'static str),

    #[error("{0}")]
    Invalid(#[from] ValidateError),

    #[error("empty collection href")]
    EmptyCollectionHref,

    #[error("unknown fixed attribute")]
    UnknownFixed,

    #[error("service document requires at least one workspace")]
    NoWorkspace,

    #[error("cannot format date: {0}")]
    Date(#[from] time::error::Format),
}

fn push(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(s.as_bytes());
}

pub fn write_feed(out: &mut Vec<u8>, f: &Feed) -> Result<(), WriteError> {
    f.validate()?;
    push(out, &format!("<feed xmlns=\"{ATOM_NS}\">"));
    write_uri_opt(out, f.id.as_ref())?;
    write_text_opt(out, f.title.as_ref(), Parent::Atom)?;
    write_text_opt(out, f.subtitle.as_ref(), Parent::Atom)?;
    write_date_opt(out, f.updated.as_ref())?;
    for a in &f.authors {
        write_person(out, a)?;
    }
    for c in &f.contributors {
        write_person(out, c)?;
    }
    for c in &f.categories {
        write_category(out, c, Parent::Atom)?;
    }
    for l in &f.links {
        write_link(out, l)?;
    }
    write_uri_opt(out, f.icon.as_ref())?;
    write_uri_opt(out, f.logo.as_ref())?;
    write_text_opt(out, f.rights.as_ref(), Parent::Atom)?;
    write_generator_opt(out, f.generator.as_ref())?;
    write_collection_opt(out, f.collection.as_ref(), Parent::Atom)?;
    for e in &f.entries {
        write_entry(out, e, e.source.as_ref(), f.id.as_ref())?;
    }
    push(out, "</feed>");
    Ok(())
}

/// Serialize feed metadata on its own, as the `<feed>` document the store
/// keeps under `source/<uuid>.atom`. No collection, no generator, no entries.
pub fn write_source_feed(out: &mut Vec<u8>, s: &Source) -> Result<(), WriteError> {
    push(out, &format!("<feed xmlns=\"{ATOM_NS}\">"));
    write_uri(out, &s.id)?;
    write_text(out, &s.title, Parent::Atom)?;
    write_text_opt(out, s.subtitle.as_ref(), Parent::Atom)?;
    write_date(out, &s.updated)?;
    for a in &s.authors {
        write_person(out, a)?;
    }
    for c in &s.contributors {
        write_person(out, c)?;
    }
    for l in &s.links {
        write_link(out, l)?;
    }
    for c in &s.categories {
        write_category(out, c, Parent::Atom)?;
    }
    write_uri_opt(out, s.icon.as_ref())?;
    write_uri_opt(out, s.logo.as_ref())?;
    write_text_opt(out, s.rights.as_ref(), Parent::Atom)?;
    push(out, "</feed>");
    Ok(())
}

/// Serialize an entry. With `feed_id` absent the entry is a standalone
/// document: it is validated first, carries the xmlns declaration and embeds
/// the `<source>` projection. Inside a feed whose id equals the source id the
/// projection is elided.
pub fn write_entry(
    out: &mut Vec<u8>,
    e: &Entry,
    source: Option<&SourceProjection>,
    feed_id: Option<&Uri>,
) -> Result<(), WriteError> {
    if feed_id.is_none() {
        e.validate(None, source)?;
        push(out, &format!("<entry xmlns=\"{ATOM_NS}\">"));
    } else {
        push(out, "<entry>");
    }
    write_text(out, &e.title, Parent::Atom)?;
    write_text_opt(out, e.summary.as_ref(), Parent::Atom)?;
    write_date(out, &e.updated)?;
    write_date_opt(out, e.published.as_ref())?;
    write_date_opt(out, e.edited.as_ref())?;
    write_uri(out, &e.id)?;
    for a in &e.authors {
        write_person(out, a)?;
    }
    for c in &e.contributors {
        write_person(out, c)?;
    }
    write_content(out, &e.content)?;
    for l in &e.links {
        write_link(out, l)?;
    }
    for c in &e.categories {
        write_category(out, c, Parent::Atom)?;
    }
    write_text_opt(out, e.rights.as_ref(), Parent::Atom)?;
    write_control_opt(out, e.control.as_ref());
    if let Some(src) = source {
        if !super::same_id(feed_id, Some(&src.id)) {
            push(out, "<source>");
            write_uri(out, &src.id)?;
            if e.authors.is_empty() {
                for a in &src.authors {
                    write_person(out, a)?;
                }
            }
            if e.rights.is_none() {
                write_text_opt(out, src.rights.as_ref(), Parent::Atom)?;
            }
            push(out, "</source>");
        }
    }
    push(out, "</entry>");
    Ok(())
}

pub fn write_service(out: &mut Vec<u8>, s: &Service) -> Result<(), WriteError> {
    if s.workspaces.is_empty() {
        return Err(WriteError::NoWorkspace);
    }
    push(
        out,
        &format!("<service xmlns:atom=\"{ATOM_NS}\" xmlns=\"{APP_NS}\">"),
    );
    for w in &s.workspaces {
        push(out, "<workspace>");
        write_text(out, &w.title, Parent::App)?;
        for c in w.collections.iter().flatten() {
            write_collection(out, c, Parent::App)?;
        }
        push(out, "</workspace>");
    }
    push(out, "</service>");
    Ok(())
}

pub fn write_uri(out: &mut Vec<u8>, u: &Uri) -> Result<(), WriteError> {
    if u.tag.ns != ATOM_NS {
        return Err(WriteError::UnknownXmlns("URI construct"));
    }
    check_url(&u.target)?;
    push(out, &format!("<{0}>{1}</{0}>", u.tag.local, u.target));
    Ok(())
}

fn write_uri_opt(out: &mut Vec<u8>, u: Option<&Uri>) -> Result<(), WriteError> {
    match u {
        Some(u) => write_uri(out, u),
        None => Ok(()),
    }
}

pub fn write_date(out: &mut Vec<u8>, d: &DateConstruct) -> Result<(), WriteError> {
    let stamp = d.at.format(&Rfc3339)?;
    if d.tag.ns == ATOM_NS {
        push(out, &format!("<{0}>{1}</{0}>", d.tag.local, stamp));
    } else if d.tag.ns == APP_NS {
        push(
            out,
            &format!("<{0} xmlns=\"{APP_NS}\">{1}</{0}>", d.tag.local, stamp),
        );
    } else {
        return Err(WriteError::UnknownXmlns("date construct"));
    }
    Ok(())
}

fn write_date_opt(out: &mut Vec<u8>, d: Option<&DateConstruct>) -> Result<(), WriteError> {
    match d {
        Some(d) => write_date(out, d),
        None => Ok(()),
    }
}

fn write_text(out: &mut Vec<u8>, t: &TextConstruct, parent: Parent) -> Result<(), WriteError> {
    if t.tag.ns != ATOM_NS {
        return Err(WriteError::UnknownXmlns("text construct"));
    }
    let tag = match parent {
        Parent::Atom => t.tag.local.clone(),
        Parent::App => format!("atom:{}", t.tag.local),
    };
    let kind = if t.kind.is_empty() { "text" } else { t.kind.as_str() };
    if t.text.is_empty() {
        push(out, &format!("<{tag}/>"));
    } else {
        push(out, &format!("<{tag} type=\"{kind}\">{}</{tag}>", t.text));
    }
    Ok(())
}

fn write_text_opt(
    out: &mut Vec<u8>,
    t: Option<&TextConstruct>,
    parent: Parent,
) -> Result<(), WriteError> {
    match t {
        Some(t) => write_text(out, t, parent),
        None => Ok(()),
    }
}

fn write_person(out: &mut Vec<u8>, p: &Person) -> Result<(), WriteError> {
    if p.tag.ns != ATOM_NS {
        return Err(WriteError::UnknownXmlns("Person"));
    }
    let tag = &p.tag.local;
    if p.name.is_empty() {
        push(out, &format!("<{tag}><name/>"));
    } else {
        push(out, &format!("<{tag}><name>{}</name>", p.name));
    }
    write_uri_opt(out, p.uri.as_ref())?;
    push(out, &format!("</{tag}>"));
    Ok(())
}

fn write_content(out: &mut Vec<u8>, c: &Content) -> Result<(), WriteError> {
    if !c.src.is_empty() {
        check_url(&c.src)?;
        if c.kind.is_empty() {
            push(out, &format!("<content src=\"{}\"/>", c.src));
        } else {
            push(out, &format!("<content src=\"{}\" type=\"{}\"/>", c.src, c.kind));
        }
        return Ok(());
    }
    push(out, &format!("<content type=\"{}\">", c.kind));
    out.extend_from_slice(&c.body);
    push(out, "</content>");
    Ok(())
}

fn write_link(out: &mut Vec<u8>, l: &Link) -> Result<(), WriteError> {
    check_url(&l.href)?;
    push(out, &format!("<link href=\"{}\"", l.href));
    if !l.rel.is_empty() {
        push(out, &format!(" rel=\"{}\"", l.rel));
    }
    if !l.kind.is_empty() {
        check_media_type(&l.kind)?;
        push(out, &format!(" type=\"{}\"", l.kind));
    }
    if !l.hreflang.is_empty() {
        push(out, &format!(" hreflang=\"{}\"", l.hreflang));
    }
    if !l.title.is_empty() {
        push(out, &format!(" title=\"{}\"", l.title));
    }
    if l.length != 0 {
        push(out, &format!(" length=\"{}\"", l.length));
    }
    push(out, "/>");
    Ok(())
}

fn write_category(out: &mut Vec<u8>, c: &Category, parent: Parent) -> Result<(), WriteError> {
    let tag = match parent {
        Parent::Atom => "category",
        Parent::App => "atom:category",
    };
    if c.term.is_empty() {
        return Err(WriteError::Invalid(ValidateError::MissingCategoryTerm));
    }
    push(out, &format!("<{tag} term=\"{}\"", c.term));
    if !c.scheme.is_empty() {
        check_url(&c.scheme)?;
        push(out, &format!(" scheme=\"{}\"", c.scheme));
    }
    if !c.label.is_empty() {
        push(out, &format!(" label=\"{}\"", c.label));
    }
    push(out, "/>");
    Ok(())
}

fn write_generator_opt(out: &mut Vec<u8>, g: Option<&Generator>) -> Result<(), WriteError> {
    let Some(g) = g else { return Ok(()) };
    push(out, "<generator");
    if !g.uri.is_empty() {
        check_url(&g.uri)?;
        push(out, &format!(" uri=\"{}\"", g.uri));
    }
    if !g.version.is_empty() {
        push(out, &format!(" version=\"{}\"", g.version));
    }
    if g.text.is_empty() {
        push(out, "/>");
    } else {
        push(out, &format!(">{}</generator>", g.text));
    }
    Ok(())
}

fn write_control_opt(out: &mut Vec<u8>, c: Option<&PublishingControl>) {
    if let Some(c) = c {
        if c.draft == "yes" {
            push(
                out,
                &format!("<control xmlns=\"{APP_NS}\"><draft>yes</draft></control>"),
            );
        }
    }
}

pub fn write_collection(
    out: &mut Vec<u8>,
    c: &Collection,
    parent: Parent,
) -> Result<(), WriteError> {
    let header = match parent {
        Parent::App => "collection".to_string(),
        Parent::Atom => {
            format!("collection xmlns:atom=\"{ATOM_NS}\" xmlns=\"{APP_NS}\"")
        }
    };
    if c.href.is_empty() {
        return Err(WriteError::EmptyCollectionHref);
    }
    check_url(&c.href)?;
    push(out, &format!("<{header} href=\"{}\">", c.href));
    write_text(out, &c.title, Parent::App)?;
    for cat in &c.categories {
        write_categories(out, cat)?;
    }
    for a in &c.accepts {
        write_accept(out, a);
    }
    push(out, "</collection>");
    Ok(())
}

fn write_collection_opt(
    out: &mut Vec<u8>,
    c: Option<&Collection>,
    parent: Parent,
) -> Result<(), WriteError> {
    match c {
        Some(c) => write_collection(out, c, parent),
        None => Ok(()),
    }
}

fn write_categories(out: &mut Vec<u8>, c: &Categories) -> Result<(), WriteError> {
    if !c.href.is_empty() {
        check_url(&c.href)?;
        push(out, &format!("<categories href=\"{}\"/>", c.href));
        return Ok(());
    }
    match c.fixed.as_str() {
        "" | "no" => push(out, "<categories"),
        "yes" => push(out, "<categories fixed=\"yes\""),
        _ => return Err(WriteError::UnknownFixed),
    }
    if c.scheme.is_empty() {
        push(out, ">");
    } else {
        check_url(&c.scheme)?;
        push(out, &format!(" scheme=\"{}\">", c.scheme));
    }
    for cat in &c.categories {
        write_category(out, cat, Parent::App)?;
    }
    push(out, "</categories>");
    Ok(())
}

fn write_accept(out: &mut Vec<u8>, a: &Accept) {
    if a.text.is_empty() {
        push(out, "<accept/>");
    } else {
        push(out, &format!("<accept>{}</accept>", a.text));
    }
}

/// Insert a newline between every `>` and the following `<`.
///
/// Applied to staged blobs so that git diffs stay line-oriented; never
/// applied to network responses.
pub fn break_lines(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len() + input.len() / 8);
    let mut iter = input.iter().peekable();
    while let Some(&b) = iter.next() {
        out.push(b);
        if b == b'>' {
            if let Some(&&next) = iter.peek() {
                if next == b'<' {
                    out.push(b'\n');
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::Workspace;
    use time::macros::datetime;

    fn author() -> Person {
        Person {
            tag: crate::atom::XmlName::atom("author"),
            name: "John Doe".into(),
            uri: Some(Uri::atom("uri", "mailto:johndoe@example.org")),
        }
    }

    #[test]
    fn date_construct_atom_and_app() {
        let mut out = Vec::new();
        let d = DateConstruct {
            tag: crate::atom::XmlName::atom("updated"),
            at: datetime!(2025-02-09 16:20:00 UTC),
        };
        write_date(&mut out, &d).unwrap();
        assert_eq!(out, b"<updated>2025-02-09T16:20:00Z</updated>");

        out.clear();
        let e = DateConstruct { tag: crate::atom::XmlName::app("edited"), ..d };
        write_date(&mut out, &e).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            format!("<edited xmlns=\"{APP_NS}\">2025-02-09T16:20:00Z</edited>")
        );
    }

    #[test]
    fn empty_text_construct_collapses() {
        let mut out = Vec::new();
        let t = TextConstruct::text("title", "");
        write_text(&mut out, &t, Parent::Atom).unwrap();
        assert_eq!(out, b"<title/>");

        out.clear();
        let t = TextConstruct::text("title", "February Blog Post");
        write_text(&mut out, &t, Parent::Atom).unwrap();
        assert_eq!(out, b"<title type=\"text\">February Blog Post</title>");
    }

    #[test]
    fn text_construct_prefixes_under_app_parent() {
        let mut out = Vec::new();
        let t = TextConstruct::text("title", "Blog Posts");
        write_text(&mut out, &t, Parent::App).unwrap();
        assert_eq!(out, b"<atom:title type=\"text\">Blog Posts</atom:title>");
    }

    #[test]
    fn standalone_entry_embeds_source_projection() {
        let entry = Entry {
            id: Uri::atom("id", "urn:uuid:59592fc2-0a7d-47fb-aceb-7d4a7bd6985a"),
            updated: DateConstruct {
                tag: crate::atom::XmlName::atom("updated"),
                at: datetime!(2025-02-09 16:20:00 UTC),
            },
            title: TextConstruct::text("title", "Random Thoughts"),
            content: Content { kind: "text".into(), src: String::new(), body: b"hello".to_vec() },
            ..Entry::default()
        };
        let src = SourceProjection {
            id: Uri::atom("id", "urn:uuid:59592fc2-0a7d-47fb-aceb-7d4a7bd6985b"),
            authors: vec![author()],
            rights: None,
        };
        let mut out = Vec::new();
        write_entry(&mut out, &entry, Some(&src), None).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with(&format!("<entry xmlns=\"{ATOM_NS}\">")));
        assert!(text.contains(
            "<source><id>urn:uuid:59592fc2-0a7d-47fb-aceb-7d4a7bd6985b</id>\
             <author><name>John Doe</name><uri>mailto:johndoe@example.org</uri></author></source>"
        ));

        // Inside the owning feed the projection is elided and the xmlns dropped.
        let mut out = Vec::new();
        write_entry(&mut out, &entry, Some(&src), Some(&src.id)).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("<entry>"));
        assert!(!text.contains("<source>"));
    }

    #[test]
    fn service_document_namespaces() {
        let service = Service {
            workspaces: vec![Workspace {
                title: TextConstruct::text("title", "Blog Posts"),
                collections: vec![
                    None,
                    Some(Collection {
                        href: "/feed/59592fc2-0a7d-47fb-aceb-7d4a7bd6985a".into(),
                        title: TextConstruct::text("title", "Blog Posts"),
                        categories: vec![Categories {
                            fixed: "yes".into(),
                            scheme: "https://example.org/scheme/".into(),
                            href: String::new(),
                            categories: vec![Category { term: "banana".into(), ..Category::default() }],
                        }],
                        accepts: vec![Accept { text: "text/plain".into() }],
                    }),
                ],
            }],
        };
        let mut out = Vec::new();
        write_service(&mut out, &service).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with(&format!("<service xmlns:atom=\"{ATOM_NS}\" xmlns=\"{APP_NS}\">")));
        assert!(text.contains("<categories fixed=\"yes\" scheme=\"https://example.org/scheme/\">"));
        assert!(text.contains("<atom:category term=\"banana\"/>"));
        assert!(text.contains("<accept>text/plain</accept>"));
        // the hole contributes nothing
        assert_eq!(text.matches("<collection").count(), 1);
    }

    #[test]
    fn break_lines_splits_adjacent_tags() {
        let broken = break_lines(b"<?xml?>\n<feed><id>x</id></feed>");
        assert_eq!(broken, b"<?xml?>\n<feed>\n<id>x</id>\n</feed>".to_vec());
    }
}
