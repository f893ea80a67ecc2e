//! Namespace-resolved parsing of Atom documents.
//!
//! The reader is lenient the way the canonical writer is strict: unknown
//! elements are skipped wholesale, element namespaces are recorded on the
//! constructs and judged later by validation, and text-construct/content
//! bodies keep their raw inner XML. `app:edited` and `app:control` are only
//! recognized under the APP namespace.

use quick_xml::escape::unescape;
use quick_xml::events::attributes::AttrError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::ResolveResult;
use quick_xml::reader::NsReader;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use super::{
    Category, Content, DateConstruct, Entry, Feed, Generator, Link, Person, PublishingControl,
    SourceProjection, TextConstruct, Uri, XmlName, APP_NS, ATOM_NS,
};

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("malformed xml: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("malformed attribute: {0}")]
    Attr(#[from] AttrError),

    #[error("invalid date: {0}")]
    Date(#[from] time::error::Parse),

    #[error("document is not utf-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("expected {0} document")]
    UnexpectedRoot(&'static str),

    #[error("unexpected end of document")]
    UnexpectedEof,

    #[error("invalid value: {0}")]
    BadValue(String),
}

type Reader<'a> = NsReader<&'a [u8]>;

fn ns_str(res: &ResolveResult<'_>) -> Result<String, ReadError> {
    match res {
        ResolveResult::Bound(ns) => Ok(std::str::from_utf8(ns.0)?.to_string()),
        ResolveResult::Unbound => Ok(String::new()),
        ResolveResult::Unknown(prefix) => Err(ReadError::BadValue(format!(
            "unknown namespace prefix {}",
            String::from_utf8_lossy(prefix)
        ))),
    }
}

fn tag_of(res: &ResolveResult<'_>, e: &BytesStart<'_>) -> Result<XmlName, ReadError> {
    Ok(XmlName {
        ns: ns_str(res)?,
        local: std::str::from_utf8(e.local_name().as_ref())?.to_string(),
    })
}

/// Raw inner XML of the element whose start event was just read.
fn inner_raw<'a>(reader: &mut Reader<'a>, input: &'a [u8], e: &BytesStart<'_>) -> Result<&'a [u8], ReadError> {
    let span = reader.read_to_end(e.name())?;
    Ok(&input[span.start as usize..span.end as usize])
}

/// Character data of the element: raw inner XML with entities resolved.
fn inner_text<'a>(reader: &mut Reader<'a>, input: &'a [u8], e: &BytesStart<'_>) -> Result<String, ReadError> {
    let raw = {
        let span = reader.read_to_end(e.name())?;
        &input[span.start as usize..span.end as usize]
    };
    let s = std::str::from_utf8(raw)?;
    Ok(unescape(s)
        .map_err(|err| ReadError::BadValue(err.to_string()))?
        .into_owned())
}

fn attr_string(e: &BytesStart<'_>, key: &[u8]) -> Result<Option<String>, ReadError> {
    for attr in e.attributes() {
        let attr = attr?;
        if attr.key.as_ref() == key {
            let value = attr
                .unescape_value()
                .map_err(|err| ReadError::BadValue(err.to_string()))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

/// Parse a standalone `<feed>` document (also the stored form of a source).
pub fn parse_feed(input: &[u8]) -> Result<Feed, ReadError> {
    let mut reader = NsReader::from_reader(input);
    loop {
        match reader.read_resolved_event()? {
            (res, Event::Start(e)) => {
                if ns_str(&res)? != ATOM_NS || e.local_name().as_ref() != b"feed" {
                    return Err(ReadError::UnexpectedRoot("feed"));
                }
                return parse_feed_children(&mut reader, input);
            }
            (res, Event::Empty(e)) => {
                if ns_str(&res)? != ATOM_NS || e.local_name().as_ref() != b"feed" {
                    return Err(ReadError::UnexpectedRoot("feed"));
                }
                return Ok(Feed::default());
            }
            (_, Event::Eof) => return Err(ReadError::UnexpectedEof),
            _ => {}
        }
    }
}

/// Parse a standalone `<entry>` document.
pub fn parse_entry(input: &[u8]) -> Result<Entry, ReadError> {
    let mut reader = NsReader::from_reader(input);
    loop {
        match reader.read_resolved_event()? {
            (res, Event::Start(e)) => {
                if ns_str(&res)? != ATOM_NS || e.local_name().as_ref() != b"entry" {
                    return Err(ReadError::UnexpectedRoot("entry"));
                }
                return parse_entry_children(&mut reader, input);
            }
            (res, Event::Empty(e)) => {
                if ns_str(&res)? != ATOM_NS || e.local_name().as_ref() != b"entry" {
                    return Err(ReadError::UnexpectedRoot("entry"));
                }
                return Ok(Entry::default());
            }
            (_, Event::Eof) => return Err(ReadError::UnexpectedEof),
            _ => {}
        }
    }
}

fn parse_feed_children<'a>(reader: &mut Reader<'a>, input: &'a [u8]) -> Result<Feed, ReadError> {
    let mut feed = Feed::default();
    loop {
        let (res, event) = reader.read_resolved_event()?;
        let (e, empty) = match &event {
            Event::Start(e) => (e, false),
            Event::Empty(e) => (e, true),
            Event::End(_) => break,
            Event::Eof => return Err(ReadError::UnexpectedEof),
            _ => continue,
        };
        let tag = tag_of(&res, e)?;
        match tag.local.as_str() {
            "id" => feed.id = Some(parse_uri(reader, input, e, tag, empty)?),
            "updated" => feed.updated = Some(parse_date(reader, input, e, tag, empty)?),
            "title" => feed.title = Some(parse_text(reader, input, e, tag, empty)?),
            "subtitle" => feed.subtitle = Some(parse_text(reader, input, e, tag, empty)?),
            "rights" => feed.rights = Some(parse_text(reader, input, e, tag, empty)?),
            "author" => feed.authors.push(parse_person(reader, input, e, tag, empty)?),
            "contributor" => feed.contributors.push(parse_person(reader, input, e, tag, empty)?),
            "link" => feed.links.push(parse_link(reader, e, empty)?),
            "category" => feed.categories.push(parse_category(reader, e, empty)?),
            "icon" => feed.icon = Some(parse_uri(reader, input, e, tag, empty)?),
            "logo" => feed.logo = Some(parse_uri(reader, input, e, tag, empty)?),
            "generator" => feed.generator = Some(parse_generator(reader, input, e, empty)?),
            "entry" => {
                if empty {
                    feed.entries.push(Entry::default());
                } else {
                    feed.entries.push(parse_entry_children(reader, input)?);
                }
            }
            _ => skip(reader, e, empty)?,
        }
    }
    Ok(feed)
}

fn parse_entry_children<'a>(reader: &mut Reader<'a>, input: &'a [u8]) -> Result<Entry, ReadError> {
    let mut entry = Entry::default();
    loop {
        let (res, event) = reader.read_resolved_event()?;
        let (e, empty) = match &event {
            Event::Start(e) => (e, false),
            Event::Empty(e) => (e, true),
            Event::End(_) => break,
            Event::Eof => return Err(ReadError::UnexpectedEof),
            _ => continue,
        };
        let tag = tag_of(&res, e)?;
        match tag.local.as_str() {
            "id" => entry.id = parse_uri(reader, input, e, tag, empty)?,
            "updated" => entry.updated = parse_date(reader, input, e, tag, empty)?,
            "title" => entry.title = parse_text(reader, input, e, tag, empty)?,
            "summary" => entry.summary = Some(parse_text(reader, input, e, tag, empty)?),
            "rights" => entry.rights = Some(parse_text(reader, input, e, tag, empty)?),
            "published" => entry.published = Some(parse_date(reader, input, e, tag, empty)?),
            "edited" if tag.ns == APP_NS => {
                entry.edited = Some(parse_date(reader, input, e, tag, empty)?)
            }
            "control" if tag.ns == APP_NS => {
                entry.control = Some(parse_control(reader, input, e, empty)?)
            }
            "author" => entry.authors.push(parse_person(reader, input, e, tag, empty)?),
            "contributor" => entry.contributors.push(parse_person(reader, input, e, tag, empty)?),
            "link" => entry.links.push(parse_link(reader, e, empty)?),
            "category" => entry.categories.push(parse_category(reader, e, empty)?),
            "content" => entry.content = parse_content(reader, input, e, empty)?,
            "source" => entry.source = Some(parse_source(reader, input, e, empty)?),
            _ => skip(reader, e, empty)?,
        }
    }
    Ok(entry)
}

fn skip(reader: &mut Reader<'_>, e: &BytesStart<'_>, empty: bool) -> Result<(), ReadError> {
    if !empty {
        reader.read_to_end(e.name())?;
    }
    Ok(())
}

fn parse_uri<'a>(
    reader: &mut Reader<'a>,
    input: &'a [u8],
    e: &BytesStart<'_>,
    tag: XmlName,
    empty: bool,
) -> Result<Uri, ReadError> {
    let target = if empty { String::new() } else { inner_text(reader, input, e)? };
    Ok(Uri { tag, target })
}

fn parse_date<'a>(
    reader: &mut Reader<'a>,
    input: &'a [u8],
    e: &BytesStart<'_>,
    tag: XmlName,
    empty: bool,
) -> Result<DateConstruct, ReadError> {
    if empty {
        return Err(ReadError::BadValue("empty date construct".to_string()));
    }
    let text = inner_text(reader, input, e)?;
    let at = OffsetDateTime::parse(&text, &Rfc3339)?;
    Ok(DateConstruct { tag, at })
}

fn parse_text<'a>(
    reader: &mut Reader<'a>,
    input: &'a [u8],
    e: &BytesStart<'_>,
    tag: XmlName,
    empty: bool,
) -> Result<TextConstruct, ReadError> {
    let kind = attr_string(e, b"type")?.unwrap_or_default();
    let text = if empty {
        String::new()
    } else {
        String::from_utf8_lossy(inner_raw(reader, input, e)?).into_owned()
    };
    Ok(TextConstruct { tag, kind, text })
}

fn parse_person<'a>(
    reader: &mut Reader<'a>,
    input: &'a [u8],
    e: &BytesStart<'_>,
    tag: XmlName,
    empty: bool,
) -> Result<Person, ReadError> {
    let mut person = Person { tag, ..Person::default() };
    if empty {
        return Ok(person);
    }
    loop {
        let (res, event) = reader.read_resolved_event()?;
        let (child, child_empty) = match &event {
            Event::Start(c) => (c, false),
            Event::Empty(c) => (c, true),
            Event::End(end) if end.name() == e.name() => break,
            Event::End(_) => continue,
            Event::Eof => return Err(ReadError::UnexpectedEof),
            _ => continue,
        };
        let child_tag = tag_of(&res, child)?;
        match child_tag.local.as_str() {
            "name" => {
                person.name = if child_empty {
                    String::new()
                } else {
                    inner_text(reader, input, child)?
                }
            }
            "uri" => person.uri = Some(parse_uri(reader, input, child, child_tag, child_empty)?),
            _ => skip(reader, child, child_empty)?,
        }
    }
    Ok(person)
}

fn parse_link(reader: &mut Reader<'_>, e: &BytesStart<'_>, empty: bool) -> Result<Link, ReadError> {
    let length = match attr_string(e, b"length")? {
        Some(raw) => raw
            .parse::<u64>()
            .map_err(|_| ReadError::BadValue(format!("link length {raw}")))?,
        None => 0,
    };
    let link = Link {
        href: attr_string(e, b"href")?.unwrap_or_default(),
        rel: attr_string(e, b"rel")?.unwrap_or_default(),
        kind: attr_string(e, b"type")?.unwrap_or_default(),
        hreflang: attr_string(e, b"hreflang")?.unwrap_or_default(),
        title: attr_string(e, b"title")?.unwrap_or_default(),
        length,
    };
    skip(reader, e, empty)?;
    Ok(link)
}

fn parse_category(
    reader: &mut Reader<'_>,
    e: &BytesStart<'_>,
    empty: bool,
) -> Result<Category, ReadError> {
    let category = Category {
        term: attr_string(e, b"term")?.unwrap_or_default(),
        scheme: attr_string(e, b"scheme")?.unwrap_or_default(),
        label: attr_string(e, b"label")?.unwrap_or_default(),
    };
    skip(reader, e, empty)?;
    Ok(category)
}

fn parse_generator<'a>(
    reader: &mut Reader<'a>,
    input: &'a [u8],
    e: &BytesStart<'_>,
    empty: bool,
) -> Result<Generator, ReadError> {
    let uri = attr_string(e, b"uri")?.unwrap_or_default();
    let version = attr_string(e, b"version")?.unwrap_or_default();
    let text = if empty { String::new() } else { inner_text(reader, input, e)? };
    Ok(Generator { uri, version, text })
}

fn parse_content<'a>(
    reader: &mut Reader<'a>,
    input: &'a [u8],
    e: &BytesStart<'_>,
    empty: bool,
) -> Result<Content, ReadError> {
    let kind = attr_string(e, b"type")?.unwrap_or_default();
    let src = attr_string(e, b"src")?.unwrap_or_default();
    let body = if empty { Vec::new() } else { inner_raw(reader, input, e)?.to_vec() };
    Ok(Content { kind, src, body })
}

fn parse_control<'a>(
    reader: &mut Reader<'a>,
    input: &'a [u8],
    e: &BytesStart<'_>,
    empty: bool,
) -> Result<PublishingControl, ReadError> {
    let mut control = PublishingControl::default();
    if empty {
        return Ok(control);
    }
    loop {
        let (_, event) = reader.read_resolved_event()?;
        let (child, child_empty) = match &event {
            Event::Start(c) => (c, false),
            Event::Empty(c) => (c, true),
            Event::End(end) if end.name() == e.name() => break,
            Event::End(_) => continue,
            Event::Eof => return Err(ReadError::UnexpectedEof),
            _ => continue,
        };
        if child.local_name().as_ref() == b"draft" && !child_empty {
            control.draft = inner_text(reader, input, child)?;
        } else {
            skip(reader, child, child_empty)?;
        }
    }
    Ok(control)
}

fn parse_source<'a>(
    reader: &mut Reader<'a>,
    input: &'a [u8],
    e: &BytesStart<'_>,
    empty: bool,
) -> Result<SourceProjection, ReadError> {
    let mut source = SourceProjection::default();
    if empty {
        return Ok(source);
    }
    loop {
        let (res, event) = reader.read_resolved_event()?;
        let (child, child_empty) = match &event {
            Event::Start(c) => (c, false),
            Event::Empty(c) => (c, true),
            Event::End(end) if end.name() == e.name() => break,
            Event::End(_) => continue,
            Event::Eof => return Err(ReadError::UnexpectedEof),
            _ => continue,
        };
        let child_tag = tag_of(&res, child)?;
        match child_tag.local.as_str() {
            "id" => source.id = parse_uri(reader, input, child, child_tag, child_empty)?,
            "author" => source.authors.push(parse_person(reader, input, child, child_tag, child_empty)?),
            "rights" => source.rights = Some(parse_text(reader, input, child, child_tag, child_empty)?),
            _ => skip(reader, child, child_empty)?,
        }
    }
    Ok(source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::write::{write_entry, write_feed, write_source_feed};
    use crate::atom::{Source, SourceProjection, TextConstruct};
    use time::macros::datetime;

    const FEED_DOC: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
<id/>
<title type="text">test microblog</title>
<updated>2025-02-14T10:33:12.546909+01:00</updated>
<author>
<name>John Doe</name>
<uri>mailto:johndoe@example.org</uri>
</author>
<link href="https://example.org/feed.atom" rel="self" type="application/atom+xml"/>
</feed>"#;

    #[test]
    fn parses_feed_submission() {
        let feed = parse_feed(FEED_DOC.as_bytes()).unwrap();
        assert_eq!(feed.id.as_ref().unwrap().target, "");
        assert!(feed.id.as_ref().unwrap().tag.is(ATOM_NS, "id"));
        let title = feed.title.as_ref().unwrap();
        assert_eq!(title.text, "test microblog");
        assert_eq!(title.kind, "text");
        // same instant as 10:33:12.546909+01:00
        assert_eq!(
            feed.updated.as_ref().unwrap().at,
            datetime!(2025-02-14 09:33:12.546909 UTC)
        );
        assert_eq!(feed.authors.len(), 1);
        assert_eq!(feed.authors[0].name, "John Doe");
        assert_eq!(feed.authors[0].uri.as_ref().unwrap().target, "mailto:johndoe@example.org");
        assert_eq!(feed.links[0].rel, "self");
        assert_eq!(feed.links[0].kind, "application/atom+xml");
        assert!(feed.validate().is_ok());
    }

    #[test]
    fn unknown_elements_are_skipped() {
        let doc = r#"<feed xmlns="http://www.w3.org/2005/Atom"><x><y>deep</y></x><title>t</title></feed>"#;
        let feed = parse_feed(doc.as_bytes()).unwrap();
        assert_eq!(feed.title.unwrap().text, "t");
    }

    #[test]
    fn rejects_wrong_root() {
        assert!(matches!(
            parse_feed(b"<entry xmlns=\"http://www.w3.org/2005/Atom\"/>"),
            Err(ReadError::UnexpectedRoot("feed"))
        ));
    }

    fn sample_source() -> Source {
        Source {
            id: Uri::atom("id", "urn:uuid:59592fc2-0a7d-47fb-aceb-7d4a7bd6985a"),
            updated: DateConstruct::updated(datetime!(2025-02-09 16:20:00.123456 UTC)),
            title: TextConstruct::text("title", "John Doe Blog"),
            authors: vec![Person {
                tag: XmlName::atom("author"),
                name: "John Doe".into(),
                uri: Some(Uri::atom("uri", "mailto:johndoe@example.org")),
            }],
            links: vec![Link {
                href: "https://example.org/feed.atom".into(),
                rel: "self".into(),
                kind: "application/atom+xml".into(),
                ..Link::default()
            }],
            categories: vec![Category { term: "blogposts".into(), ..Category::default() }],
            contributors: Vec::new(),
            icon: None,
            logo: None,
            generator: None,
            subtitle: Some(TextConstruct::text("subtitle", "a subtitle")),
            rights: Some(TextConstruct::text("rights", "Copyright (C) John Doe 2025")),
        }
    }

    #[test]
    fn source_round_trips_through_store_form() {
        let source = sample_source();
        let mut buf = Vec::new();
        write_source_feed(&mut buf, &source).unwrap();
        let broken = crate::atom::write::break_lines(&buf);
        let feed = parse_feed(&broken).unwrap();
        assert_eq!(feed.id.as_ref().unwrap(), &source.id);
        assert_eq!(feed.updated.as_ref().unwrap().at, source.updated.at);
        assert_eq!(feed.title.as_ref().unwrap().text, source.title.text);
        assert_eq!(feed.authors, source.authors);
        assert_eq!(feed.links, source.links);
        assert_eq!(feed.categories, source.categories);
        assert_eq!(feed.subtitle.as_ref().unwrap().text, "a subtitle");
        assert_eq!(feed.rights.as_ref().unwrap().text, source.rights.as_ref().unwrap().text);
    }

    #[test]
    fn entry_round_trips_with_projection() {
        let entry = Entry {
            id: Uri::atom("id", "urn:uuid:aaaa2fc2-0a7d-47fb-aceb-7d4a7bd6985b"),
            updated: DateConstruct::updated(datetime!(2025-02-09 16:20:00 UTC)),
            title: TextConstruct::text("title", "slug header - a digital glue"),
            content: Content {
                kind: "xhtml".into(),
                src: String::new(),
                body: br#"<div xmlns="http://www.w3.org/1999/xhtml" style="white-space: pre-line;"><p>hi</p></div>"#.to_vec(),
            },
            ..Entry::default()
        };
        let projection = SourceProjection {
            id: Uri::atom("id", "urn:uuid:59592fc2-0a7d-47fb-aceb-7d4a7bd6985a"),
            authors: sample_source().authors,
            rights: None,
        };
        let mut buf = Vec::new();
        write_entry(&mut buf, &entry, Some(&projection), None).unwrap();
        let parsed = parse_entry(&buf).unwrap();
        assert_eq!(parsed.id, entry.id);
        assert_eq!(parsed.updated.at, entry.updated.at);
        assert_eq!(parsed.title.text, entry.title.text);
        assert_eq!(parsed.content.kind, "xhtml");
        assert_eq!(parsed.content.body, entry.content.body);
        let src = parsed.source.unwrap();
        assert_eq!(src.id, projection.id);
        assert_eq!(src.authors, projection.authors);
    }

    #[test]
    fn feed_with_entries_round_trips(){
        let source = sample_source();
        let entry = Entry {
            id: Uri::atom("id", "urn:uuid:aaaa2fc2-0a7d-47fb-aceb-7d4a7bd6985b"),
            updated: DateConstruct::updated(datetime!(2025-02-10 08:00:00 UTC)),
            title: TextConstruct::text("title", "Untitled"),
            content: Content { kind: "text".into(), src: String::new(), body: b"plain words".to_vec() },
            ..Entry::default()
        };
        let feed = Feed {
            id: Some(source.id.clone()),
            updated: Some(source.updated.clone()),
            title: Some(source.title.clone()),
            authors: source.authors.clone(),
            links: source.links.clone(),
            entries: vec![entry],
            ..Feed::default()
        };
        let mut buf = Vec::new();
        write_feed(&mut buf, &feed).unwrap();
        let parsed = parse_feed(&buf).unwrap();
        assert_eq!(parsed.entries.len(), 1);
        assert_eq!(parsed.entries[0].title.text, "Untitled");
        assert_eq!(parsed.entries[0].content.body, b"plain words".to_vec());
        // entries of the owning feed carry no <source> projection
        assert!(parsed.entries[0].source.is_none());
    }
}
