//! Plain-text ingestion: the deterministic transformation from a `text/plain`
//! submission to an XHTML content body plus a category list, and the
//! validator applied to XHTML bodies on PUT.
//!
//! The scan is a greedy forward pass anchored on `:`. Recognized scheme
//! tokens become numbered references collected into a footer; `cat:` tokens
//! vanish from the text (taking one following character with them, so no gap
//! remains) and feed the category list. Everything else is escaped verbatim.

use quick_xml::events::Event;
use quick_xml::name::ResolveResult;
use quick_xml::reader::NsReader;
use thiserror::Error;
use url::Url;

use super::XHTML_NS;

/// `cat` must stay first: index 0 is the category pseudo-scheme.
const SCHEMES: [&str; 6] = ["cat", "http", "https", "mailto", "tel", "sms"];

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("content does not start with xhtml div")]
    NotXhtmlDiv,

    #[error("tag {0} not allowed")]
    TagNotAllowed(String),

    #[error("malformed content: {0}")]
    Malformed(String),
}

/// XML-escape `input` into `out`, matching XML 1.0 text escaping including
/// the numeric entities for tab, newline and carriage return (so newlines in
/// the submission survive the store's line-breaking pass untouched).
fn escape_into(out: &mut Vec<u8>, input: &[u8]) {
    for &b in input {
        match b {
            b'"' => out.extend_from_slice(b"&#34;"),
            b'\'' => out.extend_from_slice(b"&#39;"),
            b'&' => out.extend_from_slice(b"&amp;"),
            b'<' => out.extend_from_slice(b"&lt;"),
            b'>' => out.extend_from_slice(b"&gt;"),
            b'\t' => out.extend_from_slice(b"&#x9;"),
            b'\n' => out.extend_from_slice(b"&#xA;"),
            b'\r' => out.extend_from_slice(b"&#xD;"),
            other => out.push(other),
        }
    }
}

fn escaped(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    escape_into(&mut out, input);
    out
}

/// Transform a plain-text submission into an XHTML `<div>` body.
/// Returns the body and the extracted category terms.
pub fn prepare_plain_text(input: &[u8]) -> (Vec<u8>, Vec<String>) {
    let mut out: Vec<u8> =
        br#"<div xmlns="http://www.w3.org/1999/xhtml" style="white-space: pre-line;"><p>"#.to_vec();
    let mut urls: Vec<String> = Vec::new();
    let mut categories: Vec<String> = Vec::new();

    // `rest` is what remains to scan; `exhausted` marks that the current
    // token's tail ran to end of input (there is nothing left to consume).
    let mut rest: &[u8] = input;
    loop {
        let Some(colon) = rest.iter().position(|&b| b == b':') else {
            escape_into(&mut out, rest);
            break;
        };
        let mut before = rest[..colon].to_vec();
        let mut after = &rest[colon + 1..];
        let exhausted = match after.iter().position(|&b| b == b'\n' || b == b' ') {
            Some(i) => {
                rest = &after[i..];
                after = &after[..i];
                false
            }
            None => {
                rest = &[];
                true
            }
        };

        let mut replaced = false;
        for (k, scheme) in SCHEMES.iter().enumerate() {
            if !before.ends_with(scheme.as_bytes()) {
                continue;
            }
            let raw_url = format!("{scheme}:{}", String::from_utf8_lossy(after));
            if Url::parse(&raw_url).is_err() {
                continue;
            }
            before.truncate(before.len() - scheme.len());
            if k == 0 {
                categories.push(raw_url["cat:".len()..].to_string());
                // eat the delimiter so no visible gap remains
                if !exhausted {
                    rest = &rest[1..];
                }
            } else {
                // natural-language fix: "url ." loses the space
                if rest.len() > 1 && rest[0] == b' ' && rest[1] == b'.' {
                    rest = &rest[1..];
                }
                let index = match urls.iter().position(|u| u == &raw_url) {
                    Some(found) => found + 1,
                    None => {
                        urls.push(raw_url);
                        urls.len()
                    }
                };
                before.extend_from_slice(format!("[{index}]").as_bytes());
            }
            replaced = true;
            break;
        }
        if !replaced {
            before.push(b':');
            before.extend_from_slice(after);
        }
        escape_into(&mut out, &before);
        if exhausted {
            break;
        }
    }

    out.extend_from_slice(b"</p>");
    if !urls.is_empty() {
        out.extend_from_slice(br#"<div style="word-break:break-all;">"#);
        for (k, u) in urls.iter().enumerate() {
            let esc = escaped(u.as_bytes());
            out.extend_from_slice(b"<a href=\"");
            out.extend_from_slice(&esc);
            out.extend_from_slice(format!("\">[{}]&#xA0;", k + 1).as_bytes());
            out.extend_from_slice(&esc);
            out.extend_from_slice(b"</a>");
        }
        out.extend_from_slice(b"</div>");
    }
    out.extend_from_slice(b"</div>");
    (out, categories)
}

/// Validate and normalize an XHTML content body submitted via PUT.
///
/// The body must open with an XHTML `<div>` and may contain no start tags
/// other than `div`, `p` and `a`. Newlines are stripped before storage.
pub fn prepare_put_content(body: &[u8]) -> Result<Vec<u8>, IngestError> {
    let stripped: Vec<u8> = body.iter().copied().filter(|&b| b != b'\n').collect();

    let mut reader = NsReader::from_reader(stripped.as_slice());
    reader.config_mut().expand_empty_elements = true;

    let mut seen_root = false;
    loop {
        let (res, event) = reader
            .read_resolved_event()
            .map_err(|e| IngestError::Malformed(e.to_string()))?;
        match event {
            Event::Start(e) => {
                let local = e.local_name();
                if !seen_root {
                    let xhtml = matches!(&res, ResolveResult::Bound(ns) if ns.0 == XHTML_NS.as_bytes());
                    if !xhtml || local.as_ref() != b"div" {
                        return Err(IngestError::NotXhtmlDiv);
                    }
                    seen_root = true;
                    continue;
                }
                match local.as_ref() {
                    b"div" | b"p" | b"a" => {}
                    other => {
                        return Err(IngestError::TagNotAllowed(
                            String::from_utf8_lossy(other).into_owned(),
                        ))
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    if !seen_root {
        return Err(IngestError::NotXhtmlDiv);
    }
    Ok(stripped)
}
