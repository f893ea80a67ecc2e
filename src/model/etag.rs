//! ETag derivation and conditional-request evaluation.
//!
//! The ETag is a function of identity and last-mutation time only: a 64-bit
//! FNV-1a over the canonical `<id>` + `<updated>` serialization, base32
//! (RFC 4648) encoded and truncated to 13 characters. Every mutation bumps
//! `updated`, so the tag changes exactly when the resource does.

use std::hash::Hasher;

use data_encoding::BASE32;
use fnv::FnvHasher;
use thiserror::Error;

use crate::atom::write::{write_date, write_uri, WriteError};
use crate::atom::{DateConstruct, Uri};

pub fn resource_etag(id: &Uri, updated: &DateConstruct) -> Result<String, WriteError> {
    let mut buf = Vec::new();
    write_uri(&mut buf, id)?;
    write_date(&mut buf, updated)?;
    let mut hasher = FnvHasher::default();
    hasher.write(&buf);
    let digest = hasher.finish().to_be_bytes();
    Ok(BASE32.encode(&digest)[..13].to_string())
}

#[derive(Debug, Error)]
#[error("malformed entity tag {0}")]
pub struct ETagParseError(String);

/// One header's worth of matching. Returns `(is_set, matched)`.
///
/// A set header against an empty current ETag counts as set-but-no-match;
/// the bare token `*` matches anything; otherwise the value is a comma-space
/// separated list of quoted tags.
fn match_etag(etag: &str, header: &str) -> Result<(bool, bool), ETagParseError> {
    if !header.is_empty() && etag.is_empty() {
        return Ok((true, false));
    }
    if header.is_empty() {
        return Ok((false, false));
    }
    if header == "*" {
        return Ok((true, true));
    }
    for quoted in header.split(", ") {
        let unquoted = quoted
            .strip_prefix('"')
            .and_then(|rest| rest.strip_suffix('"'))
            .ok_or_else(|| ETagParseError(quoted.to_string()))?;
        if unquoted == etag {
            return Ok((true, true));
        }
    }
    Ok((true, false))
}

/// Evaluate `If-None-Match` then `If-Match` against the current ETag.
/// Returns whether the request may proceed; the caller maps a refusal to
/// 304 (reads) or 412 (writes). A malformed header is the caller's 400.
pub fn precondition(
    etag: &str,
    if_match: &str,
    if_none_match: &str,
) -> Result<bool, ETagParseError> {
    let (set, matched) = match_etag(etag, if_none_match)?;
    if set && matched {
        return Ok(false);
    }
    let (set, matched) = match_etag(etag, if_match)?;
    if set && !matched {
        return Ok(false);
    }
    Ok(true)
}
