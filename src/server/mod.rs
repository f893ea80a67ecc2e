//! Protocol surface: request dispatch, conditional-request gating and
//! response framing.
//!
//! Dispatch is by the dirname of the request path, exactly four prefixes:
//! `/` (service document, feed creation), `/feed`, `/entry` and the `/media`
//! stub. The model is guarded by one mutex held for the whole request, so
//! ETag computation, validation, mutation, staging and commit form a single
//! uninterruptible section. Preconditions are evaluated before the request
//! body is read; a failed PUT precondition never consumes the body.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tokio::sync::Mutex;
use tower_http::compression::CompressionLayer;

use crate::atom::read::{parse_entry, parse_feed};
use crate::atom::write::{write_entry, write_feed, write_service, XML_PROLOG};
use crate::error::ApiError;
use crate::model::{precondition, Model};

pub const MIME_FEED: &str = "application/atom+xml;type=feed";
pub const MIME_ENTRY: &str = "application/atom+xml;type=entry";
pub const MIME_SERVICE: &str = "application/atomsvc+xml";

pub type SharedModel = Arc<Mutex<Model>>;

pub fn router(model: SharedModel) -> Router {
    Router::new()
        .fallback(handle)
        .with_state(model)
        .layer(CompressionLayer::new())
}

async fn handle(State(model): State<SharedModel>, req: Request) -> Response {
    let method = req.method().as_str().to_string();
    let path = req.uri().path().to_string();
    let mut model = model.lock().await;
    match dispatch(&mut model, &method, &path, req).await {
        Ok(response) => {
            tracing::info!(%method, %path, status = %response.status(), "handled");
            response
        }
        Err(err) => {
            tracing::info!(%method, %path, status = %err.status(), error = %err, "refused");
            err.into_response()
        }
    }
}

/// Go-style `path.Dir` for request paths: everything before the final slash,
/// with the root collapsing to `/`.
fn dirname(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

async fn dispatch(
    model: &mut Model,
    method: &str,
    path: &str,
    req: Request,
) -> Result<Response, ApiError> {
    match dirname(path) {
        "/" => match method {
            "OPTIONS" => Ok(allow("OPTIONS, GET, POST")),
            "GET" => get_service(model),
            "POST" => post_to_root(model, path, req).await,
            _ => Err(ApiError::MethodNotAllowed),
        },
        "/feed" => match method {
            "OPTIONS" => Ok(allow("OPTIONS, GET, POST, PUT, DELETE")),
            "GET" => get_feed(model, path, req.headers()),
            "POST" => post_to_feed(model, path, req).await,
            "PUT" => put_feed(model, path, req).await,
            "DELETE" => delete_feed(model, path, req.headers()),
            _ => Err(ApiError::MethodNotAllowed),
        },
        "/entry" => match method {
            "OPTIONS" => Ok(allow("OPTIONS, GET, PUT, DELETE")),
            "GET" => get_entry(model, path, req.headers()),
            "PUT" => put_entry(model, path, req).await,
            "DELETE" => delete_entry(model, path, req.headers()),
            _ => Err(ApiError::MethodNotAllowed),
        },
        "/media" => match method {
            // deleting /media/X is not allowed; delete /entry/X instead
            "OPTIONS" => Ok(allow("OPTIONS, GET, PUT")),
            "GET" | "PUT" => Err(ApiError::NotImplemented),
            _ => Err(ApiError::MethodNotAllowed),
        },
        _ => Err(ApiError::MethodNotAllowed),
    }
}

fn allow(methods: &str) -> Response {
    match Response::builder()
        .status(StatusCode::OK)
        .header(header::ALLOW, methods)
        .body(Body::empty())
    {
        Ok(response) => response,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

fn xml_response(
    content_type: &str,
    body: Vec<u8>,
    etag: Option<&str>,
    location: Option<&str>,
) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type);
    if let Some(location) = location {
        builder = builder.header(header::LOCATION, location);
    }
    if let Some(etag) = etag {
        builder = builder.header(header::ETAG, format!("\"{etag}\""));
    }
    match builder.body(Body::from(body)) {
        Ok(response) => response,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers.get(name).and_then(|v| v.to_str().ok()).unwrap_or("")
}

fn require_content_type(
    headers: &HeaderMap,
    expected: &str,
    note: &str,
) -> Result<(), ApiError> {
    if header_str(headers, "content-type") != expected {
        return Err(ApiError::UnsupportedMediaType(note.to_string()));
    }
    Ok(())
}

fn check_precondition(etag: &str, headers: &HeaderMap) -> Result<bool, ApiError> {
    precondition(
        etag,
        header_str(headers, "if-match"),
        header_str(headers, "if-none-match"),
    )
    .map_err(ApiError::bad_request)
}

async fn read_body(req: Request) -> Result<Vec<u8>, ApiError> {
    let bytes = axum::body::to_bytes(req.into_body(), usize::MAX)
        .await
        .map_err(ApiError::bad_request)?;
    Ok(bytes.to_vec())
}

fn get_service(model: &Model) -> Result<Response, ApiError> {
    let mut body = XML_PROLOG.as_bytes().to_vec();
    write_service(&mut body, model.service()).map_err(ApiError::internal)?;
    Ok(xml_response(MIME_SERVICE, body, None, None))
}

async fn post_to_root(model: &mut Model, path: &str, req: Request) -> Result<Response, ApiError> {
    require_content_type(
        req.headers(),
        MIME_FEED,
        "content-type must be application/atom+xml;type=feed",
    )?;
    let bytes = read_body(req).await?;
    let new_feed = parse_feed(&bytes)
        .map_err(|_| ApiError::BadRequest("could not unmarshal request body".into()))?;
    new_feed.validate().map_err(ApiError::bad_request)?;

    let (feed, feed_path) = model.create_feed(new_feed, &format!("POST {path}"))?;
    let etag = model.feed_etag(&feed_path)?;
    let mut body = XML_PROLOG.as_bytes().to_vec();
    write_feed(&mut body, &feed).map_err(ApiError::internal)?;
    Ok(xml_response(MIME_FEED, body, Some(&etag), Some(&feed_path)))
}

fn get_feed(model: &Model, path: &str, headers: &HeaderMap) -> Result<Response, ApiError> {
    let feed = model.feed_view(path)?;
    let etag = model.feed_etag(path)?;
    if !check_precondition(&etag, headers)? {
        return Ok(StatusCode::NOT_MODIFIED.into_response());
    }
    let mut body = XML_PROLOG.as_bytes().to_vec();
    write_feed(&mut body, &feed).map_err(ApiError::internal)?;
    Ok(xml_response(MIME_FEED, body, Some(&etag), None))
}

async fn put_feed(model: &mut Model, path: &str, req: Request) -> Result<Response, ApiError> {
    require_content_type(
        req.headers(),
        MIME_FEED,
        "content-type must be application/atom+xml;type=feed",
    )?;
    let etag = model.feed_etag(path)?;
    if !check_precondition(&etag, req.headers())? {
        return Err(ApiError::PreconditionFailed);
    }
    let bytes = read_body(req).await?;
    let new_feed = parse_feed(&bytes)
        .map_err(|_| ApiError::BadRequest("could not unmarshal request body".into()))?;
    model.update_feed(path, new_feed, &format!("PUT {path}"))?;
    Ok(StatusCode::OK.into_response())
}

fn delete_feed(model: &mut Model, path: &str, headers: &HeaderMap) -> Result<Response, ApiError> {
    let etag = model.feed_etag(path)?;
    if !check_precondition(&etag, headers)? {
        return Err(ApiError::PreconditionFailed);
    }
    model.delete_feed(path, &format!("DELETE {path}"))?;
    Ok(StatusCode::OK.into_response())
}

async fn post_to_feed(model: &mut Model, path: &str, req: Request) -> Result<Response, ApiError> {
    let content_type = header_str(req.headers(), "content-type").to_string();
    let slug = header_str(req.headers(), "slug").to_string();
    let bytes = read_body(req).await?;
    let (entry, projection, entry_path) =
        model.create_entry(path, &content_type, &slug, &bytes, &format!("POST {path}"))?;
    let etag = model.entry_etag(&entry_path)?;
    let mut body = XML_PROLOG.as_bytes().to_vec();
    write_entry(&mut body, &entry, Some(&projection), None).map_err(ApiError::internal)?;
    Ok(xml_response(MIME_ENTRY, body, Some(&etag), Some(&entry_path)))
}

fn get_entry(model: &Model, path: &str, headers: &HeaderMap) -> Result<Response, ApiError> {
    let etag = model.entry_etag(path)?;
    if !check_precondition(&etag, headers)? {
        return Ok(StatusCode::NOT_MODIFIED.into_response());
    }
    let (entry, projection) = model.entry_view(path)?;
    let mut body = XML_PROLOG.as_bytes().to_vec();
    write_entry(&mut body, entry, Some(&projection), None).map_err(ApiError::internal)?;
    Ok(xml_response(MIME_ENTRY, body, Some(&etag), None))
}

async fn put_entry(model: &mut Model, path: &str, req: Request) -> Result<Response, ApiError> {
    require_content_type(
        req.headers(),
        MIME_ENTRY,
        "content-type must be application/atom+xml;type=entry",
    )?;
    let etag = model.entry_etag(path)?;
    if !check_precondition(&etag, req.headers())? {
        return Err(ApiError::PreconditionFailed);
    }
    let bytes = read_body(req).await?;
    let new_entry = parse_entry(&bytes)
        .map_err(|_| ApiError::BadRequest("could not unmarshal request body".into()))?;
    model.update_entry(path, new_entry, &format!("PUT {path}"))?;
    Ok(StatusCode::OK.into_response())
}

fn delete_entry(model: &mut Model, path: &str, headers: &HeaderMap) -> Result<Response, ApiError> {
    let etag = model.entry_etag(path)?;
    if !check_precondition(&etag, headers)? {
        return Err(ApiError::PreconditionFailed);
    }
    model.delete_entry(path, &format!("DELETE {path}"))?;
    Ok(StatusCode::OK.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dirname_matches_request_shapes() {
        assert_eq!(dirname("/"), "/");
        assert_eq!(dirname("/feed"), "/");
        assert_eq!(dirname("/feed/59592fc2-0a7d-47fb-aceb-7d4a7bd6985a"), "/feed");
        assert_eq!(dirname("/entry/59592fc2-0a7d-47fb-aceb-7d4a7bd6985a"), "/entry");
        assert_eq!(dirname("/media/x"), "/media");
        assert_eq!(dirname("/something/else/deep"), "/something/else");
    }
}
