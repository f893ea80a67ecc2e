//! End-to-end scenarios over the protocol surface, driven through the router
//! the same way a client would, against a store in a temp directory.

use std::convert::Infallible;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::Router;
use bytes::Bytes;
use http_body::Frame;
use http_body_util::BodyExt;
use tempfile::TempDir;
use tokio::sync::Mutex;
use tower::ServiceExt;

use atomgit::atom::read::{parse_entry, parse_feed};
use atomgit::{server, GitStore, Model};

const FEED_BODY: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
<id/>
<title type="text">test microblog</title>
<updated>2025-02-14T10:33:12.546909+01:00</updated>
<author>
<name>John Doe</name>
<uri>mailto:johndoe@example.org</uri>
</author>
<category term="foo"/>
<link href="https://example.org/feed.atom" rel="self" type="application/atom+xml"/>
</feed>"#;

const MIME_FEED: &str = "application/atom+xml;type=feed";
const MIME_ENTRY: &str = "application/atom+xml;type=entry";

fn app(gitdir: &Path) -> Router {
    let store = GitStore::open(gitdir).expect("open store");
    let model = Model::new(store).expect("load model");
    server::router(Arc::new(Mutex::new(model)))
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, HeaderMap, Vec<u8>) {
    let response = app.clone().oneshot(req).await.expect("infallible");
    let status = response.status();
    let headers = response.headers().clone();
    let body = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes()
        .to_vec();
    (status, headers, body)
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers.get(name).and_then(|v| v.to_str().ok()).unwrap_or("")
}

async fn create_feed(app: &Router) -> (String, String) {
    let req = Request::post("/")
        .header(header::CONTENT_TYPE, MIME_FEED)
        .body(Body::from(FEED_BODY))
        .unwrap();
    let (status, headers, _) = send(app, req).await;
    assert_eq!(status, StatusCode::OK);
    let location = header(&headers, "location").to_string();
    let etag = header(&headers, "etag").to_string();
    (location, etag)
}

async fn post_plain_text(app: &Router, feed_path: &str, body: &'static str) -> (String, String, Vec<u8>) {
    let req = Request::post(feed_path)
        .header(header::CONTENT_TYPE, "text/plain")
        .header("Slug", "slug header - a digital glue")
        .body(Body::from(body))
        .unwrap();
    let (status, headers, response_body) = send(app, req).await;
    assert_eq!(status, StatusCode::OK);
    (
        header(&headers, "location").to_string(),
        header(&headers, "etag").to_string(),
        response_body,
    )
}

#[tokio::test]
async fn scenario_create_and_list() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir.path().join("store"));

    let (location, etag) = create_feed(&app).await;
    assert!(location.starts_with("/feed/"));
    assert!(etag.starts_with('"') && etag.ends_with('"'));
    assert_eq!(etag.len(), 15); // 13 chars + quotes

    let (status, headers, body) = send(&app, Request::get("/").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(header(&headers, "content-type"), "application/atomsvc+xml");
    let body = String::from_utf8(body).unwrap();
    assert_eq!(body.matches("<collection").count(), 1);
    assert!(body.contains(&format!("href=\"{location}\"")));
    assert!(body.contains("default workspace"));
}

#[tokio::test]
async fn scenario_plain_text_post_with_categories() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir.path().join("store"));
    let (feed_path, _) = create_feed(&app).await;

    let (entry_path, etag, body) = post_plain_text(
        &app,
        &feed_path,
        "Hello mailto:johndoe@example.org and https://example.org/ plus sms:15555555555 cat:foo",
    )
    .await;
    assert!(entry_path.starts_with("/entry/"));
    assert!(etag.starts_with('"'));

    let entry = parse_entry(&body).unwrap();
    assert_eq!(entry.title.text, "slug header - a digital glue");
    assert_eq!(entry.content.kind, "xhtml");
    assert!(entry.categories.iter().any(|c| c.term == "foo"));

    let content = String::from_utf8(entry.content.body.clone()).unwrap();
    assert!(content.contains("Hello [1] and [2] plus [3]"));
    let footer = content
        .split(r#"<div style="word-break:break-all;">"#)
        .nth(1)
        .expect("footer");
    assert_eq!(footer.matches("<a href=").count(), 3);
    let pos = |needle: &str| footer.find(needle).expect(needle);
    assert!(pos("mailto:johndoe@example.org") < pos("https://example.org/"));
    assert!(pos("https://example.org/") < pos("sms:15555555555"));
    assert!(!content.contains("cat:foo"));
}

/// Request body that records whether the server ever polled it.
struct TrackingBody {
    data: Option<Bytes>,
    polled: Arc<AtomicBool>,
}

impl http_body::Body for TrackingBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Infallible>>> {
        self.polled.store(true, Ordering::SeqCst);
        Poll::Ready(self.data.take().map(|bytes| Ok(Frame::data(bytes))))
    }
}

#[tokio::test]
async fn scenario_conditional_put_does_not_consume_body_on_412() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir.path().join("store"));
    let (feed_path, _) = create_feed(&app).await;
    let (entry_path, etag, entry_body) =
        post_plain_text(&app, &feed_path, "see https://example.org/ now").await;

    // wrong etag: 412, body untouched
    let polled = Arc::new(AtomicBool::new(false));
    let body = Body::new(TrackingBody {
        data: Some(Bytes::from(entry_body.clone())),
        polled: polled.clone(),
    });
    let req = Request::put(entry_path.as_str())
        .header(header::CONTENT_TYPE, MIME_ENTRY)
        .header("If-Match", "\"WRONGWRONGWRO\"")
        .body(body)
        .unwrap();
    let (status, _, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::PRECONDITION_FAILED);
    assert!(!polled.load(Ordering::SeqCst), "server consumed the body on 412");

    // correct etag, same bytes: 200
    let req = Request::put(entry_path.as_str())
        .header(header::CONTENT_TYPE, MIME_ENTRY)
        .header("If-Match", etag)
        .body(Body::from(entry_body))
        .unwrap();
    let (status, _, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn scenario_service_doc_propagates_feed_title() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir.path().join("store"));
    let (feed_path, _) = create_feed(&app).await;

    let updated = FEED_BODY.replace("test microblog", "test microblog 2");
    let (_, headers, _) = send(&app, Request::get(feed_path.as_str()).body(Body::empty()).unwrap()).await;
    let etag = header(&headers, "etag").to_string();

    let req = Request::put(feed_path.as_str())
        .header(header::CONTENT_TYPE, MIME_FEED)
        .header("If-Match", etag)
        .body(Body::from(updated))
        .unwrap();
    let (status, _, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);

    let (_, _, body) = send(&app, Request::get("/").body(Body::empty()).unwrap()).await;
    let body = String::from_utf8(body).unwrap();
    assert!(body.contains("test microblog 2"));
}

#[tokio::test]
async fn scenario_cascade_delete_and_rehydrate() {
    let dir = TempDir::new().unwrap();
    let gitdir = dir.path().join("store");
    let entry_paths = {
        let app = app(&gitdir);
        let (feed_path, _) = create_feed(&app).await;
        let mut paths = Vec::new();
        for body in ["one", "two", "three"] {
            let (path, _, _) = post_plain_text(&app, &feed_path, body).await;
            paths.push(path);
        }

        let (_, headers, _) =
            send(&app, Request::get(feed_path.as_str()).body(Body::empty()).unwrap()).await;
        let etag = header(&headers, "etag").to_string();
        let req = Request::delete(feed_path.as_str())
            .header("If-Match", etag)
            .body(Body::empty())
            .unwrap();
        let (status, _, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        paths
    };

    // simulate a process restart: rebuild everything from the store
    let app = app(&gitdir);
    let (_, _, body) = send(&app, Request::get("/").body(Body::empty()).unwrap()).await;
    let body = String::from_utf8(body).unwrap();
    assert_eq!(body.matches("<collection").count(), 0);
    for path in entry_paths {
        let (status, _, _) = send(&app, Request::get(path.as_str()).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}

#[tokio::test]
async fn scenario_restart_preserves_content_bytes() {
    let dir = TempDir::new().unwrap();
    let gitdir = dir.path().join("store");
    let (entry_path, before) = {
        let app = app(&gitdir);
        let (feed_path, _) = create_feed(&app).await;
        let (entry_path, _, body) =
            post_plain_text(&app, &feed_path, "a single line with https://example.org/ inside").await;
        (entry_path, body)
    };

    let app = app(&gitdir);
    let (status, _, after) =
        send(&app, Request::get(entry_path.as_str()).body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(before, after);
}

#[tokio::test]
async fn client_supplied_id_honored_and_collision_conflicts() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir.path().join("store"));

    let with_id = FEED_BODY.replace(
        "<id/>",
        "<id>urn:uuid:59592fc2-0a7d-47fb-aceb-7d4a7bd6985a</id>",
    );
    let req = Request::post("/")
        .header(header::CONTENT_TYPE, MIME_FEED)
        .body(Body::from(with_id.clone()))
        .unwrap();
    let (status, headers, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        header(&headers, "location"),
        "/feed/59592fc2-0a7d-47fb-aceb-7d4a7bd6985a"
    );

    let req = Request::post("/")
        .header(header::CONTENT_TYPE, MIME_FEED)
        .body(Body::from(with_id))
        .unwrap();
    let (status, _, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::CONFLICT);

    // an id that does not parse as urn:uuid is treated as absent
    let junk_id = FEED_BODY.replace("<id/>", "<id>not-a-urn</id>");
    let req = Request::post("/")
        .header(header::CONTENT_TYPE, MIME_FEED)
        .body(Body::from(junk_id))
        .unwrap();
    let (status, headers, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_ne!(header(&headers, "location"), "/feed/not-a-urn");
}

#[tokio::test]
async fn put_with_changed_id_is_rejected() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir.path().join("store"));
    let (feed_path, _) = create_feed(&app).await;

    let (_, headers, _) = send(&app, Request::get(feed_path.as_str()).body(Body::empty()).unwrap()).await;
    let etag = header(&headers, "etag").to_string();
    let changed = FEED_BODY.replace(
        "<id/>",
        "<id>urn:uuid:aaaa2fc2-0a7d-47fb-aceb-7d4a7bd6985b</id>",
    );
    let req = Request::put(feed_path.as_str())
        .header(header::CONTENT_TYPE, MIME_FEED)
        .header("If-Match", etag)
        .body(Body::from(changed))
        .unwrap();
    let (status, _, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn conditional_get_returns_304_with_empty_body() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir.path().join("store"));
    let (feed_path, _) = create_feed(&app).await;
    let (entry_path, etag, _) = post_plain_text(&app, &feed_path, "hello").await;

    let req = Request::get(entry_path.as_str())
        .header("If-None-Match", etag.as_str())
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::NOT_MODIFIED);
    assert!(body.is_empty());

    // a different tag misses and the entry comes back
    let req = Request::get(entry_path.as_str())
        .header("If-None-Match", "\"SOMETHINGELSE\"")
        .body(Body::empty())
        .unwrap();
    let (status, headers, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(header(&headers, "etag"), etag);
    assert!(!body.is_empty());
}

#[tokio::test]
async fn wrong_content_type_is_415_and_unknown_paths_404() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir.path().join("store"));
    let (feed_path, _) = create_feed(&app).await;

    let req = Request::post("/")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{}"))
        .unwrap();
    let (status, _, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);

    let req = Request::post(feed_path.as_str())
        .header(header::CONTENT_TYPE, "application/xml")
        .body(Body::from("x"))
        .unwrap();
    let (status, _, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);

    let missing = "/feed/00000000-0000-0000-0000-000000000000";
    let (status, _, _) = send(&app, Request::get(missing).body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn options_media_and_method_handling() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir.path().join("store"));

    let (status, headers, _) =
        send(&app, Request::options("/").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(header(&headers, "allow"), "OPTIONS, GET, POST");

    let (_, headers, _) =
        send(&app, Request::options("/feed/x").body(Body::empty()).unwrap()).await;
    assert_eq!(header(&headers, "allow"), "OPTIONS, GET, POST, PUT, DELETE");

    let (_, headers, _) =
        send(&app, Request::options("/entry/x").body(Body::empty()).unwrap()).await;
    assert_eq!(header(&headers, "allow"), "OPTIONS, GET, PUT, DELETE");

    let (_, headers, _) =
        send(&app, Request::options("/media/x").body(Body::empty()).unwrap()).await;
    assert_eq!(header(&headers, "allow"), "OPTIONS, GET, PUT");

    let (status, _, _) =
        send(&app, Request::get("/media/x").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
    let (status, _, _) =
        send(&app, Request::put("/media/x").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::NOT_IMPLEMENTED);

    let (status, _, _) =
        send(&app, Request::delete("/unknown/x").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn gzip_is_applied_when_accepted() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir.path().join("store"));
    create_feed(&app).await;

    let req = Request::get("/")
        .header("Accept-Encoding", "gzip")
        .body(Body::empty())
        .unwrap();
    let (status, headers, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(header(&headers, "content-encoding"), "gzip");
    // gzip magic
    assert_eq!(&body[..2], &[0x1f, 0x8b]);
}

#[tokio::test]
async fn feed_lists_entries_newest_first() {
    let dir = TempDir::new().unwrap();
    let app = app(&dir.path().join("store"));
    let (feed_path, _) = create_feed(&app).await;
    post_plain_text(&app, &feed_path, "first post").await;
    post_plain_text(&app, &feed_path, "second post").await;

    let (status, _, body) =
        send(&app, Request::get(feed_path.as_str()).body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    let feed = parse_feed(&body).unwrap();
    assert_eq!(feed.entries.len(), 2);
    assert!(feed.entries[0].updated.at >= feed.entries[1].updated.at);
    // entries in their own feed carry no <source> element
    assert!(feed.entries.iter().all(|e| e.source.is_none()));
}
