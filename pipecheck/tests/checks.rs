//! Runs real checks against a minimal in-process piping relay.

use core::{convert::Infallible, time::Duration};
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use bytes::Bytes;
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, StreamBody};
use hyper::{
    body::{Frame, Incoming},
    service::service_fn,
};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use pipecheck::{
    cfg::{RunConfig, TargetConfig},
    check::all_checks,
    engine::http::{body, BoxBody},
    protocol::Protocol,
    report::{CheckResult, Reporter},
};
use tokio::{
    io::AsyncReadExt,
    net::TcpListener,
    sync::{mpsc, oneshot},
};
use tokio_stream::wrappers::ReceiverStream;

type Done = mpsc::Sender<Result<Frame<Bytes>, anyhow::Error>>;

/// Ways the relay can misbehave.
#[derive(Debug, Clone, Copy, Default)]
struct Faults {
    /// Answers a sender only once its receiver has arrived.
    late_sender_response: bool,
    /// Accepts a second sender on an occupied path.
    accept_same_path: bool,
    /// Forwards a body only after it has been received completely.
    buffering: bool,
    /// Alters the bodies on paths that have carried a transfer before.
    corrupt_reuse: bool,
}

/// A sender waiting to be paired.
struct Transfer {
    body: BoxBody,
    /// Headers forwarded to the receiver.
    headers: HeaderMap,
    /// Ends the sender's response once the transfer is over.
    done: Done,
    paired: oneshot::Sender<()>,
}

enum Slot {
    Sender(Transfer),
    Receiver(oneshot::Sender<Transfer>),
}

impl Slot {
    fn is_alive(&self) -> bool {
        match self {
            Slot::Sender(t) => !t.done.is_closed(),
            Slot::Receiver(tx) => !tx.is_closed(),
        }
    }
}

#[derive(Default)]
struct Relay {
    faults: Faults,
    slots: Mutex<HashMap<String, Slot>>,
    used: Mutex<HashSet<String>>,
}

fn status(code: StatusCode) -> Response<BoxBody> {
    let mut resp = Response::new(body::empty());
    *resp.status_mut() = code;
    resp
}

fn receive(relay: &Relay, path: &str, t: Transfer) -> Response<BoxBody> {
    let Transfer { body: mut incoming, headers, done, paired } = t;
    let _ = paired.send(());

    let reused = !relay.used.lock().unwrap().insert(path.to_string());
    let corrupt = relay.faults.corrupt_reuse && reused;
    let buffering = relay.faults.buffering;

    let (tx, body) = body::channel(16);
    tokio::spawn(async move {
        let mut buffered = Vec::new();
        while let Some(frame) = incoming.frame().await {
            let data = match frame {
                Ok(frame) => match frame.into_data() {
                    Ok(data) => data,
                    Err(..) => continue,
                },
                Err(err) => {
                    tx.abort(err).await;
                    return;
                }
            };
            let data = if corrupt { Bytes::from(data.to_ascii_uppercase()) } else { data };

            if buffering {
                buffered.push(data);
            } else if tx.send(data).await.is_err() {
                return;
            }
        }
        for data in buffered {
            if tx.send(data).await.is_err() {
                return;
            }
        }
        drop(done);
    });

    let mut resp = Response::new(body);
    resp.headers_mut().extend(headers);
    resp.headers_mut()
        .insert("x-robots-tag", HeaderValue::from_static("none"));
    resp
}

fn multipart_boundary(headers: &HeaderMap) -> Option<String> {
    let content_type = headers.get(header::CONTENT_TYPE)?.to_str().ok()?;
    let boundary = content_type.strip_prefix("multipart/form-data; boundary=")?;
    Some(boundary.to_string())
}

/// Splits a single-part form into the part headers and its payload.
fn decode_form(form: &[u8], boundary: &str) -> Option<(HeaderMap, Bytes)> {
    let form = form.strip_prefix(format!("--{boundary}\r\n").as_bytes())?;
    let head_len = form.windows(4).position(|w| w == b"\r\n\r\n")?;

    let mut headers = HeaderMap::new();
    for line in std::str::from_utf8(&form[..head_len]).ok()?.split("\r\n") {
        let (name, value) = line.split_once(": ")?;
        headers.insert(
            HeaderName::from_bytes(name.as_bytes()).ok()?,
            HeaderValue::from_str(value).ok()?,
        );
    }

    let payload = form[head_len + 4..].strip_suffix(format!("\r\n--{boundary}--\r\n").as_bytes())?;
    Some((headers, Bytes::copy_from_slice(payload)))
}

async fn get(req: Request<Incoming>, relay: &Relay) -> Response<BoxBody> {
    let path = req.uri().path().to_string();
    if path == "/" {
        return Response::new(body::full("relay"));
    }
    if req.headers().contains_key("service-worker") {
        return status(StatusCode::BAD_REQUEST);
    }

    let rx = {
        let mut slots = relay.slots.lock().unwrap();
        match slots.remove(&path) {
            Some(Slot::Sender(t)) if !t.done.is_closed() => return receive(relay, &path, t),
            Some(slot) if slot.is_alive() => {
                slots.insert(path, slot);
                return status(StatusCode::BAD_REQUEST);
            }
            _ => {
                let (tx, rx) = oneshot::channel();
                slots.insert(path.clone(), Slot::Receiver(tx));
                rx
            }
        }
    };

    match rx.await {
        Ok(t) => receive(relay, &path, t),
        Err(..) => status(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

async fn send(req: Request<Incoming>, relay: &Relay) -> Response<BoxBody> {
    let path = req.uri().path().to_string();
    let (parts, incoming) = req.into_parts();
    let mut body = incoming.map_err(anyhow::Error::from).boxed_unsync();

    let mut headers = HeaderMap::new();
    if let Some(boundary) = multipart_boundary(&parts.headers) {
        let Ok(form) = body.collect().await else {
            return status(StatusCode::BAD_REQUEST);
        };
        let Some((part_headers, payload)) = decode_form(&form.to_bytes(), &boundary) else {
            return status(StatusCode::BAD_REQUEST);
        };
        headers = part_headers;
        body = body::full(payload);
    } else if let Some(content_type) = parts.headers.get(header::CONTENT_TYPE) {
        headers.insert(header::CONTENT_TYPE, content_type.clone());
    }

    let (done, rx) = mpsc::channel(1);
    let (paired, on_paired) = oneshot::channel();
    let transfer = Transfer { body, headers, done, paired };

    {
        let mut slots = relay.slots.lock().unwrap();
        match slots.remove(&path) {
            Some(Slot::Receiver(tx)) if !tx.is_closed() => {
                if let Err(transfer) = tx.send(transfer) {
                    slots.insert(path, Slot::Sender(transfer));
                }
            }
            Some(slot) if slot.is_alive() => {
                slots.insert(path, slot);
                if relay.faults.accept_same_path {
                    return Response::new(body::empty());
                }
                return status(StatusCode::BAD_REQUEST);
            }
            _ => {
                slots.insert(path, Slot::Sender(transfer));
            }
        }
    }

    if relay.faults.late_sender_response {
        let _ = on_paired.await;
    }
    Response::new(StreamBody::new(ReceiverStream::new(rx)).boxed_unsync())
}

async fn handle(req: Request<Incoming>, relay: Arc<Relay>) -> Result<Response<BoxBody>, Infallible> {
    let resp = match *req.method() {
        Method::GET => get(req, &relay).await,
        Method::POST | Method::PUT => send(req, &relay).await,
        _ => status(StatusCode::METHOD_NOT_ALLOWED),
    };

    Ok(resp)
}

/// Starts the relay, returning its schemaless URL.
async fn start_relay(faults: Faults) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let relay = Arc::new(Relay { faults, ..Default::default() });

    tokio::spawn(async move {
        while let Ok((stream, ..)) = listener.accept().await {
            let relay = relay.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| handle(req, relay.clone()));
                let _ = auto::Builder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    format!("//127.0.0.1:{port}")
}

async fn run_config_with(protocol: Protocol, faults: Faults) -> RunConfig {
    let mut cfg = RunConfig::new(protocol, TargetConfig::SchemalessUrl(start_relay(faults).await));
    cfg.timeouts.receiver_wrote_to_cancel = Duration::from_millis(100);
    cfg.timeouts.after_receiver_cancel = Duration::from_millis(100);
    cfg.timeouts.after_sender_cancel = Duration::from_millis(100);
    cfg.simultaneous_requests = 3;
    cfg
}

async fn run_config(protocol: Protocol) -> RunConfig {
    run_config_with(protocol, Faults::default()).await
}

async fn run_check(name: &str, cfg: RunConfig) -> Vec<CheckResult> {
    let check = all_checks()
        .into_iter()
        .find(|c| c.name() == name)
        .unwrap();
    let protocol = cfg.protocol;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let reporter = Reporter::new(tx);
    tokio::time::timeout(Duration::from_secs(30), check.run(cfg, reporter.clone()))
        .await
        .unwrap();
    reporter.close();

    let mut results = Vec::new();
    while let Some(sub) = rx.recv().await {
        results.push(CheckResult::new(name, protocol, sub));
    }
    results
}

fn assert_all_ok(results: &[CheckResult], expected: &[&str]) {
    for r in results {
        assert!(r.ok && r.warnings.is_empty(), "{r:?}");
    }
    let names: Vec<_> = results.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(expected, names);
}

fn find<'a>(results: &'a [CheckResult], name: &str) -> &'a CheckResult {
    results
        .iter()
        .find(|r| r.name == name)
        .unwrap_or_else(|| panic!("no {name} in {results:?}"))
}

fn error_messages(r: &CheckResult) -> Vec<&str> {
    r.errors.iter().map(|e| e.message.as_str()).collect()
}

#[tokio::test]
async fn test_post_first() {
    for protocol in [Protocol::Http1_1, Protocol::H2c] {
        let results = run_check("post_first", run_config(protocol).await).await;

        assert_all_ok(
            &results,
            &[
                "post_first.sender_response_before_receiver",
                "post_first.same_path_sender_rejection",
                "post_first.content_type_forwarding",
                "post_first.x_robots_tag_none",
                "post_first.transferred",
                "post_first.reuse_path",
            ],
        );
    }
}

#[tokio::test]
async fn test_post_first_http1_0() {
    let results = run_check("post_first", run_config(Protocol::Http1_0).await).await;

    assert_all_ok(
        &results,
        &[
            "post_first.sender_response_before_receiver",
            "post_first.same_path_sender_rejection",
            "post_first.content_type_forwarding",
            "post_first.x_robots_tag_none",
            "post_first.transferred",
            "post_first.reuse_path",
        ],
    );
}

#[tokio::test]
async fn test_streaming_skipped_over_http1_0() {
    let results = run_check("post_first_byte_by_byte_streaming", run_config(Protocol::Http1_0).await).await;

    assert_all_ok(&results, &["post_first_byte_by_byte_streaming"]);
    assert_eq!(
        Some("skipped: no streaming body over HTTP/1.0"),
        results[0].message.as_deref()
    );
}

#[tokio::test]
async fn test_put() {
    let results = run_check("put", run_config(Protocol::Http1_1).await).await;

    assert!(results.iter().all(|r| r.ok), "{results:?}");
    assert!(results.iter().any(|r| r.name == "put.transferred"));
}

#[tokio::test]
async fn test_get_first() {
    for protocol in [Protocol::Http1_1, Protocol::H2c] {
        let results = run_check("get_first", run_config(protocol).await).await;

        assert_all_ok(
            &results,
            &[
                "get_first.content_type_forwarding",
                "get_first.x_robots_tag_none",
                "get_first.transferred",
                "get_first.reuse_path",
            ],
        );
    }
}

#[tokio::test]
async fn test_byte_by_byte_streaming() {
    for protocol in [Protocol::Http1_1, Protocol::H2c] {
        let results = run_check("post_first_byte_by_byte_streaming", run_config(protocol).await).await;

        assert_all_ok(&results, &["post_first_byte_by_byte_streaming.transferred"]);
    }
}

#[tokio::test]
async fn test_get_cancel_get() {
    let results = run_check("get_cancel_get", run_config(Protocol::H2c).await).await;

    assert_all_ok(&results, &["get_cancel_get"]);
}

#[tokio::test]
async fn test_post_cancel_post() {
    let results = run_check("post_cancel_post", run_config(Protocol::H2c).await).await;

    assert_all_ok(&results, &["post_cancel_post", "post_cancel_post.transferred"]);
}

#[tokio::test]
async fn test_service_worker_registration_rejection() {
    let results = run_check("service_worker_registration_rejection", run_config(Protocol::Http1_1).await).await;

    assert_all_ok(&results, &["service_worker_registration_rejection"]);
}

#[tokio::test]
async fn test_service_worker_request_closed_after_timeout() {
    // Accepted by the kernel, never answered.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut cfg = RunConfig::new(
        Protocol::Http1_1,
        TargetConfig::SchemalessUrl(format!("//127.0.0.1:{port}")),
    );
    cfg.timeouts.service_worker = Duration::from_millis(200);

    let results = run_check("service_worker_registration_rejection", cfg).await;
    assert_all_ok(&results, &["service_worker_registration_rejection"]);

    let (mut stream, ..) = listener.accept().await.unwrap();
    let closed = tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut Vec::new())).await;
    assert!(closed.is_ok(), "connection outlived the check");
}

#[tokio::test]
async fn test_multipart_form_data() {
    for protocol in [Protocol::Http1_1, Protocol::H2c] {
        let results = run_check("multipart_form_data", run_config(protocol).await).await;

        assert_all_ok(
            &results,
            &[
                "multipart_form_data.content_type_forwarding",
                "multipart_form_data.content_disposition_forwarding",
                "multipart_form_data.transferred",
            ],
        );
    }
}

#[tokio::test]
async fn test_simultaneous_request() {
    let results = run_check("simultaneous_request", run_config(Protocol::H2c).await).await;

    assert_all_ok(&results, &["simultaneous_request"]);
    assert_eq!(
        Some("all 3 simultaneous requests successfully transferred"),
        results[0].message.as_deref()
    );
}

#[tokio::test]
async fn test_long_transfer() {
    let mut cfg = run_config(Protocol::H2c).await;
    cfg.transfer_speed = 256 * 1024;
    cfg.transfer_spans = vec![Duration::from_millis(200), Duration::from_millis(400)];

    let results = run_check("post_first_chunked_long_transfer", cfg).await;

    assert_all_ok(
        &results,
        &[
            "post_first_chunked_long_transfer.partial_transfer",
            "post_first_chunked_long_transfer.partial_transfer",
            "post_first_chunked_long_transfer.transferred",
        ],
    );
    assert!(results[0].message.as_deref().unwrap().starts_with("200ms: "));
}

#[tokio::test]
async fn test_late_sender_response_warned() {
    let faults = Faults { late_sender_response: true, ..Default::default() };
    let mut cfg = run_config_with(Protocol::H2c, faults).await;
    cfg.timeouts.sender_response_before_receiver = Duration::from_millis(300);

    let results = run_check("post_first", cfg).await;

    let r = find(&results, "post_first.sender_response_before_receiver");
    assert!(r.ok);
    assert_eq!(
        "sender's response header should be arrived before receiver's request",
        r.warnings[0].message
    );
    assert!(!results.iter().any(|r| r.name == "post_first.same_path_sender_rejection"));
    assert!(find(&results, "post_first.transferred").ok);
    assert!(results.iter().all(|r| r.ok), "{results:?}");
}

#[tokio::test]
async fn test_same_path_sender_accepted() {
    let faults = Faults { accept_same_path: true, ..Default::default() };
    let results = run_check("post_first", run_config_with(Protocol::H2c, faults).await).await;

    let r = find(&results, "post_first.same_path_sender_rejection");
    assert_eq!(vec!["expected 4xx status but found: 200"], error_messages(r));
    assert!(find(&results, "post_first.transferred").ok);
}

#[tokio::test]
async fn test_buffering_relay_fails_byte_by_byte() {
    let faults = Faults { buffering: true, ..Default::default() };
    let mut cfg = run_config_with(Protocol::H2c, faults).await;
    cfg.timeouts.first_byte = Duration::from_millis(300);

    let results = run_check("post_first_byte_by_byte_streaming", cfg).await;

    assert_eq!(1, results.len(), "{results:?}");
    assert_eq!("post_first_byte_by_byte_streaming", results[0].name);
    assert_eq!(vec!["failed to get first byte in 300ms"], error_messages(&results[0]));
}

#[tokio::test]
async fn test_buffering_relay_fails_long_transfer() {
    let faults = Faults { buffering: true, ..Default::default() };
    let mut cfg = run_config_with(Protocol::H2c, faults).await;
    cfg.timeouts.first_byte = Duration::from_millis(300);
    cfg.transfer_speed = 64 * 1024;
    cfg.transfer_spans = vec![Duration::from_millis(200)];

    let results = run_check("post_first_chunked_long_transfer", cfg).await;

    assert_eq!(1, results.len(), "{results:?}");
    assert!(!results[0].ok);
    assert!(
        results[0].errors[0].message.starts_with("no data received in 300ms after"),
        "{results:?}"
    );
}

#[tokio::test]
async fn test_reused_path_corrupted() {
    let faults = Faults { corrupt_reuse: true, ..Default::default() };
    let results = run_check("post_first", run_config_with(Protocol::H2c, faults).await).await;

    assert!(find(&results, "post_first.transferred").ok);
    let r = find(&results, "post_first.reuse_path");
    assert_eq!(vec!["message different"], error_messages(r));
}

#[tokio::test]
async fn test_unreachable_target() {
    let cfg = RunConfig::new(Protocol::Http1_1, TargetConfig::SchemalessUrl("//127.0.0.1:1".into()));
    let results = run_check("post_first", cfg).await;

    assert_eq!(1, results.len());
    assert!(!results[0].ok);
    assert!(results[0].errors[0].message.starts_with("failed to POST"), "{results:?}");
}
