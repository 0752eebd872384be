//! Building blocks shared by the checks.

use core::{future::Future, ops::Range};
use std::sync::Arc;

use bytes::Bytes;
use http::{header, HeaderName, Method, Request, Response, StatusCode};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::{
    cfg::RunConfig,
    engine::{
        http::{body, used_tls, BoxBody, Client, SendOptions},
        target,
    },
    oneshot::Oneshot,
    protocol::{self, Protocol},
    report::{sub, Reporter, ResultError, ResultWarning, SubResult},
};

pub const MESSAGE: &str = "my message";
pub const REUSE_MESSAGE: &str = "message for reuse";
pub const CONTENT_TYPE: &str = "text/plain";

/// Fresh path on the target, so that units never share state on the server.
pub fn new_url(base: &str) -> String {
    format!("{base}/{}", Uuid::new_v4())
}

/// Verifies that the response came over the expected wire version and TLS
/// mode.
pub fn check_protocol<B>(resp: &Response<B>, expected: Protocol) -> Vec<ResultError> {
    let mut errors = Vec::new();

    if resp.version() != expected.version() {
        errors.push(ResultError::new(format!(
            "expected {} but {}",
            expected.version_str(),
            protocol::version_str(resp.version())
        )));
    }

    match (expected.uses_tls(), used_tls(resp)) {
        (true, false) => errors.push(ResultError::new("should use TLS but not used")),
        (false, true) => errors.push(ResultError::new("should not use TLS but used")),
        _ => {}
    }

    errors
}

/// Renders a status range the way it appears in messages, e.g. `4xx`.
pub fn status_range_str(range: &Range<u16>) -> String {
    if range.start % 100 == 0 && range.end == range.start + 100 {
        format!("{}xx", range.start / 100)
    } else {
        format!("[{}, {})", range.start, range.end)
    }
}

/// Order of the sender and the receiver in [`Ctx::transfer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    /// Both start at once.
    Concurrent,
    /// The sender starts once the receiver's request has reached the server.
    AfterReceiverWrote,
}

/// A request running in the background.
///
/// Whoever runs the request decides when it counts as responded: the
/// `responded` cell is fulfilled when the future yields a response and closed
/// when it yields nothing.
///
/// Dropping it aborts the request together with its connection.
#[derive(Debug)]
pub struct InFlight {
    responded: Oneshot<()>,
    task: JoinHandle<Option<Response<BoxBody>>>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl InFlight {
    pub fn spawn<F>(f: F) -> Self
    where
        F: Future<Output = Option<Response<BoxBody>>> + Send + 'static,
    {
        let responded = Oneshot::new();
        let cell = responded.clone();

        let task = tokio::spawn(async move {
            let _guard = cell.close_on_drop();
            let resp = f.await;
            if resp.is_some() {
                cell.send(());
            }
            resp
        });

        Self { responded, task }
    }

    /// Waits until the request either responded or failed.
    ///
    /// Returns whether it responded.
    pub async fn responded(&self) -> bool {
        self.responded.recv().await.is_some()
    }

    pub async fn response(mut self) -> Option<Response<BoxBody>> {
        match (&mut self.task).await {
            Ok(resp) => resp,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(err) => {
                log::debug!("request task stopped: {err}");
                None
            }
        }
    }
}

/// Everything a check run needs: its configuration, a client speaking the
/// unit's protocol and the result sink.
#[derive(Debug, Clone)]
pub struct Ctx {
    pub cfg: Arc<RunConfig>,
    pub client: Client,
    pub reporter: Reporter,
}

impl Ctx {
    pub fn new(cfg: RunConfig, reporter: Reporter) -> Option<Self> {
        match Client::new(cfg.protocol, cfg.tls_skip_verify) {
            Ok(client) => Some(Self { cfg: Arc::new(cfg), client, reporter }),
            Err(err) => {
                reporter.report(SubResult::error(ResultError::with_cause("failed to create HTTP client", err)));
                None
            }
        }
    }

    #[inline]
    pub fn protocol(&self) -> Protocol {
        self.cfg.protocol
    }

    #[inline]
    pub fn report(&self, result: SubResult) {
        self.reporter.report(result)
    }

    /// Runs `f` against a freshly acquired target.
    pub async fn with_target<F, Fut>(&self, f: F)
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = ()>,
    {
        target::with_target(&self.cfg, &self.reporter, f).await
    }

    pub fn request(&self, method: Method, url: &str, body: BoxBody, content_type: Option<&str>) -> Option<Request<BoxBody>> {
        let mut req = Request::builder().method(method.clone()).uri(url);
        if let Some(content_type) = content_type {
            req = req.header(header::CONTENT_TYPE, content_type);
        }

        match req.body(body) {
            Ok(req) => Some(req),
            Err(err) => {
                self.report(SubResult::error(ResultError::with_cause(
                    format!("failed to create {method} request"),
                    err,
                )));
                None
            }
        }
    }

    #[inline]
    pub fn get_request(&self, url: &str) -> Option<Request<BoxBody>> {
        self.request(Method::GET, url, body::empty(), None)
    }

    /// Sends the request and verifies the response head.
    ///
    /// Transport failures and non-200 statuses are reported and yield
    /// nothing. A protocol mismatch is reported but the response is still
    /// returned.
    pub async fn send(&self, req: Request<BoxBody>, opts: SendOptions) -> Option<Response<BoxBody>> {
        let method = req.method().clone();

        let resp = match self.client.send(req, opts).await {
            Ok(resp) => resp,
            Err(err) => {
                self.report(SubResult::error(ResultError::with_cause(format!("failed to {method}"), err)));
                return None;
            }
        };

        self.check_protocol(&resp);
        if resp.status() != StatusCode::OK {
            self.report(SubResult::error(ResultError::new(format!(
                "not OK status: {}",
                resp.status().as_u16()
            ))));
            return None;
        }

        Some(resp)
    }

    pub fn check_protocol<B>(&self, resp: &Response<B>) {
        let errors = check_protocol(resp, self.protocol());
        if !errors.is_empty() {
            self.report(SubResult::named(sub::PROTOCOL).with_errors(errors));
        }
    }

    /// Spawns [`Ctx::send`] in the background.
    pub fn spawn_send(&self, req: Request<BoxBody>, opts: SendOptions) -> InFlight {
        let ctx = self.clone();
        InFlight::spawn(async move { ctx.send(req, opts).await })
    }

    /// Spawns a GET of `url`, observing when it has been written.
    pub fn spawn_get(&self, url: &str, wrote: Option<Oneshot<()>>) -> Option<InFlight> {
        let req = self.get_request(url)?;
        let opts = SendOptions { wrote, ..Default::default() };

        Some(self.spawn_send(req, opts))
    }

    /// Waits until the receiver's request has reached the server.
    ///
    /// h3 has no such signal, so a fixed wait is used instead and reported as
    /// a warning. Returns `false` if the request failed before being written.
    pub async fn wait_receiver_wrote(&self, wrote: &Oneshot<()>) -> bool {
        if self.protocol().supports_write_instrumentation() {
            return wrote.recv().await.is_some();
        }

        self.report(
            SubResult::ok().with_warning(ResultWarning::new("Sorry. WroteRequest detection not supported in HTTP/3")),
        );
        tokio::time::sleep(self.cfg.timeouts.h3_wrote_request_wait).await;

        true
    }

    /// Waits for the receiver's response head.
    ///
    /// Reports an error if it does not arrive in time.
    pub async fn wait_receiver(&self, get: InFlight) -> Option<Response<BoxBody>> {
        let timeout = self.cfg.timeouts.get_response;

        match tokio::time::timeout(timeout, get.responded()).await {
            Ok(true) => get.response().await,
            Ok(false) => None,
            Err(..) => {
                self.report(SubResult::error(ResultError::new(format!(
                    "failed to get receiver's response in {timeout:?}"
                ))));
                None
            }
        }
    }

    /// Receives a short, fixed-length message and compares it.
    ///
    /// A mismatch is reported under `sub`.
    pub async fn receive_message(&self, get: InFlight, expected: &[u8], sub: Option<&'static str>) -> bool {
        let timeout = self.cfg.timeouts.fixed_length_body_get;

        let received = async {
            let resp = get.response().await?;
            Some(body::read_all(resp.into_body()).await)
        };
        let data = match tokio::time::timeout(timeout, received).await {
            Ok(Some(Ok(data))) => data,
            Ok(Some(Err(err))) => {
                self.report(sub_result(sub).with_error(ResultError::with_cause("failed to read up", err)));
                return false;
            }
            Ok(None) => return false,
            Err(..) => {
                self.report(sub_result(sub).with_error(ResultError::new(format!(
                    "failed to receive GET body in {timeout:?}"
                ))));
                return false;
            }
        };

        if data != expected {
            self.report(sub_result(sub).with_error(ResultError::new("message different")));
            return false;
        }

        true
    }

    /// Reads the sender's response body to the end.
    pub async fn drain_sender(&self, sub: Option<&'static str>, resp: Response<BoxBody>) -> bool {
        match body::drain(resp.into_body()).await {
            Ok(()) => true,
            Err(err) => {
                self.report(sub_result(sub).with_error(ResultError::with_cause("failed to read sender response body", err)));
                false
            }
        }
    }

    pub fn check_content_type_forwarding<B>(&self, resp: &Response<B>, expected: &str) {
        self.check_forwarded(resp, header::CONTENT_TYPE, "Content-Type", sub::CONTENT_TYPE_FORWARDING, expected);
    }

    pub fn check_content_disposition_forwarding<B>(&self, resp: &Response<B>, expected: &str) {
        self.check_forwarded(
            resp,
            header::CONTENT_DISPOSITION,
            "Content-Disposition",
            sub::CONTENT_DISPOSITION_FORWARDING,
            expected,
        );
    }

    fn check_forwarded<B>(&self, resp: &Response<B>, name: HeaderName, display: &str, sub_name: &'static str, expected: &str) {
        let received = header_str(resp, &name);

        let mut result = SubResult::named(sub_name);
        if received != expected {
            result = result.with_error(ResultError::new(format!(
                "{display} should be {expected} but found {received}"
            )));
        }
        self.report(result);
    }

    /// `X-Robots-Tag: none` is recommended, not required.
    pub fn check_x_robots_tag<B>(&self, resp: &Response<B>) {
        let received = header_str(resp, &HeaderName::from_static("x-robots-tag"));

        let mut result = SubResult::named(sub::X_ROBOTS_TAG_NONE);
        if received != "none" {
            result = result.with_warning(ResultWarning::new(format!(
                "X-Robots-Tag should be none but found {received}"
            )));
        }
        self.report(result);
    }

    /// Transfers `message` from a POST to a GET on `url`.
    ///
    /// Failures are reported, mismatches under `sub`. Success is left for the
    /// caller to report.
    pub async fn transfer(&self, url: &str, message: &'static str, order: Order, sub: Option<&'static str>) -> bool {
        let get_wrote = Oneshot::new();
        let wrote = match order {
            Order::Concurrent => None,
            Order::AfterReceiverWrote => Some(get_wrote.clone()),
        };
        let Some(get) = self.spawn_get(url, wrote) else {
            return false;
        };

        let Some(req) = self.request(Method::POST, url, body::full(message), None) else {
            return false;
        };
        let post = {
            let ctx = self.clone();
            InFlight::spawn(async move {
                if order == Order::AfterReceiverWrote && !ctx.wait_receiver_wrote(&get_wrote).await {
                    return None;
                }
                ctx.send(req, SendOptions::default()).await
            })
        };

        let ok = tokio::select! {
            ok = get.responded() => ok,
            ok = post.responded() => ok,
        };
        if !ok {
            return false;
        }

        if !self.receive_message(get, message.as_bytes(), sub).await {
            return false;
        }
        let Some(resp) = post.response().await else {
            return false;
        };

        self.drain_sender(sub, resp).await
    }

    /// Verifies that the path can be used again after a transfer.
    pub async fn reuse_path(&self, url: &str) {
        if self
            .transfer(url, REUSE_MESSAGE, Order::Concurrent, Some(sub::REUSE_PATH))
            .await
        {
            self.report(SubResult::named(sub::REUSE_PATH));
        }
    }
}

#[inline]
fn sub_result(sub: Option<&'static str>) -> SubResult {
    SubResult { name: sub, ..Default::default() }
}

fn header_str<'a, B>(resp: &'a Response<B>, name: &HeaderName) -> &'a str {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

/// Data written by the sender, one frame per call.
#[inline]
pub fn byte(b: u8) -> Bytes {
    Bytes::copy_from_slice(&[b])
}

#[cfg(test)]
mod test {
    use core::time::Duration;

    use http::Version;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::engine::http::Tls;

    fn response(version: Version, tls: bool) -> Response<()> {
        let mut resp = Response::new(());
        *resp.version_mut() = version;
        if tls {
            resp.extensions_mut().insert(Tls);
        }
        resp
    }

    #[test]
    fn test_check_protocol_ok() {
        assert!(check_protocol(&response(Version::HTTP_11, false), Protocol::Http1_1).is_empty());
        assert!(check_protocol(&response(Version::HTTP_2, true), Protocol::H2).is_empty());
        assert!(check_protocol(&response(Version::HTTP_10, true), Protocol::Http1_0Tls).is_empty());
    }

    #[test]
    fn test_check_protocol_mismatch() {
        let errors = check_protocol(&response(Version::HTTP_11, false), Protocol::H2);

        assert_eq!(
            vec![
                ResultError::new("expected HTTP/2.0 but HTTP/1.1"),
                ResultError::new("should use TLS but not used"),
            ],
            errors
        );

        let errors = check_protocol(&response(Version::HTTP_2, true), Protocol::H2c);
        assert_eq!(vec![ResultError::new("should not use TLS but used")], errors);
    }

    #[test]
    fn test_status_range_str() {
        assert_eq!("4xx", status_range_str(&(400..500)));
        assert_eq!("[400, 410)", status_range_str(&(400..410)));
    }

    #[test]
    fn test_new_url() {
        let a = new_url("http://localhost:8080");
        let b = new_url("http://localhost:8080");

        assert!(a.starts_with("http://localhost:8080/"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_in_flight_closes_without_response() {
        let req = InFlight::spawn(async { None });

        assert!(!req.responded().await);
        assert!(req.response().await.is_none());
    }

    #[tokio::test]
    async fn test_in_flight_responded() {
        let req = InFlight::spawn(async { Some(Response::new(body::full("x"))) });

        assert!(req.responded().await);
        let resp = req.response().await.unwrap();
        assert_eq!(Bytes::from_static(b"x"), body::read_all(resp.into_body()).await.unwrap());
    }

    #[tokio::test]
    async fn test_in_flight_aborts_on_drop() {
        let token = CancellationToken::new();
        let req = {
            let guard = token.clone().drop_guard();
            InFlight::spawn(async move {
                let _guard = guard;
                core::future::pending().await
            })
        };

        drop(req);
        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .unwrap();
    }

    async fn broken() -> Option<Response<BoxBody>> {
        panic!("broken request");
    }

    #[tokio::test]
    #[should_panic(expected = "broken request")]
    async fn test_in_flight_resumes_panic() {
        InFlight::spawn(broken()).response().await;
    }
}
