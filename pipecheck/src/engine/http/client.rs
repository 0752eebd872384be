use core::future::Future;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use http::{header, request::Parts, uri::PathAndQuery, HeaderValue, Request, Response, Uri};
use http_body_util::BodyExt;
use hyper::client::conn::{http1, http2};
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::ClientConfig;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tokio_util::sync::CancellationToken;

use super::{
    body::{BoxBody, Guarded},
    h3,
    io::{ObservedIo, WireWatch, WriteSignal},
    raw,
    tls::{self, ALPN_H2, ALPN_H3, ALPN_HTTP1},
};
use crate::{oneshot::Oneshot, protocol::Protocol};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The caller canceled the request before the response head arrived.
    #[error("canceled")]
    Canceled,
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

/// Response extension present when the exchange went over TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tls;

#[inline]
pub fn used_tls<B>(resp: &Response<B>) -> bool {
    resp.extensions().get::<Tls>().is_some()
}

#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Aborts the exchange.
    ///
    /// Before the response head this fails the request with
    /// [`Error::Canceled`]; afterwards it tears the connection down, which
    /// fails the response body.
    pub cancel: Option<CancellationToken>,
    /// Fulfilled once the whole request has been written to the wire.
    ///
    /// Closed without a value if the request fails first. Never fulfilled
    /// over h3.
    pub wrote: Option<Oneshot<()>>,
}

impl SendOptions {
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_wrote(mut self, wrote: Oneshot<()>) -> Self {
        self.wrote = Some(wrote);
        self
    }
}

/// HTTP client bound to a single protocol variant.
///
/// Every request goes over its own fresh connection.
#[derive(Debug, Clone)]
pub struct Client {
    protocol: Protocol,
    tls: Option<Arc<ClientConfig>>,
}

impl Client {
    pub fn new(protocol: Protocol, skip_verify: bool) -> Result<Self, anyhow::Error> {
        let tls = match protocol {
            Protocol::Http1_0 | Protocol::Http1_1 | Protocol::H2c => None,
            Protocol::Http1_0Tls | Protocol::Http1_1Tls => Some(tls::client_config(skip_verify, ALPN_HTTP1, false)?),
            Protocol::H2 => Some(tls::client_config(skip_verify, ALPN_H2, false)?),
            Protocol::H3 => Some(tls::client_config(skip_verify, ALPN_H3, true)?),
        };

        Ok(Self { protocol, tls })
    }

    #[inline]
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub async fn send(&self, req: Request<BoxBody>, opts: SendOptions) -> Result<Response<BoxBody>, Error> {
        let SendOptions { cancel, wrote } = opts;
        let cancel = cancel.unwrap_or_default();
        let signal = WriteSignal::new(wrote);

        log::trace!("{} {} {}", self.protocol, req.method(), req.uri());

        // The connection goes away with this exchange unless a response
        // head comes back.
        let conn = cancel.child_token();
        let guard = conn.clone().drop_guard();

        let resp = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Canceled),
            res = self.do_send(req, signal, conn) => res?,
        };
        guard.disarm();

        Ok(resp)
    }

    async fn do_send(
        &self,
        req: Request<BoxBody>,
        signal: WriteSignal,
        cancel: CancellationToken,
    ) -> Result<Response<BoxBody>, anyhow::Error> {
        let tls = match (&self.tls, self.protocol) {
            (Some(tls), Protocol::H3) => {
                drop(signal);
                let mut resp = h3::send(tls.clone(), req, cancel).await?;
                resp.extensions_mut().insert(Tls);
                return Ok(resp);
            }
            (tls, ..) => tls.clone(),
        };

        let (host, port) = endpoint(req.uri())?;
        let stream = TcpStream::connect((host.as_str(), port))
            .await
            .with_context(|| format!("failed to connect to {host}:{port}"))?;
        stream.set_nodelay(true)?;

        match tls {
            Some(tls) => {
                let stream = tls::connect(tls, &host, stream).await?;
                let mut resp = self.send_over(stream, req, signal, cancel).await?;
                resp.extensions_mut().insert(Tls);
                Ok(resp)
            }
            None => self.send_over(stream, req, signal, cancel).await,
        }
    }

    async fn send_over<S>(
        &self,
        io: S,
        req: Request<BoxBody>,
        signal: WriteSignal,
        cancel: CancellationToken,
    ) -> Result<Response<BoxBody>, anyhow::Error>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        match self.protocol {
            Protocol::Http1_0 | Protocol::Http1_0Tls => raw::send(io, req, signal, cancel).await,
            Protocol::Http1_1 | Protocol::Http1_1Tls => send_http1(io, req, signal, cancel).await,
            Protocol::H2 | Protocol::H2c => send_h2(io, req, signal, cancel).await,
            Protocol::H3 => Err(anyhow!("h3 does not run over a byte stream")),
        }
    }
}

async fn send_http1<S>(
    io: S,
    req: Request<BoxBody>,
    signal: WriteSignal,
    cancel: CancellationToken,
) -> Result<Response<BoxBody>, anyhow::Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut parts, body) = req.into_parts();
    into_origin_form(&mut parts)?;

    let (watch, body) = WireWatch::http1(body);
    let io = ObservedIo::new(io, watch, signal);
    let (mut sender, conn) = http1::handshake(TokioIo::new(io)).await?;
    drive(conn, cancel);

    sender.ready().await?;
    let resp = sender.send_request(Request::from_parts(parts, body)).await?;

    Ok(resp.map(|body| Guarded::new(body.map_err(anyhow::Error::from), sender).boxed_unsync()))
}

async fn send_h2<S>(
    io: S,
    req: Request<BoxBody>,
    signal: WriteSignal,
    cancel: CancellationToken,
) -> Result<Response<BoxBody>, anyhow::Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = ObservedIo::new(io, WireWatch::h2(), signal);
    let (mut sender, conn) = http2::handshake(TokioExecutor::new(), TokioIo::new(io)).await?;
    drive(conn, cancel);

    sender.ready().await?;
    let resp = sender.send_request(req).await?;

    Ok(resp.map(|body| Guarded::new(body.map_err(anyhow::Error::from), sender).boxed_unsync()))
}

/// Runs the connection until it finishes or the exchange is canceled.
fn drive<F>(conn: F, cancel: CancellationToken)
where
    F: Future<Output = Result<(), hyper::Error>> + Send + 'static,
{
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => log::trace!("connection canceled"),
            res = conn => {
                if let Err(err) = res {
                    log::debug!("connection failed: {err}");
                }
            }
        }
    });
}

fn endpoint(uri: &Uri) -> Result<(String, u16), anyhow::Error> {
    let host = uri.host().ok_or_else(|| anyhow!("URI has no host: {uri}"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
    let port = match uri.port_u16() {
        Some(port) => port,
        None if uri.scheme_str() == Some("https") => 443,
        None => 80,
    };

    Ok((host, port))
}

/// Moves the authority of an absolute URI into the `Host` header.
fn into_origin_form(parts: &mut Parts) -> Result<(), anyhow::Error> {
    let authority = parts
        .uri
        .authority()
        .ok_or_else(|| anyhow!("URI has no authority: {}", parts.uri))?;

    if !parts.headers.contains_key(header::HOST) {
        parts
            .headers
            .insert(header::HOST, HeaderValue::from_str(authority.as_str())?);
    }

    let path = parts
        .uri
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));
    parts.uri = Uri::from(path);

    Ok(())
}
