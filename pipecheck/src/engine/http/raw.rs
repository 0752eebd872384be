//! Minimal HTTP/1.0 client.
//!
//! One request per connection: the request is written with an explicit
//! `Content-Length`, and the response body is delimited either by its
//! `Content-Length` or by the server closing the connection.

use anyhow::{anyhow, bail, Context, Error};
use bytes::{Bytes, BytesMut};
use http::{header, HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode, Version};
use http_body_util::BodyExt;
use hyper::body::Body;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use super::{
    body::{self, BodySender, BoxBody},
    io::WriteSignal,
};

const MAX_HEADERS: usize = 64;
const READ_BUF_SIZE: usize = 16 * 1024;

pub async fn send<S>(
    mut stream: S,
    req: Request<BoxBody>,
    mut signal: WriteSignal,
    cancel: CancellationToken,
) -> Result<Response<BoxBody>, Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (parts, mut body) = req.into_parts();
    let len = body
        .size_hint()
        .exact()
        .context("HTTP/1.0 request body must have a known length")?;

    let head = encode_head(&parts.method, &parts.uri, &parts.headers, len)?;
    stream.write_all(&head).await?;
    while let Some(frame) = body.frame().await {
        if let Ok(data) = frame?.into_data() {
            stream.write_all(&data).await?;
        }
    }
    stream.flush().await?;
    signal.fire();

    let mut buf = BytesMut::with_capacity(READ_BUF_SIZE);
    let (head_len, head) = loop {
        if let Some(head) = parse_head(&buf)? {
            break head;
        }
        if stream.read_buf(&mut buf).await? == 0 {
            bail!("connection closed before response head");
        }
    };
    let rest = buf.split_off(head_len).freeze();

    let content_length = match head.headers().get(header::CONTENT_LENGTH) {
        Some(v) => Some(v.to_str()?.trim().parse::<u64>().context("invalid Content-Length")?),
        None => None,
    };

    let (tx, body) = body::channel(4);
    tokio::spawn(async move {
        let res = tokio::select! {
            _ = cancel.cancelled() => Err(anyhow!("canceled")),
            _ = tx.closed() => Ok(()),
            res = pump(stream, rest, content_length, &tx) => res,
        };

        if let Err(err) = res {
            tx.abort(err).await;
        }
    });

    Ok(head.map(|()| body))
}

fn encode_head(
    method: &http::Method,
    uri: &http::Uri,
    headers: &HeaderMap,
    content_length: u64,
) -> Result<BytesMut, Error> {
    let host = uri.authority().ok_or_else(|| anyhow!("URI has no authority: {uri}"))?;
    let path = uri.path_and_query().map(|v| v.as_str()).unwrap_or("/");

    let mut buf = BytesMut::with_capacity(256);
    buf.extend_from_slice(format!("{method} {path} HTTP/1.0\r\nHost: {host}\r\n").as_bytes());
    if content_length > 0 {
        buf.extend_from_slice(format!("Content-Length: {content_length}\r\n").as_bytes());
    }
    for (name, value) in headers {
        if name == header::HOST || name == header::CONTENT_LENGTH {
            continue;
        }
        buf.extend_from_slice(name.as_str().as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");

    Ok(buf)
}

/// Parses the response head.
///
/// Returns the head length together with the response, or [`None`] if more
/// bytes are needed.
fn parse_head(buf: &[u8]) -> Result<Option<(usize, Response<()>)>, Error> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);

    let len = match resp.parse(buf)? {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => return Ok(None),
    };

    let version = match resp.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };
    let status = StatusCode::from_u16(resp.code.unwrap_or(0))?;

    let mut map = HeaderMap::new();
    for h in resp.headers.iter() {
        map.append(HeaderName::from_bytes(h.name.as_bytes())?, HeaderValue::from_bytes(h.value)?);
    }

    let mut head = Response::new(());
    *head.status_mut() = status;
    *head.version_mut() = version;
    *head.headers_mut() = map;

    Ok(Some((len, head)))
}

async fn pump<S>(mut stream: S, rest: Bytes, content_length: Option<u64>, tx: &BodySender) -> Result<(), Error>
where
    S: AsyncRead + Unpin,
{
    let mut left = content_length.unwrap_or(u64::MAX);

    if !rest.is_empty() {
        let rest = rest.slice(..rest.len().min(left as usize));
        left -= rest.len() as u64;
        tx.send(rest).await?;
    }

    let mut buf = BytesMut::with_capacity(READ_BUF_SIZE);
    while left > 0 {
        buf.reserve(READ_BUF_SIZE);
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            if content_length.is_some() {
                bail!("connection closed with {left} body bytes left");
            }
            break;
        }

        let chunk = buf.split().freeze();
        let chunk = chunk.slice(..chunk.len().min(left as usize));
        left -= chunk.len() as u64;
        tx.send(chunk).await?;
    }

    Ok(())
}
