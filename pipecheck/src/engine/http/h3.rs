use core::{
    future::{poll_fn, Future},
    net::SocketAddr,
};
use std::sync::Arc;

use anyhow::{anyhow, Context, Error};
use bytes::{Buf, Bytes};
use http::{Request, Response};
use http_body_util::BodyExt;
use quinn::crypto::rustls::QuicClientConfig;
use rustls::ClientConfig;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::body::{self, BoxBody};

const DEFAULT_PORT: u16 = 443;

/// Sends a single request over a fresh QUIC connection.
///
/// The connection lives for as long as the response body is being read. The
/// response keeps the version h3 parsed it with.
pub async fn send(tls: Arc<ClientConfig>, req: Request<BoxBody>, cancel: CancellationToken) -> Result<Response<BoxBody>, Error> {
    let host = req.uri().host().ok_or_else(|| anyhow!("URI has no host: {}", req.uri()))?;
    let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
    let port = req.uri().port_u16().unwrap_or(DEFAULT_PORT);

    let addr = tokio::net::lookup_host((host.as_str(), port))
        .await?
        .next()
        .with_context(|| format!("failed to resolve {host}"))?;
    let bind: SocketAddr = if addr.is_ipv6() {
        SocketAddr::from(([0u16; 8], 0))
    } else {
        SocketAddr::from(([0u8; 4], 0))
    };

    let mut endpoint = quinn::Endpoint::client(bind)?;
    let crypto = QuicClientConfig::try_from(tls).map_err(|err| anyhow!("failed to build QUIC client crypto: {err}"))?;
    endpoint.set_default_client_config(quinn::ClientConfig::new(Arc::new(crypto)));

    let conn = endpoint.connect(addr, &host)?.await?;
    log::debug!("QUIC connection established with {addr}");

    let mut builder = h3::client::builder();
    let (mut driver, mut sender) = builder.build::<_, _, Bytes>(h3_quinn::Connection::new(conn)).await?;
    let driver = tokio::spawn(async move {
        let _ = poll_fn(|cx| driver.poll_close(cx)).await;
        log::trace!("h3 connection closed");
    });

    let (parts, mut req_body) = req.into_parts();
    let stream = sender.send_request(Request::from_parts(parts, ())).await?;
    let (mut send, mut recv) = stream.split();

    let upload = tokio::spawn(async move {
        while let Some(frame) = req_body.frame().await {
            if let Ok(data) = frame?.into_data() {
                send.send_data(data).await?;
            }
        }
        send.finish().await?;

        Ok::<_, Error>(())
    });

    let head = recv.recv_response().await?;
    let (tx, resp_body) = body::channel(4);

    tokio::spawn(async move {
        // Keep the connection alive until the body is done.
        let _conn = (endpoint, sender);
        let mut upload = upload;

        let download = async {
            while let Some(mut chunk) = recv.recv_data().await? {
                tx.send(chunk.copy_to_bytes(chunk.remaining())).await?;
            }
            Ok::<_, Error>(())
        };
        let res = tokio::select! {
            _ = cancel.cancelled() => Err(anyhow!("canceled")),
            _ = tx.closed() => Ok(()),
            res = forward(&mut upload, download) => res,
        };
        if let Err(err) = res {
            tx.abort(err).await;
        }

        upload.abort();
        driver.abort();
    });

    Ok(head.map(|()| resp_body))
}

/// Runs the response download, failing it as soon as the request body fails.
async fn forward<F>(upload: &mut JoinHandle<Result<(), Error>>, download: F) -> Result<(), Error>
where
    F: Future<Output = Result<(), Error>>,
{
    tokio::pin!(download);

    tokio::select! {
        res = &mut download => return res,
        res = upload => match res {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err.context("failed to send request body")),
            Err(err) => return Err(anyhow!("request body task failed: {err}")),
        },
    }

    download.await
}
