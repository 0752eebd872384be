//! Streamed transfers of unknown length.

use std::time::Instant;

use http::Method;
use tokio_util::sync::CancellationToken;

use super::helpers::{byte, new_url, Ctx, InFlight};
use crate::{
    cfg::RunConfig,
    engine::http::{body, BodyReader, BodySender, SendOptions},
    humanize,
    payload::{SeededBytes, SEED},
    report::{sub, Reporter, ResultError, SubResult},
    shaper::Shaper,
};

/// Largest frame of the long transfer.
const CHUNK: usize = 16 * 1024;
const READ_SIZE: usize = 32 * 1024;

/// Each byte written by the sender must reach the receiver before the next one
/// is written.
pub async fn byte_by_byte(cfg: RunConfig, reporter: Reporter) {
    if !cfg.protocol.supports_chunked_body() {
        reporter.report(SubResult::ok().with_message("skipped: no streaming body over HTTP/1.0"));
        return;
    }
    let Some(ctx) = Ctx::new(cfg, reporter) else {
        return;
    };

    ctx.with_target(|base| stream_bytes(&ctx, base)).await;
}

async fn stream_bytes(ctx: &Ctx, base: String) {
    let url = new_url(&base);
    let (writer, body) = body::channel(1);

    let Some(req) = ctx.request(Method::POST, &url, body, None) else {
        return;
    };
    let sender = {
        let ctx = ctx.clone();
        let writer = writer.clone();
        InFlight::spawn(async move {
            let resp = ctx.send(req, SendOptions::default()).await?;
            if let Err(err) = writer.send(byte(0)).await {
                ctx.report(SubResult::error(ResultError::with_cause("failed to send request body", err)));
            }
            Some(resp)
        })
    };

    let wait = ctx.cfg.timeouts.sender_response_before_receiver;
    if let Ok(false) = tokio::time::timeout(wait, sender.responded()).await {
        return;
    }

    let Some(get) = ctx.spawn_get(&url, None) else {
        return;
    };
    let Some(resp) = ctx.wait_receiver(get).await else {
        return;
    };
    let mut reader = BodyReader::new(resp.into_body());

    let timeout = ctx.cfg.timeouts.first_byte;
    let mut buf = [0u8; 1];
    match tokio::time::timeout(timeout, reader.read_exact(&mut buf)).await {
        Ok(Ok(())) if buf[0] == 0 => {}
        Ok(Ok(())) => {
            ctx.report(SubResult::named(sub::TRANSFERRED).with_error(ResultError::new("different first byte of body")));
            return;
        }
        Ok(Err(err)) => {
            ctx.report(SubResult::error(ResultError::with_cause("failed to read GET response body", err)));
            return;
        }
        Err(..) => {
            ctx.report(SubResult::error(ResultError::new(format!("failed to get first byte in {timeout:?}"))));
            return;
        }
    }

    for i in 1..=u8::MAX {
        if let Err(err) = writer.send(byte(i)).await {
            ctx.report(SubResult::error(ResultError::with_cause("failed to send request body", err)));
            return;
        }
        if let Err(err) = reader.read_exact(&mut buf).await {
            ctx.report(SubResult::error(ResultError::with_cause("failed to read GET response body", err)));
            return;
        }
        if buf[0] != i {
            ctx.report(
                SubResult::named(sub::TRANSFERRED).with_error(ResultError::new(format!("different body: i={i}"))),
            );
            return;
        }
    }
    writer.finish();

    match tokio::time::timeout(timeout, reader.read(1)).await {
        Ok(Ok(None)) => {}
        Ok(Ok(Some(data))) => {
            ctx.report(SubResult::named(sub::TRANSFERRED).with_error(ResultError::new(format!(
                "expected to read 0 bytes but {}",
                data.len()
            ))));
            return;
        }
        Ok(Err(err)) => {
            ctx.report(SubResult::named(sub::TRANSFERRED).with_error(ResultError::with_cause("expected to get EOF", err)));
            return;
        }
        Err(..) => {
            ctx.report(SubResult::named(sub::TRANSFERRED).with_error(ResultError::new("expected to get EOF")));
            return;
        }
    }
    drop(reader);

    let Some(resp) = sender.response().await else {
        return;
    };
    if !ctx.drain_sender(Some(sub::TRANSFERRED), resp).await {
        return;
    }
    ctx.report(SubResult::named(sub::TRANSFERRED));
}

/// A rate limited transfer that lasts for the configured spans, reporting the
/// progress at each of them.
pub async fn long_transfer(cfg: RunConfig, reporter: Reporter) {
    if cfg.transfer_spans.is_empty() {
        reporter.report(SubResult::ok().with_message("skipped: no transfer span given"));
        return;
    }
    if !cfg.protocol.supports_chunked_body() {
        reporter.report(SubResult::ok().with_message("skipped: no streaming body over HTTP/1.0"));
        return;
    }
    let Some(ctx) = Ctx::new(cfg, reporter) else {
        return;
    };

    ctx.with_target(|base| transfer_long(&ctx, base)).await;
}

async fn transfer_long(ctx: &Ctx, base: String) {
    let url = new_url(&base);
    let finish = CancellationToken::new();
    let _stop = finish.clone().drop_guard();

    let (writer, body) = body::channel(4);
    tokio::spawn(generate(writer, ctx.cfg.transfer_speed, finish.clone()));

    let Some(req) = ctx.request(Method::POST, &url, body, None) else {
        return;
    };
    let sender = ctx.spawn_send(req, SendOptions::default());

    let wait = ctx.cfg.timeouts.sender_response_before_receiver;
    if let Ok(false) = tokio::time::timeout(wait, sender.responded()).await {
        return;
    }

    let Some(get) = ctx.spawn_get(&url, None) else {
        return;
    };
    let Some(resp) = ctx.wait_receiver(get).await else {
        return;
    };
    let mut reader = BodyReader::new(resp.into_body());

    let spans = &ctx.cfg.transfer_spans;
    let idle = ctx.cfg.timeouts.first_byte;
    let mut expected = SeededBytes::new(SEED);
    let mut total = 0usize;
    let mut idx = 0;
    let start = Instant::now();

    loop {
        let chunk = match tokio::time::timeout(idle, reader.read(READ_SIZE)).await {
            Ok(Ok(Some(chunk))) => chunk,
            Ok(Ok(None)) => break,
            Ok(Err(err)) => {
                ctx.report(SubResult::error(ResultError::with_cause("failed to read GET response body", err)));
                return;
            }
            Err(..) => {
                ctx.report(SubResult::error(ResultError::new(format!(
                    "no data received in {idle:?} after {} transferred",
                    humanize::bytes(total as f64)
                ))));
                return;
            }
        };

        total += chunk.len();
        if chunk != expected.take(chunk.len()) {
            ctx.report(SubResult::named(sub::TRANSFERRED).with_error(ResultError::new("different body")));
            return;
        }

        let span = spans[idx];
        if finish.is_cancelled() || start.elapsed() < span {
            continue;
        }
        ctx.report(SubResult::named(sub::PARTIAL_TRANSFER).with_message(format!(
            "{span:?}: {} transferred",
            humanize::bytes(total as f64)
        )));
        if idx + 1 == spans.len() {
            finish.cancel();
        } else {
            idx += 1;
        }
    }
    drop(reader);

    let Some(resp) = sender.response().await else {
        return;
    };
    if !ctx.drain_sender(Some(sub::TRANSFERRED), resp).await {
        return;
    }
    ctx.report(SubResult::named(sub::TRANSFERRED));
}

/// Writes the seeded payload at `speed` bytes per second until `finish`.
async fn generate(writer: BodySender, speed: u64, finish: CancellationToken) {
    let burst = (speed / 100).clamp(1, CHUNK as u64);
    let mut shaper = Shaper::new(burst, speed);
    let mut payload = SeededBytes::new(SEED);

    loop {
        let tokens = shaper.tick();
        if tokens == 0 {
            tokio::select! {
                _ = finish.cancelled() => break,
                _ = tokio::time::sleep(shaper.delay()) => continue,
            }
        }

        let len = (tokens as usize).min(CHUNK);
        tokio::select! {
            _ = finish.cancelled() => break,
            res = writer.send(payload.take(len)) => {
                if res.is_err() {
                    log::debug!("long transfer body dropped");
                    break;
                }
            }
        }
        shaper.consume(len as u64);
    }

    writer.finish();
}
