//! A party gives up half way; the path must stay usable.

use http::Method;
use tokio_util::sync::CancellationToken;

use super::helpers::{new_url, Ctx, Order, CONTENT_TYPE, MESSAGE};
use crate::{
    cfg::RunConfig,
    engine::http::{body, Error, SendOptions},
    oneshot::Oneshot,
    report::{sub, Reporter, ResultError, ResultWarning, SubResult},
};

/// A sender cancels after its request is accepted, then another sender uses
/// the same path.
pub async fn post_cancel_post(cfg: RunConfig, reporter: Reporter) {
    if cfg.protocol.is_http1_0() {
        reporter.report(
            SubResult::ok().with_warning(ResultWarning::new("Sorry. This check does not support HTTP/1.0 yet")),
        );
        return;
    }

    let Some(ctx) = Ctx::new(cfg, reporter) else {
        return;
    };

    ctx.with_target(|base| sender_cancel(&ctx, base)).await;
}

async fn sender_cancel(ctx: &Ctx, base: String) {
    let url = new_url(&base);

    let cancel = CancellationToken::new();
    let (writer, body) = body::channel(1);
    let Some(req) = ctx.request(Method::POST, &url, body, None) else {
        return;
    };
    let Some(resp) = ctx.send(req, SendOptions::default().with_cancel(cancel.clone())).await else {
        return;
    };
    drop(resp);
    cancel.cancel();
    drop(writer);
    tokio::time::sleep(ctx.cfg.timeouts.after_sender_cancel).await;

    let Some(req) = ctx.request(Method::POST, &url, body::full(MESSAGE), Some(CONTENT_TYPE)) else {
        return;
    };
    let sender = ctx.spawn_send(req, SendOptions::default());

    let wait = ctx.cfg.timeouts.sender_response_before_receiver;
    let accepted = match tokio::time::timeout(wait, sender.responded()).await {
        Ok(false) => return,
        Ok(true) => {
            ctx.report(SubResult::ok());
            true
        }
        Err(..) => false,
    };

    let Some(get) = ctx.spawn_get(&url, None) else {
        return;
    };
    if !ctx.receive_message(get, MESSAGE.as_bytes(), Some(sub::TRANSFERRED)).await {
        return;
    }
    let Some(resp) = sender.response().await else {
        return;
    };
    if !ctx.drain_sender(Some(sub::TRANSFERRED), resp).await {
        return;
    }
    if !accepted {
        ctx.report(SubResult::ok());
    }
    ctx.report(SubResult::named(sub::TRANSFERRED));
}

/// A receiver cancels after its request reached the server, then a transfer
/// over the same path must succeed.
pub async fn get_cancel_get(cfg: RunConfig, reporter: Reporter) {
    let Some(ctx) = Ctx::new(cfg, reporter) else {
        return;
    };

    ctx.with_target(|base| receiver_cancel(&ctx, base)).await;
}

async fn receiver_cancel(ctx: &Ctx, base: String) {
    let url = new_url(&base);

    let cancel = CancellationToken::new();
    let wrote = Oneshot::new();
    let Some(req) = ctx.get_request(&url) else {
        return;
    };
    let opts = SendOptions::default()
        .with_cancel(cancel.clone())
        .with_wrote(wrote.clone());
    let first = {
        let client = ctx.client.clone();
        tokio::spawn(async move { client.send(req, opts).await })
    };

    if ctx.wait_receiver_wrote(&wrote).await {
        tokio::time::sleep(ctx.cfg.timeouts.receiver_wrote_to_cancel).await;
    }
    cancel.cancel();

    match first.await {
        Ok(Err(Error::Canceled)) => {}
        Ok(Err(err)) => {
            ctx.report(SubResult::error(ResultError::with_cause("failed to GET", err)));
            return;
        }
        Ok(Ok(..)) => {
            ctx.report(SubResult::error(ResultError::new(
                "expected not to receive a response but GET response received",
            )));
        }
        Err(..) => return,
    }
    tokio::time::sleep(ctx.cfg.timeouts.after_receiver_cancel).await;

    if ctx.transfer(&url, MESSAGE, Order::AfterReceiverWrote, None).await {
        ctx.report(SubResult::ok());
    }
}
