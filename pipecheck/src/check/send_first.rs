//! Transfers where one party arrives before the other.

use http::{Method, Response};
use tokio_util::sync::CancellationToken;

use super::helpers::{new_url, status_range_str, Ctx, InFlight, CONTENT_TYPE, MESSAGE};
use crate::{
    cfg::RunConfig,
    engine::http::{body, BoxBody, SendOptions},
    oneshot::Oneshot,
    protocol::Protocol,
    report::{sub, Reporter, ResultError, ResultWarning, SubResult},
};

pub async fn post_first(cfg: RunConfig, reporter: Reporter) {
    let Some(ctx) = Ctx::new(cfg, reporter) else {
        return;
    };

    ctx.with_target(|base| sender_first(&ctx, Method::POST, base)).await;
}

pub async fn put(cfg: RunConfig, reporter: Reporter) {
    let Some(ctx) = Ctx::new(cfg, reporter) else {
        return;
    };

    ctx.with_target(|base| sender_first(&ctx, Method::PUT, base)).await;
}

pub async fn get_first(cfg: RunConfig, reporter: Reporter) {
    let Some(ctx) = Ctx::new(cfg, reporter) else {
        return;
    };

    ctx.with_target(|base| receiver_first(&ctx, base)).await;
}

async fn sender_first(ctx: &Ctx, method: Method, base: String) {
    let url = new_url(&base);
    // Cancels the second sender once the receiver shows up.
    let getting = CancellationToken::new();
    let get_wrote = Oneshot::new();

    let Some(req) = ctx.request(method.clone(), &url, body::full(MESSAGE), Some(CONTENT_TYPE)) else {
        return;
    };
    let sender = {
        let ctx = ctx.clone();
        let url = url.clone();
        let getting = getting.clone();
        let get_wrote = get_wrote.clone();

        InFlight::spawn(async move {
            let resp = ctx.send(req, SendOptions::default()).await?;

            if get_wrote.get().is_some() {
                ctx.report(SubResult::named(sub::SENDER_RESPONSE_BEFORE_RECEIVER).with_warning(
                    ResultWarning::new("sender's response header should be arrived before receiver's request"),
                ));
            } else {
                ctx.report(SubResult::named(sub::SENDER_RESPONSE_BEFORE_RECEIVER));
                same_path_sender_rejection(&ctx, method, &url, getting).await;
            }

            Some(resp)
        })
    };

    let wait = ctx.cfg.timeouts.sender_response_before_receiver;
    if let Ok(false) = tokio::time::timeout(wait, sender.responded()).await {
        return;
    }
    getting.cancel();

    let Some(get) = ctx.spawn_get(&url, Some(get_wrote)) else {
        return;
    };
    let Some(resp) = ctx.wait_receiver(get).await else {
        return;
    };
    ctx.check_content_type_forwarding(&resp, CONTENT_TYPE);
    ctx.check_x_robots_tag(&resp);

    if !receive(ctx, resp).await {
        return;
    }
    let Some(resp) = sender.response().await else {
        return;
    };
    if !ctx.drain_sender(Some(sub::TRANSFERRED), resp).await {
        return;
    }
    ctx.report(SubResult::named(sub::TRANSFERRED));

    ctx.reuse_path(&url).await;
}

/// A second sender on an occupied path must be turned away.
async fn same_path_sender_rejection(ctx: &Ctx, method: Method, url: &str, getting: CancellationToken) {
    if ctx.protocol() == Protocol::H3 {
        ctx.report(
            SubResult::named(sub::SAME_PATH_SENDER_REJECTION).with_warning(ResultWarning::new("not supported in h3")),
        );
        return;
    }

    // The streamed body stays open until the second sender is answered.
    let (writer, body) = if ctx.protocol().supports_chunked_body() {
        let (tx, body) = body::channel(1);
        (Some(tx), body)
    } else {
        (None, body::full(MESSAGE))
    };
    let Some(req) = ctx.request(method.clone(), url, body, None) else {
        return;
    };

    let mut result = SubResult::named(sub::SAME_PATH_SENDER_REJECTION);
    match ctx.client.send(req, SendOptions::default().with_cancel(getting)).await {
        Ok(resp) => {
            let status = resp.status().as_u16();
            let expected = &ctx.cfg.same_path_rejection_status;
            if !expected.contains(&status) {
                result = result.with_error(ResultError::new(format!(
                    "expected {} status but found: {status}",
                    status_range_str(expected)
                )));
            }
        }
        Err(err) => {
            result = result.with_error(ResultError::with_cause(format!("failed to {method}"), err));
        }
    }
    drop(writer);
    ctx.report(result);
}

async fn receiver_first(ctx: &Ctx, base: String) {
    let url = new_url(&base);
    let get_wrote = Oneshot::new();

    let Some(get) = ctx.spawn_get(&url, Some(get_wrote.clone())) else {
        return;
    };
    if !ctx.wait_receiver_wrote(&get_wrote).await {
        return;
    }

    let Some(req) = ctx.request(Method::POST, &url, body::full(MESSAGE), Some(CONTENT_TYPE)) else {
        return;
    };
    let sender = ctx.spawn_send(req, SendOptions::default());

    let Some(resp) = ctx.wait_receiver(get).await else {
        return;
    };
    ctx.check_content_type_forwarding(&resp, CONTENT_TYPE);
    ctx.check_x_robots_tag(&resp);

    if !receive(ctx, resp).await {
        return;
    }
    let Some(resp) = sender.response().await else {
        return;
    };
    if !ctx.drain_sender(Some(sub::TRANSFERRED), resp).await {
        return;
    }
    ctx.report(SubResult::named(sub::TRANSFERRED));

    ctx.reuse_path(&url).await;
}

async fn receive(ctx: &Ctx, resp: Response<BoxBody>) -> bool {
    let timeout = ctx.cfg.timeouts.fixed_length_body_get;

    match tokio::time::timeout(timeout, body::read_all(resp.into_body())).await {
        Ok(Ok(data)) if data == MESSAGE.as_bytes() => true,
        Ok(Ok(..)) => {
            ctx.report(SubResult::named(sub::TRANSFERRED).with_error(ResultError::new("message different")));
            false
        }
        Ok(Err(err)) => {
            ctx.report(SubResult::error(ResultError::with_cause("failed to read up", err)));
            false
        }
        Err(..) => {
            ctx.report(SubResult::named(sub::TRANSFERRED).with_error(ResultError::new(format!(
                "failed to receive GET body in {timeout:?}"
            ))));
            false
        }
    }
}
