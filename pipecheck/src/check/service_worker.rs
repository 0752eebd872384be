use http::{HeaderValue, Method};

use super::helpers::{new_url, Ctx, InFlight};
use crate::{
    cfg::RunConfig,
    engine::http::{body, SendOptions},
    report::{Reporter, ResultError, SubResult},
};

const REJECTED: core::ops::Range<u16> = 400..500;

/// Browsers must not be able to register a transferred script as a Service
/// Worker of the server's origin.
pub async fn service_worker_registration_rejection(cfg: RunConfig, reporter: Reporter) {
    let Some(ctx) = Ctx::new(cfg, reporter) else {
        return;
    };

    ctx.with_target(|base| register(&ctx, base)).await;
}

async fn register(ctx: &Ctx, base: String) {
    let url = new_url(&base);
    let Some(mut req) = ctx.request(Method::GET, &url, body::empty(), None) else {
        return;
    };
    req.headers_mut()
        .insert("service-worker", HeaderValue::from_static("script"));

    let get = {
        let ctx = ctx.clone();
        InFlight::spawn(async move {
            let resp = match ctx.client.send(req, SendOptions::default()).await {
                Ok(resp) => resp,
                Err(err) => {
                    ctx.report(SubResult::error(ResultError::with_cause("failed to GET", err)));
                    return None;
                }
            };
            ctx.check_protocol(&resp);

            let status = resp.status().as_u16();
            if !REJECTED.contains(&status) {
                ctx.report(SubResult::error(ResultError::new(format!(
                    "Service Worker registration should be rejected but status code is {status}"
                ))));
                return None;
            }

            Some(resp)
        })
    };

    match tokio::time::timeout(ctx.cfg.timeouts.service_worker, get.responded()).await {
        Ok(true) => {}
        Ok(false) => return,
        // A server that keeps the request waiting has not served the script
        // either. Dropping the request closes its connection.
        Err(..) => drop(get),
    }
    ctx.report(SubResult::ok());
}
