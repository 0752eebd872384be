use tokio::task::JoinSet;

use super::helpers::{new_url, Ctx, Order, MESSAGE};
use crate::{
    cfg::RunConfig,
    report::{Reporter, ResultError, SubResult},
};

/// Many transfers at once, each on its own path, must not interfere.
pub async fn simultaneous_request(cfg: RunConfig, reporter: Reporter) {
    let Some(ctx) = Ctx::new(cfg, reporter) else {
        return;
    };

    ctx.with_target(|base| transfer_all(&ctx, base)).await;
}

async fn transfer_all(ctx: &Ctx, base: String) {
    let num = ctx.cfg.simultaneous_requests;

    let mut transfers = JoinSet::new();
    for _ in 0..num {
        let ctx = ctx.clone();
        let url = new_url(&base);
        transfers.spawn(async move { ctx.transfer(&url, MESSAGE, Order::Concurrent, None).await });
    }

    let mut succeeded = 0;
    while let Some(res) = transfers.join_next().await {
        if let Ok(true) = res {
            succeeded += 1;
        }
    }
    log::debug!("{succeeded}/{num} simultaneous transfers succeeded");

    if succeeded == num {
        ctx.report(SubResult::ok().with_message(format!(
            "all {num} simultaneous requests successfully transferred"
        )));
    } else {
        ctx.report(SubResult::error(ResultError::new(format!(
            "{succeeded}/{num} successfully transferred"
        ))));
    }
}
