use bytes::{BufMut, Bytes, BytesMut};
use http::Method;
use uuid::Uuid;

use super::helpers::{new_url, Ctx};
use crate::{
    cfg::RunConfig,
    engine::http::{body, SendOptions},
    payload::{SeededBytes, SEED},
    report::{sub, Reporter, ResultError, SubResult},
};

const PAYLOAD_SIZE: usize = 8 * 1024 * 1024;
const PART_CONTENT_TYPE: &str = "application/octet-stream";
const PART_CONTENT_DISPOSITION: &str = r#"form-data; name="input_data""#;

/// A browser form upload: the receiver gets the bare file with its part
/// headers.
pub async fn multipart_form_data(cfg: RunConfig, reporter: Reporter) {
    let Some(ctx) = Ctx::new(cfg, reporter) else {
        return;
    };

    ctx.with_target(|base| upload(&ctx, base)).await;
}

async fn upload(ctx: &Ctx, base: String) {
    let url = new_url(&base);
    let payload = SeededBytes::new(SEED).take(PAYLOAD_SIZE);
    let boundary = Uuid::new_v4().simple().to_string();

    let content_type = format!("multipart/form-data; boundary={boundary}");
    let form = encode_form(&boundary, &payload);
    let Some(req) = ctx.request(Method::POST, &url, body::full(form), Some(&content_type)) else {
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
    ctx.check_content_type_forwarding(&resp, PART_CONTENT_TYPE);
    ctx.check_content_disposition_forwarding(&resp, PART_CONTENT_DISPOSITION);

    let data = match body::read_all(resp.into_body()).await {
        Ok(data) => data,
        Err(err) => {
            ctx.report(SubResult::error(ResultError::with_cause("failed to read GET body", err)));
            return;
        }
    };
    if data != payload {
        ctx.report(SubResult::named(sub::TRANSFERRED).with_error(ResultError::new("different body")));
        return;
    }

    let Some(resp) = sender.response().await else {
        return;
    };
    if !ctx.drain_sender(Some(sub::TRANSFERRED), resp).await {
        return;
    }
    ctx.report(SubResult::named(sub::TRANSFERRED));
}

/// Encodes a single-part `multipart/form-data` body.
fn encode_form(boundary: &str, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + 256);

    buf.put_slice(format!("--{boundary}\r\n").as_bytes());
    buf.put_slice(format!("Content-Disposition: {PART_CONTENT_DISPOSITION}\r\n").as_bytes());
    buf.put_slice(format!("Content-Type: {PART_CONTENT_TYPE}\r\n\r\n").as_bytes());
    buf.put_slice(payload);
    buf.put_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

    buf.freeze()
}
