//! Conformance checks.

use core::{
    fmt::{self, Debug, Formatter},
    future::Future,
    pin::Pin,
};
use std::sync::Arc;

use crate::{cfg::RunConfig, report::Reporter};

mod cancel;
mod helpers;
mod multipart;
mod send_first;
mod service_worker;
mod simultaneous;
mod streaming;

type RunFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type RunFn = dyn Fn(RunConfig, Reporter) -> RunFuture + Send + Sync;

/// A named behavior of the server under test.
///
/// Running a check is self-contained: it shares nothing with other checks or
/// with other runs of itself.
#[derive(Clone)]
pub struct Check {
    name: &'static str,
    run: Arc<RunFn>,
}

impl Check {
    pub fn new<F, Fut>(name: &'static str, f: F) -> Self
    where
        F: Fn(RunConfig, Reporter) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let run: Arc<RunFn> = Arc::new(move |cfg: RunConfig, reporter: Reporter| -> RunFuture {
            Box::pin(f(cfg, reporter))
        });

        Self { name, run }
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Runs this check, reporting its findings into `reporter`.
    pub fn run(&self, cfg: RunConfig, reporter: Reporter) -> impl Future<Output = ()> + Send + 'static {
        (self.run)(cfg, reporter)
    }
}

impl Debug for Check {
    fn fmt(&self, f: &mut Formatter) -> Result<(), fmt::Error> {
        f.debug_struct("Check").field("name", &self.name).finish()
    }
}

/// All checks in their running order; long checks go last.
pub fn all_checks() -> Vec<Check> {
    vec![
        Check::new("post_first", send_first::post_first),
        Check::new("get_first", send_first::get_first),
        Check::new("put", send_first::put),
        Check::new("post_cancel_post", cancel::post_cancel_post),
        Check::new("get_cancel_get", cancel::get_cancel_get),
        Check::new(
            "service_worker_registration_rejection",
            service_worker::service_worker_registration_rejection,
        ),
        Check::new("post_first_byte_by_byte_streaming", streaming::byte_by_byte),
        Check::new("multipart_form_data", multipart::multipart_form_data),
        Check::new("simultaneous_request", simultaneous::simultaneous_request),
        Check::new("post_first_chunked_long_transfer", streaming::long_transfer),
    ]
}
