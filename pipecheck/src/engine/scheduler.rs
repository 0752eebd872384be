use core::num::NonZero;
use std::sync::Arc;

use tokio::sync::{
    mpsc::{self, Receiver, UnboundedReceiver},
    OwnedSemaphorePermit, Semaphore,
};

use crate::{
    cfg::RunConfig,
    check::Check,
    protocol::Protocol,
    report::{CheckResult, Reporter, SubResult},
};

const OUTPUT_BUFFER: usize = 64;

/// A dispatched (check, protocol) unit.
#[derive(Debug)]
struct Unit {
    name: &'static str,
    protocol: Protocol,
    results: UnboundedReceiver<SubResult>,
    /// Released once every result of the unit has been forwarded.
    _permit: OwnedSemaphorePermit,
}

/// Runs the (check, protocol) matrix with bounded parallelism.
///
/// Results come out grouped per unit, in `(check, protocol)` submission
/// order, no matter which unit finishes first. At most `concurrency` units
/// are in flight, counting the one being forwarded.
#[derive(Debug)]
pub struct Scheduler {
    concurrency: NonZero<usize>,
}

impl Scheduler {
    pub fn new(concurrency: NonZero<usize>) -> Self {
        Self { concurrency }
    }

    /// Starts the run and returns its result stream.
    ///
    /// Must be called within a tokio runtime.
    pub fn run<F>(self, checks: Vec<Check>, protocols: Vec<Protocol>, run_config: F) -> Receiver<CheckResult>
    where
        F: Fn(Protocol) -> RunConfig + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(OUTPUT_BUFFER);
        let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<Unit>();
        let slots = Arc::new(Semaphore::new(self.concurrency.get()));

        tokio::spawn(async move {
            for check in checks {
                for &protocol in &protocols {
                    let permit = match slots.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(..) => return,
                    };

                    log::debug!("dispatching {} over {protocol}", check.name());
                    let results = dispatch(&check, run_config(protocol));
                    let unit = Unit {
                        name: check.name(),
                        protocol,
                        results,
                        _permit: permit,
                    };
                    if queue_tx.send(unit).is_err() {
                        return;
                    }
                }
            }
        });

        tokio::spawn(async move {
            while let Some(mut unit) = queue_rx.recv().await {
                while let Some(sub) = unit.results.recv().await {
                    if tx.send(CheckResult::new(unit.name, unit.protocol, sub)).await.is_err() {
                        log::debug!("result stream dropped, stopping");
                        return;
                    }
                }
                log::trace!("{} over {} is done", unit.name, unit.protocol);
            }
        });

        rx
    }
}

/// Spawns a single check run; its result stream ends when the run returns.
fn dispatch(check: &Check, cfg: RunConfig) -> UnboundedReceiver<SubResult> {
    let (tx, rx) = mpsc::unbounded_channel();
    let reporter = Reporter::new(tx);

    let name = check.name();
    let protocol = cfg.protocol;
    let task = tokio::spawn(check.run(cfg, reporter.clone()));

    tokio::spawn(async move {
        if let Err(err) = task.await {
            // A panicking check means a broken state machine, not a broken
            // server.
            log::error!("check {name} over {protocol} failed: {err}");
            std::process::abort();
        }
        reporter.close();
    });

    rx
}

#[cfg(test)]
mod test {
    use core::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;
    use crate::{
        cfg::TargetConfig,
        report::{ResultError, ResultWarning},
    };

    fn run_config(protocol: Protocol) -> RunConfig {
        RunConfig::new(protocol, TargetConfig::SchemalessUrl("//localhost:0".into()))
    }

    /// A check that reports twice, sleeping longer for earlier protocols.
    fn sleepy(name: &'static str) -> Check {
        Check::new(name, |cfg: RunConfig, reporter: Reporter| async move {
            let ms = match cfg.protocol {
                Protocol::Http1_1 => 60,
                _ => 5,
            };
            tokio::time::sleep(Duration::from_millis(ms)).await;
            reporter.report(SubResult::named("first"));
            tokio::time::sleep(Duration::from_millis(ms)).await;
            reporter.report(SubResult::ok().with_warning(ResultWarning::new("done")));
        })
    }

    async fn collect(mut rx: Receiver<CheckResult>) -> Vec<CheckResult> {
        let mut results = Vec::new();
        while let Some(r) = rx.recv().await {
            results.push(r);
        }
        results
    }

    #[tokio::test]
    async fn test_results_in_submission_order() {
        for concurrency in [1, 2, 4] {
            let scheduler = Scheduler::new(NonZero::new(concurrency).unwrap());
            let rx = scheduler.run(
                vec![sleepy("a"), sleepy("b")],
                vec![Protocol::Http1_1, Protocol::H2c],
                run_config,
            );

            let order: Vec<_> = collect(rx)
                .await
                .into_iter()
                .map(|r| format!("{}/{}", r.protocol, r.name))
                .collect();
            assert_eq!(
                vec![
                    "http1.1/a.first",
                    "http1.1/a",
                    "h2c/a.first",
                    "h2c/a",
                    "http1.1/b.first",
                    "http1.1/b",
                    "h2c/b.first",
                    "h2c/b",
                ],
                order,
                "concurrency {concurrency}"
            );
        }
    }

    #[tokio::test]
    async fn test_concurrency_limit() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let check = {
            let running = running.clone();
            let peak = peak.clone();
            Check::new("counted", move |_, reporter: Reporter| {
                let running = running.clone();
                let peak = peak.clone();
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    reporter.report(SubResult::ok());
                }
            })
        };

        let scheduler = Scheduler::new(NonZero::new(2).unwrap());
        let rx = scheduler.run(vec![check.clone(), check.clone(), check], Protocol::ALL.to_vec(), run_config);

        assert_eq!(3 * Protocol::ALL.len(), collect(rx).await.len());
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_reports_after_return_are_dropped() {
        let check = Check::new("leaky", |_, reporter: Reporter| async move {
            let late = reporter.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                late.report(SubResult::error(ResultError::new("too late")));
            });
            reporter.report(SubResult::ok());
        });

        let scheduler = Scheduler::new(NonZero::<usize>::MIN);
        let results = collect(scheduler.run(vec![check], vec![Protocol::H2], run_config)).await;

        assert_eq!(1, results.len());
        assert!(results[0].ok);
        tokio::time::sleep(Duration::from_millis(40)).await;
    }
}
