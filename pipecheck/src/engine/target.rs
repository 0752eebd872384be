//! Ephemeral servers under test.

use core::{future::Future, time::Duration};
use std::{
    os::unix::process::ExitStatusExt,
    process::{ExitStatus, Stdio},
    sync::{Arc, Mutex as StdMutex},
};

use anyhow::{anyhow, bail, Context, Error};
use http::Request;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    net::{TcpListener, UdpSocket},
    process::{Child, Command},
    sync::Mutex,
    task::JoinHandle,
};

use super::http::{body, Client};
use crate::{
    cfg::{RunConfig, TargetConfig},
    protocol::Protocol,
    report::{Reporter, ResultError, SubResult},
};

const STDERR_CAPTURE_LIMIT: usize = 2048;
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
const STARTUP_GRACE: Duration = Duration::from_millis(100);
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(1);
const UDP_PORT_RETRY_INTERVAL: Duration = Duration::from_millis(100);
const UDP_PORT_ATTEMPTS: usize = 100;

/// Serializes acquisitions, so that a port picked for one server is not
/// handed to another before the first one binds it.
static ACQUIRE_LOCK: Mutex<()> = Mutex::const_new(());

/// A server under test, reachable at [`Target::url`].
#[derive(Debug)]
pub struct Target {
    url: String,
    server: Option<Server>,
}

impl Target {
    /// Base URL, without a trailing slash.
    #[inline]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Stops the server, if it was started by us.
    ///
    /// Fails if the server terminates abnormally.
    pub async fn teardown(self, grace: Duration) -> Result<(), Error> {
        match self.server {
            Some(server) => server.stop(grace).await,
            None => Ok(()),
        }
    }
}

/// Acquires a target for the given protocol.
pub async fn acquire(cfg: &RunConfig) -> Result<Target, Error> {
    match &cfg.target {
        TargetConfig::SchemalessUrl(url) => Ok(Target {
            url: fixed_url(url, cfg.protocol),
            server: None,
        }),
        TargetConfig::Command { command, health_check_path } => {
            let _lock = ACQUIRE_LOCK.lock().await;

            let (http_port, https_port) = reserve_ports().await.context("failed to get port")?;
            log::debug!("starting server on ports {http_port}/{https_port}: {command}");

            let mut server = Server::spawn(command, http_port, https_port).context("failed to run server")?;

            let port = if cfg.protocol.uses_tls() { https_port } else { http_port };
            let url = format!("{}://localhost:{port}", scheme(cfg.protocol));
            let health_check_url = format!("{url}{health_check_path}");

            let res = tokio::select! {
                status = server.child.wait() => {
                    let stderr = server.stderr_after_exit().await;
                    match status {
                        Ok(status) => Err(anyhow!("server exited during health check: {status}, stderr: {stderr}")),
                        Err(err) => Err(anyhow!("failed to wait for the server: {err}, stderr: {stderr}")),
                    }
                }
                res = wait_ready(cfg.protocol, &health_check_url, cfg.timeouts.health_check_polls) => res,
            };
            if let Err(err) = res {
                // Best effort, the health check error is what matters.
                let _ = server.stop(Duration::ZERO).await;
                return Err(err.context("failed to run server"));
            }
            log::debug!("server is ready at {url}");

            Ok(Target { url, server: Some(server) })
        }
    }
}

/// Acquires a target, runs `f` with its base URL and tears the target down.
///
/// Acquisition and teardown failures are reported as check-level errors.
pub async fn with_target<F, Fut>(cfg: &RunConfig, reporter: &Reporter, f: F)
where
    F: FnOnce(String) -> Fut,
    Fut: Future<Output = ()>,
{
    let target = match acquire(cfg).await {
        Ok(target) => target,
        Err(err) => {
            reporter.report(SubResult::error(ResultError::new(format!("{err:#}"))));
            return;
        }
    };

    f(target.url().to_string()).await;

    if let Err(err) = target.teardown(cfg.timeouts.teardown_grace).await {
        reporter.report(SubResult::error(ResultError::new(format!("{err:#}"))));
    }
}

#[inline]
fn scheme(protocol: Protocol) -> &'static str {
    if protocol.uses_tls() {
        "https"
    } else {
        "http"
    }
}

fn fixed_url(schemaless: &str, protocol: Protocol) -> String {
    format!("{}:{}", scheme(protocol), schemaless.trim_end_matches('/'))
}

/// Picks the HTTP port and the HTTPS port of a spawned server.
///
/// Both sockets stay bound until the two ports are known, so they differ.
async fn reserve_ports() -> Result<(u16, u16), Error> {
    let http = bind_tcp().await?;
    let (https, _udp) = bind_tcp_udp().await?;

    Ok((http.local_addr()?.port(), https.local_addr()?.port()))
}

async fn bind_tcp() -> Result<TcpListener, Error> {
    Ok(TcpListener::bind(("0.0.0.0", 0)).await?)
}

/// Binds a port that is free for both TCP and UDP.
async fn bind_tcp_udp() -> Result<(TcpListener, UdpSocket), Error> {
    for _ in 0..UDP_PORT_ATTEMPTS {
        let listener = bind_tcp().await?;
        let port = listener.local_addr()?.port();
        match UdpSocket::bind(("0.0.0.0", port)).await {
            Ok(udp) => return Ok((listener, udp)),
            Err(err) => {
                log::trace!("UDP port {port} is not available: {err}");
                tokio::time::sleep(UDP_PORT_RETRY_INTERVAL).await;
            }
        }
    }

    bail!("no port free for both TCP and UDP after {UDP_PORT_ATTEMPTS} attempts")
}

/// Polls the health check URL with the unit's own protocol.
async fn wait_ready(protocol: Protocol, url: &str, polls: u32) -> Result<(), Error> {
    // Servers under test usually run with self-signed certificates.
    let client = Client::new(protocol, true)?;

    tokio::time::sleep(STARTUP_GRACE).await;
    for attempt in 0..polls {
        let req = Request::get(url).body(body::empty())?;
        match tokio::time::timeout(HEALTH_CHECK_INTERVAL, client.send(req, Default::default())).await {
            Ok(Ok(resp)) if resp.status().is_success() => {
                let _ = body::drain(resp.into_body()).await;
                return Ok(());
            }
            Ok(Ok(resp)) => log::trace!("health check #{attempt}: {}", resp.status()),
            Ok(Err(err)) => log::trace!("health check #{attempt}: {err}"),
            Err(..) => log::trace!("health check #{attempt}: timed out"),
        }

        tokio::time::sleep(HEALTH_CHECK_INTERVAL).await;
    }

    bail!("server did not become ready after {polls} health checks")
}

#[derive(Debug)]
struct Server {
    child: Child,
    stderr: Arc<StdMutex<Vec<u8>>>,
    capture: Option<JoinHandle<()>>,
}

impl Server {
    fn spawn(command: &str, http_port: u16, https_port: u16) -> Result<Self, Error> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .env("HTTP_PORT", http_port.to_string())
            .env("HTTPS_PORT", https_port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()?;

        let stderr = Arc::new(StdMutex::new(Vec::new()));
        let capture = child.stderr.take().map(|pipe| tokio::spawn(capture_head(pipe, stderr.clone())));

        Ok(Self { child, stderr, capture })
    }

    /// Captured stderr once the pipe has been read to the end.
    async fn stderr_after_exit(&mut self) -> String {
        if let Some(capture) = self.capture.take() {
            // Grandchildren may keep the pipe open.
            let _ = tokio::time::timeout(STDERR_DRAIN_TIMEOUT, capture).await;
        }

        self.stderr()
    }

    fn stderr(&self) -> String {
        let buf = match self.stderr.lock() {
            Ok(buf) => buf,
            Err(poisoned) => poisoned.into_inner(),
        };

        String::from_utf8_lossy(&buf).into_owned()
    }

    /// Sends SIGTERM to the server's process group and waits for it to exit.
    async fn stop(mut self, grace: Duration) -> Result<(), Error> {
        let status = match self.child.try_wait()? {
            Some(status) => status,
            None => {
                if let Some(pid) = self.child.id() {
                    // SAFETY: plain syscall, the process group was created by us.
                    unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGTERM) };
                }

                match tokio::time::timeout(grace, self.child.wait()).await {
                    Ok(status) => status?,
                    Err(..) => {
                        log::warn!("server did not exit in {grace:?} after SIGTERM, killing");
                        if let Some(pid) = self.child.id() {
                            // SAFETY: same as above.
                            unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGKILL) };
                        }
                        self.child.kill().await?;
                        return Ok(());
                    }
                }
            }
        };
        log::debug!("server exited: {status}");

        if !is_graceful_exit(&status) {
            bail!("server exited abnormally: {status}, stderr: {}", self.stderr_after_exit().await);
        }

        Ok(())
    }
}

fn is_graceful_exit(status: &ExitStatus) -> bool {
    status.success() || status.signal() == Some(libc::SIGTERM) || status.code() == Some(128 + libc::SIGTERM)
}

/// Keeps the head of the stream; the rest is read and discarded.
async fn capture_head<R>(mut rd: R, out: Arc<StdMutex<Vec<u8>>>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0; 1024];
    loop {
        let n = match rd.read(&mut buf).await {
            Ok(0) | Err(..) => break,
            Ok(n) => n,
        };

        let mut out = match out.lock() {
            Ok(out) => out,
            Err(poisoned) => poisoned.into_inner(),
        };
        let take = n.min(STDERR_CAPTURE_LIMIT.saturating_sub(out.len()));
        out.extend_from_slice(&buf[..take]);
    }
}

#[cfg(test)]
mod test {
    use core::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    fn run_config(target: TargetConfig, protocol: Protocol) -> RunConfig {
        let mut cfg = RunConfig::new(protocol, target);
        cfg.timeouts.health_check_polls = 2;
        cfg
    }

    #[test]
    fn test_fixed_url() {
        assert_eq!("http://localhost:8080", fixed_url("//localhost:8080", Protocol::H2c));
        assert_eq!("https://localhost:8443/base", fixed_url("//localhost:8443/base/", Protocol::H2));
        assert_eq!("https://example.com", fixed_url("//example.com", Protocol::Http1_0Tls));
    }

    #[tokio::test]
    async fn test_acquire_fixed_url() {
        let cfg = run_config(TargetConfig::SchemalessUrl("//127.0.0.1:1".into()), Protocol::H3);
        let target = acquire(&cfg).await.unwrap();

        assert_eq!("https://127.0.0.1:1", target.url());
        target.teardown(Duration::ZERO).await.unwrap();
    }

    #[tokio::test]
    async fn test_reserve_ports() {
        for _ in 0..16 {
            let (http, https) = reserve_ports().await.unwrap();

            assert_ne!(0, http);
            assert_ne!(0, https);
            assert_ne!(http, https);
        }
    }

    #[tokio::test]
    async fn test_server_exit_during_health_check() {
        let cfg = run_config(
            TargetConfig::Command {
                command: "echo boom >&2; exit 3".into(),
                health_check_path: "/".into(),
            },
            Protocol::Http1_1,
        );

        let err = acquire(&cfg).await.unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.starts_with("failed to run server"), "{msg}");
        assert!(msg.contains("boom"), "{msg}");
    }

    #[tokio::test]
    async fn test_teardown_sigterm_is_graceful() {
        let mut server = Server::spawn("sleep 30", 0, 0).unwrap();
        assert!(server.child.try_wait().unwrap().is_none());

        server.stop(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_with_target_reports_acquisition_error() {
        let cfg = run_config(
            TargetConfig::Command {
                command: "exit 1".into(),
                health_check_path: "/".into(),
            },
            Protocol::Http1_1,
        );
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let reporter = Reporter::new(tx);

        let called = AtomicBool::new(false);
        let flag = &called;
        with_target(&cfg, &reporter, move |_| async move { flag.store(true, Ordering::SeqCst) }).await;
        reporter.close();

        assert!(!called.load(Ordering::SeqCst));
        let sub = rx.recv().await.unwrap();
        assert!(!sub.is_ok());
        assert!(rx.recv().await.is_none());
    }
}
