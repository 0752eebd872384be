use core::{num::NonZero, time::Duration};
use std::path::PathBuf;

use clap::{ArgAction, Parser};

use crate::cfg;

/// Conformance checker for HTTP piping servers.
#[derive(Debug, Clone, Parser)]
#[command(version, about)]
pub struct Cmd {
    /// Command that runs the server under test, executed as `sh -c <CMD>`.
    ///
    /// The ports to listen on are passed in the HTTP_PORT and HTTPS_PORT
    /// environment variables. A fresh server is started for every check.
    #[clap(long, value_name = "CMD")]
    pub server_command: Option<String>,
    /// Path polled until the spawned server answers with 2xx.
    #[clap(long, default_value = "/")]
    pub health_check_path: String,
    /// Already running server, e.g. "//localhost:8080".
    ///
    /// "http:" or "https:" is prepended depending on the protocol.
    #[clap(long, value_name = "URL")]
    pub server_schemaless_url: Option<String>,
    /// Do not verify the server certificate.
    #[clap(long)]
    pub tls_skip_verify: bool,
    /// Run checks over HTTP/1.0.
    #[clap(long = "http1.0")]
    pub http1_0: bool,
    /// Run checks over HTTP/1.0 with TLS.
    #[clap(long = "http1.0-tls")]
    pub http1_0_tls: bool,
    /// Run checks over HTTP/1.1.
    #[clap(long = "http1.1")]
    pub http1_1: bool,
    /// Run checks over HTTP/1.1 with TLS.
    #[clap(long = "http1.1-tls")]
    pub http1_1_tls: bool,
    /// Run checks over HTTP/2 with TLS.
    #[clap(long)]
    pub h2: bool,
    /// Run checks over cleartext HTTP/2 with prior knowledge.
    #[clap(long)]
    pub h2c: bool,
    /// Run checks over HTTP/3.
    #[clap(long)]
    pub h3: bool,
    /// Tolerate errors of a result: "NAME" or "PROTOCOL/NAME".
    #[clap(long = "compromise", value_name = "RESULT")]
    pub compromises: Vec<String>,
    /// Bytes per second sent in the long transfer check.
    #[clap(long, default_value_t = cfg::DEFAULT_TRANSFER_SPEED)]
    pub transfer_speed_byte: u64,
    /// Checkpoint of the long transfer check, e.g. "3s". Repeatable.
    #[clap(long = "transfer-span", value_name = "DURATION", value_parser = cfg::parse_duration)]
    pub transfer_spans: Vec<Duration>,
    /// Number of checks running at the same time.
    #[clap(long, default_value_t = NonZero::<usize>::MIN)]
    pub concurrency: NonZero<usize>,
    /// Number of sender/receiver pairs in the simultaneous request check.
    #[clap(long, default_value_t = NonZero::new(cfg::DEFAULT_SIMULTANEOUS_REQUESTS).unwrap_or(NonZero::<usize>::MIN))]
    pub simultaneous_requests: NonZero<usize>,
    /// Run only the named check. Repeatable.
    #[clap(long = "check", value_name = "NAME")]
    pub checks: Vec<String>,
    /// Also write results as JSON lines into this file.
    #[clap(long, value_name = "PATH")]
    pub result_jsonl_path: Option<PathBuf>,
    /// YAML file overriding the timeouts.
    #[clap(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
    /// Log verbosity on stderr: `-v` for debug, `-vv` for trace, `-vvv`
    /// adds the transport stack.
    #[clap(short, action = ArgAction::Count)]
    pub verbose: u8,
}
