use core::{error::Error, num::NonZero, ops::Range, time::Duration};
use std::{fs, path::PathBuf};

use serde::{
    de::{self, Unexpected},
    Deserialize, Deserializer,
};

use crate::{cmd::Cmd, protocol::Protocol};

pub const DEFAULT_TRANSFER_SPEED: u64 = 1024 * 1024;
pub const DEFAULT_SIMULTANEOUS_REQUESTS: usize = 10;

#[derive(Debug, Clone)]
pub struct Config {
    /// How the server under test is reached.
    pub target: TargetConfig,
    /// Protocols to run every check over, from HTTP/1.0 up to HTTP/3
    /// regardless of the flag order.
    pub protocols: Vec<Protocol>,
    /// Names of the checks to run; empty means all.
    pub checks: Vec<String>,
    /// Number of (check, protocol) units running at the same time.
    pub concurrency: NonZero<usize>,
    /// Results tolerated in the exit status: `NAME` or `PROTOCOL/NAME`.
    pub compromises: Vec<String>,
    /// Additional JSON lines output.
    pub result_jsonl_path: Option<PathBuf>,
    pub tls_skip_verify: bool,
    /// Bytes per second of the long transfer.
    pub transfer_speed: u64,
    /// Sorted checkpoints of the long transfer.
    pub transfer_spans: Vec<Duration>,
    pub simultaneous_requests: NonZero<usize>,
    pub timeouts: Timeouts,
    pub same_path_rejection_status: Range<u16>,
}

impl Config {
    /// Makes the configuration a single (check, protocol) unit runs with.
    pub fn run_config(&self, protocol: Protocol) -> RunConfig {
        RunConfig {
            protocol,
            target: self.target.clone(),
            tls_skip_verify: self.tls_skip_verify,
            transfer_speed: self.transfer_speed,
            transfer_spans: self.transfer_spans.clone(),
            simultaneous_requests: self.simultaneous_requests.get(),
            timeouts: self.timeouts.clone(),
            same_path_rejection_status: self.same_path_rejection_status.clone(),
        }
    }
}

impl TryFrom<Cmd> for Config {
    type Error = Box<dyn Error>;

    fn try_from(v: Cmd) -> Result<Self, Self::Error> {
        let target = match (v.server_command, v.server_schemaless_url) {
            (Some(..), Some(..)) => {
                return Err("--server-command and --server-schemaless-url are mutually exclusive".into());
            }
            (Some(command), None) => TargetConfig::Command {
                command,
                health_check_path: v.health_check_path,
            },
            (None, Some(url)) => {
                if !url.starts_with("//") {
                    return Err(format!("schemaless URL should start with '//': {url}").into());
                }
                TargetConfig::SchemalessUrl(url)
            }
            (None, None) => {
                return Err("either --server-command or --server-schemaless-url is required".into());
            }
        };

        let file = match &v.config {
            Some(path) => {
                log::debug!("loading config from '{}' ...", path.display());
                let data = fs::read(path)?;
                serde_yaml::from_slice(&data)?
            }
            None => FileConfig::default(),
        };

        let mut transfer_spans = v.transfer_spans;
        transfer_spans.sort();

        let mut protocols = Vec::new();
        for (enabled, protocol) in [
            (v.http1_0, Protocol::Http1_0),
            (v.http1_0_tls, Protocol::Http1_0Tls),
            (v.http1_1, Protocol::Http1_1),
            (v.http1_1_tls, Protocol::Http1_1Tls),
            (v.h2, Protocol::H2),
            (v.h2c, Protocol::H2c),
            (v.h3, Protocol::H3),
        ] {
            if enabled {
                protocols.push(protocol);
            }
        }

        let m = Self {
            target,
            protocols,
            checks: v.checks,
            concurrency: v.concurrency,
            compromises: v.compromises,
            result_jsonl_path: v.result_jsonl_path,
            tls_skip_verify: v.tls_skip_verify,
            transfer_speed: v.transfer_speed_byte,
            transfer_spans,
            simultaneous_requests: v.simultaneous_requests,
            timeouts: file.timeouts,
            same_path_rejection_status: file.same_path_rejection_status.start..file.same_path_rejection_status.end,
        };

        Ok(m)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetConfig {
    /// Spawn `sh -c <command>` per unit and poll the health check path.
    Command { command: String, health_check_path: String },
    /// Reuse a running server, e.g. `//localhost:8080`.
    SchemalessUrl(String),
}

/// Configuration of a single (check, protocol) unit.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub protocol: Protocol,
    pub target: TargetConfig,
    pub tls_skip_verify: bool,
    pub transfer_speed: u64,
    pub transfer_spans: Vec<Duration>,
    pub simultaneous_requests: usize,
    pub timeouts: Timeouts,
    pub same_path_rejection_status: Range<u16>,
}

impl RunConfig {
    /// Unit configuration with the default tuning.
    pub fn new(protocol: Protocol, target: TargetConfig) -> Self {
        Self {
            protocol,
            target,
            tls_skip_verify: false,
            transfer_speed: DEFAULT_TRANSFER_SPEED,
            transfer_spans: Vec::new(),
            simultaneous_requests: DEFAULT_SIMULTANEOUS_REQUESTS,
            timeouts: Timeouts::default(),
            same_path_rejection_status: 400..500,
        }
    }
}

/// Optional YAML file passed via `--config`.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    timeouts: Timeouts,
    same_path_rejection_status: StatusRange,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StatusRange {
    start: u16,
    end: u16,
}

impl Default for StatusRange {
    fn default() -> Self {
        Self { start: 400, end: 500 }
    }
}

/// Waits and deadlines of the checks.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Timeouts {
    /// How long the sender may wait for its response before the receiver
    /// arrives.
    #[serde(deserialize_with = "deserialize_duration")]
    pub sender_response_before_receiver: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub first_byte: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub get_response: Duration,
    /// Used instead of the wrote-request event, which h3 does not provide.
    #[serde(deserialize_with = "deserialize_duration")]
    pub h3_wrote_request_wait: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub after_sender_cancel: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub receiver_wrote_to_cancel: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub after_receiver_cancel: Duration,
    /// Deadline of a GET whose body has a fixed, small length.
    #[serde(deserialize_with = "deserialize_duration")]
    pub fixed_length_body_get: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub service_worker: Duration,
    /// Number of 1 second health check polls before giving up.
    pub health_check_polls: u32,
    #[serde(deserialize_with = "deserialize_duration")]
    pub teardown_grace: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            sender_response_before_receiver: Duration::from_secs(5),
            first_byte: Duration::from_secs(5),
            get_response: Duration::from_secs(5),
            h3_wrote_request_wait: Duration::from_secs(3),
            after_sender_cancel: Duration::from_secs(1),
            receiver_wrote_to_cancel: Duration::from_secs(3),
            after_receiver_cancel: Duration::from_secs(3),
            fixed_length_body_get: Duration::from_secs(6),
            service_worker: Duration::from_secs(1),
            health_check_polls: 60,
            teardown_grace: Duration::from_secs(5),
        }
    }
}

/// Parses a human readable duration such as `5s`, `100ms` or `1.5m`.
pub fn parse_duration(v: &str) -> Result<Duration, String> {
    let v = v.trim();
    let idx = v
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .ok_or_else(|| format!("missing unit in duration '{v}'"))?;
    let (num, unit) = v.split_at(idx);

    let num: f64 = num.parse().map_err(|_| format!("invalid number in duration '{v}'"))?;
    let scale = match unit {
        "ns" => 1e-9,
        "us" | "µs" => 1e-6,
        "ms" => 1e-3,
        "s" => 1.0,
        "m" => 60.0,
        "h" => 3600.0,
        unit => return Err(format!("unknown unit '{unit}' in duration '{v}'")),
    };

    Duration::try_from_secs_f64(num * scale).map_err(|err| format!("invalid duration '{v}': {err}"))
}

fn deserialize_duration<'de, D>(de: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let v: String = Deserialize::deserialize(de)?;
    match parse_duration(&v) {
        Ok(v) => Ok(v),
        Err(err) => Err(de::Error::invalid_value(Unexpected::Str(&v), &err.as_str())),
    }
}
