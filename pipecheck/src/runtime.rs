use core::{error::Error, time::Duration};
use std::{
    fs::File,
    io::{self, BufWriter, Write},
};

use crossterm::{
    style::{Color, Stylize},
    tty::IsTty,
};
use serde::Serialize;

use crate::{
    cfg::{Config, TargetConfig},
    check::{self, Check},
    engine::scheduler::Scheduler,
    protocol::Protocol,
    report::CheckResult,
};

/// Prefix of the header line, aligning it with the status glyphs.
const HEADER_PREFIX: &str = "\u{3000} ";

#[derive(Debug)]
pub struct Runtime {
    cfg: Config,
}

impl Runtime {
    pub fn new(cfg: Config) -> Self {
        Self { cfg }
    }

    /// Runs the selected checks, printing every result as it comes.
    pub async fn run(self) -> Result<Outcome, Box<dyn Error>> {
        let checks = select_checks(check::all_checks(), &self.cfg.checks)?;
        if self.cfg.protocols.is_empty() {
            log::warn!("specify --http1.1, --http1.1-tls or other protocols to check");
        }

        let mut out = Output::new(&self.cfg)?;
        out.header(&Header::new(&self.cfg))?;

        let mut outcome = Outcome::default();
        let scheduler = Scheduler::new(self.cfg.concurrency);
        let protocols = self.cfg.protocols.clone();
        let run_config = {
            let cfg = self.cfg.clone();
            move |protocol| cfg.run_config(protocol)
        };

        let mut results = scheduler.run(checks, protocols, run_config);
        while let Some(result) = results.recv().await {
            let status = Status::of(&result, &self.cfg.compromises);
            match status {
                Status::Failed => outcome.failed += 1,
                Status::Compromised => outcome.compromised += 1,
                Status::Ok | Status::Warned => {}
            }
            out.result(&result, status)?;
        }
        out.finish()?;

        Ok(outcome)
    }
}

/// Summary of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Outcome {
    /// Results with errors that were not compromised.
    pub failed: usize,
    pub compromised: usize,
}

impl Outcome {
    #[inline]
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

/// Keeps the checks named in `names`, in their running order.
fn select_checks(checks: Vec<Check>, names: &[String]) -> Result<Vec<Check>, Box<dyn Error>> {
    if names.is_empty() {
        return Ok(checks);
    }

    for name in names {
        if !checks.iter().any(|c| c.name() == name) {
            return Err(format!("unknown check: {name}").into());
        }
    }

    Ok(checks
        .into_iter()
        .filter(|c| names.iter().any(|name| name == c.name()))
        .collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Ok,
    Warned,
    Failed,
    Compromised,
}

impl Status {
    fn of(result: &CheckResult, compromises: &[String]) -> Self {
        if !result.errors.is_empty() {
            if is_compromised(result, compromises) {
                Self::Compromised
            } else {
                Self::Failed
            }
        } else if !result.warnings.is_empty() {
            Self::Warned
        } else {
            Self::Ok
        }
    }

    fn glyph(&self) -> &'static str {
        match self {
            Self::Ok => "✔︎",
            Self::Warned => "⚠︎",
            Self::Failed | Self::Compromised => "✖︎",
        }
    }

    fn color(&self) -> Color {
        match self {
            Self::Ok => Color::Green,
            Self::Warned => Color::Yellow,
            Self::Failed => Color::Red,
            Self::Compromised => Color::Magenta,
        }
    }
}

/// Whether a compromise, `NAME` or `PROTOCOL/NAME`, covers the result.
fn is_compromised(result: &CheckResult, compromises: &[String]) -> bool {
    compromises.iter().any(|c| match c.split_once('/') {
        Some((protocol, name)) => protocol == result.protocol.as_str() && name == result.name,
        None => c == &result.name,
    })
}

/// First line of the output, describing the run.
#[derive(Debug, Serialize)]
struct Header {
    version: &'static str,
    engine: &'static str,
    os: &'static str,
    arch: &'static str,
    options: Options,
}

impl Header {
    fn new(cfg: &Config) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            engine: "rust",
            os: std::env::consts::OS,
            arch: std::env::consts::ARCH,
            options: Options::new(cfg),
        }
    }
}

#[derive(Debug, Serialize)]
struct Options {
    #[serde(skip_serializing_if = "Option::is_none")]
    server_command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    health_check_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    server_schemaless_url: Option<String>,
    tls_skip_verify: bool,
    #[serde(rename = "http1.0")]
    http1_0: bool,
    #[serde(rename = "http1.0-tls")]
    http1_0_tls: bool,
    #[serde(rename = "http1.1")]
    http1_1: bool,
    #[serde(rename = "http1.1-tls")]
    http1_1_tls: bool,
    h2: bool,
    h2c: bool,
    h3: bool,
    #[serde(rename = "compromise", skip_serializing_if = "Vec::is_empty")]
    compromises: Vec<String>,
    transfer_speed_byte: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    transfer_spans: Vec<String>,
    concurrency: usize,
    simultaneous_requests: usize,
    #[serde(rename = "check", skip_serializing_if = "Vec::is_empty")]
    checks: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result_jsonl_path: Option<String>,
}

impl Options {
    fn new(cfg: &Config) -> Self {
        let (server_command, health_check_path, server_schemaless_url) = match &cfg.target {
            TargetConfig::Command { command, health_check_path } => {
                (Some(command.clone()), Some(health_check_path.clone()), None)
            }
            TargetConfig::SchemalessUrl(url) => (None, None, Some(url.clone())),
        };
        let enabled = |p: Protocol| cfg.protocols.contains(&p);

        Self {
            server_command,
            health_check_path,
            server_schemaless_url,
            tls_skip_verify: cfg.tls_skip_verify,
            http1_0: enabled(Protocol::Http1_0),
            http1_0_tls: enabled(Protocol::Http1_0Tls),
            http1_1: enabled(Protocol::Http1_1),
            http1_1_tls: enabled(Protocol::Http1_1Tls),
            h2: enabled(Protocol::H2),
            h2c: enabled(Protocol::H2c),
            h3: enabled(Protocol::H3),
            compromises: cfg.compromises.clone(),
            transfer_speed_byte: cfg.transfer_speed,
            transfer_spans: cfg.transfer_spans.iter().map(|d: &Duration| format!("{d:?}")).collect(),
            concurrency: cfg.concurrency.get(),
            simultaneous_requests: cfg.simultaneous_requests.get(),
            checks: cfg.checks.clone(),
            result_jsonl_path: cfg.result_jsonl_path.as_ref().map(|p| p.display().to_string()),
        }
    }
}

/// Terminal lines plus the optional JSON lines file.
struct Output {
    colored: bool,
    stdout: io::Stdout,
    jsonl: Option<BufWriter<File>>,
}

impl Output {
    fn new(cfg: &Config) -> Result<Self, Box<dyn Error>> {
        let stdout = io::stdout();
        let colored = stdout.is_tty() || std::env::var("GITHUB_ACTIONS").as_deref() == Ok("true");

        let jsonl = match &cfg.result_jsonl_path {
            Some(path) => {
                log::debug!("writing results into '{}'", path.display());
                Some(BufWriter::new(File::create(path)?))
            }
            None => None,
        };

        Ok(Self { colored, stdout, jsonl })
    }

    fn header(&mut self, header: &Header) -> Result<(), Box<dyn Error>> {
        let line = serde_json::to_string(header)?;

        writeln!(self.stdout, "{HEADER_PREFIX}{line}")?;
        self.jsonl_line(&line)
    }

    fn result(&mut self, result: &CheckResult, status: Status) -> Result<(), Box<dyn Error>> {
        let line = serde_json::to_string(result)?;

        let text = format!("{} {line}", status.glyph());
        if self.colored {
            writeln!(self.stdout, "{}", text.with(status.color()))?;
        } else {
            writeln!(self.stdout, "{text}")?;
        }
        self.stdout.flush()?;

        self.jsonl_line(&line)
    }

    fn jsonl_line(&mut self, line: &str) -> Result<(), Box<dyn Error>> {
        if let Some(jsonl) = &mut self.jsonl {
            writeln!(jsonl, "{line}")?;
        }
        Ok(())
    }

    fn finish(mut self) -> Result<(), Box<dyn Error>> {
        if let Some(jsonl) = &mut self.jsonl {
            jsonl.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use clap::Parser;

    use super::*;
    use crate::{
        cmd::Cmd,
        report::{ResultError, ResultWarning, SubResult},
    };

    fn result(sub: SubResult) -> CheckResult {
        CheckResult::new("put", Protocol::H2, sub)
    }

    #[test]
    fn test_status() {
        let compromises = vec!["put.transferred".to_string(), "h3/put".to_string()];

        assert_eq!(Status::Ok, Status::of(&result(SubResult::ok()), &compromises));
        assert_eq!(
            Status::Warned,
            Status::of(&result(SubResult::ok().with_warning(ResultWarning::new("w"))), &compromises)
        );
        assert_eq!(
            Status::Failed,
            Status::of(&result(SubResult::error(ResultError::new("e"))), &compromises)
        );
        assert_eq!(
            Status::Compromised,
            Status::of(
                &result(SubResult::named("transferred").with_error(ResultError::new("e"))),
                &compromises
            )
        );
    }

    #[test]
    fn test_compromise_by_protocol() {
        let failed = result(SubResult::error(ResultError::new("e")));

        assert!(is_compromised(&failed, &["h2/put".into()]));
        assert!(!is_compromised(&failed, &["h3/put".into()]));
        assert!(!is_compromised(&failed, &["h2/put.transferred".into()]));
        assert!(!is_compromised(&failed, &["get_first".into()]));
    }

    #[test]
    fn test_select_checks() {
        let checks = select_checks(check::all_checks(), &["put".into(), "post_first".into()]).unwrap();
        let names: Vec<_> = checks.iter().map(|c| c.name()).collect();
        assert_eq!(vec!["post_first", "put"], names);

        assert_eq!(check::all_checks().len(), select_checks(check::all_checks(), &[]).unwrap().len());
        assert!(select_checks(check::all_checks(), &["nope".into()]).is_err());
    }

    #[test]
    fn test_header() {
        let cmd = Cmd::try_parse_from([
            "pipecheck",
            "--server-schemaless-url",
            "//localhost:8080",
            "--h2c",
            "--transfer-span",
            "3s",
        ])
        .unwrap();
        let cfg = Config::try_from(cmd).unwrap();

        let header = serde_json::to_value(Header::new(&cfg)).unwrap();
        assert_eq!("rust", header["engine"]);
        assert_eq!("//localhost:8080", header["options"]["server_schemaless_url"]);
        assert_eq!(true, header["options"]["h2c"]);
        assert_eq!(false, header["options"]["http1.1"]);
        assert_eq!("3s", header["options"]["transfer_spans"][0]);
        assert!(header["options"].get("server_command").is_none());
    }

    #[tokio::test]
    async fn test_run_without_protocols_is_empty() {
        let dir = std::env::temp_dir().join(format!("pipecheck-{}.jsonl", uuid::Uuid::new_v4()));
        let cmd = Cmd::try_parse_from([
            "pipecheck",
            "--server-schemaless-url",
            "//localhost:1",
            "--result-jsonl-path",
            dir.to_str().unwrap(),
        ])
        .unwrap();
        let cfg = Config::try_from(cmd).unwrap();

        let outcome = Runtime::new(cfg).run().await.unwrap();
        assert!(outcome.is_success());

        let jsonl = std::fs::read_to_string(&dir).unwrap();
        assert_eq!(1, jsonl.lines().count());
        assert!(jsonl.starts_with("{\"version\""));
        std::fs::remove_file(dir).unwrap();
    }
}
