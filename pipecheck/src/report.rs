use core::fmt::Display;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

use crate::protocol::Protocol;

/// Sub-check names.
///
/// A sub-check name means the same thing in every check that reports it, so
/// that a single behavior can be compromised across checks.
pub mod sub {
    pub const PROTOCOL: &str = "protocol";
    pub const SENDER_RESPONSE_BEFORE_RECEIVER: &str = "sender_response_before_receiver";
    pub const SAME_PATH_SENDER_REJECTION: &str = "same_path_sender_rejection";
    pub const CONTENT_TYPE_FORWARDING: &str = "content_type_forwarding";
    pub const CONTENT_DISPOSITION_FORWARDING: &str = "content_disposition_forwarding";
    pub const X_ROBOTS_TAG_NONE: &str = "x_robots_tag_none";
    pub const TRANSFERRED: &str = "transferred";
    pub const REUSE_PATH: &str = "reuse_path";
    pub const PARTIAL_TRANSFER: &str = "partial_transfer";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultError {
    pub message: String,
}

impl ResultError {
    pub fn new<M: Into<String>>(message: M) -> Self {
        Self { message: message.into() }
    }

    /// Error message with the underlying cause appended.
    pub fn with_cause<M: Display, E: Display>(message: M, err: E) -> Self {
        Self { message: format!("{message}: {err}") }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultWarning {
    pub message: String,
}

impl ResultWarning {
    pub fn new<M: Into<String>>(message: M) -> Self {
        Self { message: message.into() }
    }
}

/// A single finding of a running check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubResult {
    /// Empty for check-level findings.
    pub name: Option<&'static str>,
    pub message: Option<String>,
    pub errors: Vec<ResultError>,
    pub warnings: Vec<ResultWarning>,
}

impl SubResult {
    /// Check-level success.
    pub fn ok() -> Self {
        Self::default()
    }

    /// Sub-check success.
    pub fn named(name: &'static str) -> Self {
        Self { name: Some(name), ..Default::default() }
    }

    /// Check-level failure with a single error.
    pub fn error(err: ResultError) -> Self {
        Self::ok().with_error(err)
    }

    pub fn with_error(mut self, err: ResultError) -> Self {
        self.errors.push(err);
        self
    }

    pub fn with_errors(mut self, errs: Vec<ResultError>) -> Self {
        self.errors.extend(errs);
        self
    }

    pub fn with_warning(mut self, warning: ResultWarning) -> Self {
        self.warnings.push(warning);
        self
    }

    pub fn with_message<M: Into<String>>(mut self, message: M) -> Self {
        self.message = Some(message.into());
        self
    }

    #[inline]
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Result record of the output stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    /// Either `<check>` or `<check>.<sub-check>`.
    pub name: String,
    pub protocol: Protocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ResultError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<ResultWarning>,
}

impl CheckResult {
    pub fn new(check: &str, protocol: Protocol, sub: SubResult) -> Self {
        let SubResult { name, message, errors, warnings } = sub;

        let name = match name {
            Some(name) => format!("{check}.{name}"),
            None => check.to_string(),
        };

        Self {
            name,
            protocol,
            message,
            ok: errors.is_empty(),
            errors,
            warnings,
        }
    }
}

/// Sink for the findings of a single (check, protocol) unit.
///
/// Cloned freely into the tasks of a check. Once closed, further reports are
/// silently dropped.
#[derive(Debug, Clone)]
pub struct Reporter {
    tx: Arc<Mutex<Option<UnboundedSender<SubResult>>>>,
}

impl Reporter {
    pub fn new(tx: UnboundedSender<SubResult>) -> Self {
        Self { tx: Arc::new(Mutex::new(Some(tx))) }
    }

    pub fn report(&self, result: SubResult) {
        let tx = match self.tx.lock() {
            Ok(tx) => tx,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(tx) = tx.as_ref() {
            if tx.send(result).is_err() {
                log::trace!("result dropped: the unit output is gone");
            }
        }
    }

    /// Ends the result stream of this unit.
    pub fn close(&self) {
        let mut tx = match self.tx.lock() {
            Ok(tx) => tx,
            Err(poisoned) => poisoned.into_inner(),
        };

        tx.take();
    }
}
