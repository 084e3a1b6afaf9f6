//! Error types for credential resolution, device links, pooling, parsing and queries.
//!
//! Every failure maps to one [`ErrorCategory`] so batch results can report
//! what went wrong without leaking transport internals or secret material.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

/// Coarse classification of a [`NetError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Missing or incomplete inputs. Never retried.
    Configuration,
    /// Connect, read or write failures on the wire.
    Transport,
    /// Template loading or application failures.
    Parsing,
    /// Pool capacity or concurrency gates saturated.
    ResourceExhausted,
    /// Referenced record does not exist.
    NotFound,
    /// Broken internal invariant.
    Internal,
}

/// Errors produced by the orchestration core.
#[derive(Error, Debug)]
pub enum NetError {
    /// Dynamic authentication needs an operator-supplied secret.
    ///
    /// This is an expected outcome: callers prompt the operator and retry.
    #[error("credentials required for device {device_id} ({hostname})")]
    CredentialsRequired { device_id: String, hostname: String },

    /// Static authentication is configured but a stored field is empty.
    #[error("incomplete credentials for device {device_id}: missing {}", missing_fields(.missing_username, .missing_secret))]
    CredentialsIncomplete {
        device_id: String,
        missing_username: bool,
        missing_secret: bool,
    },

    /// Stored ciphertext could not be decrypted.
    #[error("failed to decrypt {field} for device {device_id}: {reason}")]
    Decryption {
        device_id: String,
        field: String,
        reason: String,
    },

    /// A command failed on an established link.
    #[error("execution of '{command}' on {device_id} failed: {reason}")]
    LinkExecution {
        device_id: String,
        command: String,
        reason: String,
    },

    /// Connecting to a device failed after all attempts.
    #[error("connection to {device_id} ({address}) failed: {reason}")]
    LinkConnect {
        device_id: String,
        address: String,
        reason: String,
    },

    /// The link is not connected and could not be reopened.
    #[error("link to {0} is closed")]
    LinkClosed(String),

    /// The pool holds `max_size` entries and none could be evicted.
    #[error("link pool exhausted: {0}")]
    PoolExhausted(String),

    /// Query template id is unknown.
    #[error("query template {0} not found")]
    QueryTemplateNotFound(String),

    /// Query template exists but is disabled.
    #[error("query template {0} is not active")]
    TemplateNotActive(String),

    /// No active templates carry the requested type.
    #[error("no active query templates of type '{0}'")]
    NoActiveTemplates(String),

    /// Query device list was empty.
    #[error("device list is empty")]
    DeviceSetEmpty,

    /// Every requested device is inactive.
    #[error("no active devices among the {0} requested")]
    NoActiveDevices(usize),

    /// Device id is unknown to the inventory.
    #[error("device {0} not found")]
    DeviceNotFound(String),

    /// Vendor id is unknown to the inventory.
    #[error("vendor {0} not found")]
    VendorNotFound(String),

    /// Region id is unknown to the inventory.
    #[error("region {0} not found")]
    RegionNotFound(String),

    /// A target vendor has no command set mapped to the template.
    #[error("query template {template_id} has no command for vendor {vendor}")]
    MissingVendorCommand {
        template_id: String,
        vendor_id: String,
        vendor: String,
        device_ids: Vec<String>,
    },

    /// Template has no vendor command sets at all.
    #[error("query template {0} has no vendor commands configured")]
    NoVendorCommands(String),

    /// Connecting an interactive session failed.
    #[error("session connect failed for {target}: {reason}")]
    SessionConnect { target: String, reason: String },

    /// Interactive session id is unknown.
    #[error("session {0} not found")]
    SessionNotFound(String),

    /// Parse template is missing from the store.
    #[error("parse template {0} not found")]
    ParseTemplateNotFound(String),

    /// Parse template failed to compile.
    #[error("parse template {name} is invalid: {reason}")]
    TemplateSyntax { name: String, reason: String },

    /// Parse template raised an error while being applied.
    #[error("parse template {name} failed on input: {reason}")]
    TemplateApply { name: String, reason: String },

    /// Template name contains characters that are not allowed on disk.
    #[error("invalid template name '{0}'")]
    InvalidTemplateName(String),

    /// A prompt profile holds an invalid regex.
    #[error("invalid prompt profile: {0}")]
    InvalidPromptProfile(String),

    /// The operator interrupted a running command.
    #[error("'{command}' on {device_id} was interrupted")]
    Interrupted { device_id: String, command: String },

    /// Command or connect exceeded its deadline. Never carries device output.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// The shell channel closed while waiting for output.
    #[error("channel disconnected while waiting for prompt")]
    ChannelDisconnected,

    /// An error occurred in the async-ssh2-tokio library.
    #[error("async ssh2 error: {0}")]
    Ssh2(#[from] async_ssh2_tokio::Error),

    /// An error occurred in the russh library.
    #[error("russh error: {0}")]
    Russh(#[from] russh::Error),

    /// File system error in the template store.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Collaborator lookup failed.
    #[error("inventory error: {0}")]
    Inventory(String),

    /// Broken invariant or unexpected state.
    #[error("internal error: {0}")]
    Internal(String),
}

fn missing_fields(username: &bool, secret: &bool) -> &'static str {
    match (*username, *secret) {
        (true, true) => "username and password",
        (true, false) => "username",
        (false, true) => "password",
        (false, false) => "nothing",
    }
}

/// Substrings that mark an authentication rejection.
const AUTH_ERRORS: &[&str] = &[
    "authentication failed",
    "password authentication failed",
    "permission denied",
    "auth fail",
    "access denied",
];

/// Substrings that mark a transient transport failure.
const RETRYABLE_ERRORS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection timed out",
    "timed out",
    "timeout",
    "network is unreachable",
    "no route to host",
    "broken pipe",
    "host is down",
    "disconnect",
];

impl NetError {
    /// Returns the taxonomy bucket for this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            NetError::CredentialsRequired { .. }
            | NetError::CredentialsIncomplete { .. }
            | NetError::Decryption { .. }
            | NetError::TemplateNotActive(_)
            | NetError::NoActiveTemplates(_)
            | NetError::DeviceSetEmpty
            | NetError::NoActiveDevices(_)
            | NetError::MissingVendorCommand { .. }
            | NetError::NoVendorCommands(_)
            | NetError::InvalidTemplateName(_)
            | NetError::InvalidPromptProfile(_) => ErrorCategory::Configuration,
            NetError::LinkExecution { .. }
            | NetError::LinkConnect { .. }
            | NetError::LinkClosed(_)
            | NetError::SessionConnect { .. }
            | NetError::Interrupted { .. }
            | NetError::Timeout(_)
            | NetError::ChannelDisconnected
            | NetError::Ssh2(_)
            | NetError::Russh(_) => ErrorCategory::Transport,
            NetError::TemplateSyntax { .. } | NetError::TemplateApply { .. } => {
                ErrorCategory::Parsing
            }
            NetError::PoolExhausted(_) => ErrorCategory::ResourceExhausted,
            NetError::QueryTemplateNotFound(_)
            | NetError::DeviceNotFound(_)
            | NetError::VendorNotFound(_)
            | NetError::RegionNotFound(_)
            | NetError::SessionNotFound(_)
            | NetError::ParseTemplateNotFound(_) => ErrorCategory::NotFound,
            NetError::Io(_) | NetError::Inventory(_) | NetError::Internal(_) => {
                ErrorCategory::Internal
            }
        }
    }

    /// Structured payload describing the failing subject.
    pub fn detail(&self) -> Value {
        match self {
            NetError::CredentialsRequired {
                device_id,
                hostname,
            } => json!({ "device_id": device_id, "hostname": hostname }),
            NetError::CredentialsIncomplete {
                device_id,
                missing_username,
                missing_secret,
            } => json!({
                "device_id": device_id,
                "missing_username": missing_username,
                "missing_password": missing_secret,
            }),
            NetError::Decryption {
                device_id, field, ..
            } => json!({ "device_id": device_id, "field": field }),
            NetError::LinkExecution {
                device_id, command, ..
            }
            | NetError::Interrupted { device_id, command } => {
                json!({ "device_id": device_id, "command": command })
            }
            NetError::LinkConnect {
                device_id, address, ..
            } => json!({ "device_id": device_id, "address": address }),
            NetError::MissingVendorCommand {
                template_id,
                vendor_id,
                vendor,
                device_ids,
            } => json!({
                "template_id": template_id,
                "vendor_id": vendor_id,
                "vendor": vendor,
                "device_ids": device_ids,
            }),
            NetError::DeviceNotFound(id) | NetError::LinkClosed(id) => json!({ "device_id": id }),
            NetError::QueryTemplateNotFound(id) | NetError::TemplateNotActive(id) => {
                json!({ "template_id": id })
            }
            NetError::SessionNotFound(id) => json!({ "session_id": id }),
            NetError::TemplateSyntax { name, .. } | NetError::TemplateApply { name, .. } => {
                json!({ "template": name })
            }
            _ => Value::Null,
        }
    }

    /// Whether a retry with backoff may succeed.
    ///
    /// Authentication rejections are never retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            NetError::Timeout(_) | NetError::ChannelDisconnected => true,
            NetError::LinkConnect { reason, .. } => is_retryable_message(reason),
            NetError::Ssh2(e) => is_retryable_message(&e.to_string()),
            NetError::Russh(e) => is_retryable_message(&e.to_string()),
            NetError::Io(e) => is_retryable_message(&e.to_string()),
            _ => false,
        }
    }

    /// Converts the error into its user-visible, serializable form.
    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            category: self.category(),
            message: self.to_string(),
            detail: self.detail(),
        }
    }
}

/// Classifies a transport error message.
pub(crate) fn is_retryable_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    if AUTH_ERRORS.iter().any(|auth| lower.contains(auth)) {
        return false;
    }
    RETRYABLE_ERRORS.iter().any(|err| lower.contains(err))
}

/// User-visible error: category, message and detail payload. Never holds secrets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ErrorReport {
    pub category: ErrorCategory,
    pub message: String,
    pub detail: Value,
}

impl From<&NetError> for ErrorReport {
    fn from(err: &NetError) -> Self {
        err.report()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_errors_are_not_retryable() {
        let err = NetError::CredentialsRequired {
            device_id: "d1".to_string(),
            hostname: "core-1".to_string(),
        };
        assert_eq!(err.category(), ErrorCategory::Configuration);
        assert!(!err.is_retryable());
        assert_eq!(err.detail()["hostname"], "core-1");
    }

    #[test]
    fn incomplete_credentials_message_names_missing_fields() {
        let err = NetError::CredentialsIncomplete {
            device_id: "d1".to_string(),
            missing_username: false,
            missing_secret: true,
        };
        assert_eq!(
            err.to_string(),
            "incomplete credentials for device d1: missing password"
        );
        assert_eq!(err.detail()["missing_password"], true);
    }

    #[test]
    fn auth_failures_are_never_retried() {
        assert!(!is_retryable_message("Password authentication failed"));
        assert!(!is_retryable_message("Permission denied (timeout)"));
        assert!(is_retryable_message("Connection refused"));
        assert!(is_retryable_message("operation timed out"));
        assert!(!is_retryable_message("unknown host key"));
    }

    #[test]
    fn connect_error_classification_follows_reason() {
        let transient = NetError::LinkConnect {
            device_id: "d1".to_string(),
            address: "10.0.0.1:22".to_string(),
            reason: "connection reset by peer".to_string(),
        };
        assert!(transient.is_retryable());
        assert_eq!(transient.category(), ErrorCategory::Transport);

        let rejected = NetError::LinkConnect {
            device_id: "d1".to_string(),
            address: "10.0.0.1:22".to_string(),
            reason: "authentication failed".to_string(),
        };
        assert!(!rejected.is_retryable());
    }

    #[test]
    fn report_is_serializable() {
        let report = NetError::PoolExhausted("100/100".to_string()).report();
        assert_eq!(report.category, ErrorCategory::ResourceExhausted);
        let value = serde_json::to_value(&report).expect("serialize report");
        assert_eq!(value["category"], "resource_exhausted");
    }
}
