use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::render::QueryParams;
use crate::error::ErrorReport;
use crate::inventory::{ParserKind, QueryTemplate};
use crate::link::CommandResult;
use crate::parser::{ParsingMethod, Row};

/// Inputs of one template query.
#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    pub template_id: String,
    pub device_ids: Vec<String>,
    pub params: QueryParams,
    pub enable_parsing: bool,
    /// Overrides the vendor command set's parse template.
    pub custom_template: Option<String>,
    /// Secret for dynamic-auth devices without a per-device entry.
    pub user_secret: Option<String>,
    pub device_secrets: HashMap<String, String>,
}

impl QueryRequest {
    pub fn new(template_id: impl Into<String>, device_ids: Vec<String>) -> Self {
        Self {
            template_id: template_id.into(),
            device_ids,
            enable_parsing: true,
            ..Self::default()
        }
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn params(mut self, params: QueryParams) -> Self {
        self.params = params;
        self
    }

    pub fn parsing(mut self, enabled: bool) -> Self {
        self.enable_parsing = enabled;
        self
    }

    pub fn custom_template(mut self, name: impl Into<String>) -> Self {
        self.custom_template = Some(name.into());
        self
    }

    pub fn secret(mut self, secret: impl Into<String>) -> Self {
        self.user_secret = Some(secret.into());
        self
    }

    pub fn device_secret(mut self, device_id: impl Into<String>, secret: impl Into<String>) -> Self {
        self.device_secrets.insert(device_id.into(), secret.into());
        self
    }

    /// Secret offered for `device_id`: its own entry, else the shared one.
    pub fn secret_for(&self, device_id: &str) -> Option<&str> {
        self.device_secrets
            .get(device_id)
            .or(self.user_secret.as_ref())
            .map(String::as_str)
    }
}

/// Identity of the query template a result belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TemplateInfo {
    pub template_id: String,
    pub name: String,
    pub template_type: String,
    pub version: u32,
    pub description: Option<String>,
    pub active: bool,
}

impl From<&QueryTemplate> for TemplateInfo {
    fn from(template: &QueryTemplate) -> Self {
        Self {
            template_id: template.id.clone(),
            name: template.name.clone(),
            template_type: template.template_type.clone(),
            version: template.version,
            description: template.description.clone(),
            active: template.active,
        }
    }
}

/// Structured form of one command's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ParsedResult {
    pub device_id: String,
    pub command: String,
    pub success: bool,
    pub raw_output: String,
    pub rows: Vec<Row>,
    pub template_used: Option<String>,
    pub method: ParsingMethod,
    pub error: Option<String>,
}

/// Everything one device produced for one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DeviceQueryResult {
    pub device_id: String,
    pub hostname: String,
    pub ip_address: String,
    pub vendor_id: String,
    pub platform: String,
    pub success: bool,
    pub commands: Vec<CommandResult>,
    pub parsed: Vec<ParsedResult>,
    pub total_latency_ms: u64,
    pub error: Option<ErrorReport>,
}

/// A command dispatched with placeholders still in it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct UnrenderedCommand {
    pub vendor_id: String,
    pub command: String,
    pub missing: Vec<String>,
}

/// Aggregate of a template query across devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TemplateQueryResult {
    pub template: TemplateInfo,
    pub params: QueryParams,
    pub results: Vec<DeviceQueryResult>,
    /// False only when the query failed as a whole.
    pub success: bool,
    pub error: Option<ErrorReport>,
    pub total_devices: usize,
    pub successful_devices: usize,
    pub failed_devices: usize,
    /// Inactive devices left out of the run.
    pub skipped_devices: Vec<String>,
    pub unrendered: Vec<UnrenderedCommand>,
    pub elapsed_ms: u64,
    pub executed_at: DateTime<Utc>,
}

impl TemplateQueryResult {
    /// Whole-query failure, every requested device counted as failed.
    pub fn failed(template: TemplateInfo, request: &QueryRequest, error: ErrorReport) -> Self {
        let total = request.device_ids.len();
        Self {
            template,
            params: request.params.clone(),
            results: Vec::new(),
            success: false,
            error: Some(error),
            total_devices: total,
            successful_devices: 0,
            failed_devices: total,
            skipped_devices: Vec::new(),
            unrendered: Vec::new(),
            elapsed_ms: 0,
            executed_at: Utc::now(),
        }
    }

    /// Percentage of devices that succeeded.
    pub fn success_rate(&self) -> f64 {
        if self.total_devices == 0 {
            return 0.0;
        }
        self.successful_devices as f64 * 100.0 / self.total_devices as f64
    }

    pub fn device(&self, device_id: &str) -> Option<&DeviceQueryResult> {
        self.results.iter().find(|r| r.device_id == device_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CommandPreview {
    pub raw_command: String,
    pub processed_command: String,
    pub has_parameters: bool,
    pub missing: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct VendorPreview {
    pub vendor_id: String,
    pub vendor_code: Option<String>,
    pub vendor_name: Option<String>,
    pub platform: String,
    pub commands: Vec<CommandPreview>,
    pub parser_type: ParserKind,
    pub parser_template: Option<String>,
}

/// Rendered commands per vendor, without contacting any device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CommandsPreview {
    pub template: TemplateInfo,
    pub params: QueryParams,
    pub vendors: Vec<VendorPreview>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct VendorValidation {
    pub vendor_id: String,
    pub vendor_code: Option<String>,
    pub required: Vec<String>,
    pub missing: Vec<String>,
    pub passed: bool,
}

/// Parameter coverage of a template's command sets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ParameterValidation {
    pub template_id: String,
    pub template_name: String,
    pub provided: Vec<String>,
    pub required: Vec<String>,
    pub missing: Vec<String>,
    pub unused: Vec<String>,
    pub passed: bool,
    pub vendors: Vec<VendorValidation>,
}

/// Query orchestrator counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct QueryStats {
    pub max_concurrent_queries: usize,
    pub available_permits: usize,
    pub queries: u64,
    pub rejected_queries: u64,
    pub device_runs: u64,
    pub failed_device_runs: u64,
}
