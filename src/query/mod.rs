//! Query Orchestrator.
//!
//! A query runs one abstract template against a device set:
//!
//! 1. validate the request (device list, template, devices, vendor commands)
//! 2. group devices by vendor and render each vendor's command set
//! 3. run every device through the [`LinkPool`], bounded by the query gate
//! 4. parse each command's output and aggregate per device
//!
//! Steps 1 and 2 fail the whole call before any device is contacted. From
//! step 3 on, failures are isolated per device.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use futures::future::join_all;
use log::{debug, info, warn};
use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::config::QueryConfig;
use crate::error::{ErrorReport, NetError};
use crate::inventory::{Device, Inventory, ParserKind, QueryTemplate, Vendor, VendorCommand};
use crate::link::CommandResult;
use crate::parser::{ParseOutcome, ParserEngine};
use crate::platform;
use crate::pool::LinkPool;

mod render;
mod types;

pub use render::{QueryParams, RenderedCommand, placeholders, render};
pub use types::{
    CommandPreview, CommandsPreview, DeviceQueryResult, ParameterValidation, ParsedResult,
    QueryRequest, QueryStats, TemplateInfo, TemplateQueryResult, UnrenderedCommand,
    VendorPreview, VendorValidation,
};

/// Devices of one vendor sharing a rendered command set.
struct VendorGroup {
    vendor_id: String,
    vendor: Option<Vendor>,
    command_set: VendorCommand,
    rendered: Vec<RenderedCommand>,
    devices: Vec<Device>,
}

struct QueryPlan {
    template: QueryTemplate,
    groups: Vec<VendorGroup>,
    skipped: Vec<String>,
}

#[derive(Default)]
struct QueryCounters {
    queries: AtomicU64,
    rejected: AtomicU64,
    device_runs: AtomicU64,
    failed_device_runs: AtomicU64,
}

/// Fans query templates out over devices.
pub struct QueryOrchestrator {
    inventory: Arc<dyn Inventory>,
    pool: LinkPool,
    parser: Arc<ParserEngine>,
    gate: Arc<Semaphore>,
    max_concurrent: usize,
    counters: QueryCounters,
}

impl QueryOrchestrator {
    pub fn new(
        inventory: Arc<dyn Inventory>,
        pool: LinkPool,
        parser: Arc<ParserEngine>,
        config: &QueryConfig,
    ) -> Self {
        let max_concurrent = config.max_concurrent_queries.max(1);
        Self {
            inventory,
            pool,
            parser,
            gate: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            counters: QueryCounters::default(),
        }
    }

    /// Runs one template against `request.device_ids`.
    pub async fn run_template_query(
        &self,
        request: &QueryRequest,
    ) -> Result<TemplateQueryResult, NetError> {
        let started = Instant::now();
        self.counters.queries.fetch_add(1, Ordering::Relaxed);

        let plan = match self.plan(request).await {
            Ok(plan) => plan,
            Err(err) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!("Query {} rejected: {}", request.template_id, err);
                return Err(err);
            }
        };

        let unrendered: Vec<UnrenderedCommand> = plan
            .groups
            .iter()
            .flat_map(|group| {
                group
                    .rendered
                    .iter()
                    .filter(|r| !r.is_complete())
                    .map(|r| UnrenderedCommand {
                        vendor_id: group.vendor_id.clone(),
                        command: r.command.clone(),
                        missing: r.missing.clone(),
                    })
            })
            .collect();
        for entry in &unrendered {
            warn!(
                "Command '{}' for vendor {} is missing parameters {:?}",
                entry.command, entry.vendor_id, entry.missing
            );
        }

        let device_count: usize = plan.groups.iter().map(|g| g.devices.len()).sum();
        info!(
            "Running template {} ({}) on {} devices across {} vendors",
            plan.template.name,
            plan.template.id,
            device_count,
            plan.groups.len()
        );

        let runs = plan.groups.iter().flat_map(|group| {
            group
                .devices
                .iter()
                .map(move |device| self.run_device(device, group, request))
        });
        let results = join_all(runs).await;

        let successful = results.iter().filter(|r| r.success).count();
        let total = results.len();
        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            "Template {} finished: {}/{} devices succeeded in {} ms",
            plan.template.id, successful, total, elapsed_ms
        );

        Ok(TemplateQueryResult {
            template: TemplateInfo::from(&plan.template),
            params: request.params.clone(),
            results,
            success: true,
            error: None,
            total_devices: total,
            successful_devices: successful,
            failed_devices: total - successful,
            skipped_devices: plan.skipped,
            unrendered,
            elapsed_ms,
            executed_at: Utc::now(),
        })
    }

    /// Runs every active template of `template_type` concurrently.
    ///
    /// A template whose run fails outright becomes a failed entry.
    pub async fn run_template_type_query(
        &self,
        template_type: &str,
        request: &QueryRequest,
    ) -> Result<Vec<TemplateQueryResult>, NetError> {
        let templates: Vec<QueryTemplate> = self
            .inventory
            .get_templates_by_type(template_type)
            .await?
            .into_iter()
            .filter(|t| t.active)
            .collect();
        if templates.is_empty() {
            return Err(NetError::NoActiveTemplates(template_type.to_string()));
        }
        debug!(
            "Template type {} expands to {} templates",
            template_type,
            templates.len()
        );

        let runs = templates.iter().map(|template| {
            let scoped = QueryRequest {
                template_id: template.id.clone(),
                ..request.clone()
            };
            async move {
                match self.run_template_query(&scoped).await {
                    Ok(result) => result,
                    Err(err) => {
                        TemplateQueryResult::failed(TemplateInfo::from(template), &scoped, err.report())
                    }
                }
            }
        });
        Ok(join_all(runs).await)
    }

    /// Rendered commands per vendor. Contacts no device.
    pub async fn preview_commands(
        &self,
        template_id: &str,
        params: &QueryParams,
    ) -> Result<CommandsPreview, NetError> {
        let template = self.active_template(template_id).await?;
        let command_sets = self.command_sets(&template).await?;

        let mut vendors = Vec::with_capacity(command_sets.len());
        for command_set in command_sets {
            let vendor = self.inventory.get_vendor(&command_set.vendor_id).await?;
            let commands = command_set
                .commands
                .iter()
                .map(|raw| {
                    let rendered = render(raw, params);
                    CommandPreview {
                        raw_command: raw.clone(),
                        has_parameters: !placeholders(raw).is_empty(),
                        processed_command: rendered.command,
                        missing: rendered.missing,
                    }
                })
                .collect();
            vendors.push(VendorPreview {
                vendor_id: command_set.vendor_id.clone(),
                vendor_code: vendor.as_ref().map(|v| v.code.clone()),
                vendor_name: vendor.as_ref().map(|v| v.name.clone()),
                platform: platform::vendor_platform(vendor.as_ref()),
                commands,
                parser_type: command_set.parser_type,
                parser_template: command_set.parser_template.clone(),
            });
        }

        Ok(CommandsPreview {
            template: TemplateInfo::from(&template),
            params: params.clone(),
            vendors,
        })
    }

    /// Reports missing and unused parameters, per vendor and overall.
    pub async fn validate_parameters(
        &self,
        template_id: &str,
        params: &QueryParams,
    ) -> Result<ParameterValidation, NetError> {
        let template = self.active_template(template_id).await?;
        let command_sets = self.command_sets(&template).await?;
        let provided: BTreeSet<String> = params.keys().cloned().collect();

        let mut all_required = BTreeSet::new();
        let mut vendors = Vec::with_capacity(command_sets.len());
        for command_set in command_sets {
            let vendor = self.inventory.get_vendor(&command_set.vendor_id).await?;
            let required: BTreeSet<String> = command_set
                .commands
                .iter()
                .flat_map(|c| placeholders(c))
                .collect();
            let missing: Vec<String> = required.difference(&provided).cloned().collect();
            all_required.extend(required.iter().cloned());
            vendors.push(VendorValidation {
                vendor_id: command_set.vendor_id.clone(),
                vendor_code: vendor.map(|v| v.code),
                passed: missing.is_empty(),
                required: required.into_iter().collect(),
                missing,
            });
        }

        let missing: Vec<String> = all_required.difference(&provided).cloned().collect();
        let unused: Vec<String> = provided.difference(&all_required).cloned().collect();
        Ok(ParameterValidation {
            template_id: template.id.clone(),
            template_name: template.name.clone(),
            provided: provided.into_iter().collect(),
            required: all_required.into_iter().collect(),
            passed: missing.is_empty(),
            missing,
            unused,
            vendors,
        })
    }

    pub fn stats(&self) -> QueryStats {
        QueryStats {
            max_concurrent_queries: self.max_concurrent,
            available_permits: self.gate.available_permits(),
            queries: self.counters.queries.load(Ordering::Relaxed),
            rejected_queries: self.counters.rejected.load(Ordering::Relaxed),
            device_runs: self.counters.device_runs.load(Ordering::Relaxed),
            failed_device_runs: self.counters.failed_device_runs.load(Ordering::Relaxed),
        }
    }

    async fn active_template(&self, template_id: &str) -> Result<QueryTemplate, NetError> {
        let template = self
            .inventory
            .get_query_template(template_id)
            .await?
            .ok_or_else(|| NetError::QueryTemplateNotFound(template_id.to_string()))?;
        if !template.active {
            return Err(NetError::TemplateNotActive(template.id));
        }
        Ok(template)
    }

    async fn command_sets(&self, template: &QueryTemplate) -> Result<Vec<VendorCommand>, NetError> {
        let command_sets = self.inventory.get_vendor_commands(&template.id).await?;
        if command_sets.is_empty() {
            return Err(NetError::NoVendorCommands(template.id.clone()));
        }
        Ok(command_sets)
    }

    async fn plan(&self, request: &QueryRequest) -> Result<QueryPlan, NetError> {
        if request.device_ids.is_empty() {
            return Err(NetError::DeviceSetEmpty);
        }
        let template = self.active_template(&request.template_id).await?;

        let found = self.inventory.get_devices_by_ids(&request.device_ids).await?;
        if let Some(missing) = request
            .device_ids
            .iter()
            .find(|id| !found.iter().any(|d| &d.id == *id))
        {
            return Err(NetError::DeviceNotFound(missing.clone()));
        }

        let mut seen = HashSet::new();
        let mut skipped = Vec::new();
        let mut by_vendor: BTreeMap<String, Vec<Device>> = BTreeMap::new();
        for device in found {
            if !seen.insert(device.id.clone()) {
                continue;
            }
            if device.active {
                by_vendor
                    .entry(device.vendor_id.clone())
                    .or_default()
                    .push(device);
            } else {
                skipped.push(device.id);
            }
        }
        if !skipped.is_empty() {
            warn!("Skipping {} inactive devices: {:?}", skipped.len(), skipped);
        }
        if by_vendor.is_empty() {
            return Err(NetError::NoActiveDevices(seen.len()));
        }

        let command_sets = self.command_sets(&template).await?;
        let mut groups = Vec::with_capacity(by_vendor.len());
        for (vendor_id, devices) in by_vendor {
            let vendor = self.inventory.get_vendor(&vendor_id).await?;
            let Some(command_set) = command_sets.iter().find(|c| c.vendor_id == vendor_id) else {
                return Err(NetError::MissingVendorCommand {
                    template_id: template.id.clone(),
                    vendor: vendor
                        .as_ref()
                        .map(|v| v.name.clone())
                        .unwrap_or_else(|| vendor_id.clone()),
                    vendor_id,
                    device_ids: devices.into_iter().map(|d| d.id).collect(),
                });
            };
            let rendered = command_set
                .commands
                .iter()
                .map(|c| render(c, &request.params))
                .collect();
            groups.push(VendorGroup {
                command_set: command_set.clone(),
                vendor_id,
                vendor,
                rendered,
                devices,
            });
        }

        Ok(QueryPlan {
            template,
            groups,
            skipped,
        })
    }

    async fn run_device(
        &self,
        device: &Device,
        group: &VendorGroup,
        request: &QueryRequest,
    ) -> DeviceQueryResult {
        self.counters.device_runs.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let platform = platform::resolve_platform(device, group.vendor.as_ref());
        let mut result = DeviceQueryResult {
            device_id: device.id.clone(),
            hostname: device.hostname.clone(),
            ip_address: device.ip_address.clone(),
            vendor_id: group.vendor_id.clone(),
            platform,
            success: false,
            commands: Vec::new(),
            parsed: Vec::new(),
            total_latency_ms: 0,
            error: None,
        };

        let _permit = match self.gate.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                return self.device_failed(
                    result,
                    NetError::Internal("query gate closed".to_string()).report(),
                );
            }
        };

        let link = match self.pool.acquire(device, request.secret_for(&device.id)).await {
            Ok(link) => link,
            Err(err) => {
                warn!("Device {} ({}) unavailable: {}", device.hostname, device.id, err);
                result.total_latency_ms = started.elapsed().as_millis() as u64;
                return self.device_failed(result, err.report());
            }
        };

        let mut transport_error: Option<(String, NetError)> = None;
        for rendered in &group.rendered {
            if let Some((failed, _)) = &transport_error {
                result
                    .commands
                    .push(CommandResult::not_run(&rendered.command, failed));
                continue;
            }
            match link.execute(&rendered.command, None).await {
                Ok(output) => result.commands.push(output),
                Err(err) => {
                    result.commands.push(CommandResult::failed(&rendered.command, &err));
                    transport_error = Some((rendered.command.clone(), err));
                }
            }
        }
        self.pool.release(&device.id).await;
        result.total_latency_ms = started.elapsed().as_millis() as u64;

        result.parsed = result
            .commands
            .iter()
            .map(|command| self.parse_command(device, &result.platform, command, group, request))
            .collect();

        let error = match transport_error {
            Some((_, err)) => Some(err.report()),
            None => result.commands.iter().find(|c| !c.success).map(|c| {
                NetError::LinkExecution {
                    device_id: device.id.clone(),
                    command: c.command.clone(),
                    reason: c.error.clone().unwrap_or_default(),
                }
                .report()
            }),
        };
        match error {
            Some(report) => self.device_failed(result, report),
            None => {
                result.success = true;
                result
            }
        }
    }

    fn device_failed(&self, mut result: DeviceQueryResult, report: ErrorReport) -> DeviceQueryResult {
        self.counters.failed_device_runs.fetch_add(1, Ordering::Relaxed);
        result.success = false;
        result.error = Some(report);
        result
    }

    fn parse_command(
        &self,
        device: &Device,
        platform: &str,
        command: &CommandResult,
        group: &VendorGroup,
        request: &QueryRequest,
    ) -> ParsedResult {
        let outcome = if !command.success {
            ParseOutcome::skipped()
        } else if !request.enable_parsing || group.command_set.parser_type == ParserKind::Raw {
            ParseOutcome::raw()
        } else {
            let custom = request
                .custom_template
                .as_deref()
                .or(group.command_set.parser_template.as_deref());
            self.parser
                .parse(&command.output, platform, &command.command, custom)
        };
        ParsedResult {
            device_id: device.id.clone(),
            command: command.command.clone(),
            success: command.success,
            raw_output: command.output.clone(),
            rows: outcome.rows,
            template_used: outcome.template_used,
            method: outcome.method,
            error: outcome.error,
        }
    }
}
