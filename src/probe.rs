//! Connection tests.
//!
//! Every test opens a throw-away [`DeviceLink`] outside the pool, runs the
//! platform probe command and closes the link again. Failures are reported in
//! the result, never as an error, so batches keep going.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use log::{debug, info, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::config::{LinkConfig, QueryConfig};
use crate::credentials::CredentialResolver;
use crate::error::{ErrorReport, NetError};
use crate::inventory::{AuthMode, Device, Inventory};
use crate::link::{Connector, DeviceLink, LinkTarget, vendor_link_config};
use crate::platform;

/// Outcome of one connection test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ConnectionTestResult {
    pub device_id: String,
    pub hostname: Option<String>,
    pub address: Option<String>,
    pub platform: Option<String>,
    pub auth_mode: Option<AuthMode>,
    pub success: bool,
    pub latency_ms: u64,
    pub error: Option<ErrorReport>,
    pub tested_at: DateTime<Utc>,
}

impl ConnectionTestResult {
    fn for_id(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            hostname: None,
            address: None,
            platform: None,
            auth_mode: None,
            success: false,
            latency_ms: 0,
            error: None,
            tested_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BatchTestResult {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Percentage of devices that passed.
    pub success_rate: f64,
    pub results: Vec<ConnectionTestResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StabilitySample {
    pub attempt: u32,
    pub success: bool,
    pub latency_ms: u64,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StabilityReport {
    pub device_id: String,
    pub probe_command: String,
    pub duration_ms: u64,
    pub interval_ms: u64,
    pub attempts: u32,
    pub succeeded: u32,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub max_latency_ms: u64,
    pub samples: Vec<StabilitySample>,
}

/// Runs connection tests against inventory devices.
pub struct Prober {
    inventory: Arc<dyn Inventory>,
    resolver: Arc<CredentialResolver>,
    connector: Arc<dyn Connector>,
    link_config: LinkConfig,
    config: QueryConfig,
}

impl Prober {
    pub fn new(
        inventory: Arc<dyn Inventory>,
        resolver: Arc<CredentialResolver>,
        connector: Arc<dyn Connector>,
        link_config: LinkConfig,
        config: QueryConfig,
    ) -> Self {
        Self {
            inventory,
            resolver,
            connector,
            link_config,
            config,
        }
    }

    async fn open(&self, device: &Device, user_secret: Option<&str>) -> Result<DeviceLink, NetError> {
        let credentials = self.resolver.resolve_device(device, user_secret).await?;
        let vendor = self.inventory.get_vendor(&device.vendor_id).await?;
        let config = vendor_link_config(&self.link_config, vendor.as_ref());
        let target = LinkTarget::for_device(device, vendor.as_ref(), credentials, &config);
        let link = DeviceLink::new(target, self.connector.clone(), config);
        link.try_connect().await?;
        Ok(link)
    }

    /// Connects, runs the probe command and disconnects.
    pub async fn test_connection(
        &self,
        device_id: &str,
        user_secret: Option<&str>,
    ) -> ConnectionTestResult {
        match self.inventory.get_device(device_id).await {
            Ok(Some(device)) => self.test_device(&device, user_secret).await,
            Ok(None) => {
                let mut result = ConnectionTestResult::for_id(device_id);
                result.error = Some(NetError::DeviceNotFound(device_id.to_string()).report());
                result
            }
            Err(err) => {
                let mut result = ConnectionTestResult::for_id(device_id);
                result.error = Some(err.report());
                result
            }
        }
    }

    pub async fn test_device(
        &self,
        device: &Device,
        user_secret: Option<&str>,
    ) -> ConnectionTestResult {
        let started = Instant::now();
        let mut result = ConnectionTestResult::for_id(&device.id);
        result.hostname = Some(device.hostname.clone());
        result.address = Some(device.address());
        result.auth_mode = Some(device.auth_mode);

        let outcome = match self.open(device, user_secret).await {
            Ok(link) => {
                result.platform = Some(link.platform().to_string());
                let probe = platform::probe_command(link.platform());
                let executed = link.execute(probe, Some(self.config.probe_timeout)).await;
                link.close().await;
                executed.map(|output| {
                    if !output.success {
                        debug!(
                            "{} rejected probe '{}', login itself succeeded",
                            device.hostname, probe
                        );
                    }
                })
            }
            Err(err) => Err(err),
        };

        result.latency_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(()) => {
                result.success = true;
                debug!(
                    "Connection test to {} passed in {} ms",
                    device.hostname, result.latency_ms
                );
            }
            Err(err) => {
                warn!("Connection test to {} failed: {}", device.hostname, err);
                result.error = Some(err.report());
            }
        }
        result
    }

    /// Tests many devices, at most `max_concurrent` at a time.
    pub async fn test_batch(
        &self,
        device_ids: &[String],
        secrets: &HashMap<String, String>,
        max_concurrent: Option<usize>,
    ) -> BatchTestResult {
        let limit = max_concurrent
            .unwrap_or(self.config.max_concurrent_auth_tests)
            .max(1);
        let gate = Semaphore::new(limit);
        info!(
            "Testing {} devices, {} at a time",
            device_ids.len(),
            limit
        );

        let runs = device_ids.iter().map(|device_id| {
            let gate = &gate;
            async move {
                let _permit = match gate.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        let mut result = ConnectionTestResult::for_id(device_id);
                        result.error =
                            Some(NetError::Internal("test gate closed".to_string()).report());
                        return result;
                    }
                };
                let secret = secrets.get(device_id).map(String::as_str);
                self.test_connection(device_id, secret).await
            }
        });
        let results = join_all(runs).await;

        let succeeded = results.iter().filter(|r| r.success).count();
        let total = results.len();
        let success_rate = if total == 0 {
            0.0
        } else {
            succeeded as f64 * 100.0 / total as f64
        };
        info!("Batch test finished: {}/{} passed", succeeded, total);
        BatchTestResult {
            total,
            succeeded,
            failed: total - succeeded,
            success_rate,
            results,
        }
    }

    /// Probes one link repeatedly for `duration`, every `interval`.
    ///
    /// Fails only when the device is unknown or the first connect fails.
    pub async fn test_stability(
        &self,
        device_id: &str,
        user_secret: Option<&str>,
        duration: Option<Duration>,
        interval: Option<Duration>,
    ) -> Result<StabilityReport, NetError> {
        let duration = duration.unwrap_or(self.config.stability_duration);
        let interval = interval.unwrap_or(self.config.stability_interval);
        let device = self
            .inventory
            .get_device(device_id)
            .await?
            .ok_or_else(|| NetError::DeviceNotFound(device_id.to_string()))?;

        let link = self.open(&device, user_secret).await?;
        let probe = platform::probe_command(link.platform());
        info!(
            "Stability test on {} for {:?} every {:?} using '{}'",
            device.hostname, duration, interval, probe
        );

        let started = Instant::now();
        let mut samples = Vec::new();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let sent = Instant::now();
            let outcome = link.execute(probe, Some(self.config.probe_timeout)).await;
            samples.push(StabilitySample {
                attempt,
                success: outcome.is_ok(),
                latency_ms: sent.elapsed().as_millis() as u64,
                error: outcome.err().map(|e| e.to_string()),
                at: Utc::now(),
            });

            if started.elapsed() >= duration {
                break;
            }
            tokio::time::sleep(interval).await;
            if started.elapsed() >= duration {
                break;
            }
        }
        link.close().await;

        let succeeded = samples.iter().filter(|s| s.success).count() as u32;
        let latencies: Vec<u64> = samples
            .iter()
            .filter(|s| s.success)
            .map(|s| s.latency_ms)
            .collect();
        let avg_latency_ms = if latencies.is_empty() {
            0.0
        } else {
            latencies.iter().sum::<u64>() as f64 / latencies.len() as f64
        };
        Ok(StabilityReport {
            device_id: device.id.clone(),
            probe_command: probe.to_string(),
            duration_ms: started.elapsed().as_millis() as u64,
            interval_ms: interval.as_millis() as u64,
            attempts: attempt,
            succeeded,
            success_rate: succeeded as f64 * 100.0 / attempt as f64,
            avg_latency_ms,
            max_latency_ms: latencies.into_iter().max().unwrap_or(0),
            samples,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CredentialConfig;
    use crate::error::ErrorCategory;
    use crate::inventory::{HexCodec, MemoryInventory, NetworkTier, Region, Vendor};
    use crate::link::scripted::{Reply, ScriptedConnector, ScriptedDevice};

    fn device(id: &str, ip: &str, auth_mode: AuthMode) -> Device {
        Device {
            id: id.to_string(),
            hostname: format!("{id}-rt"),
            ip_address: ip.to_string(),
            port: 22,
            vendor_id: "huawei".to_string(),
            region_id: "east".to_string(),
            network_layer: NetworkTier::Core,
            platform_hint: None,
            auth_mode,
            static_username: Some("admin".to_string()),
            static_secret_ciphertext: Some("7077".to_string()),
            active: true,
        }
    }

    async fn prober(connector: Arc<ScriptedConnector>) -> Prober {
        let inventory = Arc::new(MemoryInventory::new());
        inventory
            .upsert_vendor(Vendor {
                id: "huawei".to_string(),
                code: "huawei".to_string(),
                name: "Huawei".to_string(),
                platform_tag: None,
                connect_timeout_secs: Some(5),
                command_timeout_secs: None,
            })
            .await;
        inventory
            .upsert_region(Region {
                id: "east".to_string(),
                code: "E2".to_string(),
                name: "East".to_string(),
                shared_secret_ciphertext: None,
            })
            .await;
        inventory
            .upsert_device(device("r1", "10.1.0.1", AuthMode::Static))
            .await;
        inventory
            .upsert_device(device("r2", "10.1.0.2", AuthMode::Static))
            .await;
        inventory
            .upsert_device(device("r3", "10.1.0.3", AuthMode::Dynamic))
            .await;
        let resolver = Arc::new(CredentialResolver::new(
            inventory.clone(),
            Arc::new(HexCodec),
            CredentialConfig::default(),
        ));
        Prober::new(
            inventory,
            resolver,
            connector,
            LinkConfig::default(),
            QueryConfig::default(),
        )
    }

    fn router() -> ScriptedDevice {
        ScriptedDevice::new("<r1-rt>")
            .reply("display clock", Reply::output("2026-10-17 09:30:00+08:00"))
            .expect_secret("pw")
    }

    #[tokio::test]
    async fn probe_runs_platform_command_and_closes() {
        let router = router();
        let connector = Arc::new(ScriptedConnector::new().with_device("10.1.0.1", router.clone()));
        let prober = prober(connector).await;

        let result = prober.test_connection("r1", None).await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.platform.as_deref(), Some("huawei_vrp"));
        assert_eq!(result.auth_mode, Some(AuthMode::Static));
        assert_eq!(router.executed().await, vec!["display clock".to_string()]);
        assert_eq!(router.connects(), 1);
    }

    #[tokio::test]
    async fn failures_are_reported_not_raised() {
        let connector = Arc::new(ScriptedConnector::new().with_device("10.1.0.1", router()));
        let prober = prober(connector.clone()).await;

        let missing = prober.test_connection("ghost", None).await;
        assert!(!missing.success);
        assert_eq!(
            missing.error.expect("report").category,
            ErrorCategory::NotFound
        );

        let needs_secret = prober.test_connection("r3", None).await;
        assert_eq!(
            needs_secret.error.expect("report").category,
            ErrorCategory::Configuration
        );
        assert_eq!(connector.connect_attempts(), 0);
    }

    #[tokio::test]
    async fn batch_isolates_failures() {
        let connector = Arc::new(ScriptedConnector::new().with_device("10.1.0.1", router()));
        let prober = prober(connector).await;

        let ids = vec!["r1".to_string(), "r2".to_string()];
        let batch = prober.test_batch(&ids, &HashMap::new(), Some(1)).await;
        assert_eq!(batch.total, 2);
        assert_eq!(batch.succeeded, 1);
        assert_eq!(batch.failed, 1);
        assert!((batch.success_rate - 50.0).abs() < f64::EPSILON);
        let r2 = batch
            .results
            .iter()
            .find(|r| r.device_id == "r2")
            .expect("r2 result");
        assert!(r2.error.as_ref().expect("report").message.contains("no route"));
    }

    #[tokio::test(start_paused = true)]
    async fn stability_samples_until_duration_elapses() {
        let router = router();
        let connector = Arc::new(ScriptedConnector::new().with_device("10.1.0.1", router.clone()));
        let prober = prober(connector).await;

        let report = prober
            .test_stability(
                "r1",
                None,
                Some(Duration::from_secs(10)),
                Some(Duration::from_secs(5)),
            )
            .await
            .expect("stability test");
        assert_eq!(report.attempts, 2);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.probe_command, "display clock");
        assert_eq!(router.executed().await.len(), 2);
    }

    #[tokio::test]
    async fn stability_requires_an_initial_connection() {
        let connector = Arc::new(ScriptedConnector::new());
        let prober = prober(connector).await;
        let err = match prober.test_stability("r1", None, None, None).await {
            Ok(_) => panic!("device is unreachable"),
            Err(err) => err,
        };
        assert!(matches!(err, NetError::LinkConnect { .. }));
    }
}
