//! The outbound call surface.
//!
//! [`NetOps`] wires the resolver, pool, parser, orchestrator, prober and
//! session manager together from one [`NetOpsConfig`], and owns the start
//! and stop of their background loops.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::info;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::config::NetOpsConfig;
use crate::credentials::{CredentialResolver, Credentials, Resolution};
use crate::error::NetError;
use crate::inventory::{Inventory, SecretCodec};
use crate::link::{Connector, LinkInfo, SshConnector};
use crate::parser::{CustomTemplateInfo, ParseOutcome, ParserEngine, ParserStats};
use crate::pool::{LinkPool, PoolStats};
use crate::probe::{BatchTestResult, ConnectionTestResult, Prober, StabilityReport};
use crate::query::{
    CommandsPreview, ParameterValidation, QueryOrchestrator, QueryParams, QueryRequest,
    QueryStats, TemplateQueryResult,
};
use crate::terminal::{CliSession, SessionInfo, SessionManager, SessionStats, SessionStream, SessionTarget};

/// Combined runtime counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ServiceStats {
    pub pool: PoolStats,
    pub parser: ParserStats,
    pub queries: QueryStats,
    pub sessions: SessionStats,
    pub cached_secrets: u64,
}

pub struct NetOps {
    config: NetOpsConfig,
    resolver: Arc<CredentialResolver>,
    pool: LinkPool,
    parser: Arc<ParserEngine>,
    orchestrator: QueryOrchestrator,
    prober: Prober,
    sessions: SessionManager,
}

impl NetOps {
    pub fn new(
        config: NetOpsConfig,
        inventory: Arc<dyn Inventory>,
        codec: Arc<dyn SecretCodec>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let resolver = Arc::new(CredentialResolver::new(
            inventory.clone(),
            codec,
            config.credentials.clone(),
        ));
        let pool = LinkPool::new(
            config.pool.clone(),
            config.link.clone(),
            connector.clone(),
            resolver.clone(),
            inventory.clone(),
        );
        let parser = Arc::new(ParserEngine::new(&config.parser));
        let orchestrator =
            QueryOrchestrator::new(inventory.clone(), pool.clone(), parser.clone(), &config.query);
        let prober = Prober::new(
            inventory.clone(),
            resolver.clone(),
            connector.clone(),
            config.link.clone(),
            config.query.clone(),
        );
        let sessions = SessionManager::new(
            config.session.clone(),
            config.link.clone(),
            connector,
            resolver.clone(),
            inventory,
        );
        Self {
            config,
            resolver,
            pool,
            parser,
            orchestrator,
            prober,
            sessions,
        }
    }

    /// Service backed by real SSH connections.
    pub fn with_ssh(
        config: NetOpsConfig,
        inventory: Arc<dyn Inventory>,
        codec: Arc<dyn SecretCodec>,
    ) -> Self {
        let connector = Arc::new(SshConnector::new(&config.link));
        Self::new(config, inventory, codec, connector)
    }

    pub fn config(&self) -> &NetOpsConfig {
        &self.config
    }

    pub fn pool(&self) -> &LinkPool {
        &self.pool
    }

    pub fn parser(&self) -> &ParserEngine {
        &self.parser
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Starts the pool sweeps and the session reaper.
    pub async fn start(&self) {
        self.pool.start().await;
        self.sessions.start().await;
        info!("Network operations service started");
    }

    /// Stops every background loop and closes all links and sessions.
    pub async fn stop(&self) {
        self.sessions.stop().await;
        self.pool.stop().await;
        info!("Network operations service stopped");
    }

    // Credentials

    pub async fn fetch_credentials(
        &self,
        device_id: &str,
        user_secret: Option<&str>,
    ) -> Result<Resolution, NetError> {
        self.resolver.try_resolve(device_id, user_secret).await
    }

    pub fn validate_credentials(&self, credentials: &Credentials) -> bool {
        self.resolver.validate(credentials)
    }

    pub async fn prime_device_secrets(&self, secrets: &HashMap<String, String>) {
        self.resolver.prime_device_secrets(secrets).await;
    }

    pub async fn prime_region_secrets(&self, secrets: &HashMap<String, String>) {
        self.resolver.prime_region_secrets(secrets).await;
    }

    pub async fn invalidate_credentials(&self, device_id: Option<&str>) {
        self.resolver.invalidate(device_id).await;
    }

    // Pool

    pub async fn pool_stats(&self) -> PoolStats {
        self.pool.stats().await
    }

    pub async fn links(&self) -> Vec<LinkInfo> {
        self.pool.links().await
    }

    pub async fn cleanup_idle_links(&self) -> usize {
        self.pool.cleanup_idle().await
    }

    pub async fn check_link_health(&self) -> usize {
        self.pool.check_health().await
    }

    // Parsing

    pub fn parse_output(
        &self,
        raw: &str,
        platform: &str,
        command: &str,
        custom_template: Option<&str>,
    ) -> ParseOutcome {
        self.parser.parse(raw, platform, command, custom_template)
    }

    pub fn add_parse_template(
        &self,
        name: &str,
        content: &str,
        description: Option<&str>,
    ) -> Result<(), NetError> {
        self.parser.add_custom_template(name, content, description)
    }

    pub fn list_parse_templates(&self) -> Result<Vec<CustomTemplateInfo>, NetError> {
        self.parser.list_custom_templates()
    }

    pub fn delete_parse_template(&self, name: &str) -> Result<(), NetError> {
        self.parser.delete_custom_template(name)
    }

    pub fn parser_stats(&self) -> ParserStats {
        self.parser.stats()
    }

    // Queries

    pub async fn run_template_query(
        &self,
        request: &QueryRequest,
    ) -> Result<TemplateQueryResult, NetError> {
        self.orchestrator.run_template_query(request).await
    }

    pub async fn run_template_type_query(
        &self,
        template_type: &str,
        request: &QueryRequest,
    ) -> Result<Vec<TemplateQueryResult>, NetError> {
        self.orchestrator
            .run_template_type_query(template_type, request)
            .await
    }

    pub async fn preview_commands(
        &self,
        template_id: &str,
        params: &QueryParams,
    ) -> Result<CommandsPreview, NetError> {
        self.orchestrator.preview_commands(template_id, params).await
    }

    pub async fn validate_parameters(
        &self,
        template_id: &str,
        params: &QueryParams,
    ) -> Result<ParameterValidation, NetError> {
        self.orchestrator
            .validate_parameters(template_id, params)
            .await
    }

    // Connection tests

    pub async fn test_connection(
        &self,
        device_id: &str,
        user_secret: Option<&str>,
    ) -> ConnectionTestResult {
        self.prober.test_connection(device_id, user_secret).await
    }

    pub async fn test_batch(
        &self,
        device_ids: &[String],
        secrets: &HashMap<String, String>,
        max_concurrent: Option<usize>,
    ) -> BatchTestResult {
        self.prober
            .test_batch(device_ids, secrets, max_concurrent)
            .await
    }

    pub async fn test_stability(
        &self,
        device_id: &str,
        user_secret: Option<&str>,
        duration: Option<Duration>,
        interval: Option<Duration>,
    ) -> Result<StabilityReport, NetError> {
        self.prober
            .test_stability(device_id, user_secret, duration, interval)
            .await
    }

    // Interactive sessions

    pub async fn create_session(
        &self,
        user_id: &str,
        target: SessionTarget,
    ) -> Result<Arc<CliSession>, NetError> {
        self.sessions.create_session(user_id, target).await
    }

    pub async fn send_input(&self, session_id: &str, chunk: &str) -> Result<String, NetError> {
        self.sessions.send_input(session_id, chunk).await
    }

    pub async fn close_session(&self, session_id: &str) -> bool {
        self.sessions.close_session(session_id).await
    }

    pub async fn open_stream(&self, session_id: &str) -> Result<SessionStream, NetError> {
        self.sessions.open_stream(session_id).await
    }

    pub async fn user_sessions(&self, user_id: &str) -> Vec<SessionInfo> {
        self.sessions.user_sessions(user_id).await
    }

    pub async fn all_sessions(&self) -> Vec<SessionInfo> {
        self.sessions.all_sessions().await
    }

    pub async fn stats(&self) -> ServiceStats {
        ServiceStats {
            pool: self.pool.stats().await,
            parser: self.parser.stats(),
            queries: self.orchestrator.stats(),
            sessions: self.sessions.stats().await,
            cached_secrets: self.resolver.cached_count().await,
        }
    }
}
