//! # rnetops - SSH Session Orchestration for Network Devices
//!
//! `rnetops` runs read-only and interactive work against fleets of routers,
//! switches and firewalls from many vendors. It resolves per-device
//! credentials, keeps a bounded pool of authenticated SSH links, fans
//! templated queries out over device sets, parses CLI output into rows, and
//! serves keystroke-level interactive terminals.
//!
//! ## Features
//!
//! - **Credential Resolution**: static (encrypted at rest) and dynamic (operator supplied, cached with a TTL) secrets
//! - **Link Pooling**: one reusable link per device, idle and health sweeps, global connection gate
//! - **Templated Queries**: per-vendor command sets with `{param}` rendering, isolated per-device failures
//! - **Output Parsing**: TextFSM-style templates, built-in and custom, with line fallback
//! - **Interactive Terminals**: keystroke decoding, config-mode tracking, idle reaping
//! - **Maximum Compatibility**: secure, balanced and legacy SSH algorithm sets
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use rnetops::config::NetOpsConfig;
//! use rnetops::inventory::{HexCodec, MemoryInventory};
//! use rnetops::query::QueryRequest;
//! use rnetops::service::NetOps;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let inventory = Arc::new(MemoryInventory::new());
//!     // ... load devices, vendors, regions and templates into the inventory
//!
//!     let ops = NetOps::with_ssh(NetOpsConfig::from_env(), inventory, Arc::new(HexCodec));
//!     ops.start().await;
//!
//!     let request = QueryRequest::new("interfaces", vec!["core-1".to_string()])
//!         .secret("operator-password");
//!     let result = ops.run_template_query(&request).await?;
//!     println!(
//!         "{}/{} devices answered",
//!         result.successful_devices, result.total_devices
//!     );
//!
//!     ops.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Main Components
//!
//! - [`service::NetOps`] - Call surface and lifecycle of background loops
//! - [`credentials::CredentialResolver`] - Per-device login material
//! - [`link::DeviceLink`] - One serialized SSH shell to one device
//! - [`pool::LinkPool`] - Bounded, reusable link collection
//! - [`query::QueryOrchestrator`] - Template fan-out and aggregation
//! - [`parser::ParserEngine`] - Structured output from raw CLI text
//! - [`terminal::SessionManager`] - Interactive operator sessions
//! - [`error::NetError`] - Error taxonomy with structured reports

pub mod config;
pub mod credentials;
pub mod error;
pub mod inventory;
pub mod link;
pub mod parser;
pub mod platform;
pub mod pool;
pub mod probe;
pub mod prompt;
pub mod query;
pub mod service;
pub mod terminal;

pub use error::{ErrorCategory, ErrorReport, NetError};
pub use service::NetOps;
