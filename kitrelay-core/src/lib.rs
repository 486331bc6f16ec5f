//! # kitrelay-core
//!
//! Core library for kitrelay - a kit fan-out and event projection engine.
//!
//! This library provides:
//! - Domain types for events, screen views, commerce events and identities
//! - Per-kit configuration parsing and the filter store
//! - The projection engine that derives kit-specific events from rules
//! - The kit manager: registry lifecycle and capability-based dispatch
//! - A reporting aggregator recording what each kit received
//! - Configuration management and logging infrastructure
//!
//! ## Architecture
//!
//! Data flows in two directions:
//! - **Configuration:** remote kit configuration → [`KitManager::reconcile`]
//!   (usually via the [`coordinator`]) → live kit registry
//! - **Events:** domain event → [`KitManager`] → filters → projection →
//!   per-kit handler → [`reporting`]
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use kitrelay_core::{Config, Event, EventType, KitFactory, KitManager};
//! use kitrelay_core::host::StaticHost;
//! use kitrelay_core::reporting::MemorySink;
//!
//! let config = Config::load().expect("failed to load config");
//! let manager = KitManager::new(
//!     KitFactory::new(),
//!     Arc::new(StaticHost::from_config(&config.host)),
//!     Arc::new(MemorySink::new()),
//!     &config.engine,
//! );
//!
//! manager.reconcile(&[serde_json::json!({"id": 1})]);
//! manager.log_event(&Event::new("Play", EventType::Media));
//! ```

// Re-export commonly used items at the crate root
pub use config::{Config, KitConfiguration};
pub use error::{Error, KitError, KitResult, Result};
pub use kit::{Delivery, Kit, KitFactory};
pub use manager::{DispatchSummary, KitManager, KitSignal, LifecycleNotice, ReconcileReport};
pub use types::*;

// Public modules
pub mod commerce;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod filter;
pub mod host;
pub mod kit;
pub mod kits;
pub mod logging;
pub mod manager;
pub mod projection;
pub mod registry;
pub mod reporting;
pub mod types;
