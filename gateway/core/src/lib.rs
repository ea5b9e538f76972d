//! Gateway Core - Task Scheduling & Execution Engine
//!
//! The core of a text-generation gateway: producers enqueue generation
//! tasks, a single orchestrator drains them in priority order, providers
//! execute them, and terminal states flow back out through status events
//! and webhook deliveries. Completely independent of any HTTP server
//! frontend; it can sit behind a REST API, a message queue consumer, or
//! run headless in tests.
//!
//! # Architecture
//!
//! ```text
//! producers ──create──▶ TaskStore (priority queue + records + idempotency)
//!                          │ claim
//!                          ▼
//!                     Orchestrator ──resolve──▶ ProviderRegistry
//!                          │                        │
//!                          │ lease                  ▼
//!                          ▼                   Provider (local / remote)
//!                     DeviceGuard
//!                          │ terminal write
//!                          ▼
//!                 DeliveryDispatcher ──▶ callback URLs
//! ```
//!
//! # Key Types
//!
//! - [`Gateway`]: facade wiring all of the below together
//! - [`TaskStore`]: durable records, priority dispatch queue, idempotency
//! - [`Orchestrator`]: the single queue consumer
//! - [`DeviceGuard`]: exclusive accelerator access with admission control
//! - [`ProviderRegistry`]: lazy, capability-bearing backend construction
//! - [`DeliveryDispatcher`]: bounded webhook delivery pool
//!
//! # Quick Start
//!
//! ```ignore
//! use gateway_core::{Gateway, GatewayConfig, TaskSpec};
//!
//! #[tokio::main]
//! async fn main() -> gateway_core::Result<()> {
//!     let config = GatewayConfig::load(None)?;
//!     let mut gateway = Gateway::from_config(&config)?;
//!     gateway.start();
//!
//!     let task = gateway.create_task(
//!         TaskSpec::new("llama-7b", "Write a haiku about queues")
//!             .with_priority(5)
//!             .with_callback_url("https://example.com/hook"),
//!     )?;
//!     println!("enqueued {}", task.id);
//!
//!     gateway.shutdown().await;
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]

pub mod config;
pub mod device;
pub mod error;
pub mod gateway;
pub mod orchestrator;
pub mod provider;
pub mod store;
pub mod task;
pub mod webhook;

pub use config::{ConfigError, GatewayConfig};
pub use device::{DeviceConfig, DeviceGuard, DeviceLease, DeviceStats, FixedMonitor, ResourceMonitor};
pub use error::{Error, Result, TaskError};
pub use gateway::{Gateway, GatewayStats};
pub use orchestrator::{Orchestrator, OrchestratorConfig, OrchestratorHandle};
pub use provider::{
    Capabilities, GenerationRequest, Provider, ProviderKind, ProviderPreset, ProviderRegistry,
    StreamChunk,
};
pub use store::{CancelOutcome, StoreConfig, StoreStats, TaskEvent, TaskStore};
pub use task::{GenerationResult, Task, TaskId, TaskSpec, TaskStatus, TokenUsage};
pub use webhook::{DeliveryDispatcher, DeliverySink, HttpSink, WebhookConfig, WebhookPayload};
