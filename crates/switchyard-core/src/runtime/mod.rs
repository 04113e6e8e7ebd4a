//! Runtime initialization and lifecycle management.
//!
//! The runtime owns everything shared between consumers: the extension registry, the
//! transport, invocation statistics and the regulation loop. Each referenced service gets its
//! own [`ConsumerClient`] with a private address holder, connection holder and call pipeline.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use switchyard_core::{
//!     config::{AppConfig, ConsumerConfig},
//!     runtime::DispatchRuntime,
//!     transport::LoopbackTransport,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AppConfig::load()?;
//!
//!     let runtime = DispatchRuntime::builder()
//!         .with_config(config)
//!         .with_transport(Arc::new(LoopbackTransport::new()))
//!         .build()?;
//!
//!     let mut orders = ConsumerConfig::new("com.example.OrderService");
//!     orders.direct_url = Some("tcp://10.0.0.1:12200,tcp://10.0.0.2:12200".to_string());
//!     let client = runtime.refer(orders).await?;
//!
//!     let request = client.build_request("place", "payload");
//!     let response = client.invoke(request).await?;
//!     println!("{} bytes", response.payload.len());
//!
//!     runtime.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod builder;
pub mod components;
pub mod consumer;
pub mod lifecycle;

pub use builder::{DispatchRuntimeBuilder, RuntimeError};
pub use components::RuntimeComponents;
pub use consumer::ConsumerClient;
pub use lifecycle::DispatchRuntime;
