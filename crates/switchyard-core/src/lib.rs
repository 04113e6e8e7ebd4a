//! # Switchyard Core
//!
//! Client-side call dispatch for RPC consumers.
//!
//! This crate provides the components that sit between an application calling a remote service
//! and the transport that carries the bytes:
//!
//! - **[`extension`]**: Alias-keyed registry of pluggable routers, filters, load balancers and
//!   regulators.
//!
//! - **[`address`]**: Copy-on-write address groups per consumer with change notification.
//!
//! - **[`connection`]**: Idempotent connection ownership, with an elastic variant that keeps
//!   only a bounded subset of endpoints connected, plus periodic liveness checks.
//!
//! - **[`router`]** and **[`balancer`]**: Candidate selection and weighted choice.
//!
//! - **[`filter`]**: Ordered interceptor chain around every call.
//!
//! - **[`stat`]**: Per-endpoint invocation and exception counters with window rotation.
//!
//! - **[`regulation`]**: Background loop that takes misbehaving endpoints out of rotation and
//!   probes them back in.
//!
//! - **[`invoker`]**: The call pipeline with sync, future, callback and oneway modes.
//!
//! - **[`runtime`]**: Builder and lifecycle that wire everything together per consumer.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                        DispatchRuntime                        │
//! │  ┌──────────────────┐  ┌──────────────┐  ┌─────────────────┐  │
//! │  │ ExtensionRegistry│  │ StatRegistry │  │ RegulationLoop  │  │
//! │  └──────────────────┘  └──────┬───────┘  └────────┬────────┘  │
//! │                               │                   │           │
//! │  ┌────────────────────────────▼───────────────────▼────────┐  │
//! │  │ ConsumerClient (one per referenced service)             │  │
//! │  │   AddressHolder · ConnectionHolder · ClientProxyInvoker │  │
//! │  └─────────────────────────────────────────────────────────┘  │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Call Flow
//!
//! ```text
//! ClientProxyInvoker ──► FilterChain ──► ClusterInvoker
//!                                          │
//!                     RouterChain ◄────────┤ route
//!                     LoadBalancer ◄───────┤ select (regulated endpoints skipped)
//!                     ConnectionHolder ◄───┤ connect
//!                     Connection::send ◄───┘ spawned send
//!                                          │
//!                     InvocationStat ◄─────── outcome recorded once per send
//! ```

pub mod address;
pub mod balancer;
pub mod config;
pub mod connection;
pub mod errors;
pub mod extension;
pub mod filter;
pub mod invoker;
pub mod metrics;
pub mod regulation;
pub mod router;
pub mod runtime;
pub mod stat;
pub mod transport;
pub mod types;
