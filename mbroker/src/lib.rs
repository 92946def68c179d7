#![deny(unsafe_code)]

//! # Overall Example
//! ```rust,no_run
//!
//! use mbroker::consumer::{ChannelSink, Consumer};
//! use mbroker::engine::RoutingEngine;
//! use mbroker::exchange::ExchangeKind;
//! use mbroker::message::{Message, Metadata};
//! use mbroker::settings::{Options, Settings};
//! use mbroker::types::{Arguments, Principal};
//! use mbroker::Result;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let settings = Settings::new(Options::default())?;
//!     let _log = mbroker::logger::logger_init(&settings.log)?;
//!
//!     let engine = RoutingEngine::builder(settings).build();
//!     engine.start().await?;
//!
//!     let p = Principal::new("guest");
//!     engine.create_exchange(&p, "amq.topic", ExchangeKind::Topic, false, true).await?;
//!     engine.create_queue(&p, "cricket", false, true, false).await?;
//!     engine.bind(&p, "cricket", "amq.topic", "sports.cricket.#", Arguments::new()).await?;
//!
//!     let (sink, mut rx) = ChannelSink::channel();
//!     engine.add_consumer(&p, Consumer::new("cricket", "c1", false, sink)).await?;
//!     engine.publish(&p, Message::with_body(Metadata::new(0, "amq.topic", "sports.cricket.score"), "4/120")).await?;
//!
//!     if let Some(d) = rx.recv().await {
//!         engine.acknowledge(&p, &d.queue, d.tag).await?;
//!     }
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod acl; // Authorization boundary and rule based authorizer
pub mod consumer; // Consumers, delivery sinks, flow notifications
pub mod delivery; // Delivery task scheduling on the worker pool
pub mod engine; // Routing engine
pub mod error;
pub mod exchange; // Exchanges, bindings and routing tables
pub mod logger;
pub mod message; // Messages, metadata and shared content chunks
pub mod queue; // Queue handlers
pub mod selector; // Binding filter expressions
pub mod stats;
pub mod store; // Persistence boundary
pub mod topic; // Topic pattern matcher
pub mod types;
pub mod unacked; // Unacknowledged delivery tracking

pub use error::{BrokerError, Result};
pub use mbroker_conf as settings;
pub use mbroker_utils as utils;
