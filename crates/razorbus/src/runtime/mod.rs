//! Runtime for dispatching published messages.
//!
//! This module provides the infrastructure for delivering messages from the
//! queue to their handlers:
//!
//! - [`Bus`]: publishes messages, runs dispatch workers, and processes bodies
//! - [`BusBuilder`]: registers one handler per data type and configures the bus
//! - [`RuntimeConfig`]: polling interval, lease length, retry policy, workers
//! - [`Outcome`] and [`Violation`]: what processing a delivery did
//!
//! # Example
//!
//! ```ignore
//! use razorbus::runtime::{Bus, RuntimeConfig};
//!
//! let bus = Bus::builder(store)
//!     .register(RepoHandler::new(repos))
//!     .register(NodeHandler::new(nodes))
//!     .config(RuntimeConfig::default())
//!     .build()?;
//!
//! bus.run(shutdown_signal).await?;
//! ```

mod bus;
mod config;
mod dispatcher;
mod registry;
mod worker;

pub use bus::Bus;
pub use config::RuntimeConfig;
pub use dispatcher::{Outcome, Violation};
pub use registry::BusBuilder;
