//! Handler-side types for processing delivered messages.
//!
//! - [`MessageHandler`]: Trait for looking up and invoking one data type
//! - [`DispatchContext`]: Delivery metadata passed to each invocation

mod context;
mod handler;

pub use context::DispatchContext;
pub use handler::MessageHandler;
