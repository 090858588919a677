//! SMS Forwarder — watches an SMS inbox and forwards each new message to a
//! configured email address, exactly once in the common case, surviving
//! restarts and racing triggers.

pub mod config;
pub mod control;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod inbox;
pub mod pipeline;
pub mod queue;
pub mod scanner;
pub mod store;
pub mod triggers;
