//! # API Handlers
//!
//! HTTP endpoint handlers: webhook deliveries on `/` and registration tokens
//! on `/token`.

pub mod token;
pub mod webhooks;
