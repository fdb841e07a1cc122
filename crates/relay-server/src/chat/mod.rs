//! Chat Service Layer
//!
//! The only writer of the store. Turns requests into store mutations and
//! routes resulting deliveries through the connection registry.

pub mod service;

pub use service::{ChatService, ServiceError};
