//! NATS messaging layer
//!
//! Shared backend for both the key-value store and cross-process events.

pub mod client;

pub use client::NatsClient;
