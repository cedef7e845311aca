//! Task Graph Live Library
//!
//! Multi-user task graph with bearer-token auth and live change events.
//! This module exports the core components for testing and integration.

pub mod auth;
pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod realtime;
pub mod server;
pub mod service;
pub mod store;
pub mod types;
