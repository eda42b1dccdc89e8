//! Toolgate - launches local tools on demand and serves them under one origin
//!
//! This library provides a supervisor and reverse proxy that:
//! - Starts tool processes ("server proxy kinds") on free local ports
//! - Deduplicates concurrent start requests for the same launch context
//! - Polls each new process until it answers, then routes traffic to it
//! - Serves every instance under `<home>/server-proxy/<kind>/<instance>/`
//! - Forwards WebSocket upgrades and rewrites redirects to the public path
//! - Pushes status transitions to any number of connected frontends

pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod health;
pub mod instance;
pub mod manager;
pub mod paths;
pub mod pool;
pub mod port;
pub mod proxy;
pub mod registry;
pub mod runner;
pub mod status;
pub mod sync;
