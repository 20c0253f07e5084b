//! Multisite - one host process serving many tenant sites
//!
//! This library provides a multi-tenant site host that:
//! - Routes HTTP traffic by Host header to the tenant that owns the hostname
//! - Builds a tenant's application instance lazily on its first request
//! - Rebuilds instances whose site configuration changed since they were built
//! - Tears down instances of sites that were unpublished or trashed
//! - Runs maintenance tasks across sites, guarded by locks shared between hosts
//! - Rotates the host process after a randomized number of requests

pub mod admin;
pub mod cache;
pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod factory;
pub mod instance;
pub mod janitor;
pub mod pool;
pub mod rotation;
pub mod server;
pub mod tasks;
pub mod tenant;
