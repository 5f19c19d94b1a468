//! HTTP server exposing the block cache for inspection and maintenance.
//!
//! - [`admin_api`]: request/response types and route handlers

pub mod admin_api;
