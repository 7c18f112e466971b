//! Filesystem-backed full-page HTTP response cache with per-client access tracking.

pub mod cache;
pub mod config;
pub mod infra;
