// ABOUTME: Library root for drips-index-sync
// ABOUTME: Exposes the sync pipeline, backend clients, config and health endpoint

pub mod config;
pub mod health;
pub mod meili;
pub mod postgres;
pub mod sync;
pub mod utils;
