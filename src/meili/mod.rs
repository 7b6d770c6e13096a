// ABOUTME: Meilisearch backend for the SearchIndex contract
// ABOUTME: REST client, request/response models and task polling

pub mod client;
pub mod models;

pub use client::MeiliClient;
