//! HTTP API: submission endpoint, attachment storage, and request auth.

pub mod app;
pub mod auth;
pub mod config;
pub mod context;
pub mod middleware;
