//! # TabReport Gateway
//!
//! HTTP API for creating, inspecting and removing report schedules,
//! plus the static `/reports` directory used for link delivery.

pub mod routes;
pub mod server;

pub use server::{AppState, build_router, start};
