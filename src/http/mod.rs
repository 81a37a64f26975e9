//! # Admin HTTP API
//!
//! Thin axum layer over the [`Coordinator`](crate::coordinator::Coordinator).
//!
//! # Endpoints
//!
//! - `GET  /health`
//! - `GET  /masters`, `POST /masters`
//! - `GET  /masters/:organization`
//! - `POST /masters/:organization/provision`
//! - `POST /masters/:organization/terminate?forced=true`
//! - `GET  /backends`
//! - `GET  /metrics`
//! - `GET  /events?limit=N`

mod routes;
mod server;

pub use routes::{admin_routes, AdminState, ErrorResponse};
pub use server::AdminServer;
