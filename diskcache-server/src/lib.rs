//! The HTTP facade: axum routes and handlers driving a
//! [`diskcache_core::Cache`]. Split out as a library so handler tests can
//! exercise the router directly with `tower::ServiceExt::oneshot`.

pub mod handlers;
pub mod respond;
pub mod routes;
pub mod state;
