//! HTTP API Module
//!
//! Small administrative REST surface over the coordination layer.

mod http;

pub use http::{router, HttpServer};
