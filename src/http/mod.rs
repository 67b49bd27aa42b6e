//! HTTP surface
//!
//! Playback endpoints (playlist, init, media segments) plus the publish
//! control endpoint and a couple of operational routes. Handlers never hold
//! locks across storage I/O; segment reads go through the blocking pool.

pub mod handlers;
pub mod routes;

pub use routes::create_router;
