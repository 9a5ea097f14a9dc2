//! Wallpanel Core - Hardware-independent logic for the ESP32-S3 wall panel
//!
//! This crate contains the parsing, formatting and state-machine logic that
//! can be tested on the host platform without ESP32 hardware: telemetry frame
//! decoding, entity-state extraction, the smart-home status machine and HTTP
//! outcome classification.

pub mod entities;
pub mod http;
pub mod status;
pub mod telemetry;

/// Cooperative keepalive capability held by long-running tasks.
///
/// Loops that can run for seconds (bulk extraction over large documents)
/// accept one of these and feed it periodically so the platform's task
/// watchdog sees progress. The firmware injects its watchdog here; tests and
/// short paths use [`NoopKeepalive`].
pub trait Keepalive {
    fn feed(&self);
}

/// Keepalive that does nothing. Used on the host and for small payloads.
pub struct NoopKeepalive;

impl Keepalive for NoopKeepalive {
    fn feed(&self) {}
}
