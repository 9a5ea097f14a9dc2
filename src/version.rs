/// Firmware version, sourced from Cargo metadata.
pub const DISPLAY_VERSION: &str = concat!("v", env!("CARGO_PKG_VERSION"));

/// HTTP User-Agent sent on every REST request.
pub const USER_AGENT: &str = concat!("ESP32-WallPanel/", env!("CARGO_PKG_VERSION"));

pub fn full_version() -> String {
    format!("{} ({})", DISPLAY_VERSION, env!("CARGO_PKG_NAME"))
}
