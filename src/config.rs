use anyhow::Result;
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const CONFIG_NAMESPACE: &str = "wallpanel";
const CONFIG_KEY: &str = "config";

// Operational constants. These are fixed at build time; there is no runtime
// configuration channel.

/// Periodic smart-home reconciliation interval.
pub const SYNC_INTERVAL: Duration = Duration::from_secs(30);
/// Watchdog feed cadence during the inter-poll sleep.
pub const SYNC_SLEEP_FEED_INTERVAL: Duration = Duration::from_secs(10);
/// Response bodies larger than this are parsed on the background worker.
pub const ASYNC_PARSE_THRESHOLD: usize = 16 * 1024;
/// Hard cap on a captured HTTP response body.
pub const MAX_RESPONSE_SIZE: usize = 128 * 1024;
/// Serial link is considered dead after this long without a frame.
pub const SERIAL_GRACE: Duration = Duration::from_secs(5);
/// Serial frame accumulator capacity, bytes.
pub const SERIAL_FRAME_CAPACITY: usize = wallpanel_core::telemetry::FRAME_BUF_CAPACITY;
/// Telemetry UART baud rate.
pub const SERIAL_BAUD: u32 = 115_200;
/// Crash ring capacity in NVS.
pub const CRASH_LOG_MAX_ENTRIES: u8 = 5;
/// Task watchdog timeout.
pub const WATCHDOG_TIMEOUT_MS: u32 = 5_000;

/// Number of switch slots bound to UI widgets.
pub const SWITCH_SLOT_COUNT: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // WiFi settings
    pub wifi_ssid: String,
    pub wifi_password: String,

    // Smart-home server
    pub server_host: String,
    pub server_port: u16,
    pub api_token: String,

    // Entity bindings: slots 0..2 are switches, slot 3 is the scene trigger
    pub switch_entities: [String; SWITCH_SLOT_COUNT],
    pub scene_entity: String,
}

impl Default for Config {
    fn default() -> Self {
        // Compiled-in values come from wifi_config.h / smart_config.h via
        // build.rs; see the .example headers.
        Self {
            wifi_ssid: env!("WIFI_SSID").to_string(),
            wifi_password: env!("WIFI_PASSWORD").to_string(),
            server_host: env!("HA_SERVER_HOST").to_string(),
            server_port: env!("HA_SERVER_PORT").parse().unwrap_or(8123),
            api_token: env!("HA_API_TOKEN").to_string(),
            switch_entities: [
                env!("HA_ENTITY_A").to_string(),
                env!("HA_ENTITY_B").to_string(),
                env!("HA_ENTITY_C").to_string(),
            ],
            scene_entity: env!("HA_ENTITY_D").to_string(),
        }
    }
}

impl Config {
    pub fn base_url(&self) -> String {
        wallpanel_core::http::base_url(&self.server_host, self.server_port)
    }

    pub fn save(&self, nvs_partition: EspDefaultNvsPartition) -> Result<()> {
        let mut nvs = EspNvs::new(nvs_partition, CONFIG_NAMESPACE, true)?;
        let json = serde_json::to_vec(self)?;
        nvs.set_blob(CONFIG_KEY, &json)?;
        log::info!("Configuration saved to NVS");
        Ok(())
    }
}

/// Load the stored configuration, falling back to the compiled defaults.
/// Stored-but-empty WiFi credentials also fall back to the compiled defaults
/// so a blank NVS never strands the panel offline.
pub fn load_or_default(nvs_partition: EspDefaultNvsPartition) -> Result<Config> {
    match load_from_nvs(nvs_partition.clone()) {
        Ok(mut config) => {
            log::info!("Loaded configuration from NVS");
            if config.wifi_ssid.is_empty() {
                let defaults = Config::default();
                log::warn!(
                    "NVS WiFi credentials empty, using compiled defaults: SSID='{}'",
                    defaults.wifi_ssid
                );
                config.wifi_ssid = defaults.wifi_ssid;
                config.wifi_password = defaults.wifi_password;
                if let Err(e) = config.save(nvs_partition) {
                    log::warn!("Failed to save updated config: {:?}", e);
                }
            }
            Ok(config)
        }
        Err(e) => {
            log::warn!("Failed to load config from NVS: {:?}, using defaults", e);
            let config = Config::default();
            if let Err(save_err) = config.save(nvs_partition) {
                log::warn!("Failed to save default config to NVS: {:?}", save_err);
            }
            Ok(config)
        }
    }
}

fn load_from_nvs(nvs_partition: EspDefaultNvsPartition) -> Result<Config> {
    let nvs = EspNvs::new(nvs_partition, CONFIG_NAMESPACE, true)?;

    let mut buf = vec![0u8; 2048]; // Max config size
    let data = nvs
        .get_blob(CONFIG_KEY, &mut buf)?
        .ok_or_else(|| anyhow::anyhow!("Config not found in NVS"))?;

    let config: Config = serde_json::from_slice(data)?;
    Ok(config)
}
