use anyhow::Result;
use esp_idf_hal::prelude::*;
use esp_idf_svc::{
    eventloop::EspSystemEventLoop, nvs::EspDefaultNvsPartition, timer::EspTaskTimerService,
};
use esp_idf_sys as _; // Binstart
use std::sync::Arc;

use log::info;

// Generate ESP-IDF app descriptor
#[allow(unexpected_cfgs)]
mod app_desc {
    esp_idf_sys::esp_app_desc!();
}

mod config;
mod logging;
mod network;
mod psram;
mod serial;
mod smart;
mod system;
mod ui;
mod version;

use crate::network::wifi::WifiManager;
use crate::serial::SerialTelemetry;
use crate::smart::status::HaStatusOwner;
use crate::smart::SmartHome;
use crate::system::crash_log::CrashLogManager;
use crate::system::uptime::RuntimeTimer;
use crate::system::watchdog;
use crate::ui::UiManager;

fn main() -> Result<()> {
    // Initialize ESP-IDF
    esp_idf_svc::sys::link_patches();

    logging::init_logger().expect("Failed to initialize logger");

    info!("ESP32-S3 Wall Panel {}", version::full_version());
    info!("Free heap: {} bytes", unsafe {
        esp_idf_sys::esp_get_free_heap_size()
    });

    // Log PSRAM layout; response and parse-job buffers depend on it
    let psram_info = psram::PsramAllocator::get_info();
    psram_info.log_info();

    // Take peripherals, event loop, timer service and the NVS partition once;
    // clones of the partition handle go to WiFi, config and the crash ring.
    let peripherals = Peripherals::take()?;
    let sys_loop = EspSystemEventLoop::take()?;
    let timer_service = EspTaskTimerService::new()?;
    let nvs = EspDefaultNvsPartition::take()?;

    // Reset-reason inspection: crash-like resets get a ring entry, then the
    // stored ring is replayed into the log.
    let reset_reason = system::reset::get_reset_reason();
    info!("Boot reason: {}", reset_reason);
    match CrashLogManager::new(nvs.clone()) {
        Ok(mut crash_log) => {
            if system::reset::is_crash_reset() {
                log::warn!("Crash-like reset detected: {}", reset_reason);
                if let Err(e) = crash_log.store(reset_reason) {
                    log::warn!("Failed to store crash log entry: {:?}", e);
                }
            }
            crash_log.print_all();
        }
        Err(e) => log::warn!("Crash log manager unavailable: {:?}", e),
    }

    // Watchdog: reconfigure, then subscribe the main task
    watchdog::configure(config::WATCHDOG_TIMEOUT_MS);
    watchdog::subscribe_current();

    let app_config = config::load_or_default(nvs.clone())?;
    info!("Configuration loaded");
    info!(
        "WiFi credentials: SSID='{}', Password={}",
        app_config.wifi_ssid,
        if app_config.wifi_password.is_empty() {
            "<empty>"
        } else {
            "<set>"
        }
    );

    // UI gate + widget tree first; every later subsystem publishes into it
    let ui = UiManager::new(app_config.switch_entities.clone());
    ui.start_ui_task()?;

    // Coordinator status -> UI status label
    let status_owner = HaStatusOwner::new();
    {
        let ui = Arc::clone(&ui);
        status_owner.register_callback(Arc::new(move |is_ready, is_syncing, text| {
            ui.set_ha_status(is_ready, is_syncing, text);
        }));
    }

    let smart = SmartHome::new(app_config.clone(), Arc::clone(&ui), Arc::clone(&status_owner));
    smart.register_states_sync(Arc::new(|states, count| {
        log::info!("States sync delivered: {:?} ({} found)", states, count);
    }));

    // Touch intents -> coordinator
    {
        let switch_target = Arc::clone(&smart);
        let scene_target = Arc::clone(&smart);
        ui.register_smart_home_callbacks(
            Arc::new(move |entity_id, on| switch_target.control_switch(entity_id, on)),
            Arc::new(move || scene_target.trigger_scene()),
        );
    }

    // WiFi lifecycle; the smart-home subsystem is gated on it
    let mut wifi = WifiManager::new(
        peripherals.modem,
        sys_loop,
        nvs.clone(),
        app_config.wifi_ssid.clone(),
        app_config.wifi_password.clone(),
    )?;
    {
        let ui = Arc::clone(&ui);
        wifi.register_status_callback(Arc::new(move |connected, text| {
            ui.set_wifi_status(connected, text);
        }));
    }
    {
        let smart = Arc::clone(&smart);
        wifi.register_ha_gate(Arc::new(move |connected| smart.wifi_gate(connected)));
    }
    {
        let smart = Arc::clone(&smart);
        wifi.register_first_connected(move || smart.request_init());
    }
    match wifi.connect() {
        Ok(()) => {
            // Give DHCP a moment; the event handlers drive the real state
            // machine either way.
            let mut ip_wait = 0;
            while !wifi.is_connected() && ip_wait < 100 {
                esp_idf_hal::delay::FreeRtos::delay_ms(100);
                watchdog::feed();
                ip_wait += 1;
            }
            if wifi.is_connected() {
                let info = wifi.info();
                log::info!("WiFi up: {} ({})", info.ssid, info.ip);
            } else {
                log::warn!("No IP address yet, connection continues in background");
            }
        }
        Err(e) => {
            log::warn!("WiFi connection failed: {:?}", e);
            log::info!("Continuing without WiFi - auto-reconnect will retry");
        }
    }

    // Serial telemetry ingestor on the host-PC UART link
    let uart_config = esp_idf_hal::uart::config::Config::new().baudrate(Hertz(config::SERIAL_BAUD));
    let uart = esp_idf_hal::uart::UartDriver::new(
        peripherals.uart1,
        peripherals.pins.gpio17, // TX
        peripherals.pins.gpio18, // RX
        Option::<esp_idf_hal::gpio::AnyIOPin>::None,
        Option::<esp_idf_hal::gpio::AnyIOPin>::None,
        &uart_config,
    )?;

    let telemetry = SerialTelemetry::new();
    {
        let ui = Arc::clone(&ui);
        telemetry.register_connection_callback(Arc::new(move |connected| {
            ui.set_serial_status(connected);
        }));
    }
    {
        let ui = Arc::clone(&ui);
        telemetry.register_data_callback(Arc::new(move |record| {
            ui.update_telemetry(record);
        }));
    }
    {
        let ui = Arc::clone(&ui);
        telemetry.register_reset_callback(Arc::new(move || ui.reset_to_defaults()));
    }
    telemetry.start(uart)?;

    // 1 Hz uptime display
    let _runtime_timer = RuntimeTimer::start(&timer_service, Arc::clone(&ui))?;

    info!("Wall panel fully initialized");

    loop {
        esp_idf_hal::delay::FreeRtos::delay_ms(2000);
        watchdog::feed();
    }
}
