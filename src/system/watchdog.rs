//! Task watchdog plumbing. Each long-lived task subscribes itself once and
//! feeds its own subscription; code that can run for seconds (HTTP, bulk
//! parsing) feeds whichever task is running it.

use wallpanel_core::Keepalive;

/// Reconfigure the task watchdog timeout. Called once by the supervisor
/// before tasks start.
pub fn configure(timeout_ms: u32) {
    unsafe {
        // Deinit first in case the bootloader already started it
        let _ = esp_idf_sys::esp_task_wdt_deinit();

        let wdt_config = esp_idf_sys::esp_task_wdt_config_t {
            timeout_ms,
            idle_core_mask: 0,
            trigger_panic: true,
        };
        let result = esp_idf_sys::esp_task_wdt_init(&wdt_config as *const _);
        if result == esp_idf_sys::ESP_OK {
            log::info!("Watchdog timeout set to {} ms", timeout_ms);
        } else {
            log::warn!("Watchdog reconfiguration failed: {:?}", result);
        }
    }
}

/// Subscribe the calling task to watchdog supervision. Safe to call if the
/// task is already subscribed.
pub fn subscribe_current() {
    let result = unsafe { esp_idf_sys::esp_task_wdt_add(std::ptr::null_mut()) };
    match result {
        esp_idf_sys::ESP_OK => log::debug!("task subscribed to watchdog"),
        esp_idf_sys::ESP_ERR_INVALID_ARG => {
            // Already subscribed by the caller, start fresh.
            unsafe { esp_idf_sys::esp_task_wdt_reset() };
        }
        other => log::warn!("failed to subscribe task to watchdog: {:?}", other),
    }
}

#[allow(dead_code)]
pub fn unsubscribe_current() {
    unsafe {
        let _ = esp_idf_sys::esp_task_wdt_delete(std::ptr::null_mut());
    }
}

/// Feed the calling task's subscription. No-op for unsubscribed tasks.
pub fn feed() {
    unsafe {
        esp_idf_sys::esp_task_wdt_reset();
    }
}

/// [`Keepalive`] capability handed to long-running loops in
/// `wallpanel-core`.
pub struct WatchdogKeepalive;

impl Keepalive for WatchdogKeepalive {
    fn feed(&self) {
        feed();
    }
}
