//! Retained-mode dashboard UI: widget tree, gate-guarded setters and the UI
//! worker task.
//!
//! The panel/flush driver consumes the widget tree from the display side and
//! is outside this module's scope; everything here is about keeping the tree
//! consistent under concurrent publishers. Producers that cannot afford to
//! stall acquire the gate with a bounded timeout and drop their update on
//! failure; that is the intended back-pressure.

pub mod gate;

use std::ffi::CString;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use wallpanel_core::telemetry::{self, TelemetryRecord, PLACEHOLDER};

use crate::config::SWITCH_SLOT_COUNT;
use gate::UiGate;

pub mod colors {
    pub const GREEN: u32 = 0x00ff88;
    pub const RED: u32 = 0xff4444;
    pub const CYAN: u32 = 0x4fc3f7;
    pub const AMBER: u32 = 0xffaa00;
    pub const GRAY: u32 = 0x888888;
    pub const WHITE: u32 = 0xffffff;
}

/// Minimum UI worker tick, matching the display driver's cadence floor.
const MIN_TICK_MS: u32 = 10;
/// Telemetry publishes at most this often.
const TELEMETRY_MIN_INTERVAL: Duration = Duration::from_millis(100);
/// Status-label publishes at most this often (5 Hz).
const STATUS_MIN_INTERVAL: Duration = Duration::from_millis(200);
/// Gate timeout for drop-on-timeout publishers.
const PUBLISH_LOCK_TIMEOUT_MS: i32 = 300;
/// Gate timeout for the high-rate status label path.
const STATUS_LOCK_TIMEOUT_MS: i32 = 200;

#[derive(Debug, Clone)]
pub struct Label {
    pub text: String,
    pub color: u32,
}

impl Label {
    fn new(text: &str, color: u32) -> Self {
        Self {
            text: text.to_string(),
            color,
        }
    }

    fn set(&mut self, text: &str) {
        if self.text != text {
            self.text.clear();
            self.text.push_str(text);
        }
    }

    fn set_colored(&mut self, text: &str, color: u32) {
        self.set(text);
        self.color = color;
    }
}

#[derive(Debug, Clone, Default)]
pub struct SwitchWidget {
    pub checked: bool,
}

/// The retained widget tree. Mutable only through the gate's guard.
#[derive(Debug)]
pub struct WidgetTree {
    // CPU panel
    pub cpu_name: Label,
    pub cpu_usage: Label,
    pub cpu_temp: Label,
    pub cpu_fan: Label,
    // GPU panel
    pub gpu_name: Label,
    pub gpu_usage: Label,
    pub gpu_temp: Label,
    pub gpu_mem: Label,
    // Memory panel
    pub mem_usage: Label,
    pub mem_bar: u8,
    pub mem_detail: Label,
    // Status strip
    pub serial_status: Label,
    pub wifi_status: Label,
    pub uptime: Label,
    // Controls panel
    pub ha_status: Label,
    pub switches: [SwitchWidget; SWITCH_SLOT_COUNT],

    dirty: bool,
}

impl WidgetTree {
    fn new() -> Self {
        Self {
            cpu_name: Label::new("CPU", colors::WHITE),
            cpu_usage: Label::new(PLACEHOLDER, colors::WHITE),
            cpu_temp: Label::new(PLACEHOLDER, colors::WHITE),
            cpu_fan: Label::new(PLACEHOLDER, colors::WHITE),
            gpu_name: Label::new("GPU", colors::WHITE),
            gpu_usage: Label::new(PLACEHOLDER, colors::WHITE),
            gpu_temp: Label::new(PLACEHOLDER, colors::WHITE),
            gpu_mem: Label::new(PLACEHOLDER, colors::WHITE),
            mem_usage: Label::new(PLACEHOLDER, colors::WHITE),
            mem_bar: 0,
            mem_detail: Label::new("", colors::GRAY),
            serial_status: Label::new("[SERIAL] Connecting...", colors::AMBER),
            wifi_status: Label::new("[WIFI] Connecting...", colors::CYAN),
            uptime: Label::new("00:00:00", colors::GRAY),
            ha_status: Label::new("HA: Connecting...", colors::GRAY),
            switches: Default::default(),
            dirty: true,
        }
    }

    /// Drive the retained library's timers: hand the current snapshot to the
    /// flush side and report the delay until the next tick.
    pub fn process_timers(&mut self) -> u32 {
        self.dirty = false;
        MIN_TICK_MS
    }

    fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    fn apply_telemetry(&mut self, rec: &TelemetryRecord) {
        if !rec.cpu.name.is_empty() {
            self.cpu_name.set(&rec.cpu.name);
        }
        self.cpu_usage.set(&telemetry::format_percent(rec.cpu.usage));
        self.cpu_temp.set(&telemetry::format_temp(rec.cpu.temp));
        self.cpu_fan.set(&telemetry::format_fan(rec.cpu.fan));

        if !rec.gpu.name.is_empty() {
            self.gpu_name.set(&rec.gpu.name);
        }
        self.gpu_usage.set(&telemetry::format_percent(rec.gpu.usage));
        self.gpu_temp.set(&telemetry::format_temp(rec.gpu.temp));
        self.gpu_mem
            .set(&telemetry::format_gpu_mem(rec.gpu.mem_used, rec.gpu.mem_total));

        self.mem_usage.set(&telemetry::format_percent(rec.mem.usage));
        self.mem_bar = rec.mem.usage.min(100);
        self.mem_detail
            .set(&telemetry::format_mem_detail(rec.mem.used, rec.mem.total));

        self.mark_dirty();
    }

    fn reset_panels(&mut self) {
        self.cpu_name.set("CPU");
        self.cpu_usage.set(PLACEHOLDER);
        self.cpu_temp.set(PLACEHOLDER);
        self.cpu_fan.set(PLACEHOLDER);
        self.gpu_name.set("GPU");
        self.gpu_usage.set(PLACEHOLDER);
        self.gpu_temp.set(PLACEHOLDER);
        self.gpu_mem.set(PLACEHOLDER);
        self.mem_usage.set(PLACEHOLDER);
        self.mem_bar = 0;
        self.mem_detail.set("");
        self.mark_dirty();
    }
}

pub type SwitchCallback = Arc<dyn Fn(&str, bool) + Send + Sync>;
pub type SceneCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct SmartHomeCallbacks {
    switch: Option<SwitchCallback>,
    scene: Option<SceneCallback>,
}

/// Owner of the widget tree and the touch-side callback slots.
pub struct UiManager {
    gate: Arc<UiGate<WidgetTree>>,
    switch_entities: [String; SWITCH_SLOT_COUNT],
    callbacks: Mutex<SmartHomeCallbacks>,
    last_telemetry: Mutex<Option<Instant>>,
    last_status: Mutex<Option<Instant>>,
}

impl UiManager {
    pub fn new(switch_entities: [String; SWITCH_SLOT_COUNT]) -> Arc<Self> {
        Arc::new(Self {
            gate: Arc::new(UiGate::new(WidgetTree::new())),
            switch_entities,
            callbacks: Mutex::new(SmartHomeCallbacks::default()),
            last_telemetry: Mutex::new(None),
            last_status: Mutex::new(None),
        })
    }

    pub fn gate(&self) -> Arc<UiGate<WidgetTree>> {
        Arc::clone(&self.gate)
    }

    /// Spawn the UI worker on the display core. It alone holds the gate
    /// without a deadline.
    pub fn start_ui_task(&self) -> Result<()> {
        let gate = self.gate();
        let task_name = CString::new("ui_task").unwrap();
        let mut handle: esp_idf_sys::TaskHandle_t = std::ptr::null_mut();

        let ret = unsafe {
            esp_idf_sys::xTaskCreatePinnedToCore(
                Some(ui_task_entry),
                task_name.as_ptr(),
                8192,
                Box::into_raw(Box::new(gate)) as *mut _,
                2,
                &mut handle,
                1, // display core
            )
        };
        if ret != 1 {
            // pdPASS
            anyhow::bail!("Failed to create UI task");
        }
        log::info!("UI task started on display core");
        Ok(())
    }

    // --- telemetry panels ---------------------------------------------------

    pub fn update_telemetry(&self, rec: &TelemetryRecord) {
        // Throttle to 10 Hz; the serial producer can be much faster.
        {
            let mut last = self.last_telemetry.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(t) = *last {
                if t.elapsed() < TELEMETRY_MIN_INTERVAL {
                    return;
                }
            }
            *last = Some(Instant::now());
        }

        match self.gate.lock(PUBLISH_LOCK_TIMEOUT_MS) {
            Some(mut tree) => tree.apply_telemetry(rec),
            None => log::warn!("dropped telemetry update: UI gate busy"),
        }
    }

    /// Reset hook: back to placeholders when the serial link dies.
    pub fn reset_to_defaults(&self) {
        match self.gate.lock(PUBLISH_LOCK_TIMEOUT_MS) {
            Some(mut tree) => {
                tree.reset_panels();
                log::info!("Dashboard reset to default values");
            }
            None => log::warn!("dropped dashboard reset: UI gate busy"),
        }
    }

    // --- status strip -------------------------------------------------------

    pub fn set_serial_status(&self, connected: bool) {
        let Some(mut tree) = self.gate.lock(STATUS_LOCK_TIMEOUT_MS) else {
            log::warn!("dropped serial status update: UI gate busy");
            return;
        };
        if connected {
            tree.serial_status
                .set_colored("[SERIAL] Connected", colors::GREEN);
        } else {
            tree.serial_status
                .set_colored("[SERIAL] Disconnected", colors::RED);
        }
        tree.mark_dirty();
    }

    pub fn set_wifi_status(&self, connected: bool, text: &str) {
        let Some(mut tree) = self.gate.lock(STATUS_LOCK_TIMEOUT_MS) else {
            log::warn!("dropped wifi status update: UI gate busy");
            return;
        };
        let msg = format!("[WIFI] {}", text);
        let color = if connected { colors::GREEN } else { colors::RED };
        tree.wifi_status.set_colored(&msg, color);
        tree.mark_dirty();
    }

    pub fn set_uptime(&self, text: &str) {
        let Some(mut tree) = self.gate.lock(100) else {
            // Next second's tick will catch up.
            return;
        };
        tree.uptime.set(text);
        tree.mark_dirty();
    }

    // --- controls panel -----------------------------------------------------

    pub fn set_ha_status(&self, is_ready: bool, is_syncing: bool, text: &str) {
        // Rate-limit the label to 5 Hz to keep gate contention bounded.
        {
            let mut last = self.last_status.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(t) = *last {
                if t.elapsed() < STATUS_MIN_INTERVAL {
                    return;
                }
            }
            *last = Some(Instant::now());
        }

        let Some(mut tree) = self.gate.lock(STATUS_LOCK_TIMEOUT_MS) else {
            log::warn!("dropped HA status update: UI gate busy");
            return;
        };
        let msg = format!("HA: {}", text);
        let color = if is_ready {
            colors::GREEN
        } else if is_syncing {
            colors::CYAN
        } else {
            colors::RED
        };
        tree.ha_status.set_colored(&msg, color);
        tree.mark_dirty();
    }

    /// Sync path: the coordinator reflects the authoritative remote state.
    pub fn set_switch(&self, slot: usize, on: bool) {
        if slot >= SWITCH_SLOT_COUNT {
            return;
        }
        let Some(mut tree) = self.gate.lock(PUBLISH_LOCK_TIMEOUT_MS) else {
            log::warn!("dropped switch update for slot {}: UI gate busy", slot);
            return;
        };
        tree.switches[slot].checked = on;
        tree.mark_dirty();
    }

    #[allow(dead_code)]
    pub fn switch_state(&self, slot: usize) -> bool {
        self.gate
            .lock(STATUS_LOCK_TIMEOUT_MS)
            .map(|tree| tree.switches.get(slot).map(|s| s.checked).unwrap_or(false))
            .unwrap_or(false)
    }

    pub fn register_smart_home_callbacks(
        &self,
        switch: SwitchCallback,
        scene: SceneCallback,
    ) {
        let mut cbs = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
        cbs.switch = Some(switch);
        cbs.scene = Some(scene);
        log::info!("Smart home callbacks registered with UI dashboard");
    }

    /// Touch entry point for a switch `value_changed`. The widget already
    /// shows the user's choice; the callback runs after the gate is released
    /// because it issues blocking I/O. Unregistered callback means the event
    /// is dropped.
    pub fn switch_toggled(&self, slot: usize, desired: bool) {
        if slot >= SWITCH_SLOT_COUNT {
            return;
        }
        if let Some(mut tree) = self.gate.lock(PUBLISH_LOCK_TIMEOUT_MS) {
            tree.switches[slot].checked = desired;
            tree.mark_dirty();
        }

        let cb = {
            let cbs = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
            cbs.switch.clone()
        };
        match cb {
            Some(cb) => cb(&self.switch_entities[slot], desired),
            None => log::warn!("switch toggle on slot {} dropped: no callback", slot),
        }
    }

    /// Touch entry point for the scene button.
    pub fn scene_pressed(&self) {
        let cb = {
            let cbs = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
            cbs.scene.clone()
        };
        match cb {
            Some(cb) => cb(),
            None => log::warn!("scene trigger dropped: no callback"),
        }
    }
}

unsafe extern "C" fn ui_task_entry(pv: *mut std::ffi::c_void) {
    let gate: Arc<UiGate<WidgetTree>> = *Box::from_raw(pv as *mut _);
    log::info!("UI worker running on core {:?}", esp_idf_hal::cpu::core());

    loop {
        let delay = {
            let mut tree = gate.lock_blocking();
            tree.process_timers()
        };
        esp_idf_hal::delay::FreeRtos::delay_ms(delay.max(MIN_TICK_MS));
    }
}
