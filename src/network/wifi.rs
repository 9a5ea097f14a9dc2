//! Station-mode Wi-Fi lifecycle: event-driven state machine with bounded
//! in-band retries, a background reconnector and a one-shot first-connected
//! latch that brings up the smart-home subsystem.

use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use esp_idf_hal::modem::Modem;
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    nvs::EspDefaultNvsPartition,
    wifi::{AuthMethod, ClientConfiguration, Configuration, EspWifi},
};

const MAXIMUM_RETRY_COUNT: u32 = 5;
const RECONNECT_DELAY: Duration = Duration::from_secs(10);
const ANY_EVENT_ID: i32 = -1; // ESP_EVENT_ANY_ID

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiStatus {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

#[derive(Debug, Clone, Default)]
pub struct WifiInfo {
    pub ssid: String,
    pub ip: String,
    pub rssi: i8,
}

pub type StatusCallback = Arc<dyn Fn(bool, &str) + Send + Sync>;
pub type GateCallback = Arc<dyn Fn(bool) + Send + Sync>;

struct Shared {
    status: Mutex<WifiStatus>,
    info: Mutex<WifiInfo>,
    retry_count: AtomicU32,
    reconnect_running: AtomicBool,
    status_cb: Mutex<Option<StatusCallback>>,
    gate_cb: Mutex<Option<GateCallback>>,
    // One-shot latch: consumed on the first Connected edge, never refilled.
    first_connected: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

pub struct WifiManager {
    // Keeps the driver (and its netif) alive for the firmware lifetime.
    wifi: EspWifi<'static>,
    shared: &'static Shared,
    ssid: String,
}

impl WifiManager {
    pub fn new(
        modem: Modem,
        sys_loop: EspSystemEventLoop,
        nvs: EspDefaultNvsPartition,
        ssid: String,
        password: String,
    ) -> Result<Self> {
        log::info!("Initializing WiFi manager for SSID: '{}'", ssid);

        if ssid.is_empty() {
            log::error!("WiFi SSID is empty! Check wifi_config.h");
            bail!("WiFi SSID cannot be empty");
        }

        let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs))?;

        let cfg = Configuration::Client(ClientConfiguration {
            ssid: ssid
                .as_str()
                .try_into()
                .map_err(|_| anyhow::anyhow!("Invalid SSID format: {}", ssid))?,
            password: password
                .as_str()
                .try_into()
                .map_err(|_| anyhow::anyhow!("Invalid password format"))?,
            auth_method: if password.is_empty() {
                log::warn!("WiFi password is empty, using open network");
                AuthMethod::None
            } else {
                AuthMethod::WPA2Personal
            },
            ..Default::default()
        });
        esp_wifi.set_configuration(&cfg)?;

        let shared: &'static Shared = Box::leak(Box::new(Shared {
            status: Mutex::new(WifiStatus::Disconnected),
            info: Mutex::new(WifiInfo::default()),
            retry_count: AtomicU32::new(0),
            reconnect_running: AtomicBool::new(false),
            status_cb: Mutex::new(None),
            gate_cb: Mutex::new(None),
            first_connected: Mutex::new(None),
        }));

        // The state machine follows the raw event stream; the handlers run on
        // the system event task and live for the firmware lifetime.
        unsafe {
            let arg = shared as *const Shared as *mut c_void;
            esp_idf_sys::esp!(esp_idf_sys::esp_event_handler_register(
                esp_idf_sys::WIFI_EVENT,
                ANY_EVENT_ID,
                Some(wifi_event_handler),
                arg,
            ))?;
            esp_idf_sys::esp!(esp_idf_sys::esp_event_handler_register(
                esp_idf_sys::IP_EVENT,
                esp_idf_sys::ip_event_t_IP_EVENT_STA_GOT_IP as i32,
                Some(ip_event_handler),
                arg,
            ))?;
            esp_idf_sys::esp!(esp_idf_sys::esp_event_handler_register(
                esp_idf_sys::IP_EVENT,
                esp_idf_sys::ip_event_t_IP_EVENT_STA_LOST_IP as i32,
                Some(ip_event_handler),
                arg,
            ))?;
        }

        log::info!("WiFi manager initialized successfully");
        Ok(Self {
            wifi: esp_wifi,
            shared,
            ssid,
        })
    }

    /// Start the station. STA_START then drives the connect attempt from the
    /// event handler.
    pub fn connect(&mut self) -> Result<()> {
        log::info!("Connecting to WiFi network: {}", self.ssid);
        self.shared.retry_count.store(0, Ordering::Relaxed);
        self.wifi.start()?;

        // Power save causes disconnects under sustained HTTP traffic.
        unsafe {
            let result = esp_idf_sys::esp_wifi_set_ps(esp_idf_sys::wifi_ps_type_t_WIFI_PS_NONE);
            if result == esp_idf_sys::ESP_OK {
                log::info!("WiFi power save disabled for stable connection");
            } else {
                log::warn!("Failed to set WiFi power save mode: {:?}", result);
            }
        }
        Ok(())
    }

    pub fn status(&self) -> WifiStatus {
        *self.shared.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn info(&self) -> WifiInfo {
        self.shared.info.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == WifiStatus::Connected
    }

    pub fn register_status_callback(&self, f: StatusCallback) {
        *self.shared.status_cb.lock().unwrap_or_else(|e| e.into_inner()) = Some(f);
    }

    /// Edge-triggered gate for the smart-home subsystem: true on Connected,
    /// false when the connection is lost.
    pub fn register_ha_gate(&self, f: GateCallback) {
        *self.shared.gate_cb.lock().unwrap_or_else(|e| e.into_inner()) = Some(f);
    }

    /// Fires exactly once per lifetime, on the first successful connection.
    pub fn register_first_connected(&self, f: impl FnOnce() + Send + 'static) {
        *self
            .shared
            .first_connected
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(Box::new(f));
    }
}

pub fn signal_strength_desc(rssi: i8) -> &'static str {
    if rssi >= -30 {
        "Excellent"
    } else if rssi >= -67 {
        "Good"
    } else if rssi >= -70 {
        "Fair"
    } else if rssi >= -80 {
        "Weak"
    } else {
        "Very Weak"
    }
}

fn status_text(status: WifiStatus, info: &WifiInfo) -> String {
    match status {
        WifiStatus::Disconnected => "Disconnected".to_string(),
        WifiStatus::Connecting => "Connecting...".to_string(),
        WifiStatus::Connected => {
            if info.ssid.is_empty() {
                "Connected".to_string()
            } else {
                format!("Connected to {}", info.ssid)
            }
        }
        WifiStatus::Failed => "Connection Failed".to_string(),
    }
}

fn set_status(shared: &'static Shared, new_status: WifiStatus) {
    let was_connected;
    {
        let mut status = shared.status.lock().unwrap_or_else(|e| e.into_inner());
        if *status == new_status {
            return;
        }
        was_connected = *status == WifiStatus::Connected;
        *status = new_status;
    }

    let info = shared.info.lock().unwrap_or_else(|e| e.into_inner()).clone();
    let text = status_text(new_status, &info);
    let is_connected = new_status == WifiStatus::Connected;
    log::info!("WiFi status changed to: {}", text);

    let status_cb = shared
        .status_cb
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone();
    if let Some(cb) = status_cb {
        cb(is_connected, &text);
    }

    // Gate edges only.
    if is_connected != was_connected {
        let gate_cb = shared.gate_cb.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(cb) = gate_cb {
            cb(is_connected);
        }
    }

    if is_connected {
        let latch = shared
            .first_connected
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(f) = latch {
            log::info!("First WiFi connection established");
            f();
        }
    }
}

fn update_connection_info(shared: &'static Shared) {
    let mut ap_info: esp_idf_sys::wifi_ap_record_t = unsafe { std::mem::zeroed() };
    if unsafe { esp_idf_sys::esp_wifi_sta_get_ap_info(&mut ap_info) } == esp_idf_sys::ESP_OK {
        let ssid_len = ap_info.ssid.iter().position(|&b| b == 0).unwrap_or(32);
        let ssid = String::from_utf8_lossy(&ap_info.ssid[..ssid_len]).into_owned();
        let mut info = shared.info.lock().unwrap_or_else(|e| e.into_inner());
        info.ssid = ssid;
        info.rssi = ap_info.rssi;
        log::info!(
            "Connected to: {}, RSSI: {} dBm ({})",
            info.ssid,
            info.rssi,
            signal_strength_desc(info.rssi)
        );
    }
}

fn start_reconnect_task(shared: &'static Shared) {
    if shared
        .reconnect_running
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        log::warn!("Reconnect task already running");
        return;
    }

    let spawned = std::thread::Builder::new()
        .name("wifi_reconnect".into())
        .stack_size(4096)
        .spawn(move || {
            log::info!("WiFi reconnect task started");
            loop {
                std::thread::sleep(RECONNECT_DELAY);
                let status = *shared.status.lock().unwrap_or_else(|e| e.into_inner());
                if status == WifiStatus::Connected {
                    log::info!("WiFi reconnected, stopping reconnect task");
                    break;
                }
                log::info!("Attempting WiFi reconnection...");
                shared.retry_count.store(0, Ordering::Relaxed);
                unsafe {
                    esp_idf_sys::esp_wifi_connect();
                }
            }
            shared.reconnect_running.store(false, Ordering::SeqCst);
        });

    if spawned.is_err() {
        log::error!("Failed to create WiFi reconnect task");
        shared.reconnect_running.store(false, Ordering::SeqCst);
    }
}

unsafe extern "C" fn wifi_event_handler(
    arg: *mut c_void,
    _event_base: esp_idf_sys::esp_event_base_t,
    event_id: i32,
    event_data: *mut c_void,
) {
    let shared = &*(arg as *const Shared);

    match event_id as u32 {
        esp_idf_sys::wifi_event_t_WIFI_EVENT_STA_START => {
            set_status(shared, WifiStatus::Connecting);
            esp_idf_sys::esp_wifi_connect();
        }
        esp_idf_sys::wifi_event_t_WIFI_EVENT_STA_CONNECTED => {
            update_connection_info(shared);
            shared.retry_count.store(0, Ordering::Relaxed);
            log::info!("WiFi associated, waiting for DHCP");
        }
        esp_idf_sys::wifi_event_t_WIFI_EVENT_STA_DISCONNECTED => {
            if !event_data.is_null() {
                let disconnected = &*(event_data as *const esp_idf_sys::wifi_event_sta_disconnected_t);
                log::warn!("WiFi disconnected (reason: {})", disconnected.reason);
            }

            set_status(shared, WifiStatus::Disconnected);

            let retries = shared.retry_count.fetch_add(1, Ordering::Relaxed) + 1;
            if retries < MAXIMUM_RETRY_COUNT {
                log::info!(
                    "Retrying connection (attempt {}/{})",
                    retries,
                    MAXIMUM_RETRY_COUNT
                );
                esp_idf_sys::esp_wifi_connect();
            } else {
                log::error!("Maximum retry attempts reached, starting background reconnection");
                set_status(shared, WifiStatus::Failed);
                start_reconnect_task(shared);
            }
        }
        _ => {}
    }
}

unsafe extern "C" fn ip_event_handler(
    arg: *mut c_void,
    _event_base: esp_idf_sys::esp_event_base_t,
    event_id: i32,
    event_data: *mut c_void,
) {
    let shared = &*(arg as *const Shared);

    match event_id as u32 {
        esp_idf_sys::ip_event_t_IP_EVENT_STA_GOT_IP => {
            if !event_data.is_null() {
                let event = &*(event_data as *const esp_idf_sys::ip_event_got_ip_t);
                let octets = event.ip_info.ip.addr.to_le_bytes();
                let ip = format!("{}.{}.{}.{}", octets[0], octets[1], octets[2], octets[3]);
                log::info!("Got IP address: {}", ip);
                shared.info.lock().unwrap_or_else(|e| e.into_inner()).ip = ip;
            }
            shared.retry_count.store(0, Ordering::Relaxed);
            set_status(shared, WifiStatus::Connected);
        }
        esp_idf_sys::ip_event_t_IP_EVENT_STA_LOST_IP => {
            log::warn!("Lost IP address");
            set_status(shared, WifiStatus::Disconnected);
        }
        _ => {}
    }
}
