//! Serial telemetry ingestor: consumes newline-delimited JSON frames from
//! the host PC's UART link and publishes decoded records plus a
//! connection-liveness edge.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use esp_idf_hal::uart::UartDriver;
use wallpanel_core::telemetry::{self, FrameAccumulator, TelemetryRecord};

use crate::config::{SERIAL_FRAME_CAPACITY, SERIAL_GRACE};

pub type ConnectionCallback = Arc<dyn Fn(bool) + Send + Sync>;
pub type DataCallback = Arc<dyn Fn(&TelemetryRecord) + Send + Sync>;
pub type ResetCallback = Arc<dyn Fn() + Send + Sync>;

const READ_CHUNK: usize = 256;
const READ_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Default)]
struct Callbacks {
    connection: Option<ConnectionCallback>,
    data: Option<DataCallback>,
    reset: Option<ResetCallback>,
}

impl Callbacks {
    fn notify_connection(&self, connected: bool) {
        if let Some(cb) = &self.connection {
            cb(connected);
        }
    }
}

pub struct SerialTelemetry {
    callbacks: Arc<Mutex<Callbacks>>,
}

impl SerialTelemetry {
    pub fn new() -> Self {
        Self {
            callbacks: Arc::new(Mutex::new(Callbacks::default())),
        }
    }

    pub fn register_connection_callback(&self, f: ConnectionCallback) {
        self.callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .connection = Some(f);
    }

    pub fn register_data_callback(&self, f: DataCallback) {
        self.callbacks.lock().unwrap_or_else(|e| e.into_inner()).data = Some(f);
    }

    /// Called when the link is declared dead so the UI can fall back to
    /// default values.
    pub fn register_reset_callback(&self, f: ResetCallback) {
        self.callbacks.lock().unwrap_or_else(|e| e.into_inner()).reset = Some(f);
    }

    /// Spawn the reception task. The driver moves into the task; it blocks
    /// on short reads and owns the frame accumulator.
    pub fn start(&self, uart: UartDriver<'static>) -> Result<()> {
        let callbacks = Arc::clone(&self.callbacks);

        std::thread::Builder::new()
            .name("serial_rx".into())
            .stack_size(8192)
            .spawn(move || run_ingest_loop(uart, callbacks))?;

        log::info!("Serial telemetry task started");
        Ok(())
    }
}

fn run_ingest_loop(uart: UartDriver<'static>, callbacks: Arc<Mutex<Callbacks>>) {
    let timeout_ticks: esp_idf_sys::TickType_t = esp_idf_hal::delay::TickType::from(READ_TIMEOUT).0;
    let mut acc = FrameAccumulator::new(SERIAL_FRAME_CAPACITY);
    let mut read_buf = [0u8; READ_CHUNK];
    let mut frames: Vec<Vec<u8>> = Vec::new();

    let mut connected = false;
    let mut last_frame: Option<Instant> = None;

    loop {
        match uart.read(&mut read_buf, timeout_ticks) {
            Ok(n) if n > 0 => {
                acc.push(&read_buf[..n], |frame| frames.push(frame.to_vec()));
            }
            Ok(_) => {}
            Err(e) => {
                log::warn!("UART read error: {:?}", e);
                esp_idf_hal::delay::FreeRtos::delay_ms(100);
            }
        }

        for frame in frames.drain(..) {
            let record = match telemetry::parse_frame(&frame) {
                Ok(record) => record,
                Err(e) => {
                    log::warn!("dropping telemetry frame: {}", e);
                    continue;
                }
            };

            last_frame = Some(Instant::now());
            let cbs = callbacks.lock().unwrap_or_else(|e| e.into_inner());
            if !connected {
                connected = true;
                log::info!("Serial telemetry link up");
                cbs.notify_connection(true);
            }
            if let Some(cb) = &cbs.data {
                cb(&record);
            }
        }

        // Freshness: declare the link dead after the grace period and reset
        // the UI to defaults.
        if connected
            && last_frame
                .map(|t| t.elapsed() >= SERIAL_GRACE)
                .unwrap_or(false)
        {
            connected = false;
            log::warn!(
                "No telemetry for {} s, marking serial link down",
                SERIAL_GRACE.as_secs()
            );
            let cbs = callbacks.lock().unwrap_or_else(|e| e.into_inner());
            cbs.notify_connection(false);
            if let Some(cb) = &cbs.reset {
                cb();
            }
        }
    }
}
