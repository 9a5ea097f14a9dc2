//! 1 Hz runtime timer: advances the uptime counter and pushes the formatted
//! value into the status widget.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use esp_idf_svc::timer::{EspTaskTimerService, EspTimer};

use crate::ui::UiManager;

pub fn format_uptime(secs: u64) -> String {
    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;
    let s = secs % 60;
    format!("{:02}:{:02}:{:02}", hours, mins, s)
}

/// Keeps the periodic timer alive; dropping it stops the updates.
pub struct RuntimeTimer {
    _timer: EspTimer<'static>,
    counter: Arc<AtomicU64>,
}

impl RuntimeTimer {
    pub fn start(timer_service: &EspTaskTimerService, ui: Arc<UiManager>) -> Result<Self> {
        let counter = Arc::new(AtomicU64::new(0));
        let tick_counter = Arc::clone(&counter);

        let mut timer = timer_service.timer(move || {
            let secs = tick_counter.fetch_add(1, Ordering::Relaxed) + 1;
            ui.set_uptime(&format_uptime(secs));
        })?;
        timer.every(Duration::from_secs(1))?;

        log::info!("Runtime timer started (1 Hz)");
        Ok(Self {
            _timer: timer,
            counter,
        })
    }

    #[allow(dead_code)]
    pub fn uptime_seconds(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uptime_formatting() {
        assert_eq!(format_uptime(0), "00:00:00");
        assert_eq!(format_uptime(59), "00:00:59");
        assert_eq!(format_uptime(61), "00:01:01");
        assert_eq!(format_uptime(3661), "01:01:01");
        assert_eq!(format_uptime(100 * 3600 + 62), "100:01:02");
    }
}
