//! NVS-backed crash ring: up to 5 timestamped entries written after
//! crash-like resets, printed at the following boot.

use anyhow::Result;
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};
use serde::{Deserialize, Serialize};

use crate::config::CRASH_LOG_MAX_ENTRIES;

const CRASH_NAMESPACE: &str = "crash_logs";
const COUNT_KEY: &str = "count";
const INDEX_KEY: &str = "index";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrashLogEntry {
    /// Wall-clock seconds at record time (0 when the clock was never set).
    pub timestamp: u64,
    /// Uptime of the boot that recorded the entry.
    pub uptime_seconds: u64,
    pub reason: String,
    pub free_heap: u32,
    pub min_free_heap: u32,
}

/// Storage slot holding entry `index` counted newest-first, given the ring
/// metadata. `None` when the index is out of range.
pub fn ring_slot(count: u8, write_index: u8, index: u8, capacity: u8) -> Option<u8> {
    if index >= count || capacity == 0 {
        return None;
    }
    if count < capacity {
        // Not wrapped yet: entries live at 0..count, newest at count-1.
        Some(count - 1 - index)
    } else {
        // Wrapped: newest is just behind the write index.
        Some((write_index + capacity - 1 - index) % capacity)
    }
}

pub struct CrashLogManager {
    nvs: EspNvs<NvsDefault>,
    count: u8,
    write_index: u8,
}

impl CrashLogManager {
    pub fn new(partition: EspDefaultNvsPartition) -> Result<Self> {
        let nvs = EspNvs::new(partition, CRASH_NAMESPACE, true)?;

        let mut count = nvs.get_u8(COUNT_KEY)?.unwrap_or(0);
        let mut write_index = nvs.get_u8(INDEX_KEY)?.unwrap_or(0);
        if count > CRASH_LOG_MAX_ENTRIES {
            count = CRASH_LOG_MAX_ENTRIES;
        }
        if write_index >= CRASH_LOG_MAX_ENTRIES {
            write_index = 0;
        }

        log::info!("Crash log manager initialized - {} logs stored", count);
        Ok(Self {
            nvs,
            count,
            write_index,
        })
    }

    #[allow(dead_code)]
    pub fn count(&self) -> u8 {
        self.count
    }

    fn entry_key(index: u8) -> String {
        format!("log_{}", index)
    }

    /// Record an entry for the given reason with current heap statistics.
    pub fn store(&mut self, reason: &str) -> Result<()> {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let entry = CrashLogEntry {
            timestamp,
            uptime_seconds: unsafe { esp_idf_sys::esp_timer_get_time() as u64 / 1_000_000 },
            reason: reason.to_string(),
            free_heap: unsafe { esp_idf_sys::esp_get_free_heap_size() },
            min_free_heap: unsafe { esp_idf_sys::esp_get_minimum_free_heap_size() },
        };

        let bytes = serde_json::to_vec(&entry)?;
        self.nvs
            .set_blob(&Self::entry_key(self.write_index), &bytes)?;

        self.write_index = (self.write_index + 1) % CRASH_LOG_MAX_ENTRIES;
        if self.count < CRASH_LOG_MAX_ENTRIES {
            self.count += 1;
        }
        self.nvs.set_u8(COUNT_KEY, self.count)?;
        self.nvs.set_u8(INDEX_KEY, self.write_index)?;

        log::info!(
            "Crash log stored (entry {}/{})",
            self.count,
            CRASH_LOG_MAX_ENTRIES
        );
        Ok(())
    }

    /// Fetch entry `index` counted newest-first.
    pub fn get_entry(&self, index: u8) -> Result<CrashLogEntry> {
        let slot = ring_slot(self.count, self.write_index, index, CRASH_LOG_MAX_ENTRIES)
            .ok_or_else(|| anyhow::anyhow!("crash log index {} out of range", index))?;

        let mut buf = vec![0u8; 512];
        let data = self
            .nvs
            .get_blob(&Self::entry_key(slot), &mut buf)?
            .ok_or_else(|| anyhow::anyhow!("crash log entry {} missing", slot))?;
        Ok(serde_json::from_slice(data)?)
    }

    pub fn print_all(&self) {
        if self.count == 0 {
            log::info!("No crash logs stored");
            return;
        }

        log::info!("=== PREVIOUS CRASH LOGS ===");
        for i in 0..self.count {
            match self.get_entry(i) {
                Ok(entry) => {
                    log::info!("--- CRASH LOG {} ---", i + 1);
                    log::info!("Timestamp: {}", entry.timestamp);
                    log::info!("Uptime: {} seconds", entry.uptime_seconds);
                    log::info!("Reason: {}", entry.reason);
                    log::info!("Free heap: {} bytes", entry.free_heap);
                    log::info!("Min free heap: {} bytes", entry.min_free_heap);
                }
                Err(e) => log::warn!("crash log {} unreadable: {:?}", i, e),
            }
        }
        log::info!("=== END CRASH LOGS ===");
    }

    #[allow(dead_code)]
    pub fn clear_all(&mut self) -> Result<()> {
        for i in 0..CRASH_LOG_MAX_ENTRIES {
            // Ignore errors for entries that never existed
            let _ = self.nvs.remove(&Self::entry_key(i));
        }
        self.count = 0;
        self.write_index = 0;
        self.nvs.set_u8(COUNT_KEY, 0)?;
        self.nvs.set_u8(INDEX_KEY, 0)?;
        log::info!("All crash logs cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwrapped_ring_reads_newest_first() {
        // 3 entries stored, capacity 5: slots 0,1,2; newest is 2.
        assert_eq!(ring_slot(3, 3, 0, 5), Some(2));
        assert_eq!(ring_slot(3, 3, 1, 5), Some(1));
        assert_eq!(ring_slot(3, 3, 2, 5), Some(0));
        assert_eq!(ring_slot(3, 3, 3, 5), None);
    }

    #[test]
    fn wrapped_ring_reads_newest_first() {
        // Full ring, next write at slot 2: newest entry is slot 1.
        assert_eq!(ring_slot(5, 2, 0, 5), Some(1));
        assert_eq!(ring_slot(5, 2, 1, 5), Some(0));
        assert_eq!(ring_slot(5, 2, 2, 5), Some(4));
        assert_eq!(ring_slot(5, 2, 3, 5), Some(3));
        assert_eq!(ring_slot(5, 2, 4, 5), Some(2));
        assert_eq!(ring_slot(5, 2, 5, 5), None);
    }

    #[test]
    fn empty_ring_has_no_entries() {
        assert_eq!(ring_slot(0, 0, 0, 5), None);
    }
}
