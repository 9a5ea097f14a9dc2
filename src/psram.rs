// PSRAM (external SPI RAM) management for the ESP32-S3 wall panel.
// Large, infrequently-touched buffers (HTTP response bodies, parse-job
// payloads) live out here; internal DRAM is reserved for latency-critical
// draw buffers and small hot structures.

use esp_idf_sys::*;
use log::*;
use std::alloc::Layout;
use std::ptr;

/// Allocations at or above this size prefer PSRAM when it is available.
const PSRAM_THRESHOLD: usize = 1024;

/// PSRAM probing and diagnostics.
pub struct PsramAllocator;

impl PsramAllocator {
    /// Check if PSRAM is available and initialized
    pub fn is_available() -> bool {
        unsafe { esp_psram_is_initialized() }
    }

    /// Get total PSRAM size in bytes
    pub fn get_size() -> usize {
        unsafe { esp_psram_get_size() }
    }

    /// Get free PSRAM in bytes
    pub fn get_free_size() -> usize {
        unsafe { heap_caps_get_free_size(MALLOC_CAP_SPIRAM) }
    }

    /// Get largest free PSRAM block
    pub fn get_largest_free_block() -> usize {
        unsafe { heap_caps_get_largest_free_block(MALLOC_CAP_SPIRAM) }
    }

    /// Get memory info for diagnostics
    pub fn get_info() -> PsramInfo {
        PsramInfo {
            available: Self::is_available(),
            total_size: Self::get_size(),
            free_size: Self::get_free_size(),
            largest_block: Self::get_largest_free_block(),
            internal_free: unsafe { heap_caps_get_free_size(MALLOC_CAP_INTERNAL) },
            internal_largest: unsafe { heap_caps_get_largest_free_block(MALLOC_CAP_INTERNAL) },
        }
    }
}

#[derive(Debug, Clone)]
pub struct PsramInfo {
    pub available: bool,
    pub total_size: usize,
    pub free_size: usize,
    pub largest_block: usize,
    pub internal_free: usize,
    pub internal_largest: usize,
}

impl PsramInfo {
    pub fn log_info(&self) {
        if self.available {
            info!("PSRAM Status: Available");
            info!("  Total: {} MB", self.total_size / 1024 / 1024);
            info!("  Free: {} KB", self.free_size / 1024);
            info!("  Largest block: {} KB", self.largest_block / 1024);
            info!("Internal RAM:");
            info!("  Free: {} KB", self.internal_free / 1024);
            info!("  Largest block: {} KB", self.internal_largest / 1024);
        } else {
            warn!("PSRAM Status: Not available");
        }
    }
}

/// Byte buffer that lands in PSRAM for large capacities, with internal-RAM
/// fallback. This is the allocation seam between the two memory tiers: code
/// that captures responses or owns parse-job payloads allocates here, all
/// other code uses the default allocator.
pub struct PsramBuffer {
    data: *mut u8,
    len: usize,
    capacity: usize,
    in_psram: bool,
}

// Ownership of the raw allocation moves with the struct; the pointer is
// never aliased outside &self/&mut self borrows.
unsafe impl Send for PsramBuffer {}

impl PsramBuffer {
    /// Allocate a buffer of fixed capacity. Returns `None` on allocation
    /// failure in both tiers.
    pub fn with_capacity(capacity: usize) -> Option<Self> {
        let (data, in_psram) = if capacity >= PSRAM_THRESHOLD && PsramAllocator::is_available() {
            let ptr = unsafe { heap_caps_malloc(capacity, MALLOC_CAP_SPIRAM) as *mut u8 };
            if !ptr.is_null() {
                (ptr, true)
            } else {
                warn!("PSRAM allocation of {} bytes failed, falling back to internal RAM", capacity);
                (Self::alloc_internal(capacity)?, false)
            }
        } else {
            (Self::alloc_internal(capacity)?, false)
        };

        Some(Self {
            data,
            len: 0,
            capacity,
            in_psram,
        })
    }

    fn alloc_internal(capacity: usize) -> Option<*mut u8> {
        let layout = Layout::from_size_align(capacity.max(1), 1).ok()?;
        let ptr = unsafe { std::alloc::alloc(layout) };
        if ptr.is_null() {
            None
        } else {
            Some(ptr)
        }
    }

    /// Append bytes; returns the number actually copied (short when the
    /// buffer is full).
    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> usize {
        let room = self.capacity - self.len;
        let n = bytes.len().min(room);
        if n > 0 {
            unsafe {
                ptr::copy_nonoverlapping(bytes.as_ptr(), self.data.add(self.len), n);
            }
            self.len += n;
        }
        n
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.data, self.len) }
    }

    /// View the contents as UTF-8, replacing invalid sequences.
    pub fn as_str_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(self.as_slice())
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Check if buffer is in PSRAM
    #[allow(dead_code)]
    pub fn is_in_psram(&self) -> bool {
        self.in_psram
    }
}

impl Drop for PsramBuffer {
    fn drop(&mut self) {
        if self.in_psram {
            unsafe {
                heap_caps_free(self.data as *mut _);
            }
        } else {
            let layout = Layout::from_size_align(self.capacity.max(1), 1)
                .expect("layout valid since allocation");
            unsafe {
                std::alloc::dealloc(self.data, layout);
            }
        }
    }
}
