//! Host-PC telemetry: frame decoding and display formatting.
//!
//! The host streams newline-delimited JSON objects over the serial link. Each
//! frame carries a full snapshot of CPU/GPU/memory metrics; unknown fields
//! are ignored, missing fields default to zero so a partial producer still
//! renders.

use serde::Deserialize;

/// Maximum accepted length for CPU/GPU model names.
pub const NAME_MAX: usize = 31;

/// Default capacity of the serial frame accumulator.
pub const FRAME_BUF_CAPACITY: usize = 2048;

/// Placeholder rendered when a value cannot be computed.
pub const PLACEHOLDER: &str = "--";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct CpuInfo {
    /// Usage percentage 0..100.
    pub usage: u8,
    /// Temperature in whole degrees Celsius.
    pub temp: u8,
    /// Frequency in MHz.
    pub freq: u32,
    /// Fan speed in RPM.
    pub fan: u16,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct GpuInfo {
    pub usage: u8,
    pub temp: u8,
    pub name: String,
    /// Dedicated memory used, MB.
    pub mem_used: u32,
    /// Dedicated memory total, MB. Zero when the host cannot report it.
    pub mem_total: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct MemoryInfo {
    pub usage: u8,
    /// Used, GB.
    pub used: f32,
    /// Total, GB.
    pub total: f32,
    /// Available, GB.
    pub avail: f32,
}

/// One decoded telemetry frame.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct TelemetryRecord {
    /// Producer timestamp, milliseconds since epoch.
    pub timestamp: u64,
    pub cpu: CpuInfo,
    pub gpu: GpuInfo,
    pub mem: MemoryInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// The bytes were not a valid JSON object of the expected shape.
    Malformed,
}

impl core::fmt::Display for FrameError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FrameError::Malformed => write!(f, "malformed telemetry frame"),
        }
    }
}

impl std::error::Error for FrameError {}

/// Decode one complete frame. Name fields are clamped to [`NAME_MAX`] bytes.
pub fn parse_frame(bytes: &[u8]) -> Result<TelemetryRecord, FrameError> {
    let mut record: TelemetryRecord =
        serde_json::from_slice(bytes).map_err(|_| FrameError::Malformed)?;
    truncate_in_place(&mut record.cpu.name, NAME_MAX);
    truncate_in_place(&mut record.gpu.name, NAME_MAX);
    Ok(record)
}

fn truncate_in_place(s: &mut String, max: usize) {
    if s.len() > max {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
    }
}

/// Accumulates serial bytes into newline-delimited frames inside a bounded
/// buffer. A frame longer than the buffer is discarded wholesale: the
/// accumulator drops input until the next delimiter and resynchronizes there.
pub struct FrameAccumulator {
    buf: Vec<u8>,
    capacity: usize,
    overflowed: bool,
    dropped_frames: u32,
}

impl FrameAccumulator {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            capacity,
            overflowed: false,
            dropped_frames: 0,
        }
    }

    /// Feed raw bytes; `on_frame` is called once per complete frame.
    pub fn push(&mut self, bytes: &[u8], mut on_frame: impl FnMut(&[u8])) {
        for &b in bytes {
            if b == b'\n' {
                if self.overflowed {
                    self.overflowed = false;
                    self.dropped_frames += 1;
                    log::warn!(
                        "serial frame exceeded {} bytes, discarded ({} dropped so far)",
                        self.capacity,
                        self.dropped_frames
                    );
                } else if !self.buf.is_empty() {
                    on_frame(&self.buf);
                }
                self.buf.clear();
                continue;
            }
            if self.overflowed {
                continue;
            }
            if self.buf.len() == self.capacity {
                self.overflowed = true;
                self.buf.clear();
                continue;
            }
            self.buf.push(b);
        }
    }

    /// Bytes currently buffered for the in-progress frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn dropped_frames(&self) -> u32 {
        self.dropped_frames
    }
}

// ---------------------------------------------------------------------------
// Display formatting. The widget layer renders these strings verbatim.
// ---------------------------------------------------------------------------

pub fn format_percent(value: u8) -> String {
    format!("{}%", value)
}

pub fn format_temp(celsius: u8) -> String {
    format!("{}°C", celsius)
}

pub fn format_fan(rpm: u16) -> String {
    format!("{}", rpm)
}

pub fn format_freq(mhz: u32) -> String {
    format!("{} MHz", mhz)
}

/// GPU memory usage percent, integer-truncated. `None` when the total is
/// unknown (zero), which the UI renders as [`PLACEHOLDER`].
pub fn gpu_mem_percent(mem_used: u32, mem_total: u32) -> Option<u8> {
    if mem_total == 0 {
        return None;
    }
    Some(((mem_used as u64 * 100) / mem_total as u64) as u8)
}

pub fn format_gpu_mem(mem_used: u32, mem_total: u32) -> String {
    match gpu_mem_percent(mem_used, mem_total) {
        Some(pct) => format_percent(pct),
        None => PLACEHOLDER.to_string(),
    }
}

/// Memory detail line, one decimal of precision: `(20.1 GB / 32.0 GB)`.
pub fn format_mem_detail(used_gb: f32, total_gb: f32) -> String {
    format!("({:.1} GB / {:.1} GB)", used_gb, total_gb)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLEAN_FRAME: &str = concat!(
        r#"{"timestamp":1723900000000,"#,
        r#""cpu":{"usage":42,"temp":55,"freq":3800,"fan":1200,"name":"R9"},"#,
        r#""gpu":{"usage":17,"temp":48,"name":"RTX","mem_used":2048,"mem_total":8192},"#,
        r#""mem":{"usage":63,"used":20.1,"total":32.0,"avail":11.9}}"#
    );

    #[test]
    fn clean_frame_decodes() {
        let rec = parse_frame(CLEAN_FRAME.as_bytes()).unwrap();
        assert_eq!(rec.timestamp, 1723900000000);
        assert_eq!(rec.cpu.usage, 42);
        assert_eq!(rec.cpu.temp, 55);
        assert_eq!(rec.cpu.freq, 3800);
        assert_eq!(rec.cpu.fan, 1200);
        assert_eq!(rec.cpu.name, "R9");
        assert_eq!(rec.gpu.mem_used, 2048);
        assert_eq!(rec.mem.used, 20.1);
    }

    #[test]
    fn clean_frame_renders_expected_strings() {
        let rec = parse_frame(CLEAN_FRAME.as_bytes()).unwrap();
        assert_eq!(format_percent(rec.cpu.usage), "42%");
        assert_eq!(format_temp(rec.cpu.temp), "55°C");
        assert_eq!(format_fan(rec.cpu.fan), "1200");
        assert_eq!(format_percent(rec.gpu.usage), "17%");
        assert_eq!(format_temp(rec.gpu.temp), "48°C");
        assert_eq!(format_gpu_mem(rec.gpu.mem_used, rec.gpu.mem_total), "25%");
        assert_eq!(format_percent(rec.mem.usage), "63%");
        assert_eq!(
            format_mem_detail(rec.mem.used, rec.mem.total),
            "(20.1 GB / 32.0 GB)"
        );
    }

    #[test]
    fn unknown_fields_are_ignored_and_missing_default() {
        let rec = parse_frame(br#"{"timestamp":5,"cpu":{"usage":9,"vendor":"x"}}"#).unwrap();
        assert_eq!(rec.cpu.usage, 9);
        assert_eq!(rec.gpu.mem_total, 0);
        assert_eq!(rec.mem.total, 0.0);
    }

    #[test]
    fn zero_gpu_mem_total_renders_placeholder() {
        assert_eq!(gpu_mem_percent(2048, 0), None);
        assert_eq!(format_gpu_mem(2048, 0), "--");
    }

    #[test]
    fn gpu_mem_percent_truncates() {
        // 2047 * 100 / 8192 = 24.98 -> 24
        assert_eq!(gpu_mem_percent(2047, 8192), Some(24));
        assert_eq!(gpu_mem_percent(8192, 8192), Some(100));
    }

    #[test]
    fn malformed_frame_is_rejected() {
        assert_eq!(parse_frame(b"{not json"), Err(FrameError::Malformed));
        assert_eq!(parse_frame(b"[1,2,3]"), Err(FrameError::Malformed));
    }

    #[test]
    fn long_names_are_clamped() {
        let long = "X".repeat(80);
        let json = format!(r#"{{"cpu":{{"name":"{}"}}}}"#, long);
        let rec = parse_frame(json.as_bytes()).unwrap();
        assert_eq!(rec.cpu.name.len(), NAME_MAX);
    }

    #[test]
    fn accumulator_splits_frames_on_newline() {
        let mut acc = FrameAccumulator::new(64);
        let mut frames = Vec::new();
        acc.push(b"{\"a\":1}\n{\"b\":2}\n{\"c", |f| frames.push(f.to_vec()));
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], b"{\"a\":1}");
        assert_eq!(acc.pending(), 3);
    }

    #[test]
    fn accumulator_discards_oversized_frames_and_resyncs() {
        let mut acc = FrameAccumulator::new(8);
        let mut frames = Vec::new();
        acc.push(b"0123456789ABCDEF\n{\"ok\":1}\n", |f| frames.push(f.to_vec()));
        assert_eq!(acc.dropped_frames(), 1);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], b"{\"ok\":1}");
    }

    #[test]
    fn accumulator_never_exceeds_capacity() {
        let mut acc = FrameAccumulator::new(8);
        acc.push(&[b'x'; 1000], |_| panic!("no frame expected"));
        assert!(acc.pending() <= 8);
    }
}
