//! Async entity-states parser: a depth-2 job queue drained by one worker
//! task pinned to the display core at low priority, so large documents are
//! chewed through while the UI is idle.
//!
//! A job owns a PSRAM copy of the payload; the caller keeps its buffer and
//! can fall back to synchronous parsing when the queue is full.

use std::ffi::CString;
use std::sync::mpsc::{Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use wallpanel_core::entities::{self, EntityState, ParseError};

use super::{now_secs, HaError};
use crate::psram::PsramBuffer;
use crate::system::watchdog::{self, WatchdogKeepalive};

/// Queue depth; one job is processed at a time by the single worker.
const MAX_JOBS: usize = 2;
const TASK_STACK_SIZE: u32 = 12 * 1024;
/// Below the UI worker so parsing only runs when rendering is idle.
const TASK_PRIORITY: u32 = 1;
/// Display core; the worker only runs when the UI is idle.
const TASK_CORE: i32 = 1;

#[derive(Debug, Clone, Copy, Default)]
pub struct ParserStats {
    pub jobs_processed: u32,
    pub entities_found: u32,
    pub entities_missing: u32,
    pub total_parse_time_ms: u64,
    pub largest_payload: usize,
}

impl ParserStats {
    pub fn average_parse_time_ms(&self) -> u64 {
        if self.jobs_processed == 0 {
            0
        } else {
            self.total_parse_time_ms / self.jobs_processed as u64
        }
    }
}

struct ParseJob {
    payload: PsramBuffer,
    entity_ids: Vec<String>,
    out: Arc<Mutex<Vec<EntityState>>>,
    latch: Arc<JobLatch>,
}

/// Completion latch: the worker deposits the found-count (or error) and
/// wakes the submitting task.
struct JobLatch {
    result: Mutex<Option<Result<usize, ParseError>>>,
    cv: Condvar,
}

impl JobLatch {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            result: Mutex::new(None),
            cv: Condvar::new(),
        })
    }

    fn complete(&self, result: Result<usize, ParseError>) {
        let mut slot = self.result.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(result);
        self.cv.notify_all();
    }

    fn wait(&self, timeout: Duration) -> Option<Result<usize, ParseError>> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.result.lock().unwrap_or_else(|e| e.into_inner());
        while slot.is_none() {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .cv
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            slot = guard;
        }
        *slot
    }
}

pub struct JobHandle {
    latch: Arc<JobLatch>,
}

impl JobHandle {
    /// Wait one slice for completion. `None` means still running; the
    /// caller feeds the watchdog and waits again.
    pub fn wait(&self, timeout_ms: u32) -> Option<Result<usize, ParseError>> {
        self.latch.wait(Duration::from_millis(timeout_ms as u64))
    }
}

pub struct ParserWorker {
    tx: SyncSender<ParseJob>,
    stats: Arc<Mutex<ParserStats>>,
}

impl ParserWorker {
    pub fn start() -> Result<Self> {
        let (tx, rx) = std::sync::mpsc::sync_channel::<ParseJob>(MAX_JOBS);
        let stats = Arc::new(Mutex::new(ParserStats::default()));

        let task_name = CString::new("entity_parser").unwrap();
        let mut handle: esp_idf_sys::TaskHandle_t = std::ptr::null_mut();
        let param = Box::into_raw(Box::new((rx, Arc::clone(&stats))));

        let ret = unsafe {
            esp_idf_sys::xTaskCreatePinnedToCore(
                Some(parser_task_entry),
                task_name.as_ptr(),
                TASK_STACK_SIZE,
                param as *mut _,
                TASK_PRIORITY,
                &mut handle,
                TASK_CORE,
            )
        };
        if ret != 1 {
            // pdPASS
            // Reclaim the parameter we leaked for the task
            drop(unsafe { Box::from_raw(param) });
            anyhow::bail!("Failed to create parser task");
        }

        log::info!(
            "Entity states parser initialized (queue: {} jobs, core: {}, priority: {})",
            MAX_JOBS,
            TASK_CORE,
            TASK_PRIORITY
        );
        Ok(Self { tx, stats })
    }

    /// Copy the payload into PSRAM and enqueue a job. Fails with `QueueFull`
    /// when both slots are taken; the caller backs off to sync parsing.
    pub fn submit(
        &self,
        json: &[u8],
        entity_ids: &[String],
        out: Arc<Mutex<Vec<EntityState>>>,
    ) -> Result<JobHandle, HaError> {
        let mut payload = PsramBuffer::with_capacity(json.len()).ok_or_else(|| {
            log::error!("Failed to allocate {} bytes in PSRAM for parse job", json.len());
            HaError::NoMemory
        })?;
        payload.extend_from_slice(json);

        let latch = JobLatch::new();
        let job = ParseJob {
            payload,
            entity_ids: entity_ids.to_vec(),
            out,
            latch: Arc::clone(&latch),
        };

        match self.tx.try_send(job) {
            Ok(()) => {
                log::info!(
                    "Submitted async parse job ({} bytes, {} entities)",
                    json.len(),
                    entity_ids.len()
                );
                Ok(JobHandle { latch })
            }
            Err(TrySendError::Full(_)) => {
                log::error!("Parse queue is full, cannot submit job");
                Err(HaError::QueueFull)
            }
            Err(TrySendError::Disconnected(_)) => {
                log::error!("Parser worker is gone");
                Err(HaError::InvalidState)
            }
        }
    }

    /// Synchronous path for small payloads; runs on the caller.
    pub fn parse_sync(
        &self,
        json: &str,
        entity_ids: &[&str],
        out: &mut [EntityState],
    ) -> Result<usize, ParseError> {
        let started = Instant::now();
        let result = entities::parse_bulk(json, entity_ids, out, now_secs(), &WatchdogKeepalive);
        if let Ok(found) = result {
            self.record(started.elapsed(), found, entity_ids.len(), json.len());
            log::debug!(
                "Sync parse completed in {} ms ({}/{} entities found)",
                started.elapsed().as_millis(),
                found,
                entity_ids.len()
            );
        }
        result
    }

    pub fn stats(&self) -> ParserStats {
        *self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, elapsed: Duration, found: usize, requested: usize, payload: usize) {
        record_stats(&self.stats, elapsed, found, requested, payload);
    }
}

fn record_stats(
    stats: &Mutex<ParserStats>,
    elapsed: Duration,
    found: usize,
    requested: usize,
    payload: usize,
) {
    let mut s = stats.lock().unwrap_or_else(|e| e.into_inner());
    s.jobs_processed += 1;
    s.entities_found += found as u32;
    s.entities_missing += (requested - found) as u32;
    s.total_parse_time_ms += elapsed.as_millis() as u64;
    if payload > s.largest_payload {
        s.largest_payload = payload;
    }
}

unsafe extern "C" fn parser_task_entry(pv: *mut std::ffi::c_void) {
    let (rx, stats): (Receiver<ParseJob>, Arc<Mutex<ParserStats>>) = *Box::from_raw(pv as *mut _);

    watchdog::subscribe_current();
    log::info!("Entity parse task started on core {:?}", esp_idf_hal::cpu::core());

    while let Ok(job) = rx.recv() {
        watchdog::feed();
        let payload_len = job.payload.len();
        log::info!(
            "Processing parse job ({} bytes, {} entities)",
            payload_len,
            job.entity_ids.len()
        );

        let started = Instant::now();
        let result = {
            let json = job.payload.as_str_lossy();
            let id_refs: Vec<&str> = job.entity_ids.iter().map(String::as_str).collect();
            let mut out = job.out.lock().unwrap_or_else(|e| e.into_inner());
            out.resize(job.entity_ids.len(), EntityState::default());
            entities::parse_bulk(&json, &id_refs, &mut out, now_secs(), &WatchdogKeepalive)
        };
        let elapsed = started.elapsed();

        match &result {
            Ok(found) => {
                record_stats(&stats, elapsed, *found, job.entity_ids.len(), payload_len);
                log::info!(
                    "Async parse completed in {} ms ({}/{} entities found)",
                    elapsed.as_millis(),
                    found,
                    job.entity_ids.len()
                );
            }
            Err(e) => log::error!("Async parse failed: {}", e),
        }

        // PSRAM payload is freed here; then wake the caller.
        drop(job.payload);
        job.latch.complete(result);
    }
}
