//! Smart-home coordinator: periodic reconciliation between the remote
//! server and the local UI, plus translation of touch intents into service
//! calls.
//!
//! The poll task starts on first Wi-Fi connect and idles while the link is
//! down. Touch handlers never write the entity cache; the 30 s poll is the
//! sole authority and corrects any optimistic widget state.

pub mod parser;
pub mod rest_client;
pub mod status;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use wallpanel_core::entities::EntityState;
use wallpanel_core::http::{self, FailureClass, FALLBACK_ABORT_THRESHOLD};
use wallpanel_core::status::{sync_outcome, HaStatus};

use crate::config::{
    Config, ASYNC_PARSE_THRESHOLD, MAX_RESPONSE_SIZE, SWITCH_SLOT_COUNT, SYNC_INTERVAL,
    SYNC_SLEEP_FEED_INTERVAL,
};
use crate::psram::PsramBuffer;
use crate::system::watchdog;
use crate::ui::UiManager;
use parser::ParserWorker;
use rest_client::HaClient;
use status::HaStatusOwner;

/// Total async-parse wait budget and the slice between watchdog feeds.
const ASYNC_PARSE_TIMEOUT_MS: u32 = 30_000;
const ASYNC_PARSE_SLICE_MS: u32 = 2_000;

/// Domain error for the smart-home subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaError {
    /// Missing/empty configuration.
    InvalidArgument,
    /// Operation before init, or a torn-down worker.
    InvalidState,
    /// Precheck failed: not associated, server unreachable before the wire.
    NotFound,
    /// Connect/DNS/reset class failures.
    Transport,
    /// Per-request budget exceeded.
    Timeout,
    /// HTTP non-2xx.
    Protocol(u16),
    /// Body was empty, truncated or unparseable.
    InvalidResponse,
    /// Buffer or job allocation failed.
    NoMemory,
    /// Parse queue full; caller backs off to sync parsing.
    QueueFull,
}

impl HaError {
    pub fn class(self) -> FailureClass {
        match self {
            HaError::Transport | HaError::Timeout | HaError::NotFound => FailureClass::Transport,
            HaError::Protocol(_) | HaError::InvalidResponse => FailureClass::Protocol,
            _ => FailureClass::LocalPrecondition,
        }
    }
}

impl core::fmt::Display for HaError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            HaError::InvalidArgument => write!(f, "invalid argument"),
            HaError::InvalidState => write!(f, "invalid state"),
            HaError::NotFound => write!(f, "server not reachable"),
            HaError::Transport => write!(f, "transport failure"),
            HaError::Timeout => write!(f, "request timed out"),
            HaError::Protocol(code) => write!(f, "HTTP status {}", code),
            HaError::InvalidResponse => write!(f, "invalid response"),
            HaError::NoMemory => write!(f, "allocation failed"),
            HaError::QueueFull => write!(f, "parse queue full"),
        }
    }
}

impl std::error::Error for HaError {}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub type StatesSyncCallback = Arc<dyn Fn(&[bool; SWITCH_SLOT_COUNT], usize) + Send + Sync>;

struct Inner {
    config: Config,
    ui: Arc<UiManager>,
    status: Arc<HaStatusOwner>,
    /// Poll-task client: owns the keep-alive GET connection.
    client: Mutex<Option<HaClient>>,
    /// Touch-side client: POST-only, fresh connection per call, so touch
    /// intents never contend with an in-flight bulk poll.
    service_client: Mutex<Option<HaClient>>,
    parser: Mutex<Option<ParserWorker>>,
    /// Authoritative local mirror; written only by the sync paths below.
    cache: Mutex<[EntityState; SWITCH_SLOT_COUNT]>,
    states_sync_cb: Mutex<Option<StatesSyncCallback>>,
    init_requested: AtomicBool,
    immediate_sync_requested: AtomicBool,
    running: AtomicBool,
    task_started: AtomicBool,
}

pub struct SmartHome {
    inner: Arc<Inner>,
}

impl SmartHome {
    pub fn new(config: Config, ui: Arc<UiManager>, status: Arc<HaStatusOwner>) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(Inner {
                config,
                ui,
                status,
                client: Mutex::new(None),
                service_client: Mutex::new(None),
                parser: Mutex::new(None),
                cache: Mutex::new(Default::default()),
                states_sync_cb: Mutex::new(None),
                init_requested: AtomicBool::new(false),
                immediate_sync_requested: AtomicBool::new(false),
                running: AtomicBool::new(false),
                task_started: AtomicBool::new(false),
            }),
        })
    }

    pub fn register_states_sync(&self, cb: StatesSyncCallback) {
        *self
            .inner
            .states_sync_cb
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(cb);
    }

    /// One-shot init request, wired to the Wi-Fi first-connected latch.
    pub fn request_init(&self) {
        self.inner.init_requested.store(true, Ordering::SeqCst);
    }

    #[allow(dead_code)]
    pub fn request_immediate_sync(&self) {
        self.inner
            .immediate_sync_requested
            .store(true, Ordering::SeqCst);
    }

    /// Wi-Fi edge gate: the subsystem runs only while the station is up.
    pub fn wifi_gate(&self, connected: bool) {
        log::info!(
            "Smart home gate: WiFi {}",
            if connected { "connected" } else { "disconnected" }
        );
        self.inner.running.store(connected, Ordering::SeqCst);

        if connected {
            self.start_task_if_needed();
            // Reconnects resync promptly; initial init is the one-shot's job.
            if self
                .inner
                .client
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .is_some()
            {
                self.inner
                    .immediate_sync_requested
                    .store(true, Ordering::SeqCst);
            }
        } else {
            self.inner.status.change(HaStatus::Offline);
        }
    }

    fn start_task_if_needed(&self) {
        if self
            .inner
            .task_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let inner = Arc::clone(&self.inner);
        let spawned = std::thread::Builder::new()
            .name("ha_task".into())
            .stack_size(12 * 1024)
            .spawn(move || run_task(inner));

        match spawned {
            Ok(_) => log::info!("HA task started"),
            Err(e) => {
                log::error!("Failed to create HA task: {:?}", e);
                self.inner.task_started.store(false, Ordering::SeqCst);
            }
        }
    }

    /// Touch intent: toggle a switch entity. Failures do not revert the
    /// widget; the next poll is authoritative.
    pub fn control_switch(&self, entity_id: &str, turn_on: bool) {
        let action = if turn_on { "ON" } else { "OFF" };
        log::info!("SWITCH CONTROL: {} -> {}", entity_id, action);

        let mut guard = self
            .inner
            .service_client
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let Some(client) = guard.as_mut() else {
            log::warn!("switch control before init, dropping");
            return;
        };

        let result = if turn_on {
            client.turn_on(entity_id)
        } else {
            client.turn_off(entity_id)
        };
        match result {
            Ok(()) => log::info!("Switch {} turned {} successfully", entity_id, action),
            Err(e) => {
                log::error!("Failed to turn {} switch {}: {}", action, entity_id, e);
                self.inner.status.change(HaStatus::SyncFailed);
            }
        }
    }

    /// Touch intent: fire the configured scene. Idempotent locally; repeated
    /// triggers map to repeated POSTs.
    pub fn trigger_scene(&self) {
        log::info!("Triggering scene {}", self.inner.config.scene_entity);

        let mut guard = self
            .inner
            .service_client
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let Some(client) = guard.as_mut() else {
            log::warn!("scene trigger before init, dropping");
            return;
        };

        let scene = self.inner.config.scene_entity.clone();
        if let Err(e) = client.trigger_scene(&scene) {
            log::error!("Scene trigger failed: {}", e);
            self.inner.status.change(HaStatus::SyncFailed);
        }
    }
}

fn run_task(inner: Arc<Inner>) {
    watchdog::subscribe_current();
    log::info!("HA task running");

    let mut cycle_count = 0u32;

    loop {
        if !inner.running.load(Ordering::SeqCst) {
            watchdog::feed();
            esp_idf_hal::delay::FreeRtos::delay_ms(500);
            continue;
        }

        if inner.init_requested.swap(false, Ordering::SeqCst) {
            watchdog::feed();
            initialize(&inner);
            watchdog::feed();
        }

        if inner.immediate_sync_requested.swap(false, Ordering::SeqCst) {
            if has_client(&inner) {
                watchdog::feed();
                run_sync_cycle(&inner);
                watchdog::feed();
                esp_idf_hal::delay::FreeRtos::delay_ms(1000);
            }
        }

        sleep_between_polls(&inner);

        cycle_count += 1;
        if cycle_count % 10 == 0 {
            log::info!(
                "HA task health: cycle {}, free heap {} bytes",
                cycle_count,
                unsafe { esp_idf_sys::esp_get_free_heap_size() }
            );
            if let Some(worker) = inner.parser.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
                let stats = worker.stats();
                log::debug!(
                    "Parser stats: {} jobs, avg {} ms, largest payload {} bytes",
                    stats.jobs_processed,
                    stats.average_parse_time_ms(),
                    stats.largest_payload
                );
            }
            if cycle_count >= 1000 {
                cycle_count = 0;
            }
        }

        if !inner.running.load(Ordering::SeqCst) || !has_client(&inner) {
            continue;
        }

        watchdog::feed();
        run_sync_cycle(&inner);
        watchdog::feed();
        esp_idf_hal::delay::FreeRtos::delay_ms(100);
    }
}

fn has_client(inner: &Inner) -> bool {
    inner
        .client
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .is_some()
}

fn initialize(inner: &Inner) {
    match HaClient::new(&inner.config, Arc::clone(&inner.status)) {
        Ok(client) => {
            *inner.client.lock().unwrap_or_else(|e| e.into_inner()) = Some(client);

            if let Ok(service) = HaClient::new(&inner.config, Arc::clone(&inner.status)) {
                *inner
                    .service_client
                    .lock()
                    .unwrap_or_else(|e| e.into_inner()) = Some(service);
            }

            let mut parser = inner.parser.lock().unwrap_or_else(|e| e.into_inner());
            if parser.is_none() {
                match ParserWorker::start() {
                    Ok(worker) => *parser = Some(worker),
                    Err(e) => {
                        // Large responses will be parsed synchronously.
                        log::error!("Failed to start parser worker: {:?}", e);
                    }
                }
            }

            log::info!("HA API initialized");
            inner.status.change(HaStatus::Ready);
            inner
                .immediate_sync_requested
                .store(true, Ordering::SeqCst);
        }
        Err(e) => {
            // Config-class failure: stay down, do not retry.
            log::error!("HA API init failed: {}", e);
        }
    }
}

/// Inter-poll sleep: plain delay loop, watchdog fed every 10 s, cut short by
/// an immediate-sync request or the gate dropping.
fn sleep_between_polls(inner: &Inner) {
    let total_secs = SYNC_INTERVAL.as_secs();
    let feed_every = SYNC_SLEEP_FEED_INTERVAL.as_secs();

    for elapsed in 0..total_secs {
        if !inner.running.load(Ordering::SeqCst)
            || inner.immediate_sync_requested.load(Ordering::SeqCst)
            || inner.init_requested.load(Ordering::SeqCst)
        {
            break;
        }
        esp_idf_hal::delay::FreeRtos::delay_ms(1000);
        if (elapsed + 1) % feed_every == 0 {
            watchdog::feed();
        }
    }
    watchdog::feed();
}

fn run_sync_cycle(inner: &Inner) {
    log::info!("Running periodic switch state sync");

    let entity_ids: Vec<String> = inner.config.switch_entities.to_vec();
    // Slots are ~5 KiB each; keep them off the task stack.
    let mut states: Vec<EntityState> = vec![EntityState::default(); entity_ids.len()];

    let bulk_result = bulk_sync(inner, &entity_ids, &mut states);

    let found = match bulk_result {
        Ok(found) if found > 0 => found,
        Ok(_) => {
            log::error!("Bulk sync found no entities, trying individual requests");
            fallback_individual(inner, &entity_ids, &mut states)
        }
        Err(e) => {
            log::warn!("Bulk sync failed ({}), trying individual requests", e);
            fallback_individual(inner, &entity_ids, &mut states)
        }
    };

    if found > 0 {
        apply_states(inner, &states, found);
    }
    inner.status.change(sync_outcome(found, entity_ids.len()));
}

/// One bulk GET with size-routed parsing. Returns the found-count.
fn bulk_sync(inner: &Inner, entity_ids: &[String], states: &mut [EntityState]) -> Result<usize, HaError> {
    let mut response = PsramBuffer::with_capacity(MAX_RESPONSE_SIZE).ok_or_else(|| {
        log::error!("Failed to allocate bulk response buffer");
        HaError::NoMemory
    })?;

    {
        let mut guard = inner.client.lock().unwrap_or_else(|e| e.into_inner());
        let client = guard.as_mut().ok_or(HaError::InvalidState)?;
        client.get_all_entities(&mut response)?;
    }

    watchdog::feed();

    let use_async = response.len() > ASYNC_PARSE_THRESHOLD;
    if use_async {
        match async_parse(inner, &response, entity_ids, states) {
            Ok(found) => return Ok(found),
            Err(HaError::QueueFull) | Err(HaError::NoMemory) | Err(HaError::InvalidState) => {
                log::warn!("Async submission unavailable, falling back to sync parse");
            }
            Err(e) => return Err(e),
        }
    }

    sync_parse(inner, &response, entity_ids, states)
}

fn sync_parse(
    inner: &Inner,
    response: &PsramBuffer,
    entity_ids: &[String],
    states: &mut [EntityState],
) -> Result<usize, HaError> {
    let id_refs: Vec<&str> = entity_ids.iter().map(String::as_str).collect();
    let json = response.as_str_lossy();

    let parser = inner.parser.lock().unwrap_or_else(|e| e.into_inner());
    let result = match parser.as_ref() {
        Some(worker) => worker.parse_sync(&json, &id_refs, states),
        None => wallpanel_core::entities::parse_bulk(
            &json,
            &id_refs,
            states,
            now_secs(),
            &crate::system::watchdog::WatchdogKeepalive,
        ),
    };

    result.map_err(|e| {
        log::error!("Sync parsing failed: {}", e);
        HaError::InvalidResponse
    })
}

/// Offload to the parser worker and wait in watchdog-fed slices.
fn async_parse(
    inner: &Inner,
    response: &PsramBuffer,
    entity_ids: &[String],
    states: &mut [EntityState],
) -> Result<usize, HaError> {
    let shared_out = Arc::new(Mutex::new(vec![EntityState::default(); entity_ids.len()]));
    let handle = {
        let parser = inner.parser.lock().unwrap_or_else(|e| e.into_inner());
        let worker = parser.as_ref().ok_or(HaError::InvalidState)?;
        worker.submit(response.as_slice(), entity_ids, Arc::clone(&shared_out))?
    };

    let mut waited_ms = 0u32;
    loop {
        match handle.wait(ASYNC_PARSE_SLICE_MS) {
            Some(result) => {
                watchdog::feed();
                let found = result.map_err(|e| {
                    log::error!("Async parsing failed: {}", e);
                    HaError::InvalidResponse
                })?;
                let parsed = shared_out.lock().unwrap_or_else(|e| e.into_inner());
                states.clone_from_slice(&parsed);
                return Ok(found);
            }
            None => {
                watchdog::feed();
                waited_ms += ASYNC_PARSE_SLICE_MS;
                if waited_ms >= ASYNC_PARSE_TIMEOUT_MS {
                    log::error!("Async parsing timed out");
                    return Err(HaError::Timeout);
                }
            }
        }
    }
}

/// Per-entity fallback with adaptive pacing; two consecutive transport
/// failures abort the cycle early so the watchdog is not starved further.
fn fallback_individual(inner: &Inner, entity_ids: &[String], states: &mut [EntityState]) -> usize {
    let mut found = 0usize;
    let mut consecutive_failures = 0u32;

    for (i, entity_id) in entity_ids.iter().enumerate() {
        watchdog::feed();

        let result = {
            let mut guard = inner.client.lock().unwrap_or_else(|e| e.into_inner());
            match guard.as_mut() {
                Some(client) => client.get_entity(entity_id),
                None => return found,
            }
        };

        match result {
            Ok(state) => {
                states[i] = state;
                found += 1;
                consecutive_failures = 0;
            }
            Err(e) => {
                consecutive_failures += 1;
                log::warn!("Failed to fetch entity {}: {}", entity_id, e);

                if consecutive_failures >= FALLBACK_ABORT_THRESHOLD
                    && e.class() == FailureClass::Transport
                {
                    log::error!(
                        "Multiple consecutive connection failures, aborting sync to prevent timeout"
                    );
                    break;
                }
            }
        }

        if i < entity_ids.len() - 1 {
            esp_idf_hal::delay::FreeRtos::delay_ms(http::inter_request_delay_ms(
                consecutive_failures,
            ));
        }
    }

    found
}

/// Apply found slots to the cache (monotonic `last_updated`) and push them to
/// the UI switches; then notify the states-sync observer.
fn apply_states(inner: &Inner, states: &[EntityState], found: usize) {
    let mut switch_states = [false; SWITCH_SLOT_COUNT];

    {
        let mut cache = inner.cache.lock().unwrap_or_else(|e| e.into_inner());
        for (slot, state) in states.iter().enumerate().take(SWITCH_SLOT_COUNT) {
            if state.found() {
                let previous = cache[slot].last_updated;
                cache[slot] = state.clone();
                cache[slot].last_updated = cache[slot].last_updated.max(previous);
                switch_states[slot] = state.is_on();
                inner.ui.set_switch(slot, state.is_on());
            } else {
                // Missing from this sync: keep last known.
                switch_states[slot] = cache[slot].is_on();
            }
        }
    }

    let cb = inner
        .states_sync_cb
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone();
    if let Some(cb) = cb {
        cb(&switch_states, found);
    }

    log::info!("Sync applied: {:?} ({} found)", switch_states, found);
}
