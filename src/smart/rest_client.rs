//! Authenticated HTTP client for the home-automation REST API.
//!
//! GETs reuse one keep-alive connection keyed by the base URL; POSTs use a
//! fresh connection per call so rare service posts stay failure-isolated.
//! The watchdog is fed before and after every wire operation; retries are
//! bounded and transport-classified.

use std::sync::Arc;
use std::time::{Duration, Instant};

use embedded_svc::http::client::Client;
use embedded_svc::http::Method;
use embedded_svc::io::{Read, Write};
use esp_idf_svc::http::client::{Configuration as HttpConfiguration, EspHttpConnection};
use esp_idf_svc::io::EspIOError;
use serde_json::Value;

use wallpanel_core::entities::{self, EntityState};
use wallpanel_core::http::{
    self, CLIENT_RETRY_DELAY_MS, POST_RETRY_DELAY_MS, REQUEST_TIMEOUT_MS, RETRY_COUNT,
};
use wallpanel_core::status::HaStatus;

use super::{now_secs, HaError};
use crate::config::Config;
use crate::psram::PsramBuffer;
use crate::smart::status::HaStatusOwner;
use crate::system::watchdog;
use crate::version::USER_AGENT;
use crate::network;

const READ_CHUNK: usize = 1024;
/// Single-entity responses are small; bulk responses use the caller's cap.
const ENTITY_RESPONSE_CAPACITY: usize = 8 * 1024;
const SERVICE_RESPONSE_CAPACITY: usize = 2 * 1024;

pub struct HaClient {
    base_url: String,
    auth_header: String,
    persistent: Option<Client<EspHttpConnection>>,
    persistent_base: String,
    status: Arc<HaStatusOwner>,
}

impl HaClient {
    /// Validates configuration and caches the authorization header. Empty
    /// token or host is a config error: the coordinator stays down.
    pub fn new(config: &Config, status: Arc<HaStatusOwner>) -> Result<Self, HaError> {
        if config.api_token.is_empty() {
            log::error!("HA API token is not defined or empty");
            return Err(HaError::InvalidArgument);
        }
        if config.server_host.is_empty() {
            log::error!("HA server host is not defined or empty");
            return Err(HaError::InvalidArgument);
        }

        Ok(Self {
            base_url: config.base_url(),
            auth_header: format!("Bearer {}", config.api_token),
            persistent: None,
            persistent_base: String::new(),
            status,
        })
    }

    pub fn get_entity(&mut self, entity_id: &str) -> Result<EntityState, HaError> {
        let url = http::entity_url(&self.base_url, entity_id);
        let mut buf =
            PsramBuffer::with_capacity(ENTITY_RESPONSE_CAPACITY).ok_or(HaError::NoMemory)?;
        self.perform(Method::Get, &url, None, &mut buf)?;

        entities::parse_single(&buf.as_str_lossy(), now_secs()).map_err(|e| {
            log::error!("failed to parse entity state for {}: {}", entity_id, e);
            HaError::InvalidResponse
        })
    }

    /// Bulk fetch of every entity; the raw body lands in `out` for
    /// size-routed parsing.
    pub fn get_all_entities(&mut self, out: &mut PsramBuffer) -> Result<(), HaError> {
        let url = http::states_url(&self.base_url);
        let started = Instant::now();
        self.perform(Method::Get, &url, None, out)?;
        log::debug!(
            "Bulk request completed in {} ms ({} bytes)",
            started.elapsed().as_millis(),
            out.len()
        );

        if out.is_empty() {
            log::error!("Empty bulk response received");
            self.status.change(HaStatus::SyncFailed);
            return Err(HaError::InvalidResponse);
        }

        let body = out.as_str_lossy();
        if http::looks_truncated(&body) {
            log::warn!(
                "Response may be truncated - doesn't end with ']' (last char: {:?})",
                body.trim_end().chars().last()
            );
        }
        Ok(())
    }

    pub fn call_service(
        &mut self,
        domain: &str,
        service: &str,
        entity_id: &str,
        extra: Option<&Value>,
    ) -> Result<(), HaError> {
        let url = http::service_url(&self.base_url, domain, service);
        let body = http::service_body(entity_id, extra);
        let mut response =
            PsramBuffer::with_capacity(SERVICE_RESPONSE_CAPACITY).ok_or(HaError::NoMemory)?;

        let result = self.perform(Method::Post, &url, Some(body.as_bytes()), &mut response);
        if let Err(e) = &result {
            log::error!("Service {}.{} failed for {}: {}", domain, service, entity_id, e);
        }
        result.map(|_| ())
    }

    pub fn turn_on(&mut self, entity_id: &str) -> Result<(), HaError> {
        self.call_service("switch", "turn_on", entity_id, None)
    }

    pub fn turn_off(&mut self, entity_id: &str) -> Result<(), HaError> {
        self.call_service("switch", "turn_off", entity_id, None)
    }

    pub fn trigger_scene(&mut self, entity_id: &str) -> Result<(), HaError> {
        self.call_service("scene", "turn_on", entity_id, None)
    }

    /// One request with bounded retries. Transport failures retry; non-2xx
    /// is reported and not retried; the connectivity precheck short-circuits
    /// before touching the wire.
    fn perform(
        &mut self,
        method: Method,
        url: &str,
        body: Option<&[u8]>,
        out: &mut PsramBuffer,
    ) -> Result<u16, HaError> {
        self.status.change(HaStatus::Syncing);

        if !network::is_associated() {
            log::error!("Network connectivity check failed, skipping HTTP request");
            self.status.change(HaStatus::SyncFailed);
            return Err(HaError::NotFound);
        }

        let is_post = method == Method::Post;
        let mut last_error = HaError::Transport;

        for attempt in 0..RETRY_COUNT {
            watchdog::feed();

            let attempt_result = if is_post {
                // Fresh connection per POST
                match self.make_connection() {
                    Ok(conn) => {
                        let mut client = Client::wrap(conn);
                        self.run_request(&mut client, method, url, body, out)
                    }
                    Err(e) => {
                        log::error!("Failed to create fresh HTTP client");
                        esp_idf_hal::delay::FreeRtos::delay_ms(CLIENT_RETRY_DELAY_MS);
                        last_error = e;
                        continue;
                    }
                }
            } else {
                let auth = self.auth_header.clone();
                match self.persistent_client() {
                    Ok(client) => run_request_inner(client, method, url, &auth, body, out),
                    Err(e) => {
                        log::error!("Failed to get HTTP client");
                        esp_idf_hal::delay::FreeRtos::delay_ms(CLIENT_RETRY_DELAY_MS);
                        last_error = e;
                        continue;
                    }
                }
            };

            watchdog::feed();

            match attempt_result {
                Ok(status_code) => {
                    if http::status_is_success(status_code) {
                        return Ok(status_code);
                    }
                    // Protocol failure: reported, not retried this cycle.
                    log::error!("HTTP request failed with status {}", status_code);
                    self.status.change(HaStatus::SyncFailed);
                    return Err(HaError::Protocol(status_code));
                }
                Err(e) => {
                    log::warn!(
                        "HTTP request failed (attempt {}/{}): {}",
                        attempt + 1,
                        RETRY_COUNT,
                        e
                    );
                    // A dead keep-alive connection poisons later attempts.
                    if !is_post {
                        self.teardown_persistent();
                    }
                    last_error = e;
                    if attempt + 1 < RETRY_COUNT {
                        self.status.change(HaStatus::Syncing);
                        esp_idf_hal::delay::FreeRtos::delay_ms(POST_RETRY_DELAY_MS);
                    }
                }
            }
        }

        log::error!("HTTP request failed after {} attempts: {}", RETRY_COUNT, last_error);
        self.status.change(HaStatus::SyncFailed);
        Err(last_error)
    }

    fn run_request(
        &self,
        client: &mut Client<EspHttpConnection>,
        method: Method,
        url: &str,
        body: Option<&[u8]>,
        out: &mut PsramBuffer,
    ) -> Result<u16, HaError> {
        run_request_inner(client, method, url, &self.auth_header, body, out)
    }

    fn make_connection(&self) -> Result<EspHttpConnection, HaError> {
        EspHttpConnection::new(&HttpConfiguration {
            timeout: Some(Duration::from_millis(REQUEST_TIMEOUT_MS as u64)),
            buffer_size: Some(4096),
            buffer_size_tx: Some(2048),
            ..Default::default()
        })
        .map_err(|e| {
            log::error!("Failed to create HTTP client: {:?}", e);
            HaError::NoMemory
        })
    }

    /// Ensure the keep-alive connection exists and matches the base URL.
    fn persistent_client(&mut self) -> Result<&mut Client<EspHttpConnection>, HaError> {
        if self.persistent.is_none() || self.persistent_base != self.base_url {
            if self.persistent.is_some() {
                log::info!("Base URL changed, recreating persistent HTTP client");
                self.teardown_persistent();
            }
            let conn = self.make_connection()?;
            self.persistent = Some(Client::wrap(conn));
            self.persistent_base = self.base_url.clone();
        }
        self.persistent.as_mut().ok_or(HaError::InvalidState)
    }

    fn teardown_persistent(&mut self) {
        self.persistent = None;
        self.persistent_base.clear();
    }
}

fn classify_io_error(e: EspIOError) -> HaError {
    if e.0.code() == esp_idf_sys::ESP_ERR_TIMEOUT {
        HaError::Timeout
    } else {
        HaError::Transport
    }
}

/// Issue one request on an existing client and stream the body into `out`,
/// dropping anything past its capacity with a warning.
fn run_request_inner(
    client: &mut Client<EspHttpConnection>,
    method: Method,
    url: &str,
    auth_header: &str,
    body: Option<&[u8]>,
    out: &mut PsramBuffer,
) -> Result<u16, HaError> {
    let headers: &[(&str, &str)] = if body.is_some() {
        &[
            ("Authorization", auth_header),
            ("User-Agent", USER_AGENT),
            ("Content-Type", "application/json"),
        ]
    } else {
        &[("Authorization", auth_header), ("User-Agent", USER_AGENT)]
    };

    let started = Instant::now();

    let result = (|| {
        let mut request = client
            .request(method, url, headers)
            .map_err(classify_io_error)?;
        if let Some(bytes) = body {
            request.write_all(bytes).map_err(classify_io_error)?;
        }
        let mut response = request.submit().map_err(classify_io_error)?;
        let status_code = response.status();

        out.clear();
        let mut chunk = [0u8; READ_CHUNK];
        let mut dropped = 0usize;
        loop {
            let n = response.read(&mut chunk).map_err(classify_io_error)?;
            if n == 0 {
                break;
            }
            let copied = out.extend_from_slice(&chunk[..n]);
            if copied < n {
                if dropped == 0 {
                    log::warn!("Response buffer limit reached at {} bytes", out.capacity());
                }
                dropped += n - copied;
            }
            // Large responses stream for a while
            watchdog::feed();
        }
        if dropped > 0 {
            log::warn!("Dropped {} response bytes past the buffer cap", dropped);
        }
        Ok(status_code)
    })();

    let duration = started.elapsed();
    match &result {
        Err(HaError::Timeout) => {
            log::error!(
                "HTTP request timed out after {} ms (timeout limit: {} ms)",
                duration.as_millis(),
                REQUEST_TIMEOUT_MS
            );
        }
        _ if duration.as_millis() as u32 > REQUEST_TIMEOUT_MS / 2 => {
            log::warn!(
                "Slow HTTP request: {} ms (more than half timeout)",
                duration.as_millis()
            );
        }
        _ => {}
    }

    result
}
