//! REST plumbing that needs no network: URL and body construction, response
//! classification, retry pacing constants.

use serde_json::{json, Value};

/// Total per-request budget, milliseconds.
pub const REQUEST_TIMEOUT_MS: u32 = 8_000;
/// Bounded attempt count per request.
pub const RETRY_COUNT: u32 = 3;
/// Delay between POST attempts, milliseconds.
pub const POST_RETRY_DELAY_MS: u32 = 500;
/// Delay after a client-creation failure on the GET path, milliseconds.
pub const CLIENT_RETRY_DELAY_MS: u32 = 1_000;

/// `http://host:port/api`
pub fn base_url(host: &str, port: u16) -> String {
    format!("http://{}:{}/api", host, port)
}

pub fn states_url(base: &str) -> String {
    format!("{}/states", base)
}

pub fn entity_url(base: &str, entity_id: &str) -> String {
    format!("{}/states/{}", base, entity_id)
}

pub fn service_url(base: &str, domain: &str, service: &str) -> String {
    format!("{}/services/{}/{}", base, domain, service)
}

/// Service-call body: `{"entity_id": id}` merged with any extra fields.
pub fn service_body(entity_id: &str, extra: Option<&Value>) -> String {
    let mut body = json!({ "entity_id": entity_id });
    if let Some(Value::Object(extra_map)) = extra {
        if let Value::Object(ref mut map) = body {
            for (k, v) in extra_map {
                map.insert(k.clone(), v.clone());
            }
        }
    }
    body.to_string()
}

/// Failure classes that drive retry/abort decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Connect/DNS/reset/timeout; retryable.
    Transport,
    /// HTTP non-2xx; reported, not retried.
    Protocol,
    /// Missing auth/server config; non-retryable.
    LocalPrecondition,
}

impl FailureClass {
    pub fn is_retryable(self) -> bool {
        self == FailureClass::Transport
    }
}

/// HTTP status in [200, 300) is success; anything else is a protocol failure.
pub fn status_is_success(status: u16) -> bool {
    (200..300).contains(&status)
}

/// Heuristic truncation check for a bulk response: the top-level array must
/// end with `]`. A truncated body usually still parses up to the cut and the
/// JSON parser reports the real error; this check exists to log a precise
/// warning first.
pub fn looks_truncated(body: &str) -> bool {
    let trimmed = body.trim_end();
    !trimmed.is_empty() && !trimmed.ends_with(']')
}

/// Pacing between individual entity requests in the fallback loop: back off
/// after failures so the network can recover.
pub fn inter_request_delay_ms(consecutive_failures: u32) -> u32 {
    if consecutive_failures > 0 {
        250
    } else {
        100
    }
}

/// Consecutive transport failures after which a multi-entity fallback cycle
/// aborts early.
pub const FALLBACK_ABORT_THRESHOLD: u32 = 2;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_construction() {
        let base = base_url("192.168.50.193", 8123);
        assert_eq!(base, "http://192.168.50.193:8123/api");
        assert_eq!(states_url(&base), "http://192.168.50.193:8123/api/states");
        assert_eq!(
            entity_url(&base, "switch.pump"),
            "http://192.168.50.193:8123/api/states/switch.pump"
        );
        assert_eq!(
            service_url(&base, "scene", "turn_on"),
            "http://192.168.50.193:8123/api/services/scene/turn_on"
        );
    }

    #[test]
    fn service_body_plain_and_merged() {
        assert_eq!(
            service_body("switch.pump", None),
            r#"{"entity_id":"switch.pump"}"#
        );

        let extra = json!({ "brightness": 128 });
        let body: Value = serde_json::from_str(&service_body("light.desk", Some(&extra))).unwrap();
        assert_eq!(body["entity_id"], "light.desk");
        assert_eq!(body["brightness"], 128);
    }

    #[test]
    fn status_classification_bounds() {
        assert!(!status_is_success(199));
        assert!(status_is_success(200));
        assert!(status_is_success(299));
        assert!(!status_is_success(300));
        assert!(!status_is_success(404));
        assert!(!status_is_success(500));
    }

    #[test]
    fn retryability() {
        assert!(FailureClass::Transport.is_retryable());
        assert!(!FailureClass::Protocol.is_retryable());
        assert!(!FailureClass::LocalPrecondition.is_retryable());
    }

    #[test]
    fn truncation_heuristic() {
        assert!(!looks_truncated("[]"));
        assert!(!looks_truncated("[{\"a\":1}]\n"));
        assert!(looks_truncated("[{\"a\":1},{\"b\""));
        // Empty responses are handled separately as "empty response".
        assert!(!looks_truncated(""));
    }

    #[test]
    fn fallback_pacing() {
        assert_eq!(inter_request_delay_ms(0), 100);
        assert_eq!(inter_request_delay_ms(1), 250);
        assert_eq!(inter_request_delay_ms(5), 250);
    }
}
