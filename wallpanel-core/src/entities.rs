//! Remote entity states: cache slot type and JSON extraction.
//!
//! The remote server reports entities either as a single JSON object
//! (`GET /api/states/<id>`) or as one large array of every entity
//! (`GET /api/states`). Extraction fills caller-provided fixed slots; the
//! rest of the system never sees a JSON DOM.

use serde_json::Value;

use crate::Keepalive;

/// Maximum bytes for an entity identifier.
pub const ENTITY_ID_MAX: usize = 63;
/// Maximum bytes retained from a reported state string.
pub const STATE_MAX: usize = 255;
/// Maximum bytes for a friendly name.
pub const FRIENDLY_NAME_MAX: usize = 63;

/// Requested ids between keepalive feeds during a bulk scan.
const KEEPALIVE_STRIDE: usize = 10;

/// One cached entity state. Fixed footprint so a bank of slots can live in a
/// flat allocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityState {
    /// Empty when the entity was not found in the last extraction.
    pub entity_id: heapless::String<ENTITY_ID_MAX>,
    pub state: heapless::String<STATE_MAX>,
    pub friendly_name: heapless::String<FRIENDLY_NAME_MAX>,
    /// Wall-clock seconds of the last update that filled this slot.
    pub last_updated: u64,
}

/// Interpretation of the reported state string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityValue {
    On,
    Off,
    Unavailable,
    Unknown,
    Other,
}

impl EntityState {
    /// Whether the last extraction found this entity.
    pub fn found(&self) -> bool {
        !self.entity_id.is_empty()
    }

    pub fn value(&self) -> EntityValue {
        match self.state.as_str() {
            "on" => EntityValue::On,
            "off" => EntityValue::Off,
            "unavailable" => EntityValue::Unavailable,
            "unknown" => EntityValue::Unknown,
            _ => EntityValue::Other,
        }
    }

    pub fn is_on(&self) -> bool {
        self.value() == EntityValue::On
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    InvalidJson,
    /// The bulk document was valid JSON but not an array of objects.
    NotArray,
    /// The single-entity document lacked the mandatory fields.
    NotAnEntity,
}

impl core::fmt::Display for ParseError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ParseError::InvalidJson => write!(f, "invalid JSON"),
            ParseError::NotArray => write!(f, "expected JSON array of entity states"),
            ParseError::NotAnEntity => write!(f, "expected an entity state object"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Copy with truncation at a char boundary; state strings longer than the
/// slot keep their head.
fn copy_bounded<const N: usize>(src: &str) -> heapless::String<N> {
    let mut end = src.len().min(N);
    while !src.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = heapless::String::new();
    // Cannot fail: the slice fits by construction.
    let _ = out.push_str(&src[..end]);
    out
}

fn fill_from_object(obj: &Value, entity_id: &str, now: u64, out: &mut EntityState) -> bool {
    let state = match obj.get("state").and_then(Value::as_str) {
        Some(s) => s,
        None => {
            log::warn!("entity {} has no valid state", entity_id);
            return false;
        }
    };

    out.entity_id = copy_bounded(entity_id);
    out.state = copy_bounded(state);
    if let Some(name) = obj
        .get("attributes")
        .and_then(|a| a.get("friendly_name"))
        .and_then(Value::as_str)
    {
        out.friendly_name = copy_bounded(name);
    }
    out.last_updated = now;
    true
}

/// Parse a single-entity document (`GET /api/states/<id>` response).
pub fn parse_single(json: &str, now: u64) -> Result<EntityState, ParseError> {
    let doc: Value = serde_json::from_str(json).map_err(|_| ParseError::InvalidJson)?;
    let obj = doc.as_object().ok_or(ParseError::NotAnEntity)?;
    let entity_id = obj
        .get("entity_id")
        .and_then(Value::as_str)
        .ok_or(ParseError::NotAnEntity)?;

    let mut state = EntityState::default();
    if !fill_from_object(&doc, entity_id, now, &mut state) {
        return Err(ParseError::NotAnEntity);
    }
    Ok(state)
}

/// Scan a bulk array for the requested entity ids and fill the matching
/// output slots. Slots for missing entities are left cleared (empty
/// `entity_id`), which callers interpret as "not found". Returns the number
/// of entities found.
///
/// The scan can cover thousands of array elements; `keepalive` is fed every
/// [`KEEPALIVE_STRIDE`] requested ids.
pub fn parse_bulk(
    json: &str,
    entity_ids: &[&str],
    out: &mut [EntityState],
    now: u64,
    keepalive: &dyn Keepalive,
) -> Result<usize, ParseError> {
    debug_assert_eq!(entity_ids.len(), out.len());

    let doc: Value = serde_json::from_str(json).map_err(|_| ParseError::InvalidJson)?;
    let entries = doc.as_array().ok_or(ParseError::NotArray)?;

    for slot in out.iter_mut() {
        *slot = EntityState::default();
    }

    let mut found = 0usize;
    for (i, (&id, slot)) in entity_ids.iter().zip(out.iter_mut()).enumerate() {
        if i % KEEPALIVE_STRIDE == 0 {
            keepalive.feed();
        }

        let hit = entries
            .iter()
            .filter(|e| e.is_object())
            .find(|e| e.get("entity_id").and_then(Value::as_str) == Some(id));

        match hit {
            Some(obj) => {
                if fill_from_object(obj, id, now, slot) {
                    found += 1;
                }
            }
            None => log::warn!("entity {} not found in bulk response", id),
        }
    }

    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NoopKeepalive;
    use core::cell::Cell;

    fn bulk_doc(ids_states: &[(&str, &str)]) -> String {
        let entries: Vec<String> = ids_states
            .iter()
            .map(|(id, st)| {
                format!(
                    r#"{{"entity_id":"{}","state":"{}","attributes":{{"friendly_name":"{} name"}}}}"#,
                    id, st, id
                )
            })
            .collect();
        format!("[{}]", entries.join(","))
    }

    #[test]
    fn bulk_all_found() {
        let json = bulk_doc(&[
            ("switch.pump", "on"),
            ("switch.wave", "off"),
            ("switch.light", "on"),
            ("sensor.unrelated", "42"),
        ]);
        let ids = ["switch.pump", "switch.wave", "switch.light"];
        let mut out = vec![EntityState::default(); 3];

        let found = parse_bulk(&json, &ids, &mut out, 1000, &NoopKeepalive).unwrap();
        assert_eq!(found, 3);
        assert!(out[0].is_on());
        assert!(!out[1].is_on());
        assert!(out[2].is_on());
        assert_eq!(out[1].friendly_name.as_str(), "switch.wave name");
        assert_eq!(out[0].last_updated, 1000);
    }

    #[test]
    fn bulk_partial_leaves_missing_slot_cleared() {
        let json = bulk_doc(&[("switch.pump", "on"), ("switch.light", "on")]);
        let ids = ["switch.pump", "switch.wave", "switch.light"];
        let mut out = vec![EntityState::default(); 3];

        let found = parse_bulk(&json, &ids, &mut out, 7, &NoopKeepalive).unwrap();
        assert_eq!(found, 2);
        assert!(out[0].found());
        assert!(!out[1].found());
        assert!(out[2].found());
    }

    #[test]
    fn bulk_skips_entity_without_state() {
        let json = r#"[{"entity_id":"switch.pump","attributes":{}}]"#;
        let ids = ["switch.pump"];
        let mut out = vec![EntityState::default(); 1];
        let found = parse_bulk(json, &ids, &mut out, 0, &NoopKeepalive).unwrap();
        assert_eq!(found, 0);
        assert!(!out[0].found());
    }

    #[test]
    fn bulk_rejects_non_array() {
        let ids = ["a"];
        let mut out = vec![EntityState::default(); 1];
        assert_eq!(
            parse_bulk(r#"{"entity_id":"a"}"#, &ids, &mut out, 0, &NoopKeepalive),
            Err(ParseError::NotArray)
        );
        assert_eq!(
            parse_bulk("[truncated", &ids, &mut out, 0, &NoopKeepalive),
            Err(ParseError::InvalidJson)
        );
    }

    #[test]
    fn bulk_feeds_keepalive_every_ten_ids() {
        struct Counter(Cell<u32>);
        impl Keepalive for Counter {
            fn feed(&self) {
                self.0.set(self.0.get() + 1);
            }
        }

        let ids: Vec<String> = (0..25).map(|i| format!("switch.s{}", i)).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let mut out = vec![EntityState::default(); 25];

        let counter = Counter(Cell::new(0));
        parse_bulk("[]", &id_refs, &mut out, 0, &counter).unwrap();
        // Fed at ids 0, 10 and 20.
        assert_eq!(counter.0.get(), 3);
    }

    #[test]
    fn single_entity_parses() {
        let json = r#"{"entity_id":"switch.pump","state":"off","attributes":{"friendly_name":"Water Pump"}}"#;
        let state = parse_single(json, 55).unwrap();
        assert_eq!(state.entity_id.as_str(), "switch.pump");
        assert_eq!(state.value(), EntityValue::Off);
        assert_eq!(state.friendly_name.as_str(), "Water Pump");
        assert_eq!(state.last_updated, 55);
    }

    #[test]
    fn single_entity_requires_id_and_state() {
        assert!(parse_single(r#"{"state":"on"}"#, 0).is_err());
        assert!(parse_single(r#"{"entity_id":"x"}"#, 0).is_err());
        assert!(parse_single("[]", 0).is_err());
    }

    #[test]
    fn state_strings_map_to_values() {
        let mut s = EntityState::default();
        for (text, value) in [
            ("on", EntityValue::On),
            ("off", EntityValue::Off),
            ("unavailable", EntityValue::Unavailable),
            ("unknown", EntityValue::Unknown),
            ("heat", EntityValue::Other),
        ] {
            s.state = copy_bounded(text);
            assert_eq!(s.value(), value);
        }
    }

    #[test]
    fn overlong_fields_are_truncated_at_char_boundary() {
        let id = "x".repeat(200);
        let json = format!(r#"{{"entity_id":"{}","state":"on"}}"#, id);
        let state = parse_single(&json, 0).unwrap();
        assert_eq!(state.entity_id.len(), ENTITY_ID_MAX);

        // Multi-byte char straddling the boundary is dropped, not split.
        let name: String = "é".repeat(FRIENDLY_NAME_MAX); // 2 bytes each
        let bounded: heapless::String<FRIENDLY_NAME_MAX> = copy_bounded(&name);
        assert!(bounded.len() <= FRIENDLY_NAME_MAX);
        assert!(bounded.as_str().chars().all(|c| c == 'é'));
    }
}
