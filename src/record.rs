// Record types that flow from the parser to storage and subscribers
//
// A LogRecord is the unit of storage: one parsed RFC5424 message. The same
// struct is what subscribers receive (pre-commit, without an id) and what
// the query API returns (post-commit, with id and created_at assigned).

use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Facility portion of a PRI value (priority >> 3, range 0-23)
pub fn facility_of(priority: u8) -> u8 {
    priority >> 3
}

/// Severity portion of a PRI value (priority & 7, range 0-7)
pub fn severity_of(priority: u8) -> u8 {
    priority & 7
}

/// One `[SD-ID key="value" ...]` group from the wire.
///
/// Parameter order is preserved; a duplicate PARAM-NAME within one element
/// replaces the earlier value (last one wins, per RFC 5424 practice).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdElement {
    pub id: String,
    pub params: Vec<(String, String)>,
}

impl SdElement {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            params: Vec::new(),
        }
    }

    /// Insert a parameter, replacing any earlier value under the same name.
    pub fn set_param(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        if let Some(slot) = self.params.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value;
        } else {
            self.params.push((name, value));
        }
    }
}

/// Structured data of a record: zero or more SD-ELEMENTs in wire order.
///
/// In memory the element list keeps duplicates and ordering exactly as
/// parsed. The canonical stored/JSON form is a mapping SD-ID -> params in
/// first-appearance order; duplicate SD-IDs merge their parameter maps with
/// later elements winning per key.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StructuredData {
    elements: Vec<SdElement>,
}

impl StructuredData {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    #[allow(dead_code)] // Consumed by parser round-trip tests and relay surfaces
    pub fn elements(&self) -> &[SdElement] {
        &self.elements
    }

    pub fn push(&mut self, element: SdElement) {
        self.elements.push(element);
    }

    /// Build the canonical mapping: SD-ID -> { param -> value }.
    pub fn to_map(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut map = serde_json::Map::new();
        for element in &self.elements {
            let entry = map
                .entry(element.id.clone())
                .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
            if let serde_json::Value::Object(params) = entry {
                for (name, value) in &element.params {
                    params.insert(name.clone(), serde_json::Value::String(value.clone()));
                }
            }
        }
        map
    }

    /// Canonical textual encoding stored in the database.
    pub fn to_canonical_json(&self) -> String {
        serde_json::to_string(&self.to_map()).unwrap_or_else(|_| "{}".to_string())
    }

    /// Decode the canonical textual encoding back into elements.
    pub fn from_canonical_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Re-serialise to the RFC5424 wire form, escaping `"`, `\` and `]`
    /// inside parameter values. Empty structured data is the nil value `-`.
    #[allow(dead_code)] // Reserved for relay/forwarding output
    pub fn to_wire(&self) -> String {
        if self.elements.is_empty() {
            return "-".to_string();
        }
        let mut out = String::new();
        for element in &self.elements {
            out.push('[');
            out.push_str(&element.id);
            for (name, value) in &element.params {
                out.push(' ');
                out.push_str(name);
                out.push_str("=\"");
                for ch in value.chars() {
                    match ch {
                        '"' | '\\' | ']' => {
                            out.push('\\');
                            out.push(ch);
                        }
                        _ => out.push(ch),
                    }
                }
                out.push('"');
            }
            out.push(']');
        }
        out
    }
}

// The external JSON shape is the canonical mapping, not the element list.
impl Serialize for StructuredData {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let map = self.to_map();
        let mut out = serializer.serialize_map(Some(map.len()))?;
        for (key, value) in &map {
            out.serialize_entry(key, value)?;
        }
        out.end()
    }
}

impl<'de> Deserialize<'de> for StructuredData {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = serde_json::Map::deserialize(deserializer)?;
        let mut sd = StructuredData::empty();
        for (id, params) in map {
            let mut element = SdElement::new(id);
            if let serde_json::Value::Object(params) = params {
                for (name, value) in params {
                    if let serde_json::Value::String(value) = value {
                        element.set_param(name, value);
                    }
                }
            }
            sd.push(element);
        }
        Ok(sd)
    }
}

/// One parsed syslog message.
///
/// `id` and `created_at` are absent until the batched transaction that
/// persists the record commits; subscribers see the record without them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Monotonically increasing identifier, assigned on durable commit.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub id: Option<i64>,
    /// PRI value 0-191; always facility * 8 + severity.
    pub priority: u8,
    /// Derived facility 0-23, denormalised for index-only filtering.
    pub facility: u8,
    /// Derived severity 0-7 (numerically smaller = more severe).
    pub severity: u8,
    /// RFC5424 version; always 1.
    pub version: u8,
    /// Message timestamp, normalised to UTC at parse time.
    pub timestamp: DateTime<Utc>,
    pub hostname: String,
    pub app_name: String,
    pub proc_id: String,
    pub msg_id: String,
    pub structured_data: StructuredData,
    pub message: String,
    /// Server-assigned commit instant.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl LogRecord {
    /// Fallback record for lenient mode: the raw line is kept as the
    /// message under severity 7 (debug) and app_name "invalid".
    pub fn lenient(raw: &str) -> Self {
        let priority = 15; // facility 1 (user-level), severity 7 (debug)
        Self {
            id: None,
            priority,
            facility: facility_of(priority),
            severity: severity_of(priority),
            version: 1,
            timestamp: Utc::now(),
            hostname: String::new(),
            app_name: "invalid".to_string(),
            proc_id: String::new(),
            msg_id: String::new(),
            structured_data: StructuredData::empty(),
            message: raw.to_string(),
            created_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_decomposition() {
        assert_eq!(facility_of(165), 20);
        assert_eq!(severity_of(165), 5);
        assert_eq!(facility_of(0), 0);
        assert_eq!(severity_of(0), 0);
        assert_eq!(facility_of(191), 23);
        assert_eq!(severity_of(191), 7);
    }

    #[test]
    fn test_canonical_json_preserves_element_order() {
        let mut sd = StructuredData::empty();
        let mut b = SdElement::new("zeta@1");
        b.set_param("k", "1");
        sd.push(b);
        let mut a = SdElement::new("alpha@1");
        a.set_param("k", "2");
        sd.push(a);

        // First-appearance order, not alphabetical
        assert_eq!(
            sd.to_canonical_json(),
            r#"{"zeta@1":{"k":"1"},"alpha@1":{"k":"2"}}"#
        );
    }

    #[test]
    fn test_duplicate_sd_id_merges_later_wins() {
        let mut sd = StructuredData::empty();
        let mut first = SdElement::new("ex@1");
        first.set_param("a", "1");
        first.set_param("b", "1");
        sd.push(first);
        let mut second = SdElement::new("ex@1");
        second.set_param("b", "2");
        sd.push(second);

        assert_eq!(sd.elements().len(), 2, "elements stay separate in memory");
        assert_eq!(sd.to_canonical_json(), r#"{"ex@1":{"a":"1","b":"2"}}"#);
    }

    #[test]
    fn test_wire_round_trip_escapes_again() {
        let mut sd = StructuredData::empty();
        let mut element = SdElement::new("ex@32473");
        element.set_param("quote", "say \"hi\"");
        element.set_param("bracket", "a]b");
        sd.push(element);

        assert_eq!(
            sd.to_wire(),
            r#"[ex@32473 quote="say \"hi\"" bracket="a\]b"]"#
        );
    }

    #[test]
    fn test_canonical_json_round_trip() {
        let mut sd = StructuredData::empty();
        let mut element = SdElement::new("ex@32473");
        element.set_param("iut", "3");
        element.set_param("eventID", "1011");
        sd.push(element);

        let text = sd.to_canonical_json();
        let back = StructuredData::from_canonical_json(&text).unwrap();
        assert_eq!(back, sd);
    }

    #[test]
    fn test_lenient_record_shape() {
        let record = LogRecord::lenient("not a syslog line");
        assert_eq!(record.severity, 7);
        assert_eq!(record.app_name, "invalid");
        assert_eq!(record.message, "not a syslog line");
        assert_eq!(record.priority, record.facility * 8 + record.severity);
    }
}
