//! Field mapping from the source schema to canonical record fields.
//!
//! A [`FieldMapping`] is an ordered list of `source → target` rules fixed at
//! start-up. Mapping a source entry copies every present source key to its
//! canonical name; absent keys are silently omitted, so partial records are
//! normal and not an error.
//!
//! The rule order is significant: it is the column order used when the
//! consolidated dataset is written out.
//!
//! # Examples
//!
//! ```rust
//! use ingest::{FieldMapping, FieldRule};
//! use serde_json::json;
//!
//! let mapping = FieldMapping::new(vec![
//!     FieldRule::new("codigo", "vehicle_id"),
//!     FieldRule::new("linha", "line"),
//! ]);
//!
//! let mapped = mapping.map_entry(&json!({"codigo": "B1", "extra": 1})).unwrap();
//! assert_eq!(mapped.get("vehicle_id"), Some(&json!("B1")));
//! assert!(mapped.get("line").is_none());
//! assert!(mapped.get("extra").is_none());
//! ```
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One `source field → canonical field` rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRule {
    pub source: String,
    pub target: String,
}

impl FieldRule {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

/// Ordered, immutable mapping from source field names to canonical names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldMapping {
    rules: Vec<FieldRule>,
}

impl FieldMapping {
    pub fn new(rules: Vec<FieldRule>) -> Self {
        Self { rules }
    }

    /// Mapping for the Rio de Janeiro BRT GPS feed.
    pub fn brt_gps() -> Self {
        const RULES: &[(&str, &str)] = &[
            ("codigo", "vehicle_id"),
            ("linha", "line"),
            ("latitude", "latitude"),
            ("longitude", "longitude"),
            ("dataHora", "gps_timestamp"),
            ("velocidade", "speed"),
            ("sentido", "direction"),
            ("trajeto", "route_name"),
            ("placa", "plate"),
            ("direcao", "heading"),
            ("ignicao", "ignition"),
            ("hodometro", "odometer"),
            ("capacidadePeVeiculo", "standing_capacity"),
            ("capacidadeSentadoVeiculo", "seated_capacity"),
            ("id_migracao_trajeto", "route_migration_id"),
        ];
        Self::new(
            RULES
                .iter()
                .map(|(source, target)| FieldRule::new(*source, *target))
                .collect(),
        )
    }

    pub fn rules(&self) -> &[FieldRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Canonical field names in rule order.
    pub fn targets(&self) -> impl Iterator<Item = &str> + '_ {
        self.rules.iter().map(|rule| rule.target.as_str())
    }

    pub fn has_target(&self, target: &str) -> bool {
        self.targets().any(|t| t == target)
    }

    /// First canonical name that appears in more than one rule, if any.
    pub fn duplicate_target(&self) -> Option<&str> {
        self.rules.iter().enumerate().find_map(|(idx, rule)| {
            self.rules[..idx]
                .iter()
                .any(|earlier| earlier.target == rule.target)
                .then_some(rule.target.as_str())
        })
    }

    /// Map one source entry to canonical fields.
    ///
    /// Returns `None` when the entry is not a JSON object or when none of the
    /// mapped source keys are present; callers skip such entries.
    pub fn map_entry(&self, entry: &Value) -> Option<Map<String, Value>> {
        let object = entry.as_object()?;
        let mut mapped = Map::new();
        for rule in &self.rules {
            if let Some(value) = object.get(&rule.source) {
                mapped.insert(rule.target.clone(), value.clone());
            }
        }
        (!mapped.is_empty()).then_some(mapped)
    }
}

impl Default for FieldMapping {
    fn default() -> Self {
        Self::brt_gps()
    }
}

impl FromIterator<FieldRule> for FieldMapping {
    fn from_iter<I: IntoIterator<Item = FieldRule>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mapping() -> FieldMapping {
        FieldMapping::new(vec![
            FieldRule::new("codigo", "vehicle_id"),
            FieldRule::new("dataHora", "gps_timestamp"),
            FieldRule::new("velocidade", "speed"),
        ])
    }

    #[test]
    fn copies_present_fields_only() {
        let entry = json!({"codigo": "B-10", "velocidade": 33, "ignored": "x"});
        let mapped = mapping().map_entry(&entry).expect("entry maps");
        assert_eq!(mapped.len(), 2);
        assert_eq!(mapped["vehicle_id"], json!("B-10"));
        assert_eq!(mapped["speed"], json!(33));
        assert!(!mapped.contains_key("gps_timestamp"));
    }

    #[test]
    fn null_values_are_copied_as_present() {
        let mapped = mapping()
            .map_entry(&json!({"codigo": null}))
            .expect("present key maps even when null");
        assert_eq!(mapped["vehicle_id"], Value::Null);
    }

    #[test]
    fn unmapped_or_non_object_entries_are_skipped() {
        assert!(mapping().map_entry(&json!({"other": 1})).is_none());
        assert!(mapping().map_entry(&json!("codigo")).is_none());
        assert!(mapping().map_entry(&json!([1, 2])).is_none());
    }

    #[test]
    fn mapping_is_idempotent() {
        let entry = json!({"codigo": 7, "dataHora": 1_700_000_000_000_i64, "velocidade": 0});
        let m = mapping();
        assert_eq!(m.map_entry(&entry), m.map_entry(&entry));
    }

    #[test]
    fn duplicate_target_detected() {
        let m = FieldMapping::new(vec![
            FieldRule::new("a", "x"),
            FieldRule::new("b", "y"),
            FieldRule::new("c", "x"),
        ]);
        assert_eq!(m.duplicate_target(), Some("x"));
        assert_eq!(mapping().duplicate_target(), None);
    }

    #[test]
    fn brt_mapping_keeps_rule_order() {
        let m = FieldMapping::brt_gps();
        let targets: Vec<&str> = m.targets().take(3).collect();
        assert_eq!(targets, ["vehicle_id", "line", "latitude"]);
        assert!(m.has_target("gps_timestamp"));
    }

    #[test]
    fn deserializes_from_rule_list() {
        let m: FieldMapping = serde_json::from_value(json!([
            {"source": "codigo", "target": "vehicle_id"}
        ]))
        .expect("rule list deserializes");
        assert_eq!(m.rules(), &[FieldRule::new("codigo", "vehicle_id")]);
    }
}
