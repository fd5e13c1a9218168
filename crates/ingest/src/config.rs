//! Configuration types for snapshot normalization.
//!
//! [`IngestConfig`] controls how a raw snapshot is located inside the source
//! payload, which fields are copied, which canonical fields form the identity
//! key, and which timezone GPS timestamps are rendered in. It is cheap to clone
//! and deserializes from any serde format.
//!
//! # Quick Start
//!
//! ```rust
//! use ingest::IngestConfig;
//!
//! let config = IngestConfig::default();
//! config.validate().expect("default configuration is valid");
//! assert_eq!(config.target_timezone, chrono_tz::America::Sao_Paulo);
//! ```
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mapping::FieldMapping;

/// Column appended to every published record with the poll's capture time.
/// No mapping rule may produce a field of the same name.
pub const CAPTURE_TIMESTAMP_FIELD: &str = "capture_timestamp";

/// Runtime configuration for normalization.
///
/// # Serialization
///
/// ```yaml
/// entries_key: veiculos
/// vehicle_id_field: vehicle_id
/// gps_timestamp_field: gps_timestamp
/// target_timezone: America/Sao_Paulo
/// field_mapping:
///   - { source: codigo, target: vehicle_id }
///   - { source: dataHora, target: gps_timestamp }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Ordered source → canonical field rules.
    ///
    /// Default: [`FieldMapping::brt_gps`]
    #[serde(default)]
    pub field_mapping: FieldMapping,

    /// Key under which the entry array is nested when the payload is an object.
    ///
    /// A bare array payload is always accepted regardless of this setting.
    ///
    /// Default: `Some("veiculos")`
    #[serde(default = "default_entries_key")]
    pub entries_key: Option<String>,

    /// Canonical field holding the vehicle identifier (identity key, part 1).
    ///
    /// Default: `"vehicle_id"`
    #[serde(default = "default_vehicle_id_field")]
    pub vehicle_id_field: String,

    /// Canonical field holding the GPS fix time as epoch milliseconds
    /// (identity key, part 2).
    ///
    /// Default: `"gps_timestamp"`
    #[serde(default = "default_gps_timestamp_field")]
    pub gps_timestamp_field: String,

    /// Timezone GPS timestamps are converted to after being read as UTC.
    ///
    /// Default: `America/Sao_Paulo`
    #[serde(default = "default_target_timezone")]
    pub target_timezone: Tz,
}

/// Errors that can occur when validating an [`IngestConfig`].
///
/// These are start-up issues: a process must not begin polling with an
/// invalid mapping.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("field mapping is empty; at least one rule is required")]
    EmptyMapping,

    #[error("canonical field '{0}' is the target of more than one mapping rule")]
    DuplicateTarget(String),

    /// An identity-key field is not produced by any mapping rule, so every
    /// record would share the same key component.
    #[error("identity field '{field}' is not a target of the field mapping")]
    UnmappedIdentityField { field: String },

    #[error("canonical field '{0}' is reserved for the capture timestamp")]
    ReservedTarget(String),
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            field_mapping: FieldMapping::default(),
            entries_key: default_entries_key(),
            vehicle_id_field: default_vehicle_id_field(),
            gps_timestamp_field: default_gps_timestamp_field(),
            target_timezone: default_target_timezone(),
        }
    }
}

impl IngestConfig {
    /// Validates internal consistency of this configuration.
    ///
    /// # Validation Rules
    ///
    /// 1. The mapping has at least one rule
    /// 2. No canonical field is targeted twice
    /// 3. Both identity fields are mapping targets
    /// 4. No rule targets [`CAPTURE_TIMESTAMP_FIELD`]
    ///
    /// ```rust
    /// use ingest::{ConfigError, FieldMapping, FieldRule, IngestConfig};
    ///
    /// let config = IngestConfig {
    ///     field_mapping: FieldMapping::new(vec![FieldRule::new("codigo", "vehicle_id")]),
    ///     ..Default::default()
    /// };
    /// assert!(matches!(
    ///     config.validate(),
    ///     Err(ConfigError::UnmappedIdentityField { .. })
    /// ));
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.field_mapping.is_empty() {
            return Err(ConfigError::EmptyMapping);
        }

        if let Some(target) = self.field_mapping.duplicate_target() {
            return Err(ConfigError::DuplicateTarget(target.to_string()));
        }

        if self.field_mapping.has_target(CAPTURE_TIMESTAMP_FIELD) {
            return Err(ConfigError::ReservedTarget(
                CAPTURE_TIMESTAMP_FIELD.to_string(),
            ));
        }

        for field in [&self.vehicle_id_field, &self.gps_timestamp_field] {
            if !self.field_mapping.has_target(field) {
                return Err(ConfigError::UnmappedIdentityField {
                    field: field.clone(),
                });
            }
        }

        Ok(())
    }
}

fn default_entries_key() -> Option<String> {
    Some("veiculos".to_string())
}

fn default_vehicle_id_field() -> String {
    "vehicle_id".to_string()
}

fn default_gps_timestamp_field() -> String {
    "gps_timestamp".to_string()
}

fn default_target_timezone() -> Tz {
    chrono_tz::America::Sao_Paulo
}
