use crate::keys::KeyBuilderMap;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Validated policy configuration.
#[derive(Debug, Clone)]
pub struct RlsConfig {
    pub route_lookup: RouteLookupSettings,
    /// Opaque service config handed to the lookup channel, if any.
    pub rls_channel_service_config: Option<serde_json::Value>,
    /// Name of the field inside the child policy config that receives the
    /// target string.
    pub child_policy_target_field: String,
    /// The child policy selected from the candidate list.
    pub child_policy: ChildPolicyChoice,
}

#[derive(Debug, Clone)]
pub struct RouteLookupSettings {
    pub key_builder_map: KeyBuilderMap,
    pub lookup_service: String,
    pub lookup_service_timeout: Duration,
    pub max_age: Duration,
    pub stale_age: Duration,
    pub cache_size_bytes: usize,
    pub default_target: Option<String>,
}

/// The chosen child policy name plus its config template. Per-target configs
/// are derived from the template by setting the target field.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildPolicyChoice {
    pub name: String,
    pub template: serde_json::Value,
}

// Raw JSON shapes. Every field is optional here; required-field and semantic
// checks happen in validation so errors can carry precise field paths.

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawPolicyConfig {
    pub route_lookup_config: Option<RawRouteLookupConfig>,
    pub route_lookup_channel_service_config: Option<serde_json::Value>,
    pub child_policy_config_target_field_name: Option<String>,
    pub child_policy: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawRouteLookupConfig {
    pub grpc_keybuilders: Option<Vec<RawKeyBuilder>>,
    pub lookup_service: Option<String>,
    pub lookup_service_timeout: Option<String>,
    pub max_age: Option<String>,
    pub stale_age: Option<String>,
    pub cache_size_bytes: Option<i64>,
    pub default_target: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawKeyBuilder {
    pub names: Option<Vec<RawName>>,
    pub headers: Option<Vec<RawHeader>>,
    pub extra_keys: Option<RawExtraKeys>,
    pub constant_keys: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawName {
    pub service: Option<String>,
    pub method: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawHeader {
    pub key: Option<String>,
    pub names: Option<Vec<String>>,
    pub required_match: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawExtraKeys {
    pub host: Option<String>,
    pub service: Option<String>,
    pub method: Option<String>,
}
