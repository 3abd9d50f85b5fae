use crate::balancer::ChildPolicyRegistry;
use crate::conf::error::ConfigError;
use crate::conf::parse::parse_duration;
use crate::conf::types::{
    ChildPolicyChoice, RawKeyBuilder, RawPolicyConfig, RawRouteLookupConfig, RlsConfig,
    RouteLookupSettings,
};
use crate::keys::{KeyBuilder, KeyBuilderMap};
use std::collections::HashSet;
use std::time::Duration;

pub const DEFAULT_LOOKUP_SERVICE_TIMEOUT: Duration = Duration::from_secs(10);
pub const MAX_MAX_AGE: Duration = Duration::from_secs(5 * 60);
pub const MAX_CACHE_SIZE_BYTES: usize = 5 * 1024 * 1024;

/// Target value substituted when validating the child policy config before
/// any real target is known.
const PLACEHOLDER_TARGET: &str = "placeholder_target";

pub(crate) fn validate_config(
    raw: RawPolicyConfig,
    registry: &ChildPolicyRegistry,
) -> Result<RlsConfig, ConfigError> {
    let mut errors = Vec::new();

    let route_lookup = match raw.route_lookup_config {
        Some(rl) => validate_route_lookup(rl),
        None => Err(ConfigError::field("routeLookupConfig", "does not exist")),
    };

    if let Some(sc) = &raw.route_lookup_channel_service_config
        && !sc.is_object()
    {
        errors.push(ConfigError::field(
            "routeLookupChannelServiceConfig",
            "type should be OBJECT",
        ));
    }

    let target_field = match raw.child_policy_config_target_field_name {
        Some(name) if !name.is_empty() => Ok(name),
        Some(_) => Err(ConfigError::field(
            "childPolicyConfigTargetFieldName",
            "must be non-empty",
        )),
        None => Err(ConfigError::field(
            "childPolicyConfigTargetFieldName",
            "does not exist",
        )),
    };

    let default_target = route_lookup
        .as_ref()
        .ok()
        .and_then(|rl| rl.default_target.as_deref());
    let child_policy = match (&raw.child_policy, &target_field) {
        (Some(list), Ok(field)) => {
            validate_child_policy(list, field, default_target, registry).map(Some)
        }
        (Some(_), Err(_)) => Ok(None),
        (None, _) => Err(ConfigError::field("childPolicy", "does not exist")),
    };

    match (route_lookup, target_field, child_policy) {
        (Ok(route_lookup), Ok(child_policy_target_field), Ok(Some(child_policy)))
            if errors.is_empty() =>
        {
            Ok(RlsConfig {
                route_lookup,
                rls_channel_service_config: raw.route_lookup_channel_service_config,
                child_policy_target_field,
                child_policy,
            })
        }
        (route_lookup, target_field, child_policy) => {
            errors.extend(route_lookup.err());
            errors.extend(target_field.err());
            errors.extend(child_policy.err());
            ConfigError::from_list(errors)?;
            // All parts validated individually but the combination was
            // rejected above, which only happens with a pending error.
            Err(ConfigError::field("childPolicy", "validation incomplete"))
        }
    }
}

fn validate_route_lookup(raw: RawRouteLookupConfig) -> Result<RouteLookupSettings, ConfigError> {
    let mut errors = Vec::new();

    let mut key_builder_map = KeyBuilderMap::new();
    match raw.grpc_keybuilders {
        None => errors.push(ConfigError::field("grpcKeybuilders", "does not exist")),
        Some(list) if list.is_empty() => {
            errors.push(ConfigError::field("grpcKeybuilders", "list is empty"));
        }
        Some(list) => {
            for (idx, kb) in list.into_iter().enumerate() {
                if let Err(e) = validate_keybuilder(idx, kb, &mut key_builder_map) {
                    errors.push(e);
                }
            }
        }
    }

    let lookup_service = match raw.lookup_service {
        Some(s) if !s.is_empty() => s,
        Some(_) => {
            errors.push(ConfigError::field(
                "lookupService",
                "must be valid lookup service URI",
            ));
            String::new()
        }
        None => {
            errors.push(ConfigError::field("lookupService", "does not exist"));
            String::new()
        }
    };

    let lookup_service_timeout = match &raw.lookup_service_timeout {
        Some(s) => match parse_duration(s, "lookupServiceTimeout") {
            Ok(d) => d,
            Err(e) => {
                errors.push(e);
                DEFAULT_LOOKUP_SERVICE_TIMEOUT
            }
        },
        None => DEFAULT_LOOKUP_SERVICE_TIMEOUT,
    };

    let max_age_set = raw.max_age.is_some();
    let mut max_age = MAX_MAX_AGE;
    if let Some(s) = &raw.max_age {
        match parse_duration(s, "maxAge") {
            Ok(d) => max_age = d,
            Err(e) => errors.push(e),
        }
    }
    max_age = max_age.min(MAX_MAX_AGE);

    let stale_age_set = raw.stale_age.is_some();
    let mut stale_age = MAX_MAX_AGE;
    if let Some(s) = &raw.stale_age {
        match parse_duration(s, "staleAge") {
            Ok(d) => stale_age = d,
            Err(e) => errors.push(e),
        }
    }
    if stale_age_set && !max_age_set {
        errors.push(ConfigError::field(
            "maxAge",
            "must be set if staleAge is set",
        ));
    }
    // A stale age at or past the max age disables the stale window.
    stale_age = stale_age.min(max_age);

    let cache_size_bytes = match raw.cache_size_bytes {
        None => {
            errors.push(ConfigError::field("cacheSizeBytes", "does not exist"));
            0
        }
        Some(v) if v <= 0 => {
            errors.push(ConfigError::field(
                "cacheSizeBytes",
                "must be greater than 0",
            ));
            0
        }
        Some(v) => (v as usize).min(MAX_CACHE_SIZE_BYTES),
    };

    let default_target = match raw.default_target {
        Some(s) if s.is_empty() => {
            errors.push(ConfigError::field(
                "defaultTarget",
                "must be non-empty if set",
            ));
            None
        }
        other => other,
    };

    ConfigError::from_list(errors)?;
    Ok(RouteLookupSettings {
        key_builder_map,
        lookup_service,
        lookup_service_timeout,
        max_age,
        stale_age,
        cache_size_bytes,
        default_target,
    })
}

fn validate_keybuilder(
    idx: usize,
    raw: RawKeyBuilder,
    key_builder_map: &mut KeyBuilderMap,
) -> Result<(), ConfigError> {
    let mut errors = Vec::new();
    let prefix = format!("grpcKeybuilders[{idx}]");

    // Each name becomes a path key: "/service/method", or "/service/" when
    // no method is given (a service-wide wildcard).
    let mut paths = Vec::new();
    match &raw.names {
        None => errors.push(ConfigError::field(format!("{prefix}.names"), "does not exist")),
        Some(names) if names.is_empty() => {
            errors.push(ConfigError::field(format!("{prefix}.names"), "list is empty"));
        }
        Some(names) => {
            let mut seen = HashSet::new();
            for (nidx, name) in names.iter().enumerate() {
                match name.service.as_deref() {
                    Some(service) if !service.is_empty() => {
                        let path = match name.method.as_deref() {
                            Some(method) if !method.is_empty() => format!("/{service}/{method}"),
                            _ => format!("/{service}/"),
                        };
                        if seen.insert(path.clone()) {
                            paths.push(path);
                        } else {
                            errors.push(ConfigError::field(
                                format!("{prefix}.names"),
                                format!("duplicate entry for {path}"),
                            ));
                        }
                    }
                    _ => errors.push(ConfigError::field(
                        format!("{prefix}.names[{nidx}].service"),
                        "must be non-empty",
                    )),
                }
            }
        }
    }

    let mut all_keys: HashSet<String> = HashSet::new();
    let mut claim_key = |key: &str, errors: &mut Vec<ConfigError>| {
        if !all_keys.insert(key.to_string()) {
            errors.push(ConfigError::field(
                prefix.clone(),
                format!("key \"{key}\" listed multiple times"),
            ));
        }
    };

    let mut builder = KeyBuilder::default();
    if let Some(headers) = raw.headers {
        for (hidx, header) in headers.into_iter().enumerate() {
            let hprefix = format!("{prefix}.headers[{hidx}]");
            if header.required_match.is_some() {
                errors.push(ConfigError::field(
                    format!("{hprefix}.requiredMatch"),
                    "must not be present",
                ));
            }
            let key = match header.key {
                Some(k) if !k.is_empty() => Some(k),
                Some(_) => {
                    errors.push(ConfigError::field(
                        format!("{hprefix}.key"),
                        "must be non-empty",
                    ));
                    None
                }
                None => {
                    errors.push(ConfigError::field(format!("{hprefix}.key"), "does not exist"));
                    None
                }
            };
            let names = match header.names {
                None => {
                    errors.push(ConfigError::field(
                        format!("{hprefix}.names"),
                        "does not exist",
                    ));
                    Vec::new()
                }
                Some(ns) if ns.is_empty() => {
                    errors.push(ConfigError::field(format!("{hprefix}.names"), "list is empty"));
                    Vec::new()
                }
                Some(ns) => {
                    for (i, n) in ns.iter().enumerate() {
                        if n.is_empty() {
                            errors.push(ConfigError::field(
                                format!("{hprefix}.names[{i}]"),
                                "header name must be non-empty",
                            ));
                        }
                    }
                    ns.into_iter().filter(|n| !n.is_empty()).collect()
                }
            };
            if let Some(key) = key {
                claim_key(&key, &mut errors);
                builder.header_keys.push((key, names));
            }
        }
    }

    if let Some(extra) = raw.extra_keys {
        let slots = [
            ("host", extra.host, &mut builder.host_key),
            ("service", extra.service, &mut builder.service_key),
            ("method", extra.method, &mut builder.method_key),
        ];
        for (field, value, slot) in slots {
            match value {
                Some(v) if v.is_empty() => errors.push(ConfigError::field(
                    format!("{prefix}.extraKeys.{field}"),
                    "must be non-empty",
                )),
                Some(v) => {
                    claim_key(&v, &mut errors);
                    *slot = Some(v);
                }
                None => {}
            }
        }
    }

    if let Some(constants) = raw.constant_keys {
        for (key, value) in constants {
            if key.is_empty() {
                errors.push(ConfigError::field(
                    format!("{prefix}.constantKeys"),
                    "keys must be non-empty",
                ));
                continue;
            }
            claim_key(&key, &mut errors);
            builder.constant_keys.insert(key, value);
        }
    }

    for path in paths {
        if !key_builder_map.insert(path.clone(), builder.clone()) {
            errors.push(ConfigError::field(
                format!("{prefix}.names"),
                format!("duplicate entry for {path}"),
            ));
        }
    }

    ConfigError::from_list(errors)
}

fn validate_child_policy(
    list: &[serde_json::Value],
    target_field: &str,
    default_target: Option<&str>,
    registry: &ChildPolicyRegistry,
) -> Result<ChildPolicyChoice, ConfigError> {
    let mut errors = Vec::new();
    let mut candidates = Vec::new();
    for (idx, item) in list.iter().enumerate() {
        let field = format!("childPolicy[{idx}]");
        let Some(obj) = item.as_object() else {
            errors.push(ConfigError::field(field, "child policy item is not an object"));
            continue;
        };
        if obj.len() != 1 {
            errors.push(ConfigError::field(
                field,
                "child policy item contains more than one field",
            ));
            continue;
        }
        if let Some((name, config)) = obj.iter().next() {
            if config.is_object() {
                candidates.push((name.clone(), config.clone()));
            } else {
                errors.push(ConfigError::field(
                    field,
                    "child policy item config is not an object",
                ));
            }
        }
    }
    ConfigError::from_list(errors)?;

    let Some((builder, template)) = registry.select(&candidates) else {
        return Err(ConfigError::field("childPolicy", "no supported policy found"));
    };

    // Validate the chosen config by substituting the default target, or a
    // placeholder when none is configured.
    let mut probe = template.clone();
    if let Some(obj) = probe.as_object_mut() {
        obj.insert(
            target_field.to_string(),
            serde_json::Value::String(default_target.unwrap_or(PLACEHOLDER_TARGET).to_string()),
        );
    }
    builder.parse_config(&probe).map_err(|status| {
        ConfigError::field(
            "childPolicy",
            format!("invalid config for policy {}: {status}", builder.name()),
        )
    })?;

    Ok(ChildPolicyChoice {
        name: builder.name().to_string(),
        template: template.clone(),
    })
}
