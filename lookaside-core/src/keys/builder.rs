use crate::keys::RequestKey;
use crate::metadata::MetadataView;
use crate::status::Status;
use std::collections::{BTreeMap, HashMap};

/// Key extraction rules for one path (or service prefix).
#[derive(Debug, Clone, Default)]
pub struct KeyBuilder {
    /// `output_key -> header names`; the first header present wins.
    pub header_keys: Vec<(String, Vec<String>)>,
    /// Constant key/value pairs added to every key.
    pub constant_keys: BTreeMap<String, String>,
    /// Key receiving the call authority, if set.
    pub host_key: Option<String>,
    /// Key receiving the service part of the path, if set.
    pub service_key: Option<String>,
    /// Key receiving the method part of the path, if set.
    pub method_key: Option<String>,
}

/// Key builders indexed by exact path (`/service/method`) or service prefix
/// (`/service/`).
#[derive(Debug, Clone, Default)]
pub struct KeyBuilderMap {
    map: HashMap<String, KeyBuilder>,
}

impl KeyBuilderMap {
    pub fn new() -> Self {
        KeyBuilderMap::default()
    }

    /// Inserts a builder for `path`. Returns false if the path was already
    /// claimed by another builder.
    pub fn insert(&mut self, path: impl Into<String>, builder: KeyBuilder) -> bool {
        use std::collections::hash_map::Entry;
        match self.map.entry(path.into()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(builder);
                true
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Derives the request key for a call.
    ///
    /// Exact path match wins; otherwise the `/service/` prefix is tried.
    /// `None` means no builder claims this path at all — no lookup applies
    /// and the caller falls through to its default-target handling. Fails
    /// only on a malformed path.
    pub fn build_key(
        &self,
        path: &str,
        authority: &str,
        metadata: &dyn MetadataView,
    ) -> Result<Option<RequestKey>, Status> {
        let last_slash = path
            .rfind('/')
            .ok_or_else(|| Status::invalid_argument(format!("malformed call path: {path}")))?;

        let builder = match self.map.get(path) {
            Some(b) => b,
            None => match self.map.get(&path[..=last_slash]) {
                Some(b) => b,
                None => return Ok(None),
            },
        };

        let mut key_map = BTreeMap::new();
        for (output_key, header_names) in &builder.header_keys {
            for name in header_names {
                if let Some(value) = metadata.get(name) {
                    key_map.insert(output_key.clone(), value.to_string());
                    break;
                }
            }
        }
        for (k, v) in &builder.constant_keys {
            key_map.entry(k.clone()).or_insert_with(|| v.clone());
        }
        if let Some(host_key) = &builder.host_key {
            key_map.insert(host_key.clone(), authority.to_string());
        }
        if let Some(service_key) = &builder.service_key {
            key_map.insert(service_key.clone(), path[1..last_slash].to_string());
        }
        if let Some(method_key) = &builder.method_key {
            key_map.insert(method_key.clone(), path[last_slash + 1..].to_string());
        }
        Ok(Some(RequestKey::new(key_map)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Metadata;

    fn map_with(path: &str, builder: KeyBuilder) -> KeyBuilderMap {
        let mut map = KeyBuilderMap::new();
        assert!(map.insert(path, builder));
        map
    }

    fn key_of(map: &KeyBuilderMap, path: &str, authority: &str, md: &Metadata) -> RequestKey {
        match map.build_key(path, authority, md) {
            Ok(Some(key)) => key,
            other => panic!("expected a key, got {other:?}"),
        }
    }

    #[test]
    fn exact_path_beats_service_prefix() {
        let mut map = KeyBuilderMap::new();
        map.insert(
            "/pkg.Svc/Method",
            KeyBuilder {
                constant_keys: BTreeMap::from([("which".into(), "exact".into())]),
                ..Default::default()
            },
        );
        map.insert(
            "/pkg.Svc/",
            KeyBuilder {
                constant_keys: BTreeMap::from([("which".into(), "prefix".into())]),
                ..Default::default()
            },
        );

        let md = Metadata::new();
        let key = key_of(&map, "/pkg.Svc/Method", "a", &md);
        assert_eq!(key.key_map().get("which").map(String::as_str), Some("exact"));

        let key = key_of(&map, "/pkg.Svc/Other", "a", &md);
        assert_eq!(key.key_map().get("which").map(String::as_str), Some("prefix"));
    }

    #[test]
    fn unknown_path_yields_no_key() {
        let map = map_with("/pkg.Svc/Method", KeyBuilder::default());
        let md = Metadata::new();
        assert_eq!(map.build_key("/other.Svc/M", "a", &md).unwrap(), None);
    }

    #[test]
    fn malformed_path_is_an_error() {
        let map = map_with("/pkg.Svc/Method", KeyBuilder::default());
        let md = Metadata::new();
        assert!(map.build_key("no-slashes", "a", &md).is_err());
    }

    #[test]
    fn first_present_header_wins() {
        let builder = KeyBuilder {
            header_keys: vec![(
                "out".into(),
                vec!["h1".into(), "h2".into(), "h3".into()],
            )],
            ..Default::default()
        };
        let map = map_with("/pkg.Svc/Method", builder);

        let md = Metadata::from_pairs([("h2", "two"), ("h3", "three")]);
        let key = key_of(&map, "/pkg.Svc/Method", "a", &md);
        assert_eq!(key.key_map().get("out").map(String::as_str), Some("two"));

        // No listed header present: the output key is skipped entirely.
        let md = Metadata::from_pairs([("unrelated", "x")]);
        let key = key_of(&map, "/pkg.Svc/Method", "a", &md);
        assert!(key.is_empty());
    }

    #[test]
    fn extra_keys_capture_host_service_and_method() {
        let builder = KeyBuilder {
            host_key: Some("h".into()),
            service_key: Some("s".into()),
            method_key: Some("m".into()),
            ..Default::default()
        };
        let map = map_with("/pkg.Svc/Method", builder);

        let md = Metadata::new();
        let key = key_of(&map, "/pkg.Svc/Method", "a.example", &md);
        assert_eq!(key.key_map().get("h").map(String::as_str), Some("a.example"));
        assert_eq!(key.key_map().get("s").map(String::as_str), Some("pkg.Svc"));
        assert_eq!(key.key_map().get("m").map(String::as_str), Some("Method"));
    }

    #[test]
    fn same_inputs_build_equal_keys() {
        let builder = KeyBuilder {
            header_keys: vec![("out".into(), vec!["h".into()])],
            constant_keys: BTreeMap::from([("c".into(), "v".into())]),
            host_key: Some("host".into()),
            ..Default::default()
        };
        let map = map_with("/pkg.Svc/Method", builder);
        let md = Metadata::from_pairs([("h", "val")]);

        let a = key_of(&map, "/pkg.Svc/Method", "auth", &md);
        let b = key_of(&map, "/pkg.Svc/Method", "auth", &md);
        assert_eq!(a, b);
    }
}
