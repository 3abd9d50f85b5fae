//! Read and write access to a call's metadata, as seen by the policy.
//!
//! The key builder only needs header lookups; delegated picks additionally
//! append the lookup header data. Header names are matched case-insensitively.

/// Read-only view of a call's metadata.
pub trait MetadataView {
    /// Returns the value of the first entry matching `name`, if any.
    fn get(&self, name: &str) -> Option<&str>;
}

/// Mutable view used on the pick path to append outgoing metadata.
pub trait MetadataMut: MetadataView {
    fn add(&mut self, name: &str, value: &str);
}

/// Simple metadata implementation for callers and tests.
///
/// Names are stored lowercased; insertion order is preserved.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    entries: Vec<(String, String)>,
}

impl Metadata {
    pub fn new() -> Self {
        Metadata::default()
    }

    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut md = Metadata::new();
        for (name, value) in pairs {
            md.add(name, value);
        }
        md
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl MetadataView for Metadata {
    fn get(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }
}

impl MetadataMut for Metadata {
    fn add(&mut self, name: &str, value: &str) {
        self.entries
            .push((name.to_ascii_lowercase(), value.to_string()));
    }
}
