//! Request keys and the builders that derive them from call attributes.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::mem;

mod builder;

pub use builder::{KeyBuilder, KeyBuilderMap};

/// The cache and request-map key for one route lookup.
///
/// An ordered map of key/value strings; ordering makes hashing and display
/// canonical. Immutable once built.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct RequestKey {
    key_map: BTreeMap<String, String>,
}

impl RequestKey {
    pub fn new(key_map: BTreeMap<String, String>) -> Self {
        RequestKey { key_map }
    }

    pub fn is_empty(&self) -> bool {
        self.key_map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.key_map.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn key_map(&self) -> &BTreeMap<String, String> {
        &self.key_map
    }

    /// Bytes attributed to this key for cache accounting.
    pub fn size(&self) -> usize {
        let strings: usize = self
            .key_map
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum();
        mem::size_of::<RequestKey>() + strings
    }
}

impl Display for RequestKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        for (i, (k, v)) in self.key_map.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{k}={v}")?;
        }
        write!(f, "}}")
    }
}

impl FromIterator<(String, String)> for RequestKey {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        RequestKey {
            key_map: iter.into_iter().collect(),
        }
    }
}
