//! Policy configuration: JSON shapes, parsing and validation.

mod error;
mod parse;
mod types;
mod validate;

pub use error::ConfigError;
pub use parse::parse_config;
pub use types::{ChildPolicyChoice, RlsConfig, RouteLookupSettings};
pub use validate::{DEFAULT_LOOKUP_SERVICE_TIMEOUT, MAX_CACHE_SIZE_BYTES, MAX_MAX_AGE};
