use crate::balancer::{LbPolicy, PolicyHelper};
use crate::status::Status;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A validated child policy configuration, produced by the builder that will
/// later consume it. Opaque to this crate.
pub trait ChildPolicyConfig: fmt::Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

/// Factory for one kind of child policy.
pub trait ChildPolicyBuilder: Send + Sync {
    /// The policy name this builder answers to in config.
    fn name(&self) -> &'static str;

    /// Parses and validates a config object for this policy.
    fn parse_config(&self, config: &serde_json::Value) -> Result<Arc<dyn ChildPolicyConfig>, Status>;

    /// Instantiates the policy. The helper is how the new policy publishes
    /// pickers and creates subchannels.
    fn build(&self, helper: Arc<dyn PolicyHelper>) -> Box<dyn LbPolicy>;
}

/// The set of child policies available to a policy instance.
///
/// There is no process-wide registry; each policy is handed one of these at
/// construction time.
#[derive(Clone, Default)]
pub struct ChildPolicyRegistry {
    builders: HashMap<&'static str, Arc<dyn ChildPolicyBuilder>>,
}

impl ChildPolicyRegistry {
    pub fn new() -> Self {
        ChildPolicyRegistry::default()
    }

    pub fn register(&mut self, builder: Arc<dyn ChildPolicyBuilder>) {
        self.builders.insert(builder.name(), builder);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn ChildPolicyBuilder>> {
        self.builders.get(name)
    }

    /// Selects the first candidate whose policy name is registered.
    ///
    /// Candidates are `{name: config}` objects in preference order, the form
    /// used by the `childPolicy` config field.
    pub fn select<'a>(
        &self,
        candidates: &'a [(String, serde_json::Value)],
    ) -> Option<(&Arc<dyn ChildPolicyBuilder>, &'a serde_json::Value)> {
        candidates
            .iter()
            .find_map(|(name, config)| self.get(name).map(|builder| (builder, config)))
    }
}

impl fmt::Debug for ChildPolicyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildPolicyRegistry")
            .field("policies", &self.builders.keys().collect::<Vec<_>>())
            .finish()
    }
}
