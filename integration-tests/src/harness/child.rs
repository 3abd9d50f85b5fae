use lookaside_core::balancer::{
    ChildPolicyBuilder, ChildPolicyConfig, ConnectivityState, LbPolicy, PickArgs, PickResult,
    Picker, PolicyHelper, PolicyUpdate, config_downcast,
};
use lookaside_core::status::Status;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::harness::NamedSubchannel;

/// Field the policy writes each wrapper's target into.
pub const TARGET_FIELD: &str = "serviceName";

/// Shared view over every stub child the policy has created.
///
/// Children register their helper here on first update, so tests can push
/// arbitrary connectivity states through them, and every delegated pick is
/// recorded by target.
#[derive(Default)]
pub struct ChildControl {
    helpers: Mutex<HashMap<String, Arc<dyn PolicyHelper>>>,
    picks: Mutex<Vec<String>>,
}

impl ChildControl {
    pub fn new() -> Arc<Self> {
        Arc::new(ChildControl::default())
    }

    pub fn has_child(&self, target: &str) -> bool {
        self.helpers.lock().unwrap().contains_key(target)
    }

    pub fn publish(self: &Arc<Self>, target: &str, state: ConnectivityState) {
        let helper = self
            .helpers
            .lock()
            .unwrap()
            .get(target)
            .cloned()
            .unwrap_or_else(|| panic!("no child built for target {target}"));
        let status = if state == ConnectivityState::TransientFailure {
            Status::unavailable("forced by test")
        } else {
            Status::ok()
        };
        let picker = Arc::new(RecordingPicker {
            target: target.to_string(),
            control: self.clone(),
        });
        helper.update_state(state, status, picker);
    }

    pub fn take_picks(&self) -> Vec<String> {
        std::mem::take(&mut self.picks.lock().unwrap())
    }
}

struct RecordingPicker {
    target: String,
    control: Arc<ChildControl>,
}

impl Picker for RecordingPicker {
    fn pick(&self, _args: &mut PickArgs<'_>) -> PickResult {
        self.control
            .picks
            .lock()
            .unwrap()
            .push(self.target.clone());
        PickResult::Pick(Arc::new(NamedSubchannel {
            address: self.target.clone(),
        }))
    }
}

#[derive(Debug)]
struct RecordingChildConfig {
    target: String,
}

impl ChildPolicyConfig for RecordingChildConfig {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct RecordingChildBuilder {
    control: Arc<ChildControl>,
}

impl RecordingChildBuilder {
    pub fn new(control: Arc<ChildControl>) -> Arc<Self> {
        Arc::new(RecordingChildBuilder { control })
    }
}

impl ChildPolicyBuilder for RecordingChildBuilder {
    fn name(&self) -> &'static str {
        "recording_child"
    }

    fn parse_config(
        &self,
        config: &serde_json::Value,
    ) -> Result<Arc<dyn ChildPolicyConfig>, Status> {
        let target = config
            .get(TARGET_FIELD)
            .and_then(|t| t.as_str())
            .ok_or_else(|| Status::invalid_argument("missing serviceName"))?;
        Ok(Arc::new(RecordingChildConfig {
            target: target.to_string(),
        }))
    }

    fn build(&self, helper: Arc<dyn PolicyHelper>) -> Box<dyn LbPolicy> {
        Box::new(RecordingChild {
            helper,
            control: self.control.clone(),
        })
    }
}

/// Stub delegate: reports READY for its configured target immediately.
struct RecordingChild {
    helper: Arc<dyn PolicyHelper>,
    control: Arc<ChildControl>,
}

impl LbPolicy for RecordingChild {
    fn update(&mut self, update: PolicyUpdate) -> Result<(), Status> {
        let Some(config) = config_downcast::<RecordingChildConfig>(update.config.as_ref()) else {
            return Err(Status::internal("unexpected config type"));
        };
        self.control
            .helpers
            .lock()
            .unwrap()
            .insert(config.target.clone(), self.helper.clone());
        let picker = Arc::new(RecordingPicker {
            target: config.target.clone(),
            control: self.control.clone(),
        });
        self.helper
            .update_state(ConnectivityState::Ready, Status::ok(), picker);
        Ok(())
    }
}
