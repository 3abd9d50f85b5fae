use crate::balancer::{
    ChannelArgs, ChildPolicyBuilder, ChildPolicyConfig, ConnectivityState, FailPicker, LbPolicy,
    PickArgs, PickResult, Picker, PolicyHelper, PolicyUpdate, QueuePicker, Subchannel,
};
use crate::rls::policy::PolicyCore;
use crate::status::Status;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Owns the delegated policy for one lookup target.
///
/// There is exactly one live wrapper per target; cache entries and the
/// default-target slot share it. Updates run in two phases: `start_update`
/// validates the templated config under the policy mutex, and
/// `maybe_finish_update` creates and updates the delegate after the mutex is
/// released, because the delegate's `update` calls straight back into the
/// helper.
pub(crate) struct ChildPolicyWrapper {
    target: String,
    core: Weak<PolicyCore>,
    /// Latched connectivity plus the delegate's latest picker.
    state: Mutex<WrapperState>,
    /// Work parked between the two update phases. Leaf lock: never held
    /// across any other acquisition.
    pending: Mutex<Option<PendingUpdate>>,
    /// The delegate itself. Touched only from the serializer.
    delegate: Mutex<Option<Delegate>>,
}

struct WrapperState {
    connectivity: ConnectivityState,
    picker: Arc<dyn Picker>,
}

enum PendingUpdate {
    Update {
        builder: Arc<dyn ChildPolicyBuilder>,
        config: Arc<dyn ChildPolicyConfig>,
    },
    /// Validation failed: drop the delegate once outside the mutex.
    Discard,
}

struct Delegate {
    policy_name: String,
    policy: Box<dyn LbPolicy>,
}

impl ChildPolicyWrapper {
    pub fn new(core: Weak<PolicyCore>, target: String) -> Arc<Self> {
        Arc::new(ChildPolicyWrapper {
            target,
            core,
            state: Mutex::new(WrapperState {
                connectivity: ConnectivityState::Idle,
                picker: Arc::new(QueuePicker),
            }),
            pending: Mutex::new(None),
            delegate: Mutex::new(None),
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn connectivity_state(&self) -> ConnectivityState {
        self.state.lock().connectivity
    }

    pub fn pick(&self, args: &mut PickArgs<'_>) -> PickResult {
        let picker = self.state.lock().picker.clone();
        picker.pick(args)
    }

    /// Phase one: re-derive the per-target config from the template and
    /// validate it. Called with the policy mutex held; must not touch the
    /// delegate beyond parking work for phase two.
    pub fn start_update(&self) {
        let Some(core) = self.core.upgrade() else {
            return;
        };
        let Some(config) = core.config() else {
            return;
        };
        let mut child_config = config.child_policy.template.clone();
        if let Some(obj) = child_config.as_object_mut() {
            obj.insert(
                config.child_policy_target_field.clone(),
                serde_json::Value::String(self.target.clone()),
            );
        }
        let Some(builder) = core.registry.get(&config.child_policy.name) else {
            // The registry validated this name at config parse time.
            warn!(
                event = "child_policy_missing_builder",
                policy = %config.child_policy.name,
            );
            return;
        };
        match builder.parse_config(&child_config) {
            Ok(parsed) => {
                *self.pending.lock() = Some(PendingUpdate::Update {
                    builder: builder.clone(),
                    config: parsed,
                });
            }
            Err(status) => {
                warn!(
                    event = "child_config_invalid",
                    target = %self.target,
                    error = %status,
                );
                *self.pending.lock() = Some(PendingUpdate::Discard);
                self.state.lock().picker = Arc::new(FailPicker::new(status));
            }
        }
    }

    /// Phase two: apply the parked work. Called on the serializer with the
    /// policy mutex released.
    pub fn maybe_finish_update(self: &Arc<Self>) {
        let Some(core) = self.core.upgrade() else {
            return;
        };
        let Some(pending) = self.pending.lock().take() else {
            return;
        };
        match pending {
            PendingUpdate::Discard => {
                *self.delegate.lock() = None;
            }
            PendingUpdate::Update { builder, config } => {
                let (addresses, channel_args) = core.current_endpoints();
                let mut delegate = self.delegate.lock();
                let recreate = delegate
                    .as_ref()
                    .is_none_or(|d| d.policy_name != builder.name());
                if recreate {
                    debug!(
                        event = "child_policy_created",
                        target = %self.target,
                        policy = builder.name(),
                    );
                    let helper: Arc<dyn PolicyHelper> = Arc::new(ChildHelper {
                        wrapper: Arc::downgrade(self),
                    });
                    *delegate = Some(Delegate {
                        policy_name: builder.name().to_string(),
                        policy: builder.build(helper),
                    });
                }
                if let Some(d) = delegate.as_mut()
                    && let Err(status) = d.policy.update(PolicyUpdate {
                        config,
                        addresses,
                        channel_args,
                    })
                {
                    warn!(
                        event = "child_policy_update_failed",
                        target = %self.target,
                        error = %status,
                    );
                }
            }
        }
    }

    pub fn exit_idle(&self) {
        if let Some(d) = self.delegate.lock().as_mut() {
            d.policy.exit_idle();
        }
    }

    pub fn reset_backoff(&self) {
        if let Some(d) = self.delegate.lock().as_mut() {
            d.policy.reset_backoff();
        }
    }
}

/// Helper handed to the delegate; proxies everything to the parent channel
/// and latches TRANSIENT_FAILURE on the way through.
struct ChildHelper {
    wrapper: Weak<ChildPolicyWrapper>,
}

impl PolicyHelper for ChildHelper {
    fn create_subchannel(&self, address: &str, args: &ChannelArgs) -> Arc<dyn Subchannel> {
        let Some(wrapper) = self.wrapper.upgrade() else {
            return Arc::new(DeadSubchannel);
        };
        let Some(core) = wrapper.core.upgrade() else {
            return Arc::new(DeadSubchannel);
        };
        core.helper.create_subchannel(address, args)
    }

    fn update_state(&self, state: ConnectivityState, status: Status, picker: Arc<dyn Picker>) {
        let Some(wrapper) = self.wrapper.upgrade() else {
            return;
        };
        debug!(
            event = "child_state_update",
            target = %wrapper.target,
            state = %state,
            status = %status,
        );
        {
            let mut ws = wrapper.state.lock();
            // Once in TRANSIENT_FAILURE, stay there until the delegate
            // reports READY again.
            if ws.connectivity == ConnectivityState::TransientFailure
                && state != ConnectivityState::Ready
            {
                return;
            }
            ws.connectivity = state;
            ws.picker = picker;
        }
        if let Some(core) = wrapper.core.upgrade() {
            core.update_picker_async();
        }
    }

    fn request_reresolution(&self) {
        let Some(wrapper) = self.wrapper.upgrade() else {
            return;
        };
        if let Some(core) = wrapper.core.upgrade() {
            core.helper.request_reresolution();
        }
    }

    fn authority(&self) -> String {
        let Some(wrapper) = self.wrapper.upgrade() else {
            return String::new();
        };
        match wrapper.core.upgrade() {
            Some(core) => core.helper.authority(),
            None => String::new(),
        }
    }

    fn add_trace_event(&self, message: &str) {
        let Some(wrapper) = self.wrapper.upgrade() else {
            return;
        };
        if let Some(core) = wrapper.core.upgrade() {
            core.helper.add_trace_event(message);
        }
    }
}

/// Returned when a subchannel is requested during teardown.
#[derive(Debug)]
struct DeadSubchannel;

impl Subchannel for DeadSubchannel {}
