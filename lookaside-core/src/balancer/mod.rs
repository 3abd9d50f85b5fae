//! Contracts between the policy and its surrounding channel.
//!
//! The policy does not own a transport, subchannels or child balancing
//! logic; it drives all of them through the traits defined here. The
//! channel supplies a [`PolicyHelper`], child policies are produced by
//! builders registered in a [`ChildPolicyRegistry`], and every routing
//! decision flows back out as a [`PickResult`].

use crate::metadata::MetadataMut;
use crate::status::Status;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

mod registry;

pub use registry::{ChildPolicyBuilder, ChildPolicyConfig, ChildPolicyRegistry};

/// Connectivity of a channel, subchannel or child policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
}

impl Display for ConnectivityState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectivityState::Idle => "IDLE",
            ConnectivityState::Connecting => "CONNECTING",
            ConnectivityState::Ready => "READY",
            ConnectivityState::TransientFailure => "TRANSIENT_FAILURE",
        };
        write!(f, "{name}")
    }
}

/// Opaque key/value arguments propagated from the channel to child policies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelArgs {
    args: HashMap<String, String>,
}

impl ChannelArgs {
    pub fn new() -> Self {
        ChannelArgs::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.args.get(key).map(String::as_str)
    }
}

/// A connection slot owned by the channel. Opaque to this crate; child
/// policies create them through their helper and hand them back in picks.
pub trait Subchannel: Send + Sync + fmt::Debug {
    /// Requests a connection attempt. Optional for implementations whose
    /// subchannels connect eagerly.
    fn connect(&self) {}
}

/// Arguments for a single pick on the data path.
pub struct PickArgs<'a> {
    /// Call path in `/service/method` form.
    pub path: &'a str,
    /// The `:authority` of the call.
    pub authority: &'a str,
    /// Outgoing metadata; readable for key building, writable so the pick
    /// can append routing headers.
    pub metadata: &'a mut dyn MetadataMut,
}

/// Outcome of a pick.
#[derive(Debug)]
pub enum PickResult {
    /// Send the call on this subchannel.
    Pick(Arc<dyn Subchannel>),
    /// No decision can be made yet; the channel should retry the pick once
    /// a new picker is published.
    Queue,
    /// Fail the call with the given status.
    Fail(Status),
}

/// A routing snapshot handed to the channel. Pickers must not block and may
/// be invoked concurrently from any thread.
pub trait Picker: Send + Sync {
    fn pick(&self, args: &mut PickArgs<'_>) -> PickResult;
}

/// Picker that queues every pick. Published while a policy has no usable
/// state yet.
#[derive(Debug, Default)]
pub struct QueuePicker;

impl Picker for QueuePicker {
    fn pick(&self, _args: &mut PickArgs<'_>) -> PickResult {
        PickResult::Queue
    }
}

/// Picker that fails every pick with a fixed status.
#[derive(Debug)]
pub struct FailPicker {
    status: Status,
}

impl FailPicker {
    pub fn new(status: Status) -> Self {
        FailPicker { status }
    }
}

impl Picker for FailPicker {
    fn pick(&self, _args: &mut PickArgs<'_>) -> PickResult {
        PickResult::Fail(self.status.clone())
    }
}

/// Callbacks a policy uses to talk back to its channel.
///
/// Implementations must be cheap and non-blocking; `update_state` in
/// particular is called with no policy locks held but from serialized
/// control-plane context.
pub trait PolicyHelper: Send + Sync {
    /// Creates a subchannel for `address`.
    fn create_subchannel(&self, address: &str, args: &ChannelArgs) -> Arc<dyn Subchannel>;

    /// Publishes a new connectivity state and picker snapshot.
    fn update_state(&self, state: ConnectivityState, status: Status, picker: Arc<dyn Picker>);

    /// Asks the channel to re-resolve its name.
    fn request_reresolution(&self);

    /// The authority of the parent channel.
    fn authority(&self) -> String;

    /// Records a trace event against the channel. No-op by default; the
    /// policy also emits structured tracing for everything it does.
    fn add_trace_event(&self, message: &str) {
        let _ = message;
    }
}

/// A config/address update pushed down into a child policy.
pub struct PolicyUpdate {
    pub config: Arc<dyn ChildPolicyConfig>,
    pub addresses: Arc<Vec<String>>,
    pub channel_args: ChannelArgs,
}

/// A delegated load-balancing policy.
///
/// Implementations publish pickers and state through the helper they were
/// built with. Dropping a policy is shutdown: it must release its resources
/// without calling back into the helper.
pub trait LbPolicy: Send {
    fn update(&mut self, update: PolicyUpdate) -> Result<(), Status>;

    fn exit_idle(&mut self) {}

    fn reset_backoff(&mut self) {}
}

/// Downcast helper for child policy configs.
pub fn config_downcast<T: Any>(config: &dyn ChildPolicyConfig) -> Option<&T> {
    config.as_any().downcast_ref::<T>()
}
