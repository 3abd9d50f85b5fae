use crate::balancer::{
    ChannelArgs, ChildPolicyRegistry, ConnectivityState, PolicyHelper,
};
use crate::conf::RlsConfig;
use crate::keys::RequestKey;
use crate::rls::cache::{CLEANUP_INTERVAL, Cache};
use crate::rls::channel::RlsChannel;
use crate::rls::child::ChildPolicyWrapper;
use crate::rls::picker::RlsPicker;
use crate::rls::proto::LookupTransportFactory;
use crate::rls::request::PendingRequest;
use crate::serializer::WorkSerializer;
use crate::status::Status;
use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info};

/// Collaborators a policy is constructed with.
pub struct PolicyArgs {
    pub helper: Arc<dyn PolicyHelper>,
    pub registry: Arc<ChildPolicyRegistry>,
    pub transport_factory: Arc<dyn LookupTransportFactory>,
}

/// A config/address update pushed into the policy by the channel.
pub struct UpdateArgs {
    pub config: Arc<RlsConfig>,
    pub addresses: Vec<String>,
    pub channel_args: ChannelArgs,
}

/// The route-lookup load-balancing policy.
///
/// Every pick derives a request key, consults the cache and either delegates
/// to a per-target child policy, queues, or fails; misses and stale entries
/// fire a throttled lookup against the configured route lookup service.
///
/// All public operations are scheduled onto the policy's serializer and
/// return immediately. Dropping the policy shuts it down.
pub struct RlsPolicy {
    core: Arc<PolicyCore>,
}

impl RlsPolicy {
    pub fn new(args: PolicyArgs) -> Self {
        let core = Arc::new(PolicyCore {
            helper: args.helper,
            registry: args.registry,
            transport_factory: args.transport_factory,
            serializer: WorkSerializer::new(),
            config: ArcSwapOption::empty(),
            update_in_progress: AtomicBool::new(false),
            mu: Mutex::new(PolicyLocked {
                is_shutdown: false,
                cache: Cache::new(),
                request_map: HashMap::new(),
                rls_channel: None,
            }),
            children: Mutex::new(ChildRoster::default()),
        });
        let cleanup = spawn_cleanup_timer(&core);
        core.mu.lock().cache.set_cleanup_task(cleanup);
        info!(event = "policy_created");
        RlsPolicy { core }
    }

    /// Adopts a new config. On a lookup-service change the lookup channel is
    /// replaced; on a cache-size change the cache is resized; child policies
    /// are re-templated when their config, the addresses or the channel args
    /// changed. A single picker is published at the end of the update.
    pub fn update(&self, args: UpdateArgs) {
        let core = self.core.clone();
        self.core
            .serializer
            .schedule("policy_update", move || core.handle_update(args));
    }

    pub fn exit_idle(&self) {
        let core = self.core.clone();
        self.core
            .serializer
            .schedule("policy_exit_idle", move || core.handle_exit_idle());
    }

    pub fn reset_backoff(&self) {
        let core = self.core.clone();
        self.core
            .serializer
            .schedule("policy_reset_backoff", move || core.handle_reset_backoff());
    }

    pub fn shutdown(&self) {
        let core = self.core.clone();
        self.core
            .serializer
            .schedule("policy_shutdown", move || core.handle_shutdown());
    }

    /// Waits until all control-plane work submitted so far has run. Useful
    /// for orderly teardown and in tests.
    pub async fn flush(&self) {
        self.core.serializer.flush().await;
    }

    #[cfg(test)]
    pub(crate) fn core(&self) -> &Arc<PolicyCore> {
        &self.core
    }
}

impl Drop for RlsPolicy {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// State shared by the policy, its pickers, timers and in-flight lookups.
pub(crate) struct PolicyCore {
    pub(crate) helper: Arc<dyn PolicyHelper>,
    pub(crate) registry: Arc<ChildPolicyRegistry>,
    pub(crate) transport_factory: Arc<dyn LookupTransportFactory>,
    pub(crate) serializer: WorkSerializer,
    /// Current config; swapped on the serializer, snapshotted by pickers.
    config: ArcSwapOption<RlsConfig>,
    /// Suppresses picker churn while an update propagates to the children.
    update_in_progress: AtomicBool,
    /// The policy-wide mutex guarding the data-path state.
    pub(crate) mu: Mutex<PolicyLocked>,
    /// Child wrappers and the control-plane inputs they are updated from.
    /// Locked after `mu` when both are needed, never before it.
    pub(crate) children: Mutex<ChildRoster>,
}

pub(crate) struct PolicyLocked {
    pub(crate) is_shutdown: bool,
    pub(crate) cache: Cache,
    pub(crate) request_map: HashMap<RequestKey, PendingRequest>,
    pub(crate) rls_channel: Option<Arc<RlsChannel>>,
}

/// Wrapper bookkeeping. Strong ownership of wrappers lives in cache entries
/// and the default slot; the map only relates targets to live wrappers, and
/// dead slots are purged whenever they are touched.
#[derive(Default)]
pub(crate) struct ChildRoster {
    map: HashMap<String, Weak<ChildPolicyWrapper>>,
    pub(crate) default_child: Option<Arc<ChildPolicyWrapper>>,
    pub(crate) addresses: Arc<Vec<String>>,
    pub(crate) channel_args: ChannelArgs,
}

impl ChildRoster {
    pub fn get_live(&mut self, target: &str) -> Option<Arc<ChildPolicyWrapper>> {
        match self.map.get(target).and_then(Weak::upgrade) {
            Some(wrapper) => Some(wrapper),
            None => {
                self.map.remove(target);
                None
            }
        }
    }

    pub fn create(&mut self, core: &Arc<PolicyCore>, target: &str) -> Arc<ChildPolicyWrapper> {
        debug!(event = "child_wrapper_created", target);
        let wrapper = ChildPolicyWrapper::new(Arc::downgrade(core), target.to_string());
        self.map.insert(target.to_string(), Arc::downgrade(&wrapper));
        wrapper
    }

    pub fn live_wrappers(&mut self) -> Vec<Arc<ChildPolicyWrapper>> {
        self.map.retain(|_, weak| weak.strong_count() > 0);
        self.map.values().filter_map(Weak::upgrade).collect()
    }
}

impl PolicyCore {
    pub(crate) fn config(&self) -> Option<Arc<RlsConfig>> {
        self.config.load_full()
    }

    pub(crate) fn current_endpoints(&self) -> (Arc<Vec<String>>, ChannelArgs) {
        let roster = self.children.lock();
        (roster.addresses.clone(), roster.channel_args.clone())
    }

    /// Publishes a fresh picker from the next serializer turn. Safe to call
    /// with any lock held.
    pub(crate) fn update_picker_async(self: &Arc<Self>) {
        let core = self.clone();
        self.serializer
            .schedule("update_picker", move || core.update_picker());
    }

    /// Recomputes the aggregate connectivity state and hands the channel a
    /// new picker snapshot. Runs on the serializer.
    pub(crate) fn update_picker(self: &Arc<Self>) {
        if self.update_in_progress.load(Ordering::Acquire) {
            return;
        }
        if self.mu.lock().is_shutdown {
            return;
        }
        let Some(config) = self.config() else {
            return;
        };
        let (wrappers, default_child) = {
            let mut roster = self.children.lock();
            (roster.live_wrappers(), roster.default_child.clone())
        };

        let mut state = ConnectivityState::Idle;
        if !wrappers.is_empty() {
            state = ConnectivityState::TransientFailure;
            let mut num_connecting = 0;
            let mut num_idle = 0;
            for wrapper in &wrappers {
                match wrapper.connectivity_state() {
                    ConnectivityState::Ready => {
                        state = ConnectivityState::Ready;
                        break;
                    }
                    ConnectivityState::Connecting => num_connecting += 1,
                    ConnectivityState::Idle => num_idle += 1,
                    ConnectivityState::TransientFailure => {}
                }
            }
            if state != ConnectivityState::Ready {
                if num_connecting > 0 {
                    state = ConnectivityState::Connecting;
                } else if num_idle > 0 {
                    state = ConnectivityState::Idle;
                }
            }
        }
        debug!(event = "publish_picker", state = %state);
        let status = if state == ConnectivityState::TransientFailure {
            Status::unavailable("no children available")
        } else {
            Status::ok()
        };
        let picker = Arc::new(RlsPicker::new(self.clone(), config, default_child));
        self.helper.update_state(state, status, picker);
    }

    fn handle_update(self: &Arc<Self>, args: UpdateArgs) {
        info!(event = "policy_update");
        self.update_in_progress.store(true, Ordering::Release);
        let old_config = self.config.load_full();
        self.config.store(Some(args.config.clone()));
        let config = args.config;

        // Serializer-side state: addresses, channel args, default target.
        let update_child_policies;
        let mut created_default = None;
        {
            let mut roster = self.children.lock();
            let addresses = Arc::new(args.addresses);
            let inputs_changed =
                *roster.addresses != *addresses || roster.channel_args != args.channel_args;
            update_child_policies = inputs_changed
                || old_config.as_ref().is_none_or(|old| {
                    old.child_policy != config.child_policy
                        || old.child_policy_target_field != config.child_policy_target_field
                });
            roster.addresses = addresses;
            roster.channel_args = args.channel_args;

            let old_default = old_config
                .as_ref()
                .and_then(|old| old.route_lookup.default_target.as_deref());
            if old_config.is_none()
                || config.route_lookup.default_target.as_deref() != old_default
            {
                match &config.route_lookup.default_target {
                    None => {
                        debug!(event = "default_target_unset");
                        roster.default_child = None;
                    }
                    Some(target) => match roster.get_live(target) {
                        Some(existing) => {
                            debug!(event = "default_target_reused", target = %target);
                            roster.default_child = Some(existing);
                        }
                        None => {
                            debug!(event = "default_target_created", target = %target);
                            let wrapper = roster.create(self, target);
                            roster.default_child = Some(wrapper.clone());
                            created_default = Some(wrapper);
                        }
                    },
                }
            }
        }

        // The new channel talks to the helper (authority, transport), so
        // build it before taking the mutex.
        let new_channel = old_config
            .as_ref()
            .is_none_or(|old| old.route_lookup.lookup_service != config.route_lookup.lookup_service)
            .then(|| RlsChannel::new(self, &config));

        // Mutex-guarded state: lookup channel, cache, and phase one of the
        // child updates.
        let wrappers: Vec<Arc<ChildPolicyWrapper>>;
        {
            let mut locked = self.mu.lock();
            if locked.is_shutdown {
                return;
            }
            if let Some(channel) = new_channel {
                if let Some(old_channel) = locked.rls_channel.replace(channel) {
                    old_channel.shutdown();
                }
            }
            if old_config
                .as_ref()
                .is_none_or(|old| old.route_lookup.cache_size_bytes != config.route_lookup.cache_size_bytes)
            {
                let now = Instant::now();
                locked
                    .cache
                    .resize(self, config.route_lookup.cache_size_bytes, now);
            }
            wrappers = if update_child_policies {
                self.children.lock().live_wrappers()
            } else {
                created_default.into_iter().collect()
            };
            for wrapper in &wrappers {
                wrapper.start_update();
            }
        }
        // Phase two runs with the mutex released.
        for wrapper in &wrappers {
            wrapper.maybe_finish_update();
        }
        self.update_in_progress.store(false, Ordering::Release);
        self.update_picker();
    }

    fn handle_exit_idle(self: &Arc<Self>) {
        let wrappers = self.children.lock().live_wrappers();
        for wrapper in wrappers {
            wrapper.exit_idle();
        }
    }

    fn handle_reset_backoff(self: &Arc<Self>) {
        {
            let mut locked = self.mu.lock();
            if locked.is_shutdown {
                return;
            }
            if let Some(channel) = &locked.rls_channel {
                channel.reset_backoff();
            }
            locked.cache.reset_all_backoff();
        }
        self.update_picker_async();
        let wrappers = self.children.lock().live_wrappers();
        for wrapper in wrappers {
            wrapper.reset_backoff();
        }
    }

    fn handle_shutdown(self: &Arc<Self>) {
        {
            let mut locked = self.mu.lock();
            if locked.is_shutdown {
                return;
            }
            info!(event = "policy_shutdown");
            locked.is_shutdown = true;
            locked.cache.shutdown();
            locked.request_map.clear();
            if let Some(channel) = locked.rls_channel.take() {
                channel.shutdown();
            }
        }
        let mut roster = self.children.lock();
        roster.default_child = None;
        roster.map.clear();
        drop(roster);
        self.config.store(None);
    }
}

/// Periodic sweep of fully expired cache entries.
fn spawn_cleanup_timer(core: &Arc<PolicyCore>) -> AbortHandle {
    let weak = Arc::downgrade(core);
    let task = tokio::spawn(async move {
        loop {
            tokio::time::sleep(CLEANUP_INTERVAL).await;
            let Some(core) = weak.upgrade() else {
                break;
            };
            let serializer = core.serializer.clone();
            serializer.schedule("cache_cleanup", move || {
                debug!(event = "cache_cleanup_tick");
                let now = Instant::now();
                let mut locked = core.mu.lock();
                if locked.is_shutdown {
                    return;
                }
                locked.cache.sweep(&core, now);
            });
        }
    });
    task.abort_handle()
}
