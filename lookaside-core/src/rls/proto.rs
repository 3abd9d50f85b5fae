//! Wire contract with the route lookup service, and the transport seam the
//! policy sends its lookups through.

use crate::balancer::ConnectivityState;
use crate::status::Status;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;

/// RPC method every lookup is sent to.
pub const ROUTE_LOOKUP_METHOD: &str = "/grpc.lookup.v1.RouteLookupService/RouteLookup";

/// The `target_type` value for RPC-channel lookups.
pub const TARGET_TYPE_GRPC: &str = "grpc";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LookupReason {
    /// No data for the key.
    Miss,
    /// Data is present but past its stale time; refresh in the background.
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteLookupRequest {
    pub target_type: String,
    pub key_map: BTreeMap<String, String>,
    pub reason: LookupReason,
    /// Header data from the entry being refreshed; only set for `Stale`.
    #[serde(default)]
    pub stale_header_data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RouteLookupResponse {
    /// Targets in preference order; must be non-empty on success.
    pub targets: Vec<String>,
    /// Opaque data echoed back to the server on routed calls.
    #[serde(default)]
    pub header_data: String,
}

/// A connection to one lookup service.
///
/// Implementations own the codec and the underlying channel. A call future
/// dropped by the policy (deadline, shutdown) must abort the call. Transport
/// errors, non-OK server statuses and undecodable responses are all
/// surfaced as the returned `Status`; an undecodable body is reported as
/// `Internal("cannot parse RLS response")`.
#[async_trait]
pub trait LookupTransport: Send + Sync {
    async fn route_lookup(&self, request: RouteLookupRequest) -> Result<RouteLookupResponse, Status>;

    /// Connectivity of the underlying channel, used to unwind per-entry
    /// backoff when the channel recovers.
    fn connectivity(&self) -> watch::Receiver<ConnectivityState>;

    /// Clears any connection backoff on the underlying channel.
    fn reset_backoff(&self) {}
}

/// Creates transports for the configured lookup service. Called again
/// whenever the configured service changes; in-flight lookups keep the
/// transport they started with.
pub trait LookupTransportFactory: Send + Sync {
    fn create_transport(
        &self,
        lookup_service: &str,
        service_config: Option<&serde_json::Value>,
        authority: &str,
    ) -> Arc<dyn LookupTransport>;
}
