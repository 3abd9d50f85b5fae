use crate::balancer::{ConnectivityState, PickResult};
use crate::rls::tests::{
    base_config_json, do_pick, eventually, fixture_with, update_policy,
};
use crate::status::Code;
use pretty_assertions::assert_eq;
use serde_json::json;

async fn fixture_with_targets(
    targets: &[&str],
) -> crate::rls::tests::Fixture {
    let fx = fixture_with(base_config_json()).await;
    let (result, _) = do_pick(&fx, "/svc.S/M", "a.example");
    assert!(matches!(result, PickResult::Queue));
    eventually(|| fx.transport.requests().len() == 1).await;
    fx.transport
        .enqueue_reply(Ok(crate::rls::proto::RouteLookupResponse {
            targets: targets.iter().map(|t| t.to_string()).collect(),
            header_data: String::new(),
        }));
    for target in targets {
        let target = target.to_string();
        eventually(|| fx.control.has_child(&target)).await;
    }
    fx.policy.flush().await;
    fx
}

#[tokio::test(start_paused = true)]
async fn transient_failure_latches_until_ready() {
    let fx = fixture_with_targets(&["t1"]).await;
    assert_eq!(
        fx.helper.latest_state().map(|(s, _)| s),
        Some(ConnectivityState::Ready)
    );

    fx.control.publish("t1", ConnectivityState::TransientFailure);
    fx.policy.flush().await;
    let (state, status) = fx.helper.latest_state().unwrap();
    assert_eq!(state, ConnectivityState::TransientFailure);
    assert_eq!(status.code, Code::Unavailable);
    assert_eq!(status.message, "no children available");

    // CONNECTING does not clear the latch.
    fx.control.publish("t1", ConnectivityState::Connecting);
    fx.policy.flush().await;
    let (state, _) = fx.helper.latest_state().unwrap();
    assert_eq!(state, ConnectivityState::TransientFailure);

    // READY does.
    fx.control.publish("t1", ConnectivityState::Ready);
    fx.policy.flush().await;
    let (state, status) = fx.helper.latest_state().unwrap();
    assert_eq!(state, ConnectivityState::Ready);
    assert!(status.is_ok());
}

#[tokio::test(start_paused = true)]
async fn aggregation_prefers_ready_then_connecting_then_idle() {
    let fx = fixture_with_targets(&["t1", "t2"]).await;
    assert_eq!(
        fx.helper.latest_state().map(|(s, _)| s),
        Some(ConnectivityState::Ready)
    );

    // One READY child keeps the policy READY.
    fx.control.publish("t1", ConnectivityState::Connecting);
    fx.policy.flush().await;
    assert_eq!(
        fx.helper.latest_state().map(|(s, _)| s),
        Some(ConnectivityState::Ready)
    );

    fx.control.publish("t2", ConnectivityState::Connecting);
    fx.policy.flush().await;
    assert_eq!(
        fx.helper.latest_state().map(|(s, _)| s),
        Some(ConnectivityState::Connecting)
    );

    fx.control.publish("t1", ConnectivityState::Idle);
    fx.policy.flush().await;
    // Still one child CONNECTING.
    assert_eq!(
        fx.helper.latest_state().map(|(s, _)| s),
        Some(ConnectivityState::Connecting)
    );

    fx.control.publish("t2", ConnectivityState::Idle);
    fx.policy.flush().await;
    assert_eq!(
        fx.helper.latest_state().map(|(s, _)| s),
        Some(ConnectivityState::Idle)
    );
}

#[tokio::test(start_paused = true)]
async fn invalid_child_config_fails_picks_for_that_target() {
    let mut cfg = base_config_json();
    // The stub builder rejects the config once the target is substituted;
    // the placeholder used at parse time passes.
    cfg["childPolicy"] = json!([{"stub_child": {"rejectTarget": "bad"}}]);
    let fx = fixture_with(cfg).await;

    let (result, _) = do_pick(&fx, "/svc.S/M", "a.example");
    assert!(matches!(result, PickResult::Queue));
    eventually(|| fx.transport.requests().len() == 1).await;
    fx.transport
        .enqueue_reply(Ok(crate::rls::proto::RouteLookupResponse {
            targets: vec!["bad".to_string()],
            header_data: String::new(),
        }));
    // Let the lookup complete and install the entry.
    eventually(|| {
        let core = fx.policy.core().clone();
        let has_entry = core.mu.lock().cache.len() == 1;
        has_entry
    })
    .await;
    fx.policy.flush().await;

    // The entry's wrapper has a permanently failing picker.
    let (result, _) = do_pick(&fx, "/svc.S/M", "a.example");
    match result {
        PickResult::Fail(status) => {
            assert_eq!(status.code, Code::InvalidArgument);
            assert!(status.message.contains("rejected"), "{status}");
        }
        other => panic!("expected failure, got {other:?}"),
    }

    // A later config that validates rehabilitates the wrapper.
    let mut cfg = base_config_json();
    cfg["childPolicy"] = json!([{"stub_child": {"generation": 2}}]);
    update_policy(&fx.policy, &fx.registry, cfg).await;
    eventually(|| fx.control.has_child("bad")).await;
    fx.policy.flush().await;

    let (result, _) = do_pick(&fx, "/svc.S/M", "a.example");
    assert!(matches!(result, PickResult::Pick(_)), "{result:?}");
    assert_eq!(fx.control.take_picks(), vec!["bad"]);
}
