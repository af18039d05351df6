//! Replacement engine tests
//!
//! End-to-end state machine runs against the scripted mock cloud: skip
//! paths, the launch retry walk over the ranked candidate list, and the
//! attach flow for replacements we launched earlier.

mod common;

use common::{
    group, member, on_demand_instance, spot_replacement, type_info, CloudCall, LaunchBehavior,
    MockCloud,
};
use spotctl::catalog::{InstanceTypeInfo, TypeCatalog};
use spotctl::engine::{Engine, Outcome, SkipReason};
use spotctl::error::SpotctlError;
use spotctl::group::GroupHandle;
use spotctl::instance::InstanceState;
use spotctl::launch::IdentityPatcher;
use std::sync::atomic::Ordering;
use std::sync::Arc;

fn engine_with(
    cloud: Arc<MockCloud>,
    groups: Vec<GroupHandle>,
    types: Vec<InstanceTypeInfo>,
) -> Engine {
    Engine::new(
        "eu-west-1".to_string(),
        Arc::new(TypeCatalog::from_types(types)),
        groups.into_iter().map(|g| (g.name.clone(), g)).collect(),
        cloud,
        Arc::new(IdentityPatcher),
    )
}

fn standard_types() -> Vec<InstanceTypeInfo> {
    vec![
        type_info("m5.large", "Intel Xeon Platinum 8175", 2, 8.0, 0.10, 0.09, 0.0),
        type_info("m5a.large", "AMD EPYC 7571", 2, 8.0, 0.096, 0.04, 0.01),
    ]
}

#[tokio::test]
async fn test_happy_path_launches_cheapest_compatible_type() {
    let cloud = Arc::new(MockCloud::new());
    let engine = engine_with(cloud.clone(), vec![group("web", 2, 4, 300)], standard_types());
    engine.registry().add(on_demand_instance("i-0od", "web")).await;

    let outcome = engine.process_instance("i-0od").await.unwrap();
    let Outcome::LaunchedReplacement {
        spot_instance_id,
        instance_type,
        bid_price,
    } = outcome
    else {
        panic!("expected a launched replacement, got {:?}", outcome);
    };
    assert!(spot_instance_id.starts_with("i-spot"));
    assert_eq!(instance_type, "m5a.large");
    assert_eq!(bid_price, 0.10);

    let specs = cloud.launch_specs.lock().unwrap();
    let spec = &specs[0];
    assert_eq!(spec.instance_type, "m5a.large");
    assert_eq!(spec.max_price, "0.1");
    assert_eq!(spec.min_count, 1);
    assert_eq!(spec.max_count, 1);
    let tag = |key: &str| {
        spec.tags
            .iter()
            .find(|t| t.key == key)
            .map(|t| t.value.as_str())
    };
    assert_eq!(tag("launched-by-autospotting"), Some("true"));
    assert_eq!(tag("launched-for-asg"), Some("web"));
    assert_eq!(tag("launched-for-replacing-instance"), Some("i-0od"));
    assert_eq!(tag("Name"), Some("web-1"));
    assert_eq!(tag("aws:autoscaling:groupName"), None);

    assert_eq!(
        engine.recap(),
        vec![format!("web Launched spot instance {}", spot_instance_id)]
    );
}

#[tokio::test]
async fn test_skips_instance_not_in_running_state() {
    let cloud = Arc::new(MockCloud::new());
    let engine = engine_with(cloud, vec![group("web", 2, 4, 300)], standard_types());
    let mut instance = on_demand_instance("i-0od", "web");
    instance.state = InstanceState::Stopped;
    engine.registry().add(instance).await;

    let outcome = engine.process_instance("i-0od").await.unwrap();
    assert!(matches!(outcome, Outcome::Skipped(SkipReason::NotRunning)));
}

#[tokio::test]
async fn test_skips_instance_outside_enabled_groups() {
    let cloud = Arc::new(MockCloud::new());
    let engine = engine_with(cloud, vec![group("web", 2, 4, 300)], standard_types());
    engine
        .registry()
        .add(on_demand_instance("i-0od", "batch"))
        .await;

    let outcome = engine.process_instance("i-0od").await.unwrap();
    assert!(matches!(
        outcome,
        Outcome::Skipped(SkipReason::NotReplaceable)
    ));
}

#[tokio::test]
async fn test_skips_group_that_needs_no_replacement() {
    let cloud = Arc::new(MockCloud::new());
    let mut g = group("web", 2, 4, 300);
    g.needs_replacement = false;
    let engine = engine_with(cloud, vec![g], standard_types());
    engine.registry().add(on_demand_instance("i-0od", "web")).await;

    let outcome = engine.process_instance("i-0od").await.unwrap();
    assert!(matches!(
        outcome,
        Outcome::Skipped(SkipReason::NotReplaceable)
    ));
}

#[tokio::test]
async fn test_skips_member_protected_from_scale_in() {
    let cloud = Arc::new(MockCloud::new());
    let mut g = group("web", 2, 4, 300);
    g.members = vec![member("i-0od", true)];
    let engine = engine_with(cloud, vec![g], standard_types());
    engine.registry().add(on_demand_instance("i-0od", "web")).await;

    let outcome = engine.process_instance("i-0od").await.unwrap();
    assert!(matches!(
        outcome,
        Outcome::Skipped(SkipReason::ProtectedFromScaleIn)
    ));
}

#[tokio::test]
async fn test_skips_member_protected_from_termination() {
    let cloud = Arc::new(MockCloud::new());
    cloud
        .protected
        .lock()
        .unwrap()
        .insert("i-0od".to_string(), true);
    let engine = engine_with(cloud, vec![group("web", 2, 4, 300)], standard_types());
    engine.registry().add(on_demand_instance("i-0od", "web")).await;

    let outcome = engine.process_instance("i-0od").await.unwrap();
    assert!(matches!(
        outcome,
        Outcome::Skipped(SkipReason::ProtectedFromTermination)
    ));
}

#[tokio::test]
async fn test_assumes_protected_when_attribute_describe_fails() {
    let cloud = Arc::new(MockCloud::new());
    cloud
        .attribute_errors
        .lock()
        .unwrap()
        .push("i-0od".to_string());
    let engine = engine_with(cloud, vec![group("web", 2, 4, 300)], standard_types());
    engine.registry().add(on_demand_instance("i-0od", "web")).await;

    let outcome = engine.process_instance("i-0od").await.unwrap();
    assert!(matches!(
        outcome,
        Outcome::Skipped(SkipReason::ProtectedFromTermination)
    ));
}

#[tokio::test]
async fn test_capacity_error_advances_to_next_type() {
    let cloud = Arc::new(
        MockCloud::new().plan_launches(vec![
            LaunchBehavior::InsufficientCapacity,
            LaunchBehavior::Succeed,
        ]),
    );
    let mut types = standard_types();
    types.push(type_info(
        "m5d.large",
        "Intel Xeon Platinum 8175",
        2,
        8.0,
        0.113,
        0.06,
        0.0,
    ));
    let engine = engine_with(cloud.clone(), vec![group("web", 2, 4, 300)], types);
    engine.registry().add(on_demand_instance("i-0od", "web")).await;

    let outcome = engine.process_instance("i-0od").await.unwrap();
    let Outcome::LaunchedReplacement { instance_type, .. } = outcome else {
        panic!("expected a launched replacement, got {:?}", outcome);
    };
    assert_eq!(instance_type, "m5d.large");

    let attempted: Vec<String> = cloud
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            CloudCall::RunInstances(t) => Some(t),
            _ => None,
        })
        .collect();
    assert_eq!(attempted, vec!["m5a.large", "m5d.large"]);
}

#[tokio::test]
async fn test_exhausted_capacity_surfaces_insufficient_capacity() {
    let cloud = Arc::new(MockCloud::new().plan_launches(vec![
        LaunchBehavior::InsufficientCapacity,
        LaunchBehavior::InsufficientCapacity,
    ]));
    let engine = engine_with(cloud, vec![group("web", 2, 4, 300)], standard_types());
    engine.registry().add(on_demand_instance("i-0od", "web")).await;

    let err = engine.process_instance("i-0od").await.unwrap_err();
    assert!(matches!(err, SpotctlError::InsufficientCapacity { .. }));
}

#[tokio::test]
async fn test_exhausted_non_capacity_errors_surface_launch_failed() {
    let cloud = Arc::new(MockCloud::new().plan_launches(vec![
        LaunchBehavior::Fail("InvalidParameterValue"),
        LaunchBehavior::Fail("InvalidParameterValue"),
    ]));
    let engine = engine_with(cloud, vec![group("web", 2, 4, 300)], standard_types());
    engine.registry().add(on_demand_instance("i-0od", "web")).await;

    let err = engine.process_instance("i-0od").await.unwrap_err();
    assert!(matches!(err, SpotctlError::LaunchFailed { .. }));
}

#[tokio::test]
async fn test_no_compatible_type_when_only_other_family_is_cheaper() {
    let cloud = Arc::new(MockCloud::new());
    let types = vec![
        type_info("m5.large", "Intel Xeon Platinum 8175", 2, 8.0, 0.10, 0.09, 0.0),
        type_info("m6g.large", "AWS Graviton2 Processor", 2, 8.0, 0.077, 0.03, 0.0),
    ];
    // Deny the source type itself so nothing survives the filter.
    let mut g = group("web", 2, 4, 300);
    g.config.disallowed_instance_types = vec!["m5*".to_string()];
    let engine = engine_with(cloud, vec![g], types);
    engine.registry().add(on_demand_instance("i-0od", "web")).await;

    let err = engine.process_instance("i-0od").await.unwrap_err();
    assert!(matches!(err, SpotctlError::NoCompatibleType { .. }));
}

#[tokio::test]
async fn test_unknown_source_type_is_an_error() {
    let cloud = Arc::new(MockCloud::new());
    let engine = engine_with(cloud, vec![group("web", 2, 4, 300)], vec![]);
    let mut instance = on_demand_instance("i-0od", "web");
    instance.instance_type = "z9.mega".to_string();
    engine.registry().add(instance).await;

    let err = engine.process_instance("i-0od").await.unwrap_err();
    assert!(matches!(err, SpotctlError::UnknownInstanceType(_)));
}

#[tokio::test]
async fn test_ready_replacement_is_swapped_in() {
    let cloud = Arc::new(MockCloud::new().with_instance(on_demand_instance("i-abc", "web")));
    let mut g = group("web", 2, 2, 300);
    g.members = vec![member("i-abc", false)];
    let engine = engine_with(cloud.clone(), vec![g], standard_types());
    engine
        .registry()
        .add(spot_replacement("i-0spot", "i-abc", "web", 600))
        .await;

    let outcome = engine.process_instance("i-0spot").await.unwrap();
    let Outcome::Swapped {
        spot_instance_id,
        replaced_instance_id,
    } = outcome
    else {
        panic!("expected a swap, got {:?}", outcome);
    };
    assert_eq!(spot_instance_id, "i-0spot");
    assert_eq!(replaced_instance_id, "i-abc");

    let calls = cloud.calls();
    // Max size was at desired, so it was transiently bumped and restored.
    assert!(calls.iter().any(|c| c == &CloudCall::SetMaxSize("web".to_string(), 3)));
    assert!(calls.iter().any(|c| c == &CloudCall::SetMaxSize("web".to_string(), 2)));
    assert!(calls
        .iter()
        .any(|c| c == &CloudCall::TerminateInGroup("i-abc".to_string(), true, true)));
    assert_eq!(
        engine.recap(),
        vec!["web Swapped spot instance i-0spot in for i-abc".to_string()]
    );
}

#[tokio::test]
async fn test_replacement_within_grace_period_waits() {
    let cloud = Arc::new(MockCloud::new().with_instance(on_demand_instance("i-abc", "web")));
    let mut g = group("web", 2, 2, 300);
    g.members = vec![member("i-abc", false)];
    let engine = engine_with(cloud.clone(), vec![g], standard_types());
    engine
        .registry()
        .add(spot_replacement("i-0spot", "i-abc", "web", 120))
        .await;

    let outcome = engine.process_instance("i-0spot").await.unwrap();
    assert!(matches!(outcome, Outcome::Waiting { .. }));
    // Nothing was touched while waiting.
    assert!(cloud.calls().is_empty());
}

#[tokio::test]
async fn test_attached_replacement_is_skipped() {
    let cloud = Arc::new(MockCloud::new());
    let mut g = group("web", 2, 4, 300);
    g.members = vec![member("i-abc", false), member("i-0spot", false)];
    let engine = engine_with(cloud, vec![g], standard_types());
    engine
        .registry()
        .add(spot_replacement("i-0spot", "i-abc", "web", 600))
        .await;

    let outcome = engine.process_instance("i-0spot").await.unwrap();
    assert!(matches!(
        outcome,
        Outcome::Skipped(SkipReason::AlreadyAttached)
    ));
}

#[tokio::test]
async fn test_attach_failure_surfaces_and_cleans_up() {
    let cloud = Arc::new(MockCloud::new().with_instance(on_demand_instance("i-abc", "web")));
    cloud.fail_attach.store(true, Ordering::SeqCst);
    let mut g = group("web", 2, 2, 300);
    g.members = vec![member("i-abc", false)];
    let engine = engine_with(cloud.clone(), vec![g], standard_types());
    engine
        .registry()
        .add(spot_replacement("i-0spot", "i-abc", "web", 600))
        .await;

    let err = engine.process_instance("i-0spot").await.unwrap_err();
    assert!(matches!(err, SpotctlError::AttachFailed { .. }));

    let calls = cloud.calls();
    assert!(calls
        .iter()
        .any(|c| c == &CloudCall::TerminateInstances(vec!["i-0spot".to_string()])));
    assert_eq!(
        calls.last(),
        Some(&CloudCall::ResumeProcesses("web".to_string()))
    );
}
