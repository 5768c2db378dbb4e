// Integration tests for the provisioning scheduler (cap handling, template matching, unit isolation)

mod common;

use common::{fixture, template_cfg, FixtureBuilder, CLOUD_ID};
use nodelease_common::{NodeError, NodeState};
use nodelease_orchestrator::{CloudAccount, CloudRegistry, ProvisioningScheduler, TemplateRegistry};
use nodelease_providers::mock::MockProvider;
use std::sync::Arc;

#[tokio::test]
async fn cap_truncates_workload() {
    let fx = FixtureBuilder::new().cap(2).build();

    let pending = fx.scheduler.provision(CLOUD_ID, "linux", 5).await.unwrap();
    assert_eq!(pending.len(), 2);

    for p in pending {
        assert_eq!(p.template_id, "linux");
        assert_eq!(p.executors, 1);
        let node = p.wait().await.unwrap();
        assert_eq!(node.state().await, NodeState::Idle);
    }
    assert_eq!(fx.provider.create_calls(), 2);
    assert_eq!(fx.provider.live_instance_count(), 2);
    assert_eq!(fx.cloud.in_flight(), 0);
}

#[tokio::test]
async fn at_cap_requests_nothing() {
    let fx = FixtureBuilder::new().cap(2).build();
    fx.provider.seed_instance("other-a", "ACTIVE", vec![]);
    fx.provider.seed_instance("other-b", "ACTIVE", vec![]);

    let pending = fx.scheduler.provision(CLOUD_ID, "linux", 3).await.unwrap();
    assert!(pending.is_empty());
    assert_eq!(fx.provider.create_calls(), 0);
}

#[tokio::test]
async fn workload_within_headroom_is_fully_accepted() {
    let fx = FixtureBuilder::new().cap(10).build();
    for i in 0..3 {
        fx.provider.seed_instance(&format!("pre-{}", i), "ACTIVE", vec![]);
    }

    let pending = fx.scheduler.provision(CLOUD_ID, "docker", 4).await.unwrap();
    assert_eq!(pending.len(), 4);
    for p in pending {
        p.wait().await.unwrap();
    }
    assert_eq!(fx.provider.create_calls(), 4);
    let names: Vec<String> = fx.provider.created_requests().into_iter().map(|r| r.name).collect();
    assert_eq!(names, vec!["linux"; 4]);
}

#[tokio::test]
async fn no_matching_template_has_no_side_effects() {
    let fx = fixture();

    let pending = fx.scheduler.provision(CLOUD_ID, "windows", 3).await.unwrap();
    assert!(pending.is_empty());
    assert_eq!(fx.provider.list_calls(), 0);
    assert_eq!(fx.provider.create_calls(), 0);
}

#[tokio::test]
async fn malformed_label_fails_synchronously() {
    let fx = fixture();
    let err = fx.scheduler.provision(CLOUD_ID, "linux &&", 1).await.err().unwrap();
    assert!(matches!(err, NodeError::InvalidLabelExpression(_)));

    let err = fx.scheduler.provision("nope", "linux", 1).await.err().unwrap();
    assert!(matches!(err, NodeError::CloudNotFound(_)));
}

#[tokio::test]
async fn failed_unit_does_not_affect_siblings() {
    let fx = fixture();
    fx.provider.fail_next_creates(1);

    let pending = fx.scheduler.provision(CLOUD_ID, "linux", 2).await.unwrap();
    assert_eq!(pending.len(), 2);

    let mut ok = 0;
    let mut failed = 0;
    for p in pending {
        match p.wait().await {
            Ok(_) => ok += 1,
            Err(NodeError::ProviderUnavailable(_)) => failed += 1,
            Err(e) => panic!("unexpected error {e}"),
        }
    }
    assert_eq!((ok, failed), (1, 1));
    assert_eq!(fx.nodes.len().await, 1);
}

#[tokio::test]
async fn count_failure_before_acceptance_is_returned() {
    let fx = fixture();
    fx.provider.set_unavailable(true);

    let err = fx.scheduler.provision(CLOUD_ID, "linux", 2).await.err().unwrap();
    assert!(matches!(err, NodeError::ProviderUnavailable(_)));
    assert_eq!(fx.provider.create_calls(), 0);
}

#[tokio::test]
async fn unresolvable_image_fails_before_create() {
    let mut cfg = template_cfg("linux", "linux");
    cfg.image = "centos-5".to_string();
    let fx = FixtureBuilder::new().templates(vec![cfg]).build();

    let pending = fx.scheduler.provision(CLOUD_ID, "linux", 1).await.unwrap();
    assert_eq!(pending.len(), 1);
    let err = pending.into_iter().next().unwrap().wait().await.err().unwrap();
    assert!(matches!(err, NodeError::InvalidTemplate(_)));
    assert_eq!(fx.provider.create_calls(), 0);
    assert_eq!(fx.cloud.in_flight(), 0);
}

#[tokio::test]
async fn boot_error_status_releases_instance() {
    let fx = FixtureBuilder::new()
        .provider(MockProvider::new().with_boot_sequence(&["BUILD", "ERROR"]))
        .build();

    let pending = fx.scheduler.provision(CLOUD_ID, "linux", 1).await.unwrap();
    let err = pending.into_iter().next().unwrap().wait().await.err().unwrap();
    assert!(matches!(err, NodeError::BootFailure { .. }));
    assert_eq!(fx.provider.delete_calls(), 1);
    assert_eq!(fx.provider.live_instance_count(), 0);
    assert!(fx.nodes.is_empty().await);
}

#[tokio::test]
async fn provision_template_respects_cap() {
    let fx = FixtureBuilder::new().cap(1).build();

    let err = fx.scheduler.provision_template(CLOUD_ID, "missing").await.err().unwrap();
    assert!(matches!(err, NodeError::TemplateNotFound(_)));

    let first = fx.scheduler.provision_template(CLOUD_ID, "linux").await.unwrap();
    let node = first.unwrap().wait().await.unwrap();
    assert_eq!(node.template_id, "linux");

    let second = fx.scheduler.provision_template(CLOUD_ID, "linux").await.unwrap();
    assert!(second.is_none());
    assert_eq!(fx.provider.create_calls(), 1);
}

#[tokio::test]
async fn provision_any_uses_first_cloud_with_a_match() {
    let fx = fixture();
    let windows_provider = Arc::new(MockProvider::new());
    let linux_provider = Arc::new(MockProvider::new());

    let mut registry = CloudRegistry::default();
    registry
        .register(CloudAccount::new(
            "win",
            "r1",
            5,
            TemplateRegistry::from_configs(vec![template_cfg("win2022", "windows")]).unwrap(),
            windows_provider.clone(),
        ))
        .unwrap();
    registry
        .register(CloudAccount::new(
            "lnx",
            "r1",
            5,
            TemplateRegistry::from_configs(vec![template_cfg("linux", "linux")]).unwrap(),
            linux_provider.clone(),
        ))
        .unwrap();
    let scheduler = ProvisioningScheduler::new(
        Arc::new(registry),
        fx.lifecycle.clone(),
        2,
        fx.cancel.clone(),
    );

    let pending = scheduler.provision_any("linux", 1).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].cloud_id, "lnx");
    pending.into_iter().next().unwrap().wait().await.unwrap();
    assert_eq!(linux_provider.create_calls(), 1);
    assert_eq!(windows_provider.create_calls(), 0);

    assert!(scheduler.provision_any("gpu", 1).await.unwrap().is_empty());
}
