// Admin API tests against the in-memory router

mod common;

use axum::http::StatusCode;
use axum_test::TestServer;
use common::{network, Fixture, FixtureBuilder, CLOUD_ID};
use nodelease_common::NodeState;
use nodelease_orchestrator::api::{self, AppState};
use nodelease_orchestrator::ProvisioningScheduler;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

fn server(fx: &Fixture) -> TestServer {
    let scheduler = ProvisioningScheduler::new(fx.clouds.clone(), fx.lifecycle.clone(), 4, fx.cancel.clone());
    let state = Arc::new(AppState {
        clouds: fx.clouds.clone(),
        scheduler: Arc::new(scheduler),
        lifecycle: fx.lifecycle.clone(),
        logger: fx.logger.clone(),
        cancel: fx.cancel.clone(),
    });
    TestServer::new(api::router(state)).unwrap()
}

#[tokio::test]
async fn root_is_online() {
    let fx = FixtureBuilder::new().build();
    let res = server(&fx).get("/").await;
    res.assert_status_ok();
    assert_eq!(res.text(), "Nodelease Orchestrator Online");
}

#[tokio::test]
async fn templates_are_listed_per_cloud() {
    let fx = FixtureBuilder::new().build();
    let srv = server(&fx);

    let res = srv.get(&format!("/admin/clouds/{}/templates", CLOUD_ID)).await;
    res.assert_status_ok();
    let body: Value = res.json();
    assert_eq!(body[0]["id"], "linux");
    assert!(body[0].get("remote_password").is_none());

    let res = srv.get("/admin/clouds/nope/templates").await;
    res.assert_status(StatusCode::NOT_FOUND);
    let body: Value = res.json();
    assert_eq!(body["error"], "CLOUD_NOT_FOUND");

    srv.get(&format!("/admin/clouds/{}/templates/missing", CLOUD_ID))
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn add_template_validates_against_catalog() {
    let fx = FixtureBuilder::new().build();
    let srv = server(&fx);
    let path = format!("/admin/clouds/{}/templates", CLOUD_ID);

    let res = srv
        .post(&path)
        .json(&json!({ "id": "big", "image": "ubuntu-22.04", "flavor": "m1.large", "labels": "big" }))
        .await;
    res.assert_status(StatusCode::CREATED);
    let body: Value = res.json();
    assert_eq!(body["image_ref"], "img-0001");
    assert_eq!(body["flavor_ref"], "flv-0002");
    assert!(fx.cloud.templates.by_id("big").is_some());

    srv.post(&path)
        .json(&json!({ "id": "big", "image": "ubuntu-22.04", "flavor": "m1.large" }))
        .await
        .assert_status(StatusCode::BAD_REQUEST);

    srv.post(&path)
        .json(&json!({ "id": "old", "image": "centos-5", "flavor": "m1.small" }))
        .await
        .assert_status(StatusCode::BAD_REQUEST);
    assert!(fx.cloud.templates.by_id("old").is_none());
}

#[tokio::test]
async fn test_connection_reports_auth_failure() {
    let fx = FixtureBuilder::new().build();
    let srv = server(&fx);
    let path = format!("/admin/clouds/{}/test", CLOUD_ID);

    let res = srv.post(&path).await;
    res.assert_status_ok();
    assert_eq!(res.json::<Value>()["ok"], true);

    fx.provider.set_auth_failure(true);
    let res = srv.post(&path).await;
    res.assert_status(StatusCode::BAD_GATEWAY);
    assert_eq!(res.json::<Value>()["error"], "AUTHENTICATION_FAILURE");
}

#[tokio::test]
async fn provision_accepts_up_to_cap() {
    let fx = FixtureBuilder::new().cap(2).build();
    let srv = server(&fx);

    let res = srv
        .post("/admin/provision")
        .json(&json!({ "cloud_id": CLOUD_ID, "label": "linux", "count": 5 }))
        .await;
    res.assert_status(StatusCode::ACCEPTED);
    let body: Value = res.json();
    assert_eq!(body["accepted"], 2);
    assert_eq!(body["pending"][0]["template_id"], "linux");

    srv.post("/admin/provision")
        .json(&json!({ "cloud_id": CLOUD_ID, "label": "linux ||" }))
        .await
        .assert_status(StatusCode::BAD_REQUEST);

    srv.post("/admin/provision")
        .json(&json!({ "count": 1 }))
        .await
        .assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_nodes_and_instances_are_404() {
    let fx = FixtureBuilder::new().build();
    let srv = server(&fx);

    let res = srv.post("/admin/nodes/linux:deadbeef/terminate").await;
    res.assert_status(StatusCode::NOT_FOUND);
    assert_eq!(res.json::<Value>()["error"], "NODE_NOT_FOUND");

    srv.post("/admin/attach")
        .json(&json!({ "cloud_id": CLOUD_ID, "instance_id": "ghost" }))
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn reattach_does_not_restart_activation() {
    let fx = FixtureBuilder::new().build();
    let srv = server(&fx);
    let id = fx
        .provider
        .seed_instance("linux-legacy", "ACTIVE", vec![network("private", &["10.1.0.4"])]);
    let body = json!({ "cloud_id": CLOUD_ID, "instance_id": id });

    let res = srv.post("/admin/attach").json(&body).await;
    res.assert_status(StatusCode::CREATED);
    let node_id = res.json::<Value>()["id"].as_str().unwrap().to_string();

    let node = fx.nodes.get(&node_id).await.unwrap();
    for _ in 0..200 {
        if node.state().await == NodeState::Idle {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(node.state().await, NodeState::Idle);

    let res = srv.post("/admin/attach").json(&body).await;
    res.assert_status_ok();
    assert_eq!(res.json::<Value>()["state"], "idle");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fx.launcher.tried(), vec!["10.1.0.4"]);
    let attaches = fx
        .logger
        .for_node(&node_id)
        .into_iter()
        .filter(|e| e.action_type == "ATTACH_INSTANCE")
        .count();
    assert_eq!(attaches, 1);
}

#[tokio::test]
async fn node_endpoints_drive_the_lifecycle() {
    let fx = FixtureBuilder::new().build();
    let srv = server(&fx);
    let template = fx.cloud.templates.by_id("linux").unwrap();
    let node = fx.lifecycle.launch(&fx.cloud, &template, &fx.cancel).await.unwrap();

    let nodes: Value = srv.get("/admin/nodes").await.json();
    assert_eq!(nodes[0]["id"], node.id.as_str());
    assert_eq!(nodes[0]["state"], "idle");

    let res = srv.post(&format!("/admin/nodes/{}/busy", node.id)).await;
    res.assert_status_ok();
    assert_eq!(res.json::<Value>()["state"], "connected");

    let res = srv.post(&format!("/admin/nodes/{}/terminate", node.id)).await;
    res.assert_status_ok();
    assert_eq!(res.json::<Value>()["state"], "terminated");
    assert_eq!(fx.provider.delete_calls(), 1);

    let actions: Value = srv
        .get(&format!("/admin/actions?node_id={}", node.id))
        .await
        .json();
    assert!(actions
        .as_array()
        .unwrap()
        .iter()
        .any(|a| a["action_type"] == "TERMINATE_INSTANCE"));

    let status: Value = srv.get("/admin/status").await.json();
    assert_eq!(status["clouds"][0]["id"], CLOUD_ID);
}
