//! Node-agent convergence driven through the public reconciliation
//! entry point with a real env file and a fake service manager.

use castellan::castellan::api::types::Node;
use castellan::castellan::node::agent::{
    apply_config_update, effective_desired_config, RUNTIME_CONFIG_KEY, RUNTIME_VERSION_KEY,
};
use castellan::castellan::node::service::{ServiceManager, RESTART_DONE};
use castellan::castellan::node::{CURRENT_VERSION_ANNOTATION, DESIRED_VERSION_ANNOTATION};
use std::collections::BTreeMap;
use std::error::Error;
use std::fs;
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Default)]
struct RecordingManager {
    restarts: AtomicU32,
    fail: bool,
}

impl ServiceManager for RecordingManager {
    async fn reload(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        Ok(())
    }

    async fn restart_unit(&self, _unit: &str) -> Result<String, Box<dyn Error + Send + Sync>> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        Ok(if self.fail {
            "failed".to_string()
        } else {
            RESTART_DONE.to_string()
        })
    }
}

#[tokio::test]
async fn annotation_converges_with_on_disk_state() {
    let dir = tempfile::tempdir().expect("tempdir");
    let env_path = dir.path().join("runtime.env");
    fs::write(&env_path, "RUNTIME_VERSION=repo/runtime:v1.0.0\nKEEP=1\n").expect("seed");

    // The controller wrote only the bare reference form.
    let mut node = Node::default();
    node.metadata.name = Some("worker-0".to_string());
    node.metadata
        .set_annotation(DESIRED_VERSION_ANNOTATION, "repo/runtime:v2.0.0");

    let desired = effective_desired_config(&node)
        .expect("parse")
        .expect("present");
    assert_eq!(desired[RUNTIME_VERSION_KEY], "repo/runtime:v2.0.0");
    assert!(!desired.contains_key(RUNTIME_CONFIG_KEY));

    let manager = RecordingManager::default();
    let restarted = apply_config_update(&manager, &env_path, &mut node, &desired, None)
        .await
        .expect("apply");

    assert!(restarted);
    assert_eq!(manager.restarts.load(Ordering::SeqCst), 1);

    // The advertised version matches the env file exactly.
    let contents = fs::read_to_string(&env_path).expect("read");
    assert!(contents.contains("RUNTIME_VERSION=repo/runtime:v2.0.0"));
    assert!(contents.contains("KEEP=1"));
    assert_eq!(
        node.metadata.annotation(CURRENT_VERSION_ANNOTATION),
        Some("repo/runtime:v2.0.0")
    );

    // A second pass is a no-op: the service is not restarted again.
    let restarted = apply_config_update(&manager, &env_path, &mut node, &desired, None)
        .await
        .expect("apply");
    assert!(!restarted);
    assert_eq!(manager.restarts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_restart_surfaces_and_keeps_annotations() {
    let dir = tempfile::tempdir().expect("tempdir");
    let env_path = dir.path().join("runtime.env");
    fs::write(&env_path, "RUNTIME_VERSION=repo/runtime:v1.0.0\n").expect("seed");

    let mut node = Node::default();
    node.metadata.name = Some("worker-0".to_string());
    let mut desired = BTreeMap::new();
    desired.insert(
        RUNTIME_VERSION_KEY.to_string(),
        "repo/runtime:v2.0.0".to_string(),
    );

    let manager = RecordingManager {
        fail: true,
        ..RecordingManager::default()
    };
    let err = apply_config_update(&manager, &env_path, &mut node, &desired, None)
        .await
        .expect_err("failed restart must surface");

    assert!(err.to_string().contains("unexpected status"));
    assert!(node
        .metadata
        .annotation(CURRENT_VERSION_ANNOTATION)
        .is_none());
}
