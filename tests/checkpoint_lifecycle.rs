//! End-to-end checkpoint lifecycle against a fake store and runtime:
//! snapshot, promotion on parent loss, retirement on recovery, and
//! grace-period collection, all on a real filesystem.

use castellan::castellan::api::types::{
    Base64Bytes, ConfigMap, ObjectMeta, Pod, PodSpec, Secret, SecretVolumeSource, VolumeSpec,
};
use castellan::castellan::checkpoint::manifest::ManifestStore;
use castellan::castellan::checkpoint::{
    checkpoint_key, Checkpointer, CheckpointerConfig, PodRuntime, RemoteStore,
    CHECKPOINT_ANNOTATION, CHECKPOINT_OF_ANNOTATION,
};
use std::collections::HashMap;
use std::error::Error;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct FakeStoreInner {
    secrets: Mutex<HashMap<(String, String), Secret>>,
    config_maps: Mutex<HashMap<(String, String), ConfigMap>>,
    pods: Mutex<Vec<Pod>>,
    reachable: AtomicBool,
    healthy: AtomicBool,
}

#[derive(Clone, Default)]
struct FakeStore {
    inner: Arc<FakeStoreInner>,
}

impl FakeStore {
    fn new() -> Self {
        let store = Self::default();
        store.inner.reachable.store(true, Ordering::SeqCst);
        store.inner.healthy.store(true, Ordering::SeqCst);
        store
    }

    fn put_secret(&self, secret: Secret) {
        let key = (
            secret.metadata.namespace.clone().unwrap(),
            secret.metadata.name.clone().unwrap(),
        );
        self.inner.secrets.lock().unwrap().insert(key, secret);
    }

    fn set_pods(&self, pods: Vec<Pod>) {
        *self.inner.pods.lock().unwrap() = pods;
    }

    fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
    }
}

impl RemoteStore for FakeStore {
    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Secret>, Box<dyn Error + Send + Sync>> {
        if !self.inner.reachable.load(Ordering::SeqCst) {
            return Err("store unreachable".into());
        }
        Ok(self
            .inner
            .secrets
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, Box<dyn Error + Send + Sync>> {
        if !self.inner.reachable.load(Ordering::SeqCst) {
            return Err("store unreachable".into());
        }
        Ok(self
            .inner
            .config_maps
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn list_pods(&self, _namespace: &str) -> Result<Vec<Pod>, Box<dyn Error + Send + Sync>> {
        if !self.inner.reachable.load(Ordering::SeqCst) {
            return Err("store unreachable".into());
        }
        Ok(self.inner.pods.lock().unwrap().clone())
    }

    async fn discovery_healthy(&self) -> bool {
        self.inner.healthy.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Default)]
struct FakeRuntime {
    pods: Arc<Mutex<Vec<Pod>>>,
}

impl FakeRuntime {
    fn set_pods(&self, pods: Vec<Pod>) {
        *self.pods.lock().unwrap() = pods;
    }
}

impl PodRuntime for FakeRuntime {
    async fn running_pods(&self) -> Result<Vec<Pod>, Box<dyn Error + Send + Sync>> {
        Ok(self.pods.lock().unwrap().clone())
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    store: FakeStore,
    runtime: FakeRuntime,
    checkpointer: Checkpointer<FakeStore, FakeRuntime>,
    manifests: ManifestStore,
    secret_root: PathBuf,
}

fn fixture(grace_period: Duration) -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let active = dir.path().join("active");
    let inactive = dir.path().join("inactive");
    let secret_root = dir.path().join("secrets");
    let config_map_root = dir.path().join("configmaps");
    fs::create_dir_all(&active).expect("active dir");
    fs::create_dir_all(&inactive).expect("inactive dir");

    let store = FakeStore::new();
    let runtime = FakeRuntime::default();
    let manifests = ManifestStore::new(active, inactive);
    let checkpointer = Checkpointer::new(
        store.clone(),
        runtime.clone(),
        manifests.clone(),
        secret_root.clone(),
        config_map_root,
        CheckpointerConfig {
            self_pod: None,
            grace_period,
            tick_interval: Duration::from_secs(1),
        },
    );

    Fixture {
        _dir: dir,
        store,
        runtime,
        checkpointer,
        manifests,
        secret_root,
    }
}

fn scheduler_parent() -> Pod {
    let mut meta = ObjectMeta::named(Some("kube-system"), "kube-scheduler");
    meta.set_annotation(CHECKPOINT_ANNOTATION, "true");
    let mut pod = Pod::new(meta, PodSpec::default());
    pod.status = Some(Default::default());
    pod
}

fn scheduler_child(key: &str) -> Pod {
    let mut meta = ObjectMeta::named(Some("kube-system"), "kube-scheduler");
    meta.set_annotation(CHECKPOINT_OF_ANNOTATION, key);
    Pod::new(meta, PodSpec::default())
}

fn secret_with(entries: &[(&str, &str)]) -> Secret {
    let mut secret = Secret {
        metadata: ObjectMeta::named(Some("kube-system"), "scheduler-creds"),
        ..Secret::default()
    };
    for (key, value) in entries {
        secret
            .data
            .insert(key.to_string(), Base64Bytes(value.as_bytes().to_vec()));
    }
    secret
}

#[tokio::test]
async fn checkpoint_survives_parent_restart() {
    let mut fx = fixture(Duration::from_secs(3600));
    let key = checkpoint_key("kube-system", "kube-scheduler");
    let parent = scheduler_parent();

    // Parent running: a warm standby is written, nothing is active.
    fx.store.set_pods(vec![parent.clone()]);
    fx.runtime.set_pods(vec![parent.clone()]);
    fx.checkpointer.tick().await.expect("tick");
    assert!(fx.manifests.inactive_exists(&key));
    assert!(!fx.manifests.active_exists(&key));

    // Parent dies: the standby is promoted within one tick, tagged as
    // a checkpoint of its parent.
    fx.runtime.set_pods(Vec::new());
    fx.checkpointer.tick().await.expect("tick");
    assert!(fx.manifests.active_exists(&key));
    let promoted: Pod =
        serde_json::from_slice(&fs::read(fx.manifests.active_path(&key)).expect("read"))
            .expect("decode");
    assert_eq!(
        promoted.metadata.annotation(CHECKPOINT_OF_ANNOTATION),
        Some(key.as_str())
    );

    // The runtime now runs the checkpoint; nothing changes.
    fx.runtime.set_pods(vec![scheduler_child(&key)]);
    fx.checkpointer.tick().await.expect("tick");
    assert!(fx.manifests.active_exists(&key));

    // Parent returns: the active copy is retired, the warm standby
    // stays.
    fx.runtime.set_pods(vec![parent, scheduler_child(&key)]);
    fx.checkpointer.tick().await.expect("tick");
    assert!(!fx.manifests.active_exists(&key));
    assert!(fx.manifests.inactive_exists(&key));
}

#[tokio::test]
async fn secrets_are_rewritten_to_host_paths() {
    let mut fx = fixture(Duration::from_secs(3600));
    let key = checkpoint_key("kube-system", "kube-scheduler");

    let mut parent = scheduler_parent();
    parent.spec.volumes = vec![VolumeSpec {
        name: "creds".to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: "scheduler-creds".to_string(),
            ..SecretVolumeSource::default()
        }),
        ..VolumeSpec::default()
    }];
    fx.store.put_secret(secret_with(&[("A", "X"), ("B", "Y")]));
    fx.store.set_pods(vec![parent.clone()]);
    fx.runtime.set_pods(vec![parent]);

    fx.checkpointer.tick().await.expect("tick");

    let base = fx
        .secret_root
        .join("kube-system")
        .join("kube-scheduler")
        .join("scheduler-creds");
    assert_eq!(fs::read(base.join("A")).expect("A"), b"X");
    assert_eq!(fs::read(base.join("B")).expect("B"), b"Y");
    for item in ["A", "B"] {
        let mode = fs::metadata(base.join(item))
            .expect("metadata")
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600, "wrong mode on {item}");
    }

    let manifest: Pod =
        serde_json::from_slice(&fs::read(fx.manifests.inactive_path(&key)).expect("read"))
            .expect("decode");
    let volume = &manifest.spec.volumes[0];
    assert!(volume.secret.is_none());
    assert_eq!(
        volume.host_path.as_ref().expect("host path").path,
        base.to_string_lossy()
    );
}

#[tokio::test]
async fn store_error_keeps_last_known_good_checkpoint() {
    let mut fx = fixture(Duration::from_secs(3600));
    let key = checkpoint_key("kube-system", "kube-scheduler");

    let mut parent = scheduler_parent();
    parent.spec.volumes = vec![VolumeSpec {
        name: "creds".to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: "scheduler-creds".to_string(),
            ..SecretVolumeSource::default()
        }),
        ..VolumeSpec::default()
    }];
    fx.store.put_secret(secret_with(&[("A", "X")]));
    fx.store.set_pods(vec![parent.clone()]);
    fx.runtime.set_pods(vec![parent]);
    fx.checkpointer.tick().await.expect("tick");
    let before = fs::read(fx.manifests.inactive_path(&key)).expect("read");

    // Snapshot refresh fails while the store is down; the previous
    // manifest must stay untouched.
    fx.store.set_reachable(false);
    fx.checkpointer.tick().await.expect("tick");
    let after = fs::read(fx.manifests.inactive_path(&key)).expect("read");
    assert_eq!(before, after);
}

#[tokio::test]
async fn collection_needs_store_confirmed_absence() {
    let mut fx = fixture(Duration::ZERO);
    let key = checkpoint_key("kube-system", "kube-scheduler");
    let parent = scheduler_parent();

    fx.store.set_pods(vec![parent.clone()]);
    fx.runtime.set_pods(vec![parent]);
    fx.checkpointer.tick().await.expect("tick");
    assert!(fx.manifests.inactive_exists(&key));

    // Parent disappears everywhere, but the store is unreachable:
    // nothing may be collected.
    fx.runtime.set_pods(Vec::new());
    fx.store.set_reachable(false);
    fx.checkpointer.tick().await.expect("tick");
    assert!(fx.manifests.inactive_exists(&key));

    // Store back and confirming the deletion: with a zero grace
    // period the confirming ticks collect everything.
    fx.store.set_reachable(true);
    fx.store.set_pods(Vec::new());
    fx.checkpointer.tick().await.expect("tick");
    fx.checkpointer.tick().await.expect("tick");
    assert!(!fx.manifests.inactive_exists(&key));
    assert!(!fx.manifests.active_exists(&key));
    assert!(!fx
        .secret_root
        .join("kube-system")
        .join("kube-scheduler")
        .exists());
}

#[tokio::test]
async fn unhealthy_api_server_is_promoted() {
    let mut fx = fixture(Duration::from_secs(3600));
    let key = checkpoint_key("kube-system", "kube-apiserver-worker-0");
    assert_eq!(key, "kube-system-kube-apiserver");

    let mut meta = ObjectMeta::named(Some("kube-system"), "kube-apiserver-worker-0");
    meta.set_annotation(CHECKPOINT_ANNOTATION, "true");
    let parent = Pod::new(meta, PodSpec::default());

    fx.store.set_pods(vec![parent.clone()]);
    fx.runtime.set_pods(vec![parent.clone()]);
    fx.checkpointer.tick().await.expect("tick");
    assert!(fx.manifests.inactive_exists(&key));

    // The manifest is still present locally but the server stopped
    // answering discovery: the checkpoint takes over.
    fx.store.inner.healthy.store(false, Ordering::SeqCst);
    fx.checkpointer.tick().await.expect("tick");
    assert!(fx.manifests.active_exists(&key));
}
