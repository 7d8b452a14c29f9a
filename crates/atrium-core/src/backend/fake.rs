//! In-memory backend fake shared by the unit tests.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};

use super::{Backend, ClusterInfo, ImageFacts, IngressKind, PollStatus, WaitKind};
use crate::resources::Resource;

/// Scriptable fake environment.
///
/// Seeds describe the pre-existing state; every mutating call is recorded
/// in `ops` in invocation order so tests can assert sequencing.
#[derive(Default)]
pub struct FakeBackend {
    pub reachable: RefCell<bool>,
    pub ingress: RefCell<Option<IngressKind>>,
    pub namespaces: RefCell<HashSet<String>>,
    pub volumes: RefCell<HashSet<String>>,
    pub deployments: RefCell<HashMap<String, u32>>,
    pub secrets: RefCell<HashSet<String>>,
    pub config_maps: RefCell<HashMap<(String, String), String>>,
    pub secret_data: RefCell<HashMap<(String, String), String>>,
    pub server_image: RefCell<Option<String>>,
    pub image_facts: RefCell<HashMap<String, ImageFacts>>,
    /// Scripted poll outcomes, drained front to back; `Ready` once empty.
    pub poll_script: RefCell<VecDeque<PollStatus>>,
    pub ops: RefCell<Vec<String>>,
    pub poll_count: RefCell<u32>,
    /// Resource name whose apply should fail, for abort tests.
    pub fail_apply_of: RefCell<Option<String>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            reachable: RefCell::new(true),
            ingress: RefCell::new(Some(IngressKind::Traefik)),
            ..Default::default()
        }
    }

    pub fn seed_namespace(&self, name: &str) {
        self.namespaces.borrow_mut().insert(name.to_string());
    }

    pub fn seed_volume(&self, claim: &str) {
        self.volumes.borrow_mut().insert(claim.to_string());
    }

    pub fn seed_deployment(&self, name: &str, replicas: u32) {
        self.deployments.borrow_mut().insert(name.to_string(), replicas);
    }

    pub fn seed_image_facts(&self, image: &str, facts: ImageFacts) {
        self.image_facts.borrow_mut().insert(image.to_string(), facts);
    }

    pub fn script_polls(&self, outcomes: impl IntoIterator<Item = PollStatus>) {
        self.poll_script.borrow_mut().extend(outcomes);
    }

    pub fn ops(&self) -> Vec<String> {
        self.ops.borrow().clone()
    }

    fn record(&self, op: String) {
        self.ops.borrow_mut().push(op);
    }
}

impl Backend for FakeBackend {
    fn check_cluster(&self) -> anyhow::Result<ClusterInfo> {
        if !*self.reachable.borrow() {
            anyhow::bail!("connection refused");
        }
        Ok(ClusterInfo {
            ingress: *self.ingress.borrow(),
        })
    }

    fn apply(&self, _namespace: &str, resource: &Resource) -> anyhow::Result<()> {
        if self.fail_apply_of.borrow().as_deref() == Some(resource.name.as_str()) {
            anyhow::bail!("rejected manifest for {}", resource.name);
        }
        self.record(format!("apply {}/{}", resource.kind, resource.name));
        match resource.kind.as_str() {
            "Namespace" => {
                self.namespaces.borrow_mut().insert(resource.name.clone());
            }
            "PersistentVolumeClaim" => {
                self.volumes.borrow_mut().insert(resource.name.clone());
            }
            "Secret" => {
                self.secrets.borrow_mut().insert(resource.name.clone());
                if let Some(data) = resource.manifest["stringData"].as_object() {
                    for (key, value) in data {
                        self.secret_data.borrow_mut().insert(
                            (resource.name.clone(), key.clone()),
                            value.as_str().unwrap_or_default().to_string(),
                        );
                    }
                }
            }
            "ConfigMap" => {
                if let Some(data) = resource.manifest["data"].as_object() {
                    for (key, value) in data {
                        self.config_maps.borrow_mut().insert(
                            (resource.name.clone(), key.clone()),
                            value.as_str().unwrap_or_default().to_string(),
                        );
                    }
                }
            }
            "Deployment" => {
                let replicas = resource.manifest["spec"]["replicas"].as_u64().unwrap_or(1);
                self.deployments
                    .borrow_mut()
                    .insert(resource.name.clone(), replicas as u32);
            }
            _ => {}
        }
        Ok(())
    }

    fn run_job(&self, _namespace: &str, job: &Resource) -> anyhow::Result<String> {
        self.record(format!("job {}", job.name));
        Ok(job.name.clone())
    }

    fn has_namespace(&self, namespace: &str) -> bool {
        self.namespaces.borrow().contains(namespace)
    }

    fn has_deployment(&self, _namespace: &str, _selector: &str) -> bool {
        self.server_image.borrow().is_some()
    }

    fn has_volume(&self, _namespace: &str, claim: &str) -> bool {
        self.volumes.borrow().contains(claim)
    }

    fn has_secret(&self, _namespace: &str, name: &str) -> bool {
        self.secrets.borrow().contains(name)
    }

    fn config_map_entry(&self, namespace: &str, name: &str, key: &str) -> Option<String> {
        let _ = namespace;
        self.config_maps
            .borrow()
            .get(&(name.to_string(), key.to_string()))
            .cloned()
    }

    fn secret_entry(&self, namespace: &str, name: &str, key: &str) -> Option<String> {
        let _ = namespace;
        self.secret_data
            .borrow()
            .get(&(name.to_string(), key.to_string()))
            .cloned()
    }

    fn replicas(&self, _namespace: &str, deployment: &str) -> Option<u32> {
        self.deployments.borrow().get(deployment).copied()
    }

    fn running_image(&self, _namespace: &str, _selector: &str) -> Option<String> {
        self.server_image.borrow().clone()
    }

    fn scale(&self, _namespace: &str, deployment: &str, replicas: u32) -> anyhow::Result<()> {
        self.record(format!("scale {deployment}={replicas}"));
        self.deployments
            .borrow_mut()
            .insert(deployment.to_string(), replicas);
        Ok(())
    }

    fn inspect_image(
        &self,
        _namespace: &str,
        image: &str,
        _pull_policy: &str,
    ) -> anyhow::Result<ImageFacts> {
        self.image_facts
            .borrow()
            .get(image)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no inspect data for image {image}"))
    }

    fn poll(&self, _namespace: &str, _kind: WaitKind, name: &str) -> anyhow::Result<PollStatus> {
        *self.poll_count.borrow_mut() += 1;
        self.record(format!("poll {name}"));
        Ok(self
            .poll_script
            .borrow_mut()
            .pop_front()
            .unwrap_or(PollStatus::Ready))
    }
}
