//! Backend implementation driving the cluster through the `kubectl` CLI.
//!
//! Deliberately thin: every method is one CLI invocation plus minimal
//! output parsing. The reconciliation logic lives above the [`Backend`]
//! trait, never here.

use std::io::Write;
use std::process::{Command, Stdio};

use anyhow::Context;
use tracing::debug;

use super::{Backend, ClusterInfo, ImageFacts, IngressKind, PollStatus, WaitKind};
use crate::resources::Resource;

pub struct KubectlBackend;

impl KubectlBackend {
    pub fn new() -> anyhow::Result<Self> {
        which_kubectl()?;
        Ok(Self)
    }

    fn output(&self, args: &[&str]) -> anyhow::Result<String> {
        debug!(?args, "kubectl");
        let out = Command::new("kubectl")
            .args(args)
            .output()
            .context("failed to run kubectl")?;
        if !out.status.success() {
            anyhow::bail!(
                "kubectl {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }

    fn succeeds(&self, args: &[&str]) -> bool {
        debug!(?args, "kubectl");
        Command::new("kubectl")
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    fn apply_manifest(&self, manifest: &serde_json::Value) -> anyhow::Result<()> {
        let mut child = Command::new("kubectl")
            .args(["apply", "-f", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to run kubectl apply")?;
        child
            .stdin
            .as_mut()
            .context("no stdin handle for kubectl apply")?
            .write_all(manifest.to_string().as_bytes())?;
        let out = child.wait_with_output()?;
        if !out.status.success() {
            anyhow::bail!(
                "kubectl apply failed: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Ok(())
    }
}

fn which_kubectl() -> anyhow::Result<()> {
    let found = Command::new("kubectl")
        .arg("version")
        .arg("--client")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false);
    if !found {
        anyhow::bail!("install kubectl before running this command");
    }
    Ok(())
}

impl Backend for KubectlBackend {
    fn check_cluster(&self) -> anyhow::Result<ClusterInfo> {
        self.output(&["get", "nodes", "-o", "name"])
            .context("cannot reach the cluster")?;
        let classes = self
            .output(&["get", "ingressclass", "-o", "jsonpath={.items[*].metadata.name}"])
            .unwrap_or_default();
        let ingress = if classes.contains("traefik") {
            Some(IngressKind::Traefik)
        } else if classes.contains("nginx") {
            Some(IngressKind::Nginx)
        } else {
            None
        };
        Ok(ClusterInfo { ingress })
    }

    fn apply(&self, _namespace: &str, resource: &Resource) -> anyhow::Result<()> {
        self.apply_manifest(&resource.manifest)
            .with_context(|| format!("failed to apply {}/{}", resource.kind, resource.name))
    }

    fn run_job(&self, _namespace: &str, job: &Resource) -> anyhow::Result<String> {
        self.apply_manifest(&job.manifest)
            .with_context(|| format!("failed to submit job {}", job.name))?;
        Ok(job.name.clone())
    }

    fn has_namespace(&self, namespace: &str) -> bool {
        self.succeeds(&["get", "namespace", namespace])
    }

    fn has_deployment(&self, namespace: &str, selector: &str) -> bool {
        self.output(&[
            "get",
            "deploy",
            "-n",
            namespace,
            "-l",
            selector,
            "-o",
            "jsonpath={.items[*].metadata.name}",
        ])
        .map(|names| !names.is_empty())
        .unwrap_or(false)
    }

    fn has_volume(&self, namespace: &str, claim: &str) -> bool {
        self.output(&[
            "get",
            "pvc",
            "-n",
            namespace,
            claim,
            "-o",
            "jsonpath={.status.phase}",
        ])
        .map(|phase| phase == "Bound")
        .unwrap_or(false)
    }

    fn has_secret(&self, namespace: &str, name: &str) -> bool {
        self.succeeds(&["get", "secret", "-n", namespace, name])
    }

    fn config_map_entry(&self, namespace: &str, name: &str, key: &str) -> Option<String> {
        let path = format!("{{.data.{}}}", key.replace('.', "\\."));
        self.output(&["get", "configmap", "-n", namespace, name, "-o", &format!("jsonpath={path}")])
            .ok()
            .filter(|value| !value.is_empty())
    }

    fn secret_entry(&self, namespace: &str, name: &str, key: &str) -> Option<String> {
        // go-template decodes the base64 payload for us.
        let template = format!("{{{{index .data \"{key}\" | base64decode}}}}");
        self.output(&["get", "secret", "-n", namespace, name, "-o", &format!("go-template={template}")])
            .ok()
            .filter(|value| !value.is_empty())
    }

    fn replicas(&self, namespace: &str, deployment: &str) -> Option<u32> {
        self.output(&[
            "get",
            "deploy",
            "-n",
            namespace,
            deployment,
            "-o",
            "jsonpath={.status.replicas}",
        ])
        .ok()
        .map(|count| count.parse().unwrap_or(0))
    }

    fn running_image(&self, namespace: &str, selector: &str) -> Option<String> {
        self.output(&[
            "get",
            "pod",
            "-n",
            namespace,
            "-l",
            selector,
            "-o",
            "jsonpath={.items[0].spec.containers[0].image}",
        ])
        .ok()
        .filter(|image| !image.is_empty())
    }

    fn scale(&self, namespace: &str, deployment: &str, replicas: u32) -> anyhow::Result<()> {
        self.output(&[
            "scale",
            "deploy",
            "-n",
            namespace,
            deployment,
            &format!("--replicas={replicas}"),
        ])
        .with_context(|| format!("cannot scale {deployment} to {replicas}"))?;
        Ok(())
    }

    fn inspect_image(
        &self,
        namespace: &str,
        image: &str,
        pull_policy: &str,
    ) -> anyhow::Result<ImageFacts> {
        // One-shot pod printing key=value facts; volumes of the target
        // namespace are visible to it, so the on-disk data version comes
        // from the same run.
        let overrides = serde_json::json!({
            "spec": {
                "containers": [{
                    "name": "inspector",
                    "image": image,
                    "imagePullPolicy": pull_policy,
                    "command": ["sh", "-c", INSPECT_SCRIPT],
                    "volumeMounts": [{"name": "var-db", "mountPath": "/var/lib/db"}],
                }],
                "volumes": [{
                    "name": "var-db",
                    "persistentVolumeClaim": {"claimName": "var-db"},
                }],
                "restartPolicy": "Never",
            }
        })
        .to_string();
        let out = self
            .output(&[
                "run",
                "atrium-inspector",
                "-n",
                namespace,
                "--rm",
                "--attach",
                "--quiet",
                "--restart=Never",
                &format!("--image={image}"),
                &format!("--overrides={overrides}"),
            ])
            .with_context(|| format!("failed to inspect image {image}"))?;
        Ok(parse_image_facts(&out))
    }

    fn poll(&self, namespace: &str, kind: WaitKind, name: &str) -> anyhow::Result<PollStatus> {
        match kind {
            WaitKind::Job => {
                let out = self
                    .output(&[
                        "get",
                        "job",
                        "-n",
                        namespace,
                        name,
                        "-o",
                        "jsonpath={.status.succeeded},{.status.failed}",
                    ])
                    .with_context(|| format!("failed to get {name} job status"))?;
                let (succeeded, failed) = out.split_once(',').unwrap_or((out.as_str(), ""));
                if succeeded == "1" {
                    Ok(PollStatus::Ready)
                } else if failed == "1" {
                    Ok(PollStatus::Failed(format!(
                        "job failed, run kubectl logs -n {namespace} --tail=-1 -ljob-name={name} for details"
                    )))
                } else {
                    Ok(PollStatus::Pending)
                }
            }
            WaitKind::Pod => {
                let out = self
                    .output(&[
                        "get",
                        "pod",
                        "-n",
                        namespace,
                        name,
                        "-o",
                        "jsonpath={.status.containerStatuses[0].state.terminated.reason}",
                    ])
                    .with_context(|| format!("failed to get {name} pod status"))?;
                match out.as_str() {
                    "" => Ok(PollStatus::Pending),
                    "Completed" => Ok(PollStatus::Ready),
                    reason => Ok(PollStatus::Failed(format!("pod ended with status {reason}"))),
                }
            }
            WaitKind::Deployment => {
                let out = self.output(&[
                    "get",
                    "deploy",
                    "-n",
                    namespace,
                    name,
                    "-o",
                    "jsonpath={.status.readyReplicas},{.spec.replicas}",
                ])?;
                let (ready, wanted) = out.split_once(',').unwrap_or(("", ""));
                let ready: u32 = ready.parse().unwrap_or(0);
                let wanted: u32 = wanted.parse().unwrap_or(1);
                if ready >= wanted {
                    Ok(PollStatus::Ready)
                } else {
                    Ok(PollStatus::Pending)
                }
            }
            WaitKind::Secret => {
                if self.succeeds(&["get", "secret", "-n", namespace, name]) {
                    Ok(PollStatus::Ready)
                } else {
                    Ok(PollStatus::Pending)
                }
            }
            WaitKind::Issuer => {
                let out = self
                    .output(&[
                        "get",
                        "issuer",
                        "-n",
                        namespace,
                        name,
                        "-o",
                        "jsonpath={.status.conditions[*].type}",
                    ])
                    .unwrap_or_default();
                if out.contains("Ready") {
                    Ok(PollStatus::Ready)
                } else {
                    Ok(PollStatus::Pending)
                }
            }
        }
    }
}

const INSPECT_SCRIPT: &str = r#"
cat /etc/atrium-release 2>/dev/null | sed 's/^/product_release=/'
cat /usr/lib/atrium/db-version 2>/dev/null | sed 's/^/image_schema_version=/'
cat /var/lib/db/data/VERSION 2>/dev/null | sed 's/^/data_schema_version=/'
cat /var/lib/db/dbname 2>/dev/null | sed 's/^/db_name=/'
cat /var/lib/db/dbport 2>/dev/null | sed 's/^/db_port=/'
cat /var/lib/db/fqdn 2>/dev/null | sed 's/^/fqdn=/'
"#;

/// Parse the key=value lines emitted by the inspection script.
fn parse_image_facts(out: &str) -> ImageFacts {
    let mut facts = ImageFacts::default();
    for line in out.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        match key {
            "product_release" => facts.product_release = Some(value.to_string()),
            "image_schema_version" => facts.image_schema_version = value.parse().ok(),
            "data_schema_version" => facts.data_schema_version = value.parse().ok(),
            "db_name" => facts.db_name = Some(value.to_string()),
            "db_port" => facts.db_port = value.parse().ok(),
            "fqdn" => facts.fqdn = Some(value.to_string()),
            _ => {}
        }
    }
    facts
}
