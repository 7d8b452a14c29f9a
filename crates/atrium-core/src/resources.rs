//! Builders for the declarative resource descriptions handed to the backend.
//!
//! The engine treats these documents as opaque payloads: they are built
//! here, serialized as JSON and passed to [`Backend::apply`] or
//! [`Backend::run_job`] verbatim. The orchestration CLI accepts JSON
//! wherever it accepts YAML.
//!
//! [`Backend::apply`]: crate::backend::Backend::apply
//! [`Backend::run_job`]: crate::backend::Backend::run_job

use serde_json::{Value, json};

/// Label attached to everything this tool creates.
pub const MANAGED_BY_LABEL: &str = "atriumadm";

/// A declarative resource description.
///
/// `kind` and `name` are kept outside the payload for logging and error
/// messages; `manifest` is the full document.
#[derive(Debug, Clone)]
pub struct Resource {
    pub kind: String,
    pub name: String,
    pub manifest: Value,
}

impl Resource {
    fn new(kind: &str, name: &str, manifest: Value) -> Self {
        Self {
            kind: kind.to_string(),
            name: name.to_string(),
            manifest,
        }
    }
}

/// A volume attached to a job or deployment.
#[derive(Debug, Clone)]
pub struct VolumeMount {
    pub claim: String,
    pub mount_path: String,
}

impl VolumeMount {
    pub fn new(claim: &str, mount_path: &str) -> Self {
        Self {
            claim: claim.to_string(),
            mount_path: mount_path.to_string(),
        }
    }
}

fn labels() -> Value {
    json!({"app": "atrium", "app.kubernetes.io/managed-by": MANAGED_BY_LABEL})
}

fn metadata(namespace: &str, name: &str) -> Value {
    json!({"namespace": namespace, "name": name, "labels": labels()})
}

pub fn namespace(name: &str) -> Resource {
    Resource::new(
        "Namespace",
        name,
        json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {"name": name, "labels": labels()},
        }),
    )
}

pub fn persistent_volume_claim(
    namespace_name: &str,
    name: &str,
    size: &str,
    storage_class: Option<&str>,
) -> Resource {
    let mut spec = json!({
        "accessModes": ["ReadWriteOnce"],
        "resources": {"requests": {"storage": size}},
    });
    if let Some(class) = storage_class {
        spec["storageClassName"] = json!(class);
    }
    Resource::new(
        "PersistentVolumeClaim",
        name,
        json!({
            "apiVersion": "v1",
            "kind": "PersistentVolumeClaim",
            "metadata": metadata(namespace_name, name),
            "spec": spec,
        }),
    )
}

/// Secret holding a username/password pair.
pub fn basic_auth_secret(namespace_name: &str, name: &str, user: &str, password: &str) -> Resource {
    Resource::new(
        "Secret",
        name,
        json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "type": "kubernetes.io/basic-auth",
            "metadata": metadata(namespace_name, name),
            "stringData": {"username": user, "password": password},
        }),
    )
}

/// Opaque secret from string entries.
pub fn string_secret(namespace_name: &str, name: &str, entries: &[(&str, &str)]) -> Resource {
    let data: serde_json::Map<String, Value> = entries
        .iter()
        .map(|(k, v)| (k.to_string(), json!(v)))
        .collect();
    Resource::new(
        "Secret",
        name,
        json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "type": "Opaque",
            "metadata": metadata(namespace_name, name),
            "stringData": data,
        }),
    )
}

/// Pull secret for an authenticated image registry.
pub fn registry_secret(namespace_name: &str, name: &str, auth_config: &str) -> Resource {
    Resource::new(
        "Secret",
        name,
        json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "type": "kubernetes.io/dockerconfigjson",
            "metadata": metadata(namespace_name, name),
            "stringData": {".dockerconfigjson": auth_config},
        }),
    )
}

/// TLS secret from caller-provided PEM material.
pub fn tls_secret(namespace_name: &str, name: &str, cert: &str, key: &str, ca: &str) -> Resource {
    Resource::new(
        "Secret",
        name,
        json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "type": "kubernetes.io/tls",
            "metadata": metadata(namespace_name, name),
            "stringData": {"tls.crt": cert, "tls.key": key, "ca.crt": ca},
        }),
    )
}

pub fn config_map(namespace_name: &str, name: &str, entries: &[(&str, &str)]) -> Resource {
    let data: serde_json::Map<String, Value> = entries
        .iter()
        .map(|(k, v)| (k.to_string(), json!(v)))
        .collect();
    Resource::new(
        "ConfigMap",
        name,
        json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": metadata(namespace_name, name),
            "data": data,
        }),
    )
}

/// Certificate-manager issuer signing with an existing CA secret.
pub fn ca_issuer(namespace_name: &str, name: &str, ca_secret: &str) -> Resource {
    Resource::new(
        "Issuer",
        name,
        json!({
            "apiVersion": "cert-manager.io/v1",
            "kind": "Issuer",
            "metadata": metadata(namespace_name, name),
            "spec": {"ca": {"secretName": ca_secret}},
        }),
    )
}

/// Bootstrap issuer used once to self-sign a brand new CA.
pub fn self_signed_issuer(namespace_name: &str, name: &str) -> Resource {
    Resource::new(
        "Issuer",
        name,
        json!({
            "apiVersion": "cert-manager.io/v1",
            "kind": "Issuer",
            "metadata": metadata(namespace_name, name),
            "spec": {"selfSigned": {}},
        }),
    )
}

/// Certificate request, either for the CA itself or for a leaf bound to a
/// DNS name.
pub fn certificate(
    namespace_name: &str,
    name: &str,
    secret_name: &str,
    issuer: &str,
    dns_name: Option<&str>,
    is_ca: bool,
    subject: &[(&str, &str)],
) -> Resource {
    let mut spec = json!({
        "secretName": secret_name,
        "isCA": is_ca,
        "issuerRef": {"name": issuer, "kind": "Issuer"},
        "commonName": dns_name.unwrap_or(name),
    });
    if let Some(fqdn) = dns_name {
        spec["dnsNames"] = json!([fqdn]);
    }
    if !subject.is_empty() {
        let fields: serde_json::Map<String, Value> = subject
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, v)| (k.to_string(), json!([v])))
            .collect();
        spec["subject"] = json!(fields);
    }
    Resource::new(
        "Certificate",
        name,
        json!({
            "apiVersion": "cert-manager.io/v1",
            "kind": "Certificate",
            "metadata": metadata(namespace_name, name),
            "spec": spec,
        }),
    )
}

/// Ingress exposing the server behind the cluster's controller.
///
/// The issuer annotation makes the certificate controller emit the serving
/// certificate secret referenced in the TLS section.
pub fn ingress(
    namespace_name: &str,
    name: &str,
    fqdn: &str,
    tls_secret_name: &str,
    issuer: Option<&str>,
    service: &str,
    port: u16,
) -> Resource {
    let mut meta = metadata(namespace_name, name);
    if let Some(issuer_name) = issuer {
        meta["annotations"] = json!({"cert-manager.io/issuer": issuer_name});
    }
    Resource::new(
        "Ingress",
        name,
        json!({
            "apiVersion": "networking.k8s.io/v1",
            "kind": "Ingress",
            "metadata": meta,
            "spec": {
                "tls": [{"hosts": [fqdn], "secretName": tls_secret_name}],
                "rules": [{
                    "host": fqdn,
                    "http": {"paths": [{
                        "path": "/",
                        "pathType": "Prefix",
                        "backend": {"service": {"name": service, "port": {"number": port}}},
                    }]},
                }],
            },
        }),
    )
}

/// Traefik TCP route for ports the HTTP ingress cannot carry.
pub fn traefik_tcp_route(namespace_name: &str, name: &str, service: &str, port: u16) -> Resource {
    Resource::new(
        "IngressRouteTCP",
        name,
        json!({
            "apiVersion": "traefik.io/v1alpha1",
            "kind": "IngressRouteTCP",
            "metadata": metadata(namespace_name, name),
            "spec": {
                "entryPoints": [name],
                "routes": [{
                    "match": "HostSNI(`*`)",
                    "services": [{"name": service, "port": port}],
                }],
            },
        }),
    )
}

/// Service selecting the pods of one component deployment.
pub fn service(namespace_name: &str, name: &str, component: &str, ports: &[(&str, u16)]) -> Resource {
    let port_list: Vec<Value> = ports
        .iter()
        .map(|(port_name, port)| json!({"name": port_name, "port": port}))
        .collect();
    Resource::new(
        "Service",
        name,
        json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": metadata(namespace_name, name),
            "spec": {"selector": {"component": component}, "ports": port_list},
        }),
    )
}

/// Deployment for one of the product's components.
pub fn deployment(
    namespace_name: &str,
    name: &str,
    image: &str,
    pull_policy: &str,
    replicas: u32,
    mounts: &[VolumeMount],
    env: &[(&str, &str)],
    pull_secret: Option<&str>,
) -> Resource {
    // The component label is what services and the probe select on.
    let mut meta = metadata(namespace_name, name);
    meta["labels"]["component"] = json!(name);
    Resource::new(
        "Deployment",
        name,
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": meta,
            "spec": {
                "replicas": replicas,
                "selector": {"matchLabels": {"component": name}},
                "template": {
                    "metadata": {"labels": {"app": "atrium", "component": name}},
                    "spec": pod_spec(name, image, pull_policy, mounts, env, pull_secret, None),
                },
            },
        }),
    )
}

/// One-shot job running a rendered script to completion.
pub fn script_job(
    namespace_name: &str,
    name: &str,
    image: &str,
    pull_policy: &str,
    mounts: &[VolumeMount],
    pull_secret: Option<&str>,
    script: &str,
) -> Resource {
    let mut spec = pod_spec(name, image, pull_policy, mounts, &[], pull_secret, Some(script));
    spec["restartPolicy"] = json!("Never");
    Resource::new(
        "Job",
        name,
        json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": metadata(namespace_name, name),
            "spec": {"backoffLimit": 0, "template": {"spec": spec}},
        }),
    )
}

fn pod_spec(
    name: &str,
    image: &str,
    pull_policy: &str,
    mounts: &[VolumeMount],
    env: &[(&str, &str)],
    pull_secret: Option<&str>,
    script: Option<&str>,
) -> Value {
    let volume_mounts: Vec<Value> = mounts
        .iter()
        .map(|m| json!({"name": m.claim, "mountPath": m.mount_path}))
        .collect();
    let volumes: Vec<Value> = mounts
        .iter()
        .map(|m| json!({"name": m.claim, "persistentVolumeClaim": {"claimName": m.claim}}))
        .collect();
    let env_list: Vec<Value> = env
        .iter()
        .map(|(k, v)| json!({"name": k, "value": v}))
        .collect();

    let mut container = json!({
        "name": name,
        "image": image,
        "imagePullPolicy": pull_policy,
        "volumeMounts": volume_mounts,
        "env": env_list,
    });
    if let Some(body) = script {
        container["command"] = json!(["sh", "-c", body]);
    }

    let mut spec = json!({"containers": [container], "volumes": volumes});
    if let Some(secret) = pull_secret {
        spec["imagePullSecrets"] = json!([{"name": secret}]);
    }
    spec
}
