use anyhow::{Context, Result};
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt::Debug;
use tracing::{debug, info};

use crate::config::MANAGED_BY;
use crate::error::GatewayError;

pub type DecodedSecret = BTreeMap<String, String>;

pub trait NamespacedResource:
    Resource<Scope = NamespaceResourceScope, DynamicType = ()>
    + Clone
    + Debug
    + DeserializeOwned
    + Serialize
    + Send
    + Sync
    + 'static
{
}

impl<K> NamespacedResource for K where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + DeserializeOwned
        + Serialize
        + Send
        + Sync
        + 'static
{
}

#[derive(Debug, Clone, Default)]
pub struct RunPodOptions {
    pub port: Option<u16>,
    pub env: BTreeMap<String, String>,
    pub args: Vec<String>,
}

#[derive(Clone)]
pub struct KubeGateway {
    client: Client,
    context: String,
    page_size: u32,
}

impl KubeGateway {
    pub async fn connect(expected_context: &str, page_size: u32) -> Result<Self> {
        let kubeconfig = Kubeconfig::read().context("failed to read kubeconfig")?;
        let active_context = kubeconfig.current_context.clone().unwrap_or_default();
        ensure_context(expected_context, &active_context)?;

        let options = KubeConfigOptions {
            context: Some(active_context.clone()),
            cluster: None,
            user: None,
        };
        let config = Config::from_custom_kubeconfig(kubeconfig, &options)
            .await
            .context("failed to infer Kubernetes configuration")?;
        let client = Client::try_from(config).context("failed to initialize Kubernetes client")?;
        debug!(context = %active_context, "connected to cluster");

        Ok(Self {
            client,
            context: active_context,
            page_size: page_size.max(1),
        })
    }

    #[cfg(test)]
    pub fn from_client(client: Client, context: &str, page_size: u32) -> Self {
        Self {
            client,
            context: context.to_string(),
            page_size: page_size.max(1),
        }
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn api<K: NamespacedResource>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub async fn get<K: NamespacedResource>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<K>> {
        self.api::<K>(namespace)
            .get_opt(name)
            .await
            .with_context(|| format!("failed to read {} {namespace}/{name}", K::kind(&())))
    }

    /// Lists every resource in the namespace, following continuation tokens
    /// until the server reports no further pages.
    pub async fn list<K: NamespacedResource>(
        &self,
        namespace: &str,
        label_selector: Option<&str>,
    ) -> Result<Vec<K>> {
        let api = self.api::<K>(namespace);
        let mut params = ListParams::default().limit(self.page_size);
        if let Some(selector) = label_selector.filter(|value| !value.trim().is_empty()) {
            params = params.labels(selector);
        }

        let mut items = Vec::new();
        let mut continue_token: Option<String> = None;
        loop {
            let page_params = match continue_token.take() {
                Some(token) => params.clone().continue_token(&token),
                None => params.clone(),
            };
            let page = api
                .list(&page_params)
                .await
                .with_context(|| format!("failed to list {} in {namespace}", K::plural(&())))?;
            items.extend(page.items);

            match page.metadata.continue_ {
                Some(token) if !token.is_empty() => continue_token = Some(token),
                _ => break,
            }
        }

        Ok(items)
    }

    pub async fn pods(&self, namespace: &str, deployment: &str) -> Result<Vec<Pod>> {
        self.list::<Pod>(namespace, Some(&format!("app={deployment}")))
            .await
    }

    pub async fn pod_names(&self, namespace: &str, deployment: &str) -> Result<Vec<String>> {
        let pods = self.pods(namespace, deployment).await?;
        Ok(pods.iter().map(ResourceExt::name_any).collect())
    }

    pub async fn deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        self.get::<Deployment>(namespace, name).await
    }

    pub async fn decoded_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DecodedSecret>> {
        let secret = self.get::<Secret>(namespace, name).await?;
        Ok(secret.as_ref().map(decode_secret))
    }

    pub async fn decoded_secrets(
        &self,
        namespace: &str,
    ) -> Result<BTreeMap<String, DecodedSecret>> {
        let secrets = self.list::<Secret>(namespace, None).await?;
        Ok(secrets
            .iter()
            .map(|secret| (secret.name_any(), decode_secret(secret)))
            .collect())
    }

    pub async fn delete_pod(&self, namespace: &str, name: &str) -> Result<bool> {
        match self
            .api::<Pod>(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(true),
            Err(error) if is_not_found(&error) => Ok(false),
            Err(error) => {
                Err(error).with_context(|| format!("failed to delete pod {namespace}/{name}"))
            }
        }
    }

    pub async fn run_pod(
        &self,
        namespace: &str,
        image: &str,
        name: &str,
        options: &RunPodOptions,
    ) -> Result<Pod> {
        let pod = pod_manifest(namespace, image, name, options)?;
        info!(namespace, pod = name, image, "creating pod");
        self.api::<Pod>(namespace)
            .create(&PostParams::default(), &pod)
            .await
            .with_context(|| format!("failed to create pod {namespace}/{name}"))?;

        eprintln!("Awaiting {name} pod to be ready…");
        let ready = self.await_condition::<Pod>(namespace, name, "Ready").await?;
        eprintln!("Pod {name} is ready");
        Ok(ready)
    }
}

pub fn ensure_context(expected: &str, actual: &str) -> Result<(), GatewayError> {
    if expected == actual {
        Ok(())
    } else {
        Err(GatewayError::ContextMismatch {
            expected: expected.to_string(),
            actual: if actual.is_empty() {
                "<none>".to_string()
            } else {
                actual.to_string()
            },
        })
    }
}

/// The only place secret values become plaintext. Keys without a value are
/// skipped; invalid UTF-8 is replaced rather than rejected.
pub fn decode_secret(secret: &Secret) -> DecodedSecret {
    secret
        .data
        .as_ref()
        .map(|data| {
            data.iter()
                .map(|(key, value)| (key.clone(), String::from_utf8_lossy(&value.0).into_owned()))
                .collect()
        })
        .unwrap_or_default()
}

pub fn is_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 404)
}

fn pod_manifest(namespace: &str, image: &str, name: &str, options: &RunPodOptions) -> Result<Pod> {
    let mut container = serde_json::json!({
        "name": name,
        "image": image,
        "imagePullPolicy": "Always",
    });
    if !options.env.is_empty() {
        container["env"] = options
            .env
            .iter()
            .map(|(key, value)| serde_json::json!({ "name": key, "value": value }))
            .collect();
    }
    if !options.args.is_empty() {
        container["args"] = serde_json::json!(options.args);
    }
    if let Some(port) = options.port {
        container["ports"] = serde_json::json!([{ "containerPort": port }]);
    }

    let manifest = serde_json::json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": name,
            "namespace": namespace,
            "labels": {
                "app.kubernetes.io/name": name,
                "app.kubernetes.io/managed-by": MANAGED_BY,
            },
        },
        "spec": {
            "containers": [container],
            "restartPolicy": "Never",
        },
    });
    serde_json::from_value(manifest).context("failed to build pod manifest")
}

pub fn pod_readiness(pod: &Pod) -> (usize, usize, i32) {
    let container_statuses = pod
        .status
        .as_ref()
        .and_then(|status| status.container_statuses.as_deref())
        .unwrap_or(&[]);
    let total = container_statuses.len();
    let ready = container_statuses
        .iter()
        .filter(|container| container.ready)
        .count();
    let restarts = container_statuses
        .iter()
        .map(|container| container.restart_count)
        .sum();

    (ready, total, restarts)
}

pub fn human_age(timestamp: Option<&Time>) -> String {
    let Some(timestamp) = timestamp else {
        return "-".to_string();
    };

    let elapsed_seconds =
        (k8s_openapi::jiff::Timestamp::now().as_second() - timestamp.0.as_second()).max(0);
    format_elapsed_seconds(elapsed_seconds)
}

fn format_elapsed_seconds(seconds: i64) -> String {
    if seconds >= 86_400 {
        return format!("{}d", seconds / 86_400);
    }

    if seconds >= 3_600 {
        return format!("{}h", seconds / 3_600);
    }

    if seconds >= 60 {
        return format!("{}m", seconds / 60);
    }

    format!("{seconds}s")
}
