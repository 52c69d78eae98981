use anyhow::{Context, Result, bail};
use futures::FutureExt;
use futures::future::BoxFuture;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::ResourceExt;

use super::{Target, environment_arg};
use crate::command::{Entry, IndexDef, Invocation, LeafDef, OptionSpec};
use crate::k8s::{KubeGateway, NamespacedResource};
use crate::model::ResourceKind;

pub(super) fn entries() -> Entry {
    Entry::Group {
        name: "resource",
        entries: vec![
            Entry::Index(IndexDef {
                description: "Inspect namespaced cluster resources",
                ..IndexDef::default()
            }),
            Entry::Leaf(LeafDef {
                name: "get",
                description: "Print one resource as YAML",
                options: vec![
                    environment_arg(),
                    OptionSpec::required("kind", "Resource kind, e.g. pod, deploy, svc"),
                    OptionSpec::required("name", "Resource name"),
                ],
                handler: get,
            }),
            Entry::Leaf(LeafDef {
                name: "list",
                description: "List resource names",
                options: vec![
                    environment_arg(),
                    OptionSpec::required("kind", "Resource kind, e.g. pod, deploy, svc"),
                    OptionSpec::value("selector", "Label selector, e.g. app=web").short('l'),
                ],
                handler: list,
            }),
        ],
    }
}

fn parse_kind(invocation: &Invocation) -> Result<ResourceKind> {
    let token = invocation.required("kind")?;
    ResourceKind::from_token(token).with_context(|| {
        format!(
            "unknown resource kind {token}; expected one of {}",
            ResourceKind::TOKENS.join(", ")
        )
    })
}

fn get(invocation: Invocation) -> BoxFuture<'static, Result<()>> {
    async move {
        let kind = parse_kind(&invocation)?;
        if kind == ResourceKind::Secret {
            bail!("use `secret get` to read secrets");
        }
        let target = Target::from_invocation(&invocation).await?;
        let name = invocation.required("name")?;

        let rendered = match kind {
            ResourceKind::Pod => render::<Pod>(&target, name).await?,
            ResourceKind::Deployment => render::<Deployment>(&target, name).await?,
            ResourceKind::Job => render::<Job>(&target, name).await?,
            ResourceKind::Service => render::<Service>(&target, name).await?,
            ResourceKind::Ingress => render::<Ingress>(&target, name).await?,
            ResourceKind::ConfigMap => render::<ConfigMap>(&target, name).await?,
            ResourceKind::ReplicaSet => render::<ReplicaSet>(&target, name).await?,
            ResourceKind::Secret => None,
        };

        match rendered {
            Some(yaml) => print!("{yaml}"),
            None => eprintln!("{kind} \"{name}\" not found in {}", target.namespace),
        }
        Ok(())
    }
    .boxed()
}

fn list(invocation: Invocation) -> BoxFuture<'static, Result<()>> {
    async move {
        let kind = parse_kind(&invocation)?;
        let target = Target::from_invocation(&invocation).await?;
        let selector = invocation.value("selector");
        let gateway = &target.gateway;
        let namespace = target.namespace.as_str();

        let names = match kind {
            ResourceKind::Pod => names::<Pod>(gateway, namespace, selector).await?,
            ResourceKind::Deployment => names::<Deployment>(gateway, namespace, selector).await?,
            ResourceKind::Job => names::<Job>(gateway, namespace, selector).await?,
            ResourceKind::Service => names::<Service>(gateway, namespace, selector).await?,
            ResourceKind::Ingress => names::<Ingress>(gateway, namespace, selector).await?,
            ResourceKind::ConfigMap => names::<ConfigMap>(gateway, namespace, selector).await?,
            ResourceKind::Secret => names::<Secret>(gateway, namespace, selector).await?,
            ResourceKind::ReplicaSet => names::<ReplicaSet>(gateway, namespace, selector).await?,
        };

        if names.is_empty() {
            eprintln!("No {kind} resources found in {namespace}");
        }
        for name in names {
            println!("{name}");
        }
        Ok(())
    }
    .boxed()
}

async fn render<K: NamespacedResource>(target: &Target, name: &str) -> Result<Option<String>> {
    let Some(mut resource) = target.gateway.get::<K>(&target.namespace, name).await? else {
        return Ok(None);
    };
    resource.meta_mut().managed_fields = None;
    let yaml = serde_yaml::to_string(&resource).context("failed to render resource as YAML")?;
    Ok(Some(yaml))
}

async fn names<K: NamespacedResource>(
    gateway: &KubeGateway,
    namespace: &str,
    selector: Option<&str>,
) -> Result<Vec<String>> {
    let resources = gateway.list::<K>(namespace, selector).await?;
    Ok(resources.iter().map(ResourceExt::name_any).collect())
}

#[cfg(test)]
mod tests {
    use super::names;
    use crate::k8s::tests::{json_response, mock_gateway};
    use k8s_openapi::api::core::v1::Service;
    use serde_json::json;

    #[tokio::test]
    async fn names_follow_every_page_for_any_kind() {
        let (gateway, mut handle) = mock_gateway(1);
        let server = tokio::spawn(async move {
            let (request, send) = handle.next_request().await.expect("first page");
            assert_eq!(request.uri().path(), "/api/v1/namespaces/ns/services");
            send.send_response(json_response(
                200,
                json!({
                    "apiVersion": "v1",
                    "kind": "ServiceList",
                    "metadata": { "continue": "next" },
                    "items": [{ "metadata": { "name": "web" } }],
                }),
            ));

            let (request, send) = handle.next_request().await.expect("second page");
            assert!(request.uri().query().unwrap_or_default().contains("continue=next"));
            send.send_response(json_response(
                200,
                json!({
                    "apiVersion": "v1",
                    "kind": "ServiceList",
                    "metadata": {},
                    "items": [{ "metadata": { "name": "redis" } }],
                }),
            ));
        });

        let listed = names::<Service>(&gateway, "ns", None).await.unwrap();
        assert_eq!(listed, vec!["web", "redis"]);
        server.await.unwrap();
    }
}
