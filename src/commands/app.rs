use anyhow::{Context, Result, bail};
use futures::FutureExt;
use futures::future::{BoxFuture, try_join_all};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use kube::runtime::watcher;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    Target, confirm, connect, deployment_arg, deployment_name, environment_arg, interrupt_token,
    render_rows, yes_flag,
};
use crate::command::{Entry, IndexDef, Invocation, LeafDef, OptionSpec};
use crate::exec::{ExecInput, ExecOptions, ExecOutput, OutputMode};
use crate::k8s::{RunPodOptions, human_age, pod_readiness};
use crate::model::Environment;
use crate::port_forward::ForwardOptions;
use crate::watch::{Subscription, WatchCallbacks};

const DEFAULT_WAIT_SECONDS: u64 = 300;
const APP_PORT: &str = "3000";

pub(super) fn entries() -> Entry {
    Entry::Group {
        name: "app",
        entries: vec![
            Entry::Index(IndexDef {
                description: "Manage apps running in Cloud Platform",
                options: vec![
                    OptionSpec::value("deployment", "Deployment to report on").short('d'),
                ],
                handler: Some(versions),
            }),
            Entry::Leaf(LeafDef {
                name: "list",
                description: "List app versions",
                options: vec![
                    environment_arg(),
                    OptionSpec::optional("deployment", "Only this deployment"),
                ],
                handler: list,
            }),
            Entry::Leaf(LeafDef {
                name: "pods",
                description: "List a deployment's pods",
                options: vec![environment_arg(), deployment_arg()],
                handler: pods,
            }),
            Entry::Leaf(LeafDef {
                name: "exec",
                description: "Run a command on all pods",
                options: vec![
                    environment_arg(),
                    OptionSpec::required("command", "Command to run"),
                    deployment_arg(),
                    OptionSpec::flag("one-pod", "Runs the command only on the first pod"),
                    OptionSpec::flag("stdin", "Pipe stdin to remote command (implies --one-pod)"),
                ],
                handler: exec,
            }),
            Entry::Leaf(LeafDef {
                name: "exec-js",
                description: "Run a script in node on all pods",
                options: vec![
                    environment_arg(),
                    OptionSpec::optional("script", "Script file (defaults to stdin)"),
                    OptionSpec::flag("one-pod", "Runs the script only on the first pod"),
                ],
                handler: exec_js,
            }),
            Entry::Leaf(LeafDef {
                name: "ping",
                description: "Ping application",
                options: vec![environment_arg(), app_port_arg()],
                handler: ping,
            }),
            Entry::Leaf(LeafDef {
                name: "health",
                description: "Check health of application",
                options: vec![environment_arg(), app_port_arg()],
                handler: health,
            }),
            Entry::Leaf(LeafDef {
                name: "dump-env",
                description: "Dump environment from pods",
                options: vec![environment_arg(), deployment_arg()],
                handler: dump_env,
            }),
            Entry::Leaf(LeafDef {
                name: "recycle-pods",
                description: "Delete deployment's pods one-by-one to have them recreated",
                options: vec![environment_arg(), deployment_arg(), yes_flag()],
                handler: recycle_pods,
            }),
            Entry::Leaf(LeafDef {
                name: "wait-ready",
                description: "Wait until a deployment reports Available",
                options: vec![
                    environment_arg(),
                    deployment_arg(),
                    OptionSpec::value("timeout", "Seconds to wait before giving up"),
                ],
                handler: wait_ready,
            }),
            Entry::Leaf(LeafDef {
                name: "port-forward",
                description: "Forward a local port to a deployment's first pod",
                options: vec![
                    environment_arg(),
                    OptionSpec::required("remote-port", "Port inside the pod"),
                    deployment_arg(),
                    OptionSpec::value("port", "Local port (defaults to the remote port)"),
                    yes_flag(),
                ],
                handler: port_forward,
            }),
            Entry::Leaf(LeafDef {
                name: "run-pod",
                description: "Start a one-off pod and wait until it is ready",
                options: vec![
                    environment_arg(),
                    OptionSpec::required("name", "Pod name"),
                    OptionSpec::required("image", "Container image"),
                    OptionSpec::value("port", "Container port to expose"),
                    OptionSpec::repeated("env", "Environment variable as KEY=value"),
                ],
                handler: run_pod,
            }),
        ],
    }
}

fn versions(invocation: Invocation) -> BoxFuture<'static, Result<()>> {
    async move {
        let gateway = connect(&invocation).await?;
        let deployment = deployment_name(&invocation);
        let app_name = &invocation.settings.app_name;

        let mut rows = Vec::new();
        for environment in Environment::ALL {
            let namespace = environment.namespace(app_name);
            let version = gateway
                .deployment(&namespace, &deployment)
                .await?
                .as_ref()
                .and_then(deployed_version)
                .unwrap_or_else(|| "-".to_string());
            rows.push(vec![environment.to_string(), version]);
        }
        println!("{}", render_rows(&["Environment", "Version"], &rows));
        Ok(())
    }
    .boxed()
}

fn list(invocation: Invocation) -> BoxFuture<'static, Result<()>> {
    async move {
        let target = Target::from_invocation(&invocation).await?;
        let selector = invocation.value("deployment").map(|name| format!("app={name}"));
        let deployments = target
            .gateway
            .list::<Deployment>(&target.namespace, selector.as_deref())
            .await?;

        let rows = deployments
            .iter()
            .map(|deployment| {
                let status = deployment.status.clone().unwrap_or_default();
                vec![
                    deployment.name_any(),
                    deployment
                        .labels()
                        .get("app.kubernetes.io/version")
                        .cloned()
                        .unwrap_or_else(|| "-".to_string()),
                    format!(
                        "{}/{}/{}",
                        status.ready_replicas.unwrap_or(0),
                        status.available_replicas.unwrap_or(0),
                        status.replicas.unwrap_or(0)
                    ),
                    first_image(deployment).unwrap_or_default(),
                ]
            })
            .collect::<Vec<_>>();
        println!(
            "{}",
            render_rows(
                &["Deployment", "Version", "Ready/Available/Selected", "Image"],
                &rows
            )
        );
        Ok(())
    }
    .boxed()
}

fn pods(invocation: Invocation) -> BoxFuture<'static, Result<()>> {
    async move {
        let target = Target::from_invocation(&invocation).await?;
        let deployment = deployment_name(&invocation);
        let pods = target.gateway.pods(&target.namespace, &deployment).await?;
        if pods.is_empty() {
            eprintln!("No pods found for {deployment} in {}", target.namespace);
            return Ok(());
        }

        let rows = pods
            .iter()
            .map(|pod| {
                let (ready, total, restarts) = pod_readiness(pod);
                vec![
                    pod.name_any(),
                    pod.status
                        .as_ref()
                        .and_then(|status| status.phase.clone())
                        .unwrap_or_else(|| "Unknown".to_string()),
                    format!("{ready}/{total}"),
                    restarts.to_string(),
                    human_age(pod.metadata.creation_timestamp.as_ref()),
                ]
            })
            .collect::<Vec<_>>();
        println!(
            "{}",
            render_rows(&["Pod", "Phase", "Ready", "Restarts", "Age"], &rows)
        );
        Ok(())
    }
    .boxed()
}

fn exec(invocation: Invocation) -> BoxFuture<'static, Result<()>> {
    async move {
        let target = Target::from_invocation(&invocation).await?;
        let command = invocation.required("command")?.to_string();
        let deployment = deployment_name(&invocation);
        let pipe_stdin = invocation.flag("stdin");
        let one_pod = invocation.flag("one-pod") || pipe_stdin;

        let mut pods = target
            .gateway
            .pod_names(&target.namespace, &deployment)
            .await?;
        if pods.is_empty() {
            eprintln!("No pods found to run command on.");
            return Ok(());
        }
        if one_pod {
            pods.truncate(1);
        }

        let argv = shell_command(&command);
        let cancel = interrupt_token();
        for pod in &pods {
            eprintln!("Running command on pod \"{pod}\"…");
            let mut options =
                ExecOptions::new(OutputMode::Inherit, invocation.settings.input_end_delay)
                    .cancel(cancel.clone());
            if pipe_stdin {
                options = options.input(ExecInput::stdin());
            }
            let output = target
                .gateway
                .exec(&target.namespace, pod, &argv, options)
                .await?;
            if output.is_cancelled() {
                eprintln!("Cancelled");
                break;
            }
        }
        Ok(())
    }
    .boxed()
}

fn exec_js(invocation: Invocation) -> BoxFuture<'static, Result<()>> {
    async move {
        let script = load_script(invocation.value("script")).await?;
        let target = Target::from_invocation(&invocation).await?;
        let mut pods = target
            .gateway
            .pod_names(&target.namespace, &invocation.settings.app_name)
            .await?;
        if pods.is_empty() {
            eprintln!("No pods found to run script on.");
            return Ok(());
        }
        if invocation.flag("one-pod") {
            pods.truncate(1);
        }

        let argv = vec!["node".to_string(), "-".to_string()];
        let cancel = interrupt_token();
        for pod in &pods {
            eprintln!("Running script on pod \"{pod}\"…");
            let options = ExecOptions::new(OutputMode::Inherit, invocation.settings.input_end_delay)
                .input(script.as_str())
                .cancel(cancel.clone());
            let output = target
                .gateway
                .exec(&target.namespace, pod, &argv, options)
                .await?;
            if output.is_cancelled() {
                eprintln!("Cancelled");
                break;
            }
        }
        Ok(())
    }
    .boxed()
}

fn ping(invocation: Invocation) -> BoxFuture<'static, Result<()>> {
    async move {
        let Some(responses) = remote_request(&invocation, "/ping").await? else {
            return Ok(());
        };
        if all_pods_pass(&responses, ping_succeeded) {
            eprintln!("All pods responded");
        } else {
            eprintln!("Some pods did not respond!");
        }
        print_responses(&responses)
    }
    .boxed()
}

fn health(invocation: Invocation) -> BoxFuture<'static, Result<()>> {
    async move {
        let Some(responses) = remote_request(&invocation, "/health").await? else {
            return Ok(());
        };
        if all_pods_pass(&responses, health_succeeded) {
            eprintln!("All pods are healthy");
        } else {
            eprintln!("Some pods are not healthy!");
        }
        print_responses(&responses)
    }
    .boxed()
}

async fn remote_request(
    invocation: &Invocation,
    path: &str,
) -> Result<Option<BTreeMap<String, Value>>> {
    let target = Target::from_invocation(invocation).await?;
    let port = invocation
        .parse::<u16>("port")?
        .context("missing argument --port")?;
    let pods = target
        .gateway
        .pod_names(&target.namespace, &invocation.settings.app_name)
        .await?;
    if pods.is_empty() {
        eprintln!("No pods found to run script on.");
        return Ok(None);
    }

    let argv = request_command(port, path);
    let cancel = interrupt_token();
    let mut responses = BTreeMap::new();
    for pod in &pods {
        eprintln!("Running script on pod \"{pod}\"…");
        let options = ExecOptions::new(OutputMode::Json, invocation.settings.input_end_delay)
            .cancel(cancel.clone());
        match target
            .gateway
            .exec(&target.namespace, pod, &argv, options)
            .await?
        {
            ExecOutput::Json(response) => {
                responses.insert(pod.clone(), response);
            }
            ExecOutput::Cancelled => {
                eprintln!("Cancelled");
                return Ok(None);
            }
            other => bail!("unexpected request output from {pod}: {other:?}"),
        }
    }
    Ok(Some(responses))
}

fn request_command(port: u16, path: &str) -> Vec<String> {
    let path = Value::from(path);
    let script = format!(
        r#"const http = require('http');
http.get({{ host: '127.0.0.1', port: {port}, path: {path}, timeout: 10000 }}, (response) => {{
  let body = '';
  response.setEncoding('utf8');
  response.on('data', (chunk) => {{ body += chunk; }});
  response.on('end', () => {{
    try {{ process.stdout.write(JSON.stringify(JSON.parse(body))); }}
    catch (error) {{ process.stdout.write(JSON.stringify({{ statusCode: response.statusCode, body }})); }}
  }});
}}).on('error', (error) => {{ process.stdout.write(JSON.stringify({{ error: error.message }})); }});
"#
    );
    vec!["node".to_string(), "-e".to_string(), script]
}

fn ping_succeeded(response: &Value) -> bool {
    response["status"] == "UP"
}

fn health_succeeded(response: &Value) -> bool {
    response["healthy"] == true
}

fn all_pods_pass(responses: &BTreeMap<String, Value>, check: fn(&Value) -> bool) -> bool {
    responses.values().all(check)
}

fn print_responses(responses: &BTreeMap<String, Value>) -> Result<()> {
    let rendered =
        serde_json::to_string_pretty(responses).context("failed to render pod responses")?;
    println!("{rendered}");
    Ok(())
}

fn app_port_arg() -> OptionSpec {
    OptionSpec::value("port", "Port the application listens on inside the pod")
        .default_value(APP_PORT)
}

fn dump_env(invocation: Invocation) -> BoxFuture<'static, Result<()>> {
    async move {
        let target = Target::from_invocation(&invocation).await?;
        let deployment = deployment_name(&invocation);
        let pods = target
            .gateway
            .pod_names(&target.namespace, &deployment)
            .await?;
        if pods.is_empty() {
            eprintln!("No pods found to run command on.");
            return Ok(());
        }

        let argv = vec!["printenv".to_string()];
        let dumps = try_join_all(pods.iter().map(|pod| {
            let options = ExecOptions::new(OutputMode::Text, invocation.settings.input_end_delay);
            let gateway = &target.gateway;
            let namespace = &target.namespace;
            let argv = &argv;
            async move {
                match gateway.exec(namespace, pod, argv, options).await? {
                    ExecOutput::Text(text) => Ok((pod.clone(), text)),
                    other => bail!("unexpected printenv output from {pod}: {other:?}"),
                }
            }
        }))
        .await?;

        for line in merge_environments(&dumps) {
            println!("{line}");
        }
        Ok(())
    }
    .boxed()
}

fn recycle_pods(invocation: Invocation) -> BoxFuture<'static, Result<()>> {
    async move {
        let target = Target::from_invocation(&invocation).await?;
        let deployment = deployment_name(&invocation);
        let pods = target
            .gateway
            .pod_names(&target.namespace, &deployment)
            .await?;
        if pods.is_empty() {
            eprintln!("No pods found to delete.");
            return Ok(());
        }

        let mut deletions = DeletionWatch::start(&target, &deployment).await?;

        let question = format!("Are you sure you want to recycle {} pods?", pods.len());
        if !confirm(&question, None, invocation.flag("yes")).await? {
            return deletions.finish().await;
        }

        for pod in &pods {
            eprintln!("Deleting pod \"{pod}\"…");
            if !target.gateway.delete_pod(&target.namespace, pod).await? {
                eprintln!("Already gone");
                continue;
            }
            deletions.wait_for(pod).await?;
            eprintln!("Deleted");
        }

        deletions.finish().await
    }
    .boxed()
}

struct DeletionWatch {
    subscription: Option<Subscription>,
    deleted_rx: mpsc::UnboundedReceiver<String>,
    deleted: HashSet<String>,
}

impl DeletionWatch {
    async fn start(target: &Target, deployment: &str) -> Result<Self> {
        let (callbacks, deleted_rx) = Self::callbacks();
        let subscription = target
            .gateway
            .start_watching(
                &target.namespace,
                watcher::Config::default().labels(&format!("app={deployment}")),
                CancellationToken::new(),
                callbacks,
            )
            .await?;
        Ok(Self::new(subscription, deleted_rx))
    }

    fn callbacks() -> (WatchCallbacks<Pod>, mpsc::UnboundedReceiver<String>) {
        let (deleted_tx, deleted_rx) = mpsc::unbounded_channel();
        let callbacks = WatchCallbacks::<Pod>::new().on_deleted(move |pod: Pod| {
            let _ = deleted_tx.send(pod.name_any());
        });
        (callbacks, deleted_rx)
    }

    fn new(subscription: Subscription, deleted_rx: mpsc::UnboundedReceiver<String>) -> Self {
        Self {
            subscription: Some(subscription),
            deleted_rx,
            deleted: HashSet::new(),
        }
    }

    /// A watch that ends first reports its own failure.
    async fn wait_for(&mut self, pod: &str) -> Result<()> {
        while !self.deleted.contains(pod) {
            match self.deleted_rx.recv().await {
                Some(name) => {
                    self.deleted.insert(name);
                }
                None => {
                    if let Some(subscription) = self.subscription.take() {
                        subscription
                            .finished()
                            .await
                            .with_context(|| format!("pod watch failed before {pod} was deleted"))?;
                    }
                    bail!("pod watch ended before deletion of {pod} was observed");
                }
            }
        }
        Ok(())
    }

    async fn finish(mut self) -> Result<()> {
        match self.subscription.take() {
            Some(subscription) => {
                subscription.stop();
                subscription.finished().await
            }
            None => Ok(()),
        }
    }
}

fn wait_ready(invocation: Invocation) -> BoxFuture<'static, Result<()>> {
    async move {
        let target = Target::from_invocation(&invocation).await?;
        let deployment = deployment_name(&invocation);
        let seconds = invocation
            .parse::<u64>("timeout")?
            .unwrap_or(DEFAULT_WAIT_SECONDS);

        eprintln!("Waiting for {deployment} to become available…");
        let wait = target
            .gateway
            .await_condition::<Deployment>(&target.namespace, &deployment, "Available");
        match tokio::time::timeout(Duration::from_secs(seconds), wait).await {
            Ok(result) => {
                result?;
                eprintln!("Deployment {deployment} is available");
                Ok(())
            }
            Err(_) => bail!("deployment {deployment} was not available within {seconds}s"),
        }
    }
    .boxed()
}

fn port_forward(invocation: Invocation) -> BoxFuture<'static, Result<()>> {
    async move {
        let target = Target::from_invocation(&invocation).await?;
        let remote_port = invocation
            .parse::<u16>("remote-port")?
            .context("missing argument <remote-port>")?;
        let local_port = invocation.parse::<u16>("port")?.unwrap_or(remote_port);
        let deployment = deployment_name(&invocation);

        let pods = target
            .gateway
            .pod_names(&target.namespace, &deployment)
            .await?;
        let Some(pod) = pods.first() else {
            bail!("no pods found for {deployment} in {}", target.namespace);
        };
        if !confirm(
            "Connect to production resource?",
            Some(target.environment),
            invocation.flag("yes"),
        )
        .await?
        {
            return Ok(());
        }

        let options = ForwardOptions {
            cancel: CancellationToken::new(),
            trap_interrupt: true,
        };
        target
            .gateway
            .port_forward(
                &target.namespace,
                pod,
                local_port,
                remote_port,
                options,
                |address| {
                    eprintln!(
                        "Forwarding {address} to {pod}:{remote_port}. Press Ctrl-C to stop."
                    );
                },
            )
            .await
    }
    .boxed()
}

fn run_pod(invocation: Invocation) -> BoxFuture<'static, Result<()>> {
    async move {
        let target = Target::from_invocation(&invocation).await?;
        let name = invocation.required("name")?;
        let image = invocation.required("image")?;
        let options = RunPodOptions {
            port: invocation.parse::<u16>("port")?,
            env: parse_env_pairs(&invocation.values("env"))?,
            args: Vec::new(),
        };

        let pod = target
            .gateway
            .run_pod(&target.namespace, image, name, &options)
            .await?;
        println!("{}", pod.name_any());
        Ok(())
    }
    .boxed()
}

fn shell_command(command: &str) -> Vec<String> {
    ["/bin/sh", "-e", "-c", command]
        .into_iter()
        .map(str::to_string)
        .collect()
}

async fn load_script(path: Option<&str>) -> Result<String> {
    match path {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read script {path}")),
        None => {
            let mut script = String::new();
            tokio::io::stdin()
                .read_to_string(&mut script)
                .await
                .context("failed to read script from stdin")?;
            Ok(script)
        }
    }
}

fn first_image(deployment: &Deployment) -> Option<String> {
    deployment
        .spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .first()?
        .image
        .clone()
}

/// Tag of the first container image, ignoring digests.
fn deployed_version(deployment: &Deployment) -> Option<String> {
    let image = first_image(deployment)?;
    let image = image.split('@').next().unwrap_or(&image);
    let (repository, tag) = image.rsplit_once(':')?;
    (!tag.contains('/') && !repository.is_empty()).then(|| tag.to_string())
}

fn parse_env_pairs(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    pairs
        .iter()
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                Ok((key.trim().to_string(), value.to_string()))
            }
            _ => bail!("environment variable {pair:?} is not KEY=value"),
        })
        .collect()
}

/// Merges `printenv` dumps into sorted `KEY=value` lines, taking values from
/// the first pod and noting pods whose value differs.
fn merge_environments(dumps: &[(String, String)]) -> Vec<String> {
    let mut table: BTreeMap<&str, BTreeMap<&str, &str>> = BTreeMap::new();
    for (pod, dump) in dumps {
        for line in dump.lines().filter(|line| !line.is_empty()) {
            let (key, value) = line.split_once('=').unwrap_or((line, ""));
            table.entry(key).or_default().insert(pod.as_str(), value);
        }
    }

    let Some((first_pod, _)) = dumps.first() else {
        return Vec::new();
    };
    table
        .into_iter()
        .map(|(key, values)| {
            let first_value = values.get(first_pod.as_str()).copied().unwrap_or("");
            let differences = values
                .iter()
                .filter(|(pod, value)| **pod != first_pod.as_str() && **value != first_value)
                .map(|(pod, value)| format!("{pod}→{value}"))
                .collect::<Vec<_>>();
            let missing = dumps
                .iter()
                .filter(|(pod, _)| !values.contains_key(pod.as_str()))
                .map(|(pod, _)| format!("{pod}→<unset>"));
            let differences = differences.into_iter().chain(missing).collect::<Vec<_>>();

            if differences.is_empty() {
                format!("{key}={first_value}")
            } else {
                format!("{key}={first_value}  # differs: {}", differences.join(", "))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{
        DeletionWatch, all_pods_pass, deployed_version, health_succeeded, merge_environments,
        parse_env_pairs, ping_succeeded, request_command, shell_command,
    };
    use crate::watch::Subscription;
    use crate::watch::tests::pod;
    use futures::stream;
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::api::core::v1::Pod;
    use kube::runtime::watcher::Event;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::io;
    use tokio_util::sync::CancellationToken;

    async fn deletion_watch(events: Vec<Result<Event<Pod>, io::Error>>) -> DeletionWatch {
        let (callbacks, deleted_rx) = DeletionWatch::callbacks();
        let subscription =
            Subscription::start(stream::iter(events), CancellationToken::new(), callbacks)
                .await
                .unwrap();
        DeletionWatch::new(subscription, deleted_rx)
    }

    fn deployment_with_image(image: &str) -> Deployment {
        serde_json::from_value(json!({
            "metadata": { "name": "web" },
            "spec": {
                "selector": {},
                "template": { "spec": { "containers": [{ "name": "web", "image": image }] } },
            },
        }))
        .unwrap()
    }

    #[test]
    fn version_is_the_image_tag() {
        assert_eq!(
            deployed_version(&deployment_with_image("quay.io/hmpps/app:2024-01-05.123.abc")),
            Some("2024-01-05.123.abc".to_string())
        );
        assert_eq!(
            deployed_version(&deployment_with_image("registry:5000/app@sha256:abc")),
            None
        );
        assert_eq!(deployed_version(&deployment_with_image("redis")), None);
    }

    #[test]
    fn env_pairs_require_a_key() {
        let parsed = parse_env_pairs(&["A=1".to_string(), "URL=x=y".to_string()]).unwrap();
        assert_eq!(parsed["A"], "1");
        assert_eq!(parsed["URL"], "x=y");
        assert!(parse_env_pairs(&["=1".to_string()]).is_err());
        assert!(parse_env_pairs(&["FLAG".to_string()]).is_err());
    }

    #[test]
    fn commands_run_through_a_failing_shell() {
        assert_eq!(shell_command("ls"), vec!["/bin/sh", "-e", "-c", "ls"]);
    }

    #[test]
    fn environments_are_merged_with_differences_noted() {
        let dumps = vec![
            ("web-a".to_string(), "PATH=/bin\nHOST=web-a\nONLY_A=1\n".to_string()),
            ("web-b".to_string(), "HOST=web-b\nPATH=/bin\n".to_string()),
        ];
        assert_eq!(
            merge_environments(&dumps),
            vec![
                "HOST=web-a  # differs: web-b→web-b",
                "ONLY_A=1  # differs: web-b→<unset>",
                "PATH=/bin",
            ]
        );
    }

    #[test]
    fn no_dumps_means_no_lines() {
        assert!(merge_environments(&[]).is_empty());
    }

    #[test]
    fn pods_pass_only_when_every_response_does() {
        let mut responses = BTreeMap::new();
        responses.insert("web-a".to_string(), json!({ "status": "UP", "healthy": true }));
        responses.insert("web-b".to_string(), json!({ "status": "UP", "healthy": true }));
        assert!(all_pods_pass(&responses, ping_succeeded));
        assert!(all_pods_pass(&responses, health_succeeded));

        responses.insert("web-c".to_string(), json!({ "error": "connect ECONNREFUSED" }));
        assert!(!all_pods_pass(&responses, ping_succeeded));
        assert!(!all_pods_pass(&responses, health_succeeded));

        let unhealthy = BTreeMap::from([("web-a".to_string(), json!({ "healthy": false }))]);
        assert!(!all_pods_pass(&unhealthy, health_succeeded));
    }

    #[test]
    fn request_script_targets_the_local_port_and_path() {
        let argv = request_command(3000, "/health");
        assert_eq!(argv[..2], ["node", "-e"]);
        assert!(argv[2].contains("port: 3000"));
        assert!(argv[2].contains(r#"path: "/health""#));
    }

    #[tokio::test]
    async fn deletions_are_observed_through_the_watch() {
        let mut deletions = deletion_watch(vec![
            Ok(Event::Init),
            Ok(Event::InitApply(pod("web-1", "u1"))),
            Ok(Event::InitDone),
            Ok(Event::Delete(pod("web-1", "u1"))),
        ])
        .await;

        deletions.wait_for("web-1").await.unwrap();
        deletions.finish().await.unwrap();
    }

    #[tokio::test]
    async fn watch_failure_is_reported_instead_of_a_missing_deletion() {
        let mut deletions = deletion_watch(vec![
            Ok(Event::Init),
            Ok(Event::InitDone),
            Err(io::Error::other("watch expired")),
        ])
        .await;

        let error = deletions.wait_for("web-1").await.unwrap_err();
        let message = format!("{error:#}");
        assert!(message.contains("pod watch failed before web-1 was deleted"));
        assert!(message.contains("watch expired"));
    }
}
