mod app;
mod resource;
mod secret;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::command::{Entry, Invocation, OptionSpec};
use crate::k8s::KubeGateway;
use crate::model::Environment;

pub fn manifest() -> Vec<Entry> {
    vec![app::entries(), secret::entries(), resource::entries()]
}

pub(crate) struct Target {
    pub gateway: KubeGateway,
    pub environment: Environment,
    pub namespace: String,
}

impl Target {
    pub async fn from_invocation(invocation: &Invocation) -> Result<Self> {
        let token = invocation.required("environment")?;
        let environment = Environment::from_token(token)
            .with_context(|| format!("unknown environment {token}"))?;
        let gateway = connect(invocation).await?;
        let namespace = environment.namespace(&invocation.settings.app_name);
        debug!(
            %environment,
            namespace,
            context = gateway.context(),
            "resolved target"
        );
        Ok(Self {
            gateway,
            environment,
            namespace,
        })
    }
}

pub(crate) async fn connect(invocation: &Invocation) -> Result<KubeGateway> {
    let settings = &invocation.settings;
    KubeGateway::connect(&settings.context, settings.page_size).await
}

pub(crate) fn environment_arg() -> OptionSpec {
    OptionSpec::required("environment", "Cloud Platform environment").choices(&Environment::NAMES)
}

pub(crate) fn deployment_arg() -> OptionSpec {
    OptionSpec::optional("deployment", "Pods from this deployment are targeted")
}

pub(crate) fn yes_flag() -> OptionSpec {
    OptionSpec::flag("yes", "Skip the confirmation prompt").short('y')
}

pub(crate) fn deployment_name(invocation: &Invocation) -> String {
    invocation
        .value("deployment")
        .map(str::to_string)
        .unwrap_or_else(|| invocation.settings.app_name.clone())
}

/// Asks on stderr before a risky action. `--yes` skips the question, as does
/// `dev` when the action passes its environment as `proceed_unless_production`.
pub(crate) async fn confirm(
    question: &str,
    proceed_unless_production: Option<Environment>,
    assume_yes: bool,
) -> Result<bool> {
    if assume_yes {
        return Ok(true);
    }
    if proceeds_without_asking(proceed_unless_production) {
        eprintln!("{question}\nAutomatically proceeding on non-production…");
        return Ok(true);
    }

    eprint!("{question} [y/N]: ");
    let mut answer = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut answer)
        .await
        .context("failed to read confirmation")?;
    Ok(answer_proceeds(&answer))
}

fn proceeds_without_asking(proceed_unless_production: Option<Environment>) -> bool {
    proceed_unless_production == Some(Environment::Dev)
}

fn answer_proceeds(answer: &str) -> bool {
    matches!(
        answer.trim().to_ascii_lowercase().as_str(),
        "y" | "yes" | "true"
    )
}

pub(crate) fn interrupt_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });
    cancel
}

pub(crate) fn short_date(timestamp: Option<&Time>) -> String {
    timestamp
        .and_then(|time| DateTime::<Utc>::from_timestamp(time.0.as_second(), 0))
        .map(|time| time.with_timezone(&Local).format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "Unknown date".to_string())
}

pub(crate) fn render_rows(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths = headers.iter().map(|header| header.len()).collect::<Vec<_>>();
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let header_row = headers.iter().map(|header| header.to_string()).collect::<Vec<_>>();
    std::iter::once(&header_row)
        .chain(rows)
        .map(|row| {
            row.iter()
                .zip(&widths)
                .map(|(cell, &width)| format!("{cell:<width$}"))
                .collect::<Vec<_>>()
                .join("  ")
                .trim_end()
                .to_string()
        })
        .collect::<Vec<_>>()
        .join("\n")
}
