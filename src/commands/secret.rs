use anyhow::Result;
use futures::FutureExt;
use futures::future::BoxFuture;
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;

use super::{Target, confirm, environment_arg, render_rows, short_date, yes_flag};
use crate::command::{Entry, IndexDef, Invocation, LeafDef, OptionSpec};
use crate::k8s::DecodedSecret;

pub(super) fn entries() -> Entry {
    Entry::Group {
        name: "secret",
        entries: vec![
            Entry::Index(IndexDef {
                description: "Read secrets stored in Cloud Platform",
                ..IndexDef::default()
            }),
            Entry::Leaf(LeafDef {
                name: "list",
                description: "List secrets in Cloud Platform",
                options: vec![environment_arg()],
                handler: list,
            }),
            Entry::Leaf(LeafDef {
                name: "get",
                description: "Read secret from Cloud Platform",
                options: vec![
                    environment_arg(),
                    OptionSpec::required("secret", "Name of secret"),
                    yes_flag(),
                ],
                handler: get,
            }),
        ],
    }
}

fn list(invocation: Invocation) -> BoxFuture<'static, Result<()>> {
    async move {
        let target = Target::from_invocation(&invocation).await?;
        let secrets = target
            .gateway
            .list::<Secret>(&target.namespace, None)
            .await?;
        if secrets.is_empty() {
            eprintln!("No secrets found");
            return Ok(());
        }

        eprintln!("Secrets in {}\n", target.namespace);
        let rows = secrets.iter().map(secret_row).collect::<Vec<_>>();
        println!(
            "{}",
            render_rows(&["Name", "Created", "Type", "Count"], &rows)
        );
        Ok(())
    }
    .boxed()
}

fn get(invocation: Invocation) -> BoxFuture<'static, Result<()>> {
    async move {
        let target = Target::from_invocation(&invocation).await?;
        let name = invocation.required("secret")?;
        if !confirm(
            "Are you sure you want to print the secret?",
            None,
            invocation.flag("yes"),
        )
        .await?
        {
            return Ok(());
        }

        let Some(data) = target
            .gateway
            .decoded_secret(&target.namespace, name)
            .await?
        else {
            eprintln!("Secret \"{name}\" not found in {}", target.namespace);
            return Ok(());
        };

        eprintln!("\"{name}\" in {}\n", target.namespace);
        for line in key_value_lines(&data) {
            println!("{line}");
        }
        Ok(())
    }
    .boxed()
}

fn secret_row(secret: &Secret) -> Vec<String> {
    vec![
        secret.name_any(),
        short_date(secret.metadata.creation_timestamp.as_ref()),
        secret
            .type_
            .clone()
            .unwrap_or_else(|| "[unknown]".to_string()),
        secret
            .data
            .as_ref()
            .map_or(0, |data| data.len())
            .to_string(),
    ]
}

fn key_value_lines(data: &DecodedSecret) -> Vec<String> {
    data.iter().map(|(key, value)| format!("{key}={value}")).collect()
}

#[cfg(test)]
mod tests {
    use super::{key_value_lines, secret_row};
    use crate::k8s::decode_secret;
    use k8s_openapi::api::core::v1::Secret;
    use serde_json::json;

    #[test]
    fn rows_describe_type_and_key_count() {
        let secret: Secret = serde_json::from_value(json!({
            "metadata": { "name": "elasticache-redis" },
            "type": "Opaque",
            "data": { "auth_token": "dG9rZW4xMjM=", "url": "eA==" },
        }))
        .unwrap();
        let row = secret_row(&secret);
        assert_eq!(row[0], "elasticache-redis");
        assert_eq!(row[1], "Unknown date");
        assert_eq!(row[2], "Opaque");
        assert_eq!(row[3], "2");
    }

    #[test]
    fn decoded_values_print_sorted_by_key() {
        let secret: Secret = serde_json::from_value(json!({
            "data": { "zeta": "eg==", "auth_token": "dG9rZW4xMjM=" },
        }))
        .unwrap();
        assert_eq!(
            key_value_lines(&decode_secret(&secret)),
            vec!["auth_token=token123", "zeta=z"]
        );
    }
}
