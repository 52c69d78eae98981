use futures::Stream;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use kube::runtime::watcher::{self, Event};
use std::fmt::Debug;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::k8s::{KubeGateway, NamespacedResource};
use crate::watch::{Subscription, WatchHandler};

pub trait Conditioned {
    fn conditions(&self) -> Vec<(&str, &str)>;

    fn condition_met(&self, condition: &str) -> bool {
        self.conditions()
            .iter()
            .any(|(kind, status)| *kind == condition && *status == "True")
    }
}

impl Conditioned for Pod {
    fn conditions(&self) -> Vec<(&str, &str)> {
        self.status
            .as_ref()
            .and_then(|status| status.conditions.as_deref())
            .unwrap_or(&[])
            .iter()
            .map(|condition| (condition.type_.as_str(), condition.status.as_str()))
            .collect()
    }
}

impl Conditioned for Deployment {
    fn conditions(&self) -> Vec<(&str, &str)> {
        self.status
            .as_ref()
            .and_then(|status| status.conditions.as_deref())
            .unwrap_or(&[])
            .iter()
            .map(|condition| (condition.type_.as_str(), condition.status.as_str()))
            .collect()
    }
}

impl Conditioned for Job {
    fn conditions(&self) -> Vec<(&str, &str)> {
        self.status
            .as_ref()
            .and_then(|status| status.conditions.as_deref())
            .unwrap_or(&[])
            .iter()
            .map(|condition| (condition.type_.as_str(), condition.status.as_str()))
            .collect()
    }
}

/// Failure of a condition wait. Waits have no deadline of their own; wrap
/// them in `tokio::time::timeout` where one is needed.
#[derive(Debug, Error)]
pub enum ConditionError<K: Debug> {
    #[error("{name} was deleted before condition {condition} was met")]
    Deleted {
        name: String,
        condition: String,
        snapshot: Box<K>,
    },

    #[error("watch on {name} ended before condition {condition} was met")]
    Ended { name: String, condition: String },

    #[error(transparent)]
    Watch(#[from] anyhow::Error),
}

impl<K: Debug> ConditionError<K> {
    pub fn snapshot(&self) -> Option<&K> {
        match self {
            Self::Deleted { snapshot, .. } => Some(snapshot),
            Self::Ended { .. } | Self::Watch(_) => None,
        }
    }
}

type Outcome<K> = Result<K, ConditionError<K>>;

struct ConditionHandler<K: Debug> {
    name: String,
    condition: String,
    outcome: Option<oneshot::Sender<Outcome<K>>>,
    cancel: CancellationToken,
}

impl<K: Debug> ConditionHandler<K> {
    fn settle(&mut self, outcome: Outcome<K>) {
        if let Some(sender) = self.outcome.take() {
            let _ = sender.send(outcome);
            self.cancel.cancel();
        }
    }
}

impl<K> ConditionHandler<K>
where
    K: kube::Resource + Conditioned + Debug,
{
    fn check(&mut self, resource: K) {
        if resource.name_any() == self.name && resource.condition_met(&self.condition) {
            self.settle(Ok(resource));
        }
    }
}

impl<K> WatchHandler<K> for ConditionHandler<K>
where
    K: kube::Resource + Conditioned + Debug + Send + 'static,
{
    fn added(&mut self, resource: K) {
        self.check(resource);
    }

    fn updated(&mut self, resource: K) {
        self.check(resource);
    }

    fn deleted(&mut self, resource: K) {
        if resource.name_any() != self.name {
            return;
        }
        let outcome = Err(ConditionError::Deleted {
            name: self.name.clone(),
            condition: self.condition.clone(),
            snapshot: Box::new(resource),
        });
        self.settle(outcome);
    }
}

/// Resolves with the first snapshot of `name` whose `condition` is True, or
/// fails if the resource is deleted first. Settles at most once.
pub async fn wait_for_condition<K, S, E>(
    stream: S,
    name: &str,
    condition: &str,
) -> Result<K, ConditionError<K>>
where
    K: kube::Resource + Conditioned + Debug + Send + 'static,
    S: Stream<Item = Result<Event<K>, E>> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    let cancel = CancellationToken::new();
    let (sender, receiver) = oneshot::channel();
    let handler = ConditionHandler {
        name: name.to_string(),
        condition: condition.to_string(),
        outcome: Some(sender),
        cancel: cancel.clone(),
    };

    let subscription = Subscription::start(stream, cancel, handler).await?;
    match receiver.await {
        Ok(outcome) => {
            subscription.stop();
            outcome
        }
        Err(_) => {
            subscription.finished().await?;
            Err(ConditionError::Ended {
                name: name.to_string(),
                condition: condition.to_string(),
            })
        }
    }
}

impl KubeGateway {
    pub async fn await_condition<K>(
        &self,
        namespace: &str,
        name: &str,
        condition: &str,
    ) -> anyhow::Result<K>
    where
        K: NamespacedResource + Conditioned,
    {
        info!(namespace, name, condition, kind = %K::kind(&()), "awaiting condition");
        let config = watcher::Config::default().fields(&format!("metadata.name={name}"));
        let stream = watcher::watcher(self.api::<K>(namespace), config);
        let resource = wait_for_condition(stream, name, condition).await?;
        debug!(namespace, name, condition, "condition met");
        Ok(resource)
    }
}
