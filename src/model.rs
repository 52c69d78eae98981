use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Environment {
    Dev,
    Preprod,
    Prod,
}

impl Environment {
    pub const ALL: [Self; 3] = [Self::Dev, Self::Preprod, Self::Prod];
    pub const NAMES: [&'static str; 3] = ["dev", "preprod", "prod"];

    pub fn name(self) -> &'static str {
        match self {
            Self::Dev => "dev",
            Self::Preprod => "preprod",
            Self::Prod => "prod",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|environment| environment.name().eq_ignore_ascii_case(token.trim()))
    }

    pub fn namespace(self, app_name: &str) -> String {
        format!("{app_name}-{}", self.name())
    }
}

impl Display for Environment {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ResourceKind {
    Pod,
    Deployment,
    Job,
    Service,
    Ingress,
    ConfigMap,
    Secret,
    ReplicaSet,
}

impl ResourceKind {
    pub const ALL: [Self; 8] = [
        Self::Pod,
        Self::Deployment,
        Self::Job,
        Self::Service,
        Self::Ingress,
        Self::ConfigMap,
        Self::Secret,
        Self::ReplicaSet,
    ];

    pub const TOKENS: [&'static str; 8] = [
        "pod",
        "deployment",
        "job",
        "service",
        "ingress",
        "configmap",
        "secret",
        "replicaset",
    ];

    pub fn title(self) -> &'static str {
        match self {
            Self::Pod => "Pod",
            Self::Deployment => "Deployment",
            Self::Job => "Job",
            Self::Service => "Service",
            Self::Ingress => "Ingress",
            Self::ConfigMap => "ConfigMap",
            Self::Secret => "Secret",
            Self::ReplicaSet => "ReplicaSet",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "po" | "pod" | "pods" => Some(Self::Pod),
            "deploy" | "deployment" | "deployments" | "dp" => Some(Self::Deployment),
            "job" | "jobs" => Some(Self::Job),
            "svc" | "service" | "services" => Some(Self::Service),
            "ing" | "ingress" | "ingresses" => Some(Self::Ingress),
            "cm" | "configmap" | "configmaps" | "config-map" | "config-maps" => {
                Some(Self::ConfigMap)
            }
            "secret" | "secrets" => Some(Self::Secret),
            "rs" | "replicaset" | "replicasets" | "replica-set" | "replica-sets" => {
                Some(Self::ReplicaSet)
            }
            _ => None,
        }
    }
}

impl Display for ResourceKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.title())
    }
}
