use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("current context should be {expected} but is {actual}")]
    ContextMismatch { expected: String, actual: String },

    #[error("command failed on pod {pod}: {}", describe_status(status))]
    RemoteCommand { pod: String, status: Box<Status> },
}

impl GatewayError {
    pub fn remote_status(&self) -> Option<&Status> {
        match self {
            Self::RemoteCommand { status, .. } => Some(status),
            Self::ContextMismatch { .. } => None,
        }
    }
}

fn describe_status(status: &Status) -> String {
    let mut parts = Vec::new();
    if let Some(reason) = status.reason.as_deref() {
        parts.push(reason.to_string());
    }
    if let Some(message) = status.message.as_deref() {
        parts.push(message.to_string());
    }
    if parts.is_empty() {
        parts.push(
            status
                .status
                .clone()
                .unwrap_or_else(|| "unknown status".to_string()),
        );
    }
    parts.join(": ")
}
