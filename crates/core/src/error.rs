//! Error taxonomy shared by the stores, the clients and the simulators.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Bad field path, criteria, patch or object shape.
    #[error("malformed: {0}")]
    Malformed(String),

    #[error("reconcile error: {0}")]
    Reconcile(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("internal: {0}")]
    Internal(String),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    pub fn is_already_exists(&self) -> bool {
        match self {
            Error::AlreadyExists(_) => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 409 && resp.reason == "AlreadyExists",
            _ => false,
        }
    }

    /// Short machine-readable reason used in dry-run results.
    pub fn reason(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "NotFound",
            Error::AlreadyExists(_) => "AlreadyExists",
            Error::Malformed(_) => "Malformed",
            Error::Reconcile(_) => "ReconcileError",
            Error::Timeout(_) => "Timeout",
            Error::Kube(_) => "KubeError",
            Error::Serde(_) => "SerializationError",
            Error::Internal(_) => "InternalError",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
