/// Implemented by each reconciler's own `Error` enum so the shared
/// reconcile wrapper can dispatch retry/backoff/orphan-mitigation
/// behavior without matching on every concrete variant.
pub trait Classify {
    /// Whether this failure should be retried (and thus counted against
    /// the operation's retry budget) rather than treated as an immediate
    /// terminal failure.
    fn is_retriable(&self) -> bool;

    /// Whether hitting this failure should flip `orphanMitigationInProgress`.
    fn requires_orphan_mitigation(&self) -> bool {
        false
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes reported error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },

    #[error("invalid user input: {0}")]
    UserInput(String),

    #[error("json error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("parse duration: {source}")]
    ParseDuration {
        #[from]
        source: parse_duration::parse::Error,
    },
}

impl Classify for Error {
    fn is_retriable(&self) -> bool {
        matches!(self, Error::Kube { .. })
    }
}
