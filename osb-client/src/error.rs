use serde::Deserialize;

/// Error body shape the OSB spec defines for non-2xx broker responses.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OsbErrorBody {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub instance_usable: Option<bool>,
}

#[derive(Debug, thiserror::Error)]
pub enum OsbError {
    #[error("broker call failed and should be retried: {0}")]
    Retriable(String),

    #[error("broker requires accepts_incomplete=true for this operation")]
    AsyncRequired,

    #[error("broker rejected the request terminally: {status} {description}")]
    Terminal { status: u16, description: String },

    #[error("broker reports the resource is gone")]
    Gone,

    #[error("transport error talking to broker: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("failed to decode broker response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl OsbError {
    /// Whether a reconciler should count this failure against its retry
    /// budget rather than treating it as an immediate terminal failure.
    pub fn is_retriable(&self) -> bool {
        matches!(self, OsbError::Retriable(_) | OsbError::Transport(_))
    }
}

impl catalog_common::error::Classify for OsbError {
    fn is_retriable(&self) -> bool {
        OsbError::is_retriable(self)
    }

    /// A terminal broker rejection is the one failure mode that should flip
    /// `orphanMitigationInProgress` straight away rather than wait out the
    /// retry budget; callers still gate this on the operation kind (only
    /// provision/bind have something to mitigate).
    fn requires_orphan_mitigation(&self) -> bool {
        matches!(self, OsbError::Terminal { .. })
    }
}

/// Maps an HTTP status/body pair from a broker response into the
/// classification the reconcilers branch on. 5xx (except 501) and network
/// failures are retriable; 408 and 409 are retriable (timeout/conflict, not
/// a permanent rejection); 422 with `error: "AsyncRequired"` demands
/// `accepts_incomplete=true`; 410 means gone; everything else 4xx is
/// terminal.
pub fn classify(status: reqwest::StatusCode, body: &OsbErrorBody) -> OsbError {
    if status == reqwest::StatusCode::GONE {
        return OsbError::Gone;
    }
    if status == reqwest::StatusCode::UNPROCESSABLE_ENTITY
        && body.error.as_deref() == Some("AsyncRequired")
    {
        return OsbError::AsyncRequired;
    }
    if status.is_server_error() && status != reqwest::StatusCode::NOT_IMPLEMENTED {
        return OsbError::Retriable(format!(
            "{status}: {}",
            body.description.as_deref().unwrap_or("no description")
        ));
    }
    if status == reqwest::StatusCode::REQUEST_TIMEOUT || status == reqwest::StatusCode::CONFLICT {
        return OsbError::Retriable(format!(
            "{status}: {}",
            body.description.as_deref().unwrap_or("no description")
        ));
    }
    OsbError::Terminal {
        status: status.as_u16(),
        description: body
            .description
            .clone()
            .or_else(|| body.error.clone())
            .unwrap_or_else(|| status.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(error: Option<&str>, description: Option<&str>) -> OsbErrorBody {
        OsbErrorBody {
            error: error.map(str::to_string),
            description: description.map(str::to_string),
            instance_usable: None,
        }
    }

    #[test]
    fn server_error_is_retriable() {
        let err = classify(reqwest::StatusCode::BAD_GATEWAY, &body(None, None));
        assert!(err.is_retriable());
    }

    #[test]
    fn not_implemented_is_terminal_not_retriable() {
        let err = classify(reqwest::StatusCode::NOT_IMPLEMENTED, &body(None, None));
        assert!(!err.is_retriable());
        assert!(matches!(err, OsbError::Terminal { status: 501, .. }));
    }

    #[test]
    fn unprocessable_with_async_required_marker() {
        let err = classify(
            reqwest::StatusCode::UNPROCESSABLE_ENTITY,
            &body(Some("AsyncRequired"), Some("needs async")),
        );
        assert!(matches!(err, OsbError::AsyncRequired));
    }

    #[test]
    fn unprocessable_without_marker_is_terminal() {
        let err = classify(
            reqwest::StatusCode::UNPROCESSABLE_ENTITY,
            &body(Some("RequiresApp"), Some("needs app")),
        );
        assert!(matches!(err, OsbError::Terminal { status: 422, .. }));
    }

    #[test]
    fn gone_is_gone() {
        let err = classify(reqwest::StatusCode::GONE, &body(None, None));
        assert!(matches!(err, OsbError::Gone));
    }

    #[test]
    fn plain_4xx_is_terminal() {
        let err = classify(
            reqwest::StatusCode::BAD_REQUEST,
            &body(Some("MalformedRequest"), None),
        );
        assert!(matches!(err, OsbError::Terminal { status: 400, .. }));
    }

    #[test]
    fn request_timeout_is_retriable() {
        let err = classify(reqwest::StatusCode::REQUEST_TIMEOUT, &body(None, None));
        assert!(err.is_retriable());
    }

    #[test]
    fn conflict_is_retriable() {
        let err = classify(
            reqwest::StatusCode::CONFLICT,
            &body(None, Some("a provision is already in flight")),
        );
        assert!(err.is_retriable());
    }
}
