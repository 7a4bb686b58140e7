use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{OsbError, OsbErrorBody, classify};

const API_VERSION: &str = "2.17";

#[derive(Debug, Clone)]
pub enum BrokerAuth {
    Basic { username: String, password: String },
    Bearer { token: String },
    None,
}

#[derive(Debug, Clone)]
pub struct OriginatingIdentity {
    pub platform: String,
    /// Base64-encoded JSON value, already encoded by the caller per the
    /// OSB originating-identity header format.
    pub value: String,
}

/// Stateless-beyond-config HTTP client for a single broker. One instance
/// is built per `Broker` resource from its `spec.url`/auth/CA bundle.
#[derive(Clone)]
pub struct OsbClient {
    client: reqwest::Client,
    base_url: String,
    auth: BrokerAuth,
    timeout: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProvisionRequest {
    pub service_id: String,
    pub plan_id: String,
    pub organization_guid: String,
    pub space_guid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateInstanceRequest {
    pub service_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_values: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BindRequest {
    pub service_id: String,
    pub plan_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_resource: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogResponse {
    pub services: Vec<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProvisionResponse {
    #[serde(default)]
    pub dashboard_url: Option<String>,
    #[serde(default)]
    pub operation: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BindResponse {
    #[serde(default)]
    pub credentials: Option<Value>,
    #[serde(default)]
    pub operation: Option<String>,
    #[serde(default)]
    pub syslog_drain_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LastOperationState {
    InProgress,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LastOperationResponse {
    pub state: LastOperationState,
    #[serde(default)]
    pub description: Option<String>,
}

/// `Ok(None)` distinguishes a synchronous 200/201 (operation already done)
/// from a 202 (operation is async and must be polled).
pub enum DispatchOutcome<T> {
    Completed(T),
    Async { operation: Option<String> },
}

impl OsbClient {
    /// `ca_bundle` is a PEM-encoded certificate (or bundle) trusted in
    /// addition to the platform's default roots; `insecure_skip_tls_verify`
    /// disables certificate validation entirely and should only ever be set
    /// for brokers under test.
    pub fn new(
        base_url: impl Into<String>,
        auth: BrokerAuth,
        timeout: Duration,
        ca_bundle: Option<&str>,
        insecure_skip_tls_verify: bool,
    ) -> Result<Self, OsbError> {
        let mut builder = reqwest::Client::builder();
        if let Some(pem) = ca_bundle {
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(pem.as_bytes())?);
        }
        if insecure_skip_tls_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        Ok(Self {
            client: builder.build()?,
            base_url: base_url.into(),
            auth,
            timeout,
        })
    }

    fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        originating_identity: Option<&OriginatingIdentity>,
    ) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{}", self.base_url.trim_end_matches('/'), path))
            .timeout(self.timeout)
            .header("X-Broker-API-Version", API_VERSION);

        builder = match &self.auth {
            BrokerAuth::Basic { username, password } => {
                builder.basic_auth(username, Some(password))
            }
            BrokerAuth::Bearer { token } => builder.bearer_auth(token),
            BrokerAuth::None => builder,
        };

        if let Some(identity) = originating_identity {
            builder = builder.header(
                "X-Broker-API-Originating-Identity",
                format!("{} {}", identity.platform, identity.value),
            );
        }

        builder
    }

    async fn send<R: for<'de> Deserialize<'de>>(
        builder: reqwest::RequestBuilder,
    ) -> Result<R, OsbError> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<R>().await?);
        }
        let body = response
            .json::<OsbErrorBody>()
            .await
            .unwrap_or_default();
        Err(classify(status, &body))
    }

    async fn send_dispatch<R: for<'de> Deserialize<'de>>(
        builder: reqwest::RequestBuilder,
    ) -> Result<DispatchOutcome<R>, OsbError> {
        let response = builder.send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::ACCEPTED {
            #[derive(Deserialize)]
            struct AsyncBody {
                #[serde(default)]
                operation: Option<String>,
            }
            let body: AsyncBody = response.json().await.unwrap_or(AsyncBody { operation: None });
            return Ok(DispatchOutcome::Async {
                operation: body.operation,
            });
        }
        if status.is_success() {
            return Ok(DispatchOutcome::Completed(response.json::<R>().await?));
        }
        let body = response
            .json::<OsbErrorBody>()
            .await
            .unwrap_or_default();
        Err(classify(status, &body))
    }

    pub async fn get_catalog(&self) -> Result<CatalogResponse, OsbError> {
        Self::send(self.request(reqwest::Method::GET, "/v2/catalog", None)).await
    }

    pub async fn provision_instance(
        &self,
        instance_id: &str,
        accepts_incomplete: bool,
        req: &ProvisionRequest,
        originating_identity: Option<&OriginatingIdentity>,
    ) -> Result<DispatchOutcome<ProvisionResponse>, OsbError> {
        let path = format!(
            "/v2/service_instances/{instance_id}?accepts_incomplete={accepts_incomplete}"
        );
        Self::send_dispatch(
            self.request(reqwest::Method::PUT, &path, originating_identity)
                .json(req),
        )
        .await
    }

    pub async fn update_instance(
        &self,
        instance_id: &str,
        accepts_incomplete: bool,
        req: &UpdateInstanceRequest,
        originating_identity: Option<&OriginatingIdentity>,
    ) -> Result<DispatchOutcome<Value>, OsbError> {
        let path = format!(
            "/v2/service_instances/{instance_id}?accepts_incomplete={accepts_incomplete}"
        );
        Self::send_dispatch(
            self.request(reqwest::Method::PATCH, &path, originating_identity)
                .json(req),
        )
        .await
    }

    pub async fn deprovision_instance(
        &self,
        instance_id: &str,
        service_id: &str,
        plan_id: &str,
        accepts_incomplete: bool,
        originating_identity: Option<&OriginatingIdentity>,
    ) -> Result<DispatchOutcome<Value>, OsbError> {
        let path = format!(
            "/v2/service_instances/{instance_id}?service_id={service_id}&plan_id={plan_id}&accepts_incomplete={accepts_incomplete}"
        );
        Self::send_dispatch(self.request(reqwest::Method::DELETE, &path, originating_identity)).await
    }

    pub async fn poll_instance_last_operation(
        &self,
        instance_id: &str,
        operation: Option<&str>,
    ) -> Result<LastOperationResponse, OsbError> {
        let mut path = format!("/v2/service_instances/{instance_id}/last_operation");
        if let Some(op) = operation {
            path.push_str(&format!("?operation={}", urlencode(op)));
        }
        Self::send(self.request(reqwest::Method::GET, &path, None)).await
    }

    pub async fn bind(
        &self,
        instance_id: &str,
        binding_id: &str,
        accepts_incomplete: bool,
        req: &BindRequest,
        originating_identity: Option<&OriginatingIdentity>,
    ) -> Result<DispatchOutcome<BindResponse>, OsbError> {
        let path = format!(
            "/v2/service_instances/{instance_id}/service_bindings/{binding_id}?accepts_incomplete={accepts_incomplete}"
        );
        Self::send_dispatch(
            self.request(reqwest::Method::PUT, &path, originating_identity)
                .json(req),
        )
        .await
    }

    pub async fn get_binding(
        &self,
        instance_id: &str,
        binding_id: &str,
    ) -> Result<BindResponse, OsbError> {
        let path = format!("/v2/service_instances/{instance_id}/service_bindings/{binding_id}");
        Self::send(self.request(reqwest::Method::GET, &path, None)).await
    }

    pub async fn unbind(
        &self,
        instance_id: &str,
        binding_id: &str,
        service_id: &str,
        plan_id: &str,
        accepts_incomplete: bool,
        originating_identity: Option<&OriginatingIdentity>,
    ) -> Result<DispatchOutcome<Value>, OsbError> {
        let path = format!(
            "/v2/service_instances/{instance_id}/service_bindings/{binding_id}?service_id={service_id}&plan_id={plan_id}&accepts_incomplete={accepts_incomplete}"
        );
        Self::send_dispatch(self.request(reqwest::Method::DELETE, &path, originating_identity)).await
    }

    pub async fn poll_binding_last_operation(
        &self,
        instance_id: &str,
        binding_id: &str,
        operation: Option<&str>,
    ) -> Result<LastOperationResponse, OsbError> {
        let mut path = format!(
            "/v2/service_instances/{instance_id}/service_bindings/{binding_id}/last_operation"
        );
        if let Some(op) = operation {
            path.push_str(&format!("?operation={}", urlencode(op)));
        }
        Self::send(self.request(reqwest::Method::GET, &path, None)).await
    }
}

fn urlencode(s: &str) -> String {
    s.bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                (b as char).to_string()
            }
            _ => format!("%{b:02X}"),
        })
        .collect()
}
