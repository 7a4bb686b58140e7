use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A reference to a key within a `Secret` in the same namespace as the
/// resource that holds the reference.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct SecretKeyReference {
    pub name: String,
    pub key: String,
}

/// A reference to a `Secret` by name only, used where the namespace is
/// implied by the referencing resource.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct LocalObjectReference {
    pub name: String,
}

/// Identity of the cluster principal that last mutated a spec, captured by
/// an admission layer ahead of this controller and forwarded verbatim as
/// the OSB originating-identity header when enabled.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct UserInfo {
    pub username: String,
    #[serde(default)]
    pub uid: Option<String>,
    #[serde(default)]
    pub groups: Vec<String>,
}

fn default_insecure_skip_tls_verify() -> bool {
    false
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(tag = "type")]
pub enum BrokerAuthInfo {
    Basic { secret_ref: LocalObjectReference },
    Bearer { secret_ref: LocalObjectReference },
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct CatalogRestrictions {
    #[serde(default)]
    pub service_class_restrictions: Vec<String>,
    #[serde(default)]
    pub service_plan_restrictions: Vec<String>,
}

fn default_relist_duration() -> Option<String> {
    None
}

#[derive(CustomResource, Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "servicecatalog.example.io",
    version = "v1alpha1",
    kind = "Broker",
    plural = "brokers",
    derive = "PartialEq",
    status = "BrokerStatus"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.phase\", \"name\": \"PHASE\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.lastCatalogFetchTime\", \"name\": \"LAST-FETCH\", \"type\": \"date\" }"
)]
pub struct BrokerSpec {
    pub url: String,
    #[serde(default)]
    pub auth_info: Option<BrokerAuthInfo>,
    #[serde(default)]
    pub ca_bundle: Option<String>,
    #[serde(default = "default_insecure_skip_tls_verify")]
    pub insecure_skip_tls_verify: bool,
    #[serde(default)]
    pub catalog_restrictions: Option<CatalogRestrictions>,
    /// Overrides the process-wide broker relist interval for this broker only.
    #[serde(default = "default_relist_duration")]
    pub relist_duration: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum BrokerPhase {
    #[default]
    Pending,
    Fetching,
    Ready,
    Failing,
    Deleting,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
pub struct BrokerStatus {
    pub phase: BrokerPhase,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub reconciled_generation: i64,
    #[serde(default)]
    pub last_catalog_fetch_time: Option<Time>,
    #[serde(default)]
    pub last_catalog_fetch_checksum: Option<String>,
}

// ---------------------------------------------------------------------
// ServiceClass
// ---------------------------------------------------------------------

#[derive(CustomResource, Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "servicecatalog.example.io",
    version = "v1alpha1",
    kind = "ServiceClass",
    plural = "serviceclasses",
    derive = "PartialEq",
    status = "ServiceClassStatus"
)]
pub struct ServiceClassSpec {
    pub broker_name: String,
    pub external_id: String,
    pub external_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub bindable: bool,
    #[serde(default)]
    pub plan_updatable: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ServiceClassStatus {
    #[serde(default)]
    pub removed_from_broker_catalog: bool,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

// ---------------------------------------------------------------------
// ServicePlan
// ---------------------------------------------------------------------

#[derive(CustomResource, Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "servicecatalog.example.io",
    version = "v1alpha1",
    kind = "ServicePlan",
    plural = "serviceplans",
    derive = "PartialEq",
    status = "ServicePlanStatus"
)]
pub struct ServicePlanSpec {
    pub broker_name: String,
    pub service_class_ref: LocalObjectReference,
    pub external_id: String,
    pub external_name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Overrides the owning class's bindable flag when present.
    #[serde(default)]
    pub bindable: Option<bool>,
    #[serde(default)]
    pub free: bool,
    #[serde(default)]
    pub instance_create_parameter_schema: Option<serde_json::Value>,
    #[serde(default)]
    pub instance_update_parameter_schema: Option<serde_json::Value>,
    #[serde(default)]
    pub binding_create_parameter_schema: Option<serde_json::Value>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ServicePlanStatus {
    #[serde(default)]
    pub removed_from_broker_catalog: bool,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

// ---------------------------------------------------------------------
// Shared operation bookkeeping (ServiceInstance + ServiceBinding)
// ---------------------------------------------------------------------

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum OperationKind {
    Provision,
    Update,
    Deprovision,
    Bind,
    Unbind,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct Operation {
    pub kind: OperationKind,
    pub started_at: Time,
    #[serde(default)]
    pub broker_operation_key: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum DeprovisionStatus {
    #[default]
    NotRequired,
    Required,
    Succeeded,
    Failed,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum UnbindStatus {
    #[default]
    NotRequired,
    Required,
    Succeeded,
    Failed,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ParametersFromSource {
    pub secret_key_ref: SecretKeyReference,
}

/// Snapshot of the parameters/checksum that were in effect for the most
/// recently *successful* operation, used to detect drift between spec and
/// the broker's last-known view.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct PropertiesState {
    #[serde(default)]
    pub parameters_checksum: Option<String>,
    #[serde(default)]
    pub user_info: Option<UserInfo>,
}

// ---------------------------------------------------------------------
// ServiceInstance
// ---------------------------------------------------------------------

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(untagged)]
pub enum PlanReference {
    ByName {
        cluster_service_class_external_name: String,
        cluster_service_plan_external_name: String,
    },
    ById {
        cluster_service_class_ref: String,
        cluster_service_plan_ref: String,
    },
}

#[derive(CustomResource, Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "servicecatalog.example.io",
    version = "v1alpha1",
    kind = "ServiceInstance",
    plural = "serviceinstances",
    derive = "PartialEq",
    status = "ServiceInstanceStatus",
    namespaced
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.phase\", \"name\": \"PHASE\", \"type\": \"string\" }"
)]
pub struct ServiceInstanceSpec {
    #[serde(flatten)]
    pub plan_reference: PlanReference,
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
    #[serde(default)]
    pub parameters_from: Vec<ParametersFromSource>,
    pub external_id: String,
    #[serde(default)]
    pub user_info: Option<UserInfo>,
    #[serde(default)]
    pub update_requests: i64,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum InstancePhase {
    #[default]
    Pending,
    Provisioning,
    Ready,
    Updating,
    Deprovisioning,
    Failed,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ServiceInstanceStatus {
    pub phase: InstancePhase,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub class_ref: Option<LocalObjectReference>,
    #[serde(default)]
    pub plan_ref: Option<LocalObjectReference>,
    #[serde(default)]
    pub external_properties: Option<PropertiesState>,
    #[serde(default)]
    pub in_progress_properties: Option<PropertiesState>,
    #[serde(default)]
    pub current_operation: Option<Operation>,
    #[serde(default)]
    pub last_operation_key: Option<String>,
    #[serde(default)]
    pub last_operation_poll_backoff_seconds: Option<u64>,
    #[serde(default)]
    pub deprovision_status: DeprovisionStatus,
    #[serde(default)]
    pub reconciled_generation: i64,
    #[serde(default)]
    pub provisioned_at: Option<Time>,
    #[serde(default)]
    pub orphan_mitigation_in_progress: bool,
    /// Reason/message of the failure that triggered orphan mitigation,
    /// reapplied to the `Ready` condition once the compensating deprovision
    /// completes so the original cause is not lost behind "Deprovisioning".
    #[serde(default)]
    pub orphan_mitigation_reason: Option<String>,
    #[serde(default)]
    pub reconciled_update_requests: i64,
}

// ---------------------------------------------------------------------
// ServiceBinding
// ---------------------------------------------------------------------

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(tag = "type")]
pub enum SecretTransform {
    RenameKey { from: String, to: String },
    AddKey {
        key: String,
        #[serde(default)]
        value: Option<String>,
        #[serde(default)]
        string_value: Option<String>,
        #[serde(default)]
        json_path_expression: Option<String>,
    },
    AddKeysFrom { secret_ref: LocalObjectReference },
    RemoveKey { key: String },
}

#[derive(CustomResource, Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "servicecatalog.example.io",
    version = "v1alpha1",
    kind = "ServiceBinding",
    plural = "servicebindings",
    derive = "PartialEq",
    status = "ServiceBindingStatus",
    namespaced
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.phase\", \"name\": \"PHASE\", \"type\": \"string\" }"
)]
pub struct ServiceBindingSpec {
    pub instance_ref: LocalObjectReference,
    pub secret_name: String,
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
    #[serde(default)]
    pub parameters_from: Vec<ParametersFromSource>,
    pub external_id: String,
    #[serde(default)]
    pub user_info: Option<UserInfo>,
    #[serde(default)]
    pub secret_transforms: Vec<SecretTransform>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum BindingPhase {
    #[default]
    Pending,
    Binding,
    Ready,
    Unbinding,
    Failed,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ServiceBindingStatus {
    pub phase: BindingPhase,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub external_properties: Option<PropertiesState>,
    #[serde(default)]
    pub in_progress_properties: Option<PropertiesState>,
    #[serde(default)]
    pub current_operation: Option<Operation>,
    #[serde(default)]
    pub last_operation_key: Option<String>,
    #[serde(default)]
    pub last_operation_poll_backoff_seconds: Option<u64>,
    #[serde(default)]
    pub unbind_status: UnbindStatus,
    #[serde(default)]
    pub reconciled_generation: i64,
    #[serde(default)]
    pub bound_at: Option<Time>,
    #[serde(default)]
    pub orphan_mitigation_in_progress: bool,
    #[serde(default)]
    pub orphan_mitigation_reason: Option<String>,
}

/// Condition reasons shared across reconcilers, so event emission and
/// status patching always agree on the string value.
pub mod reasons {
    pub const FETCHING_CATALOG: &str = "FetchingCatalog";
    pub const CATALOG_FETCH_FAILED: &str = "ErrorFetchingCatalog";
    pub const CATALOG_READY: &str = "CatalogReady";

    pub const PROVISIONING: &str = "Provisioning";
    pub const PROVISION_FAILED: &str = "ErrorProvisionCallFailed";
    pub const PROVISIONED: &str = "ProvisionedSuccessfully";
    pub const UPDATING: &str = "Updating";
    pub const UPDATE_FAILED: &str = "ErrorUpdateCallFailed";
    pub const UPDATED: &str = "UpdatedSuccessfully";
    pub const DEPROVISIONING: &str = "Deprovisioning";
    pub const DEPROVISION_FAILED: &str = "ErrorDeprovisionCallFailed";
    pub const DEPROVISIONED: &str = "DeprovisionedSuccessfully";

    pub const BINDING: &str = "Binding";
    pub const BIND_FAILED: &str = "ErrorBindCallFailed";
    pub const BOUND: &str = "InjectedBindResult";
    pub const BIND_INJECT_FAILED: &str = "ErrorInjectingBindResult";
    pub const UNBINDING: &str = "Unbinding";
    pub const UNBIND_FAILED: &str = "ErrorUnbindCallFailed";
    pub const UNBOUND: &str = "UnboundSuccessfully";

    pub const INSTANCE_NOT_READY: &str = "ErrorInstanceNotReady";
    pub const NOT_BINDABLE: &str = "ErrorNotBindable";
    pub const NAMESPACE_NOT_FOUND: &str = "ErrorNamespaceNotFound";
    pub const SECRET_CONFLICT: &str = "ErrorInjectingBindResult";

    pub const RECONCILIATION_RETRY_TIMEOUT: &str = "ErrorReconciliationRetryTimeout";
    pub const ORPHAN_MITIGATION: &str = "OrphanMitigation";

    pub const REFERENCE_RESOLVE_FAILED: &str = "ErrorResolvingReference";
}
