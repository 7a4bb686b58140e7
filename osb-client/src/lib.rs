mod client;
mod error;

pub use client::{
    BindRequest, BindResponse, BrokerAuth, CatalogResponse, DispatchOutcome,
    LastOperationResponse, LastOperationState, OriginatingIdentity, OsbClient, ProvisionRequest,
    ProvisionResponse, UpdateInstanceRequest,
};
pub use error::{OsbError, OsbErrorBody, classify};
