pub mod colors;
pub mod config;
pub mod error;
pub mod finalizer;
pub mod leader;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod patch;
pub mod shutdown;

pub mod annotations {
    pub const CREATED_BY: &str = "servicecatalog.example.io/created-by";
    pub const SPEC_HASH: &str = "servicecatalog.example.io/spec-hash";
    pub const BROKER_NAME: &str = "servicecatalog.example.io/broker-name";
    pub const BROKER_UID: &str = "servicecatalog.example.io/broker-uid";
}

/// Name this manager uses when applying status patches.
pub const MANAGER_NAME: &str = "servicecatalog-controller";

pub fn hash_spec<T: serde::Serialize>(spec: &T) -> String {
    use sha2::{Digest, Sha256};
    let spec_bytes = serde_json::to_vec(spec).expect("serializing an already-typed spec");
    let mut hasher = Sha256::new();
    hasher.update(&spec_bytes);
    hex::encode(hasher.finalize())
}

pub fn init() {
    let disable_colors = ["1", "true"].contains(
        &std::env::var("DISABLE_COLORS")
            .unwrap_or_else(|_| String::new())
            .to_lowercase()
            .as_str(),
    );
    owo_colors::set_override(!disable_colors);
}
