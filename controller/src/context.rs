use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use catalog_common::config::Config;
use catalog_osb_client::{BrokerAuth, OsbClient};
use catalog_types::{Broker, BrokerAuthInfo};
use k8s_openapi::{api::core::v1::{ObjectReference, Secret}};
use kube::{
    Api, Client, Resource, ResourceExt,
    runtime::events::{EventRecorder, EventSource},
};
use tokio::sync::{RwLock, Semaphore};

use catalog_common::error::Error;

/// Shared state handed to every reconciler. One `Context` is constructed
/// in `main` and cloned (behind `Arc`) into each of the five controllers.
pub struct Context {
    pub client: Client,
    pub config: Config,
    reporter: EventSource,
    osb_clients: RwLock<HashMap<String, Arc<OsbClient>>>,
    last_action: Mutex<HashMap<String, String>>,
    /// Caps concurrent outbound broker calls at `config.concurrent_syncs`.
    /// The pinned `kube::runtime::Controller` has no concurrency knob of
    /// its own (it only deduplicates in-flight keys), so this is where
    /// `concurrent_syncs` is actually enforced rather than left unused.
    sync_limit: Arc<Semaphore>,
}

impl Context {
    pub fn new(client: Client, config: Config, reporter: EventSource) -> Self {
        let sync_limit = Arc::new(Semaphore::new(config.concurrent_syncs.max(1)));
        Self {
            client,
            config,
            reporter,
            osb_clients: RwLock::new(HashMap::new()),
            last_action: Mutex::new(HashMap::new()),
            sync_limit,
        }
    }

    /// Acquires a permit bounding this controller kind's concurrent
    /// outbound broker dispatches. Held for the lifetime of the returned
    /// guard; drop it once the dispatch (and any status patch that follows
    /// it) completes.
    pub async fn acquire_sync_permit(&self) -> tokio::sync::OwnedSemaphorePermit {
        self.sync_limit
            .clone()
            .acquire_owned()
            .await
            .expect("sync_limit semaphore is never closed")
    }

    /// Builds an `EventRecorder` scoped to a single object, since the
    /// underlying API attaches every published event to one `ObjectReference`
    /// rather than letting a shared recorder target an arbitrary object.
    pub fn recorder_for<T>(&self, obj: &T) -> EventRecorder
    where
        T: Resource<DynamicType = ()> + ResourceExt,
    {
        EventRecorder::new(self.client.clone(), self.reporter.clone(), object_reference(obj))
    }

    /// Returns `true` the first time `action` is reported for `key`, and on
    /// every change thereafter; `false` while the same action keeps
    /// recurring. Used to keep a resync-interval-driven controller from
    /// logging the same "no-op" decision on every tick.
    pub fn action_changed(&self, key: &str, action: &str) -> bool {
        let mut last = self.last_action.lock().expect("last_action mutex poisoned");
        if last.get(key).map(String::as_str) == Some(action) {
            false
        } else {
            last.insert(key.to_string(), action.to_string());
            true
        }
    }

    /// Returns a cached `OsbClient` for this broker, building and
    /// inserting one (by resolving its auth secret) if this is the first
    /// use since the broker's spec last changed. Cache key incorporates
    /// the broker's resourceVersion so a credential rotation invalidates
    /// the entry.
    pub async fn osb_client_for(&self, broker: &Broker) -> Result<Arc<OsbClient>, Error> {
        let key = format!(
            "{}/{}",
            broker.name_any(),
            broker.resource_version().unwrap_or_default()
        );
        if let Some(client) = self.osb_clients.read().await.get(&key) {
            return Ok(client.clone());
        }

        let auth = match &broker.spec.auth_info {
            None => BrokerAuth::None,
            Some(BrokerAuthInfo::Basic { secret_ref }) => {
                let secret = self.get_secret(secret_ref.name.as_str()).await?;
                let username = secret_string(&secret, "username")?;
                let password = secret_string(&secret, "password")?;
                BrokerAuth::Basic { username, password }
            }
            Some(BrokerAuthInfo::Bearer { secret_ref }) => {
                let secret = self.get_secret(secret_ref.name.as_str()).await?;
                let token = secret_string(&secret, "token")?;
                BrokerAuth::Bearer { token }
            }
        };

        let client = Arc::new(
            OsbClient::new(
                broker.spec.url.clone(),
                auth,
                self.config.osb_api_timeout,
                broker.spec.ca_bundle.as_deref(),
                broker.spec.insecure_skip_tls_verify,
            )
            .map_err(|e| Error::UserInput(e.to_string()))?,
        );

        let prefix = format!("{}/", broker.name_any());
        let mut clients = self.osb_clients.write().await;
        clients.retain(|existing_key, _| !existing_key.starts_with(&prefix));
        clients.insert(key, client.clone());
        Ok(client)
    }

    async fn get_secret(&self, name: &str) -> Result<Secret, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &self.config.namespace);
        Ok(api.get(name).await?)
    }
}

fn secret_string(secret: &Secret, key: &str) -> Result<String, Error> {
    let data = secret
        .data
        .as_ref()
        .ok_or_else(|| Error::UserInput("secret has no data".to_string()))?;
    let value = data
        .get(key)
        .ok_or_else(|| Error::UserInput(format!("secret is missing key {key}")))?;
    String::from_utf8(value.0.clone())
        .map_err(|_| Error::UserInput(format!("secret key {key} is not valid utf-8")))
}

fn object_reference<T>(obj: &T) -> ObjectReference
where
    T: Resource<DynamicType = ()> + ResourceExt,
{
    ObjectReference {
        api_version: Some(<T as Resource>::api_version(&()).to_string()),
        kind: Some(<T as Resource>::kind(&()).to_string()),
        name: Some(obj.name_any()),
        namespace: obj.namespace(),
        uid: obj.uid(),
        resource_version: obj.resource_version(),
        ..Default::default()
    }
}
