use std::{sync::Arc, time::Duration};

use catalog_common::{
    colors::{FG1, FG2},
    error::{Classify, Error},
    finalizer,
    leader::run_elected,
};
use catalog_types::Broker;
use futures::stream::StreamExt;
use kube::{
    Api, Client, ResourceExt,
    api::ListParams,
    runtime::{Controller, controller::Action},
};
use owo_colors::OwoColorize;
use tokio_util::sync::CancellationToken;

use super::actions;
use crate::context::Context;

const FINALIZER: &str = "servicecatalog.example.io/broker-protection";

/// Entrypoint for the `Broker` controller. Brokers are cluster-scoped, so
/// unlike the namespaced resources this runs exactly one `Controller`
/// instance, gated by leader election so only one replica drives catalog
/// fetches against any given broker at a time.
pub async fn run(client: Client, context: Arc<Context>, shutdown: CancellationToken) {
    println!("{}", "Starting Broker controller...".green());
    let namespace = context.config.namespace.clone();
    run_elected(
        client.clone(),
        &namespace,
        "servicecatalog-broker-controller-lock",
        shutdown,
        move || {
            let client = client.clone();
            let context = context.clone();
            async move {
                let brokers: Api<Broker> = Api::all(client);
                Controller::new(brokers, ListParams::default())
                    .run(reconcile, on_error, context)
                    .for_each(|_res| async move {})
                    .await;
            }
        },
    )
    .await;
}

#[derive(Debug, Clone, PartialEq)]
enum BrokerAction {
    AddFinalizer,
    Fetching,
    Failing { reason: String },
    Deleting,
    NoOp,
    Requeue(Duration),
}

impl BrokerAction {
    fn label(&self) -> &'static str {
        match self {
            BrokerAction::AddFinalizer => "AddFinalizer",
            BrokerAction::Fetching => "Fetching",
            BrokerAction::Failing { .. } => "Failing",
            BrokerAction::Deleting => "Deleting",
            BrokerAction::NoOp => "NoOp",
            BrokerAction::Requeue(_) => "Requeue",
        }
    }
}

async fn determine_action(broker: &Broker, relist_due: bool) -> BrokerAction {
    if broker.metadata.deletion_timestamp.is_some() {
        return BrokerAction::Deleting;
    }
    if !finalizer::has(broker, FINALIZER) {
        return BrokerAction::AddFinalizer;
    }
    if relist_due {
        return BrokerAction::Fetching;
    }
    BrokerAction::NoOp
}

fn relist_due(broker: &Broker, default_interval: Duration) -> bool {
    let interval = broker
        .spec
        .relist_duration
        .as_deref()
        .and_then(|d| parse_duration::parse(d).ok())
        .unwrap_or(default_interval);
    let Some(status) = broker.status.as_ref() else {
        return true;
    };
    let Some(last_fetch) = status.last_catalog_fetch_time.as_ref() else {
        return true;
    };
    let age = chrono::Utc::now().signed_duration_since(last_fetch.0);
    age.to_std().map(|age| age >= interval).unwrap_or(true)
}

async fn reconcile(broker: Arc<Broker>, context: Arc<Context>) -> Result<Action, Error> {
    let client = context.client.clone();
    let name = broker.name_any();

    let due = relist_due(&broker, context.config.broker_relist_interval);
    let action = determine_action(&broker, due).await;

    if context.action_changed(&name, action.label()) {
        println!(
            "{}{}{}",
            name.color(FG2),
            " ACTION: ".color(FG1),
            action.label().color(FG2),
        );
    }

    let result = match action {
        BrokerAction::AddFinalizer => {
            let api: Api<Broker> = Api::all(client);
            finalizer::add(&api, &broker, FINALIZER).await?;
            Action::requeue(Duration::from_secs(1))
        }
        BrokerAction::Deleting => {
            actions::mark_deleting(&client, &broker).await?;
            actions::mark_owned_children_removed(&client, &broker).await?;
            if actions::owned_children_remain(&client, &broker).await? {
                Action::requeue(Duration::from_secs(5))
            } else {
                let api: Api<Broker> = Api::all(client);
                if finalizer::has(&broker, FINALIZER) {
                    finalizer::remove(&api, &broker, FINALIZER).await?;
                }
                Action::await_change()
            }
        }
        BrokerAction::Fetching => {
            let _permit = context.acquire_sync_permit().await;
            actions::mark_fetching(&client, &broker).await?;
            let osb_client = context.osb_client_for(&broker).await?;
            match osb_client.get_catalog().await {
                Ok(catalog) => {
                    let checksum = catalog_common::hash_spec(&catalog.services);
                    if broker
                        .status
                        .as_ref()
                        .and_then(|s| s.last_catalog_fetch_checksum.as_deref())
                        != Some(checksum.as_str())
                        || broker.status.as_ref().map(|s| s.reconciled_generation)
                            != Some(broker.metadata.generation.unwrap_or_default())
                    {
                        actions::publish_catalog(
                            &client,
                            &broker,
                            broker.spec.catalog_restrictions.as_ref(),
                            catalog,
                            &checksum,
                        )
                        .await?;
                    }
                    Action::requeue(context.config.broker_relist_interval)
                }
                Err(e) => {
                    actions::mark_failing(&client, &broker, e.to_string()).await?;
                    Action::requeue(Duration::from_secs(30))
                }
            }
        }
        BrokerAction::Failing { reason } => {
            actions::mark_failing(&client, &broker, reason).await?;
            Action::requeue(Duration::from_secs(30))
        }
        BrokerAction::Requeue(d) => Action::requeue(d),
        BrokerAction::NoOp => Action::requeue(context.config.resync_interval),
    };

    Ok(result)
}

fn on_error(broker: Arc<Broker>, error: &Error, _context: Arc<Context>) -> Action {
    eprintln!(
        "{}",
        format!(
            "broker {} reconciliation error: {error}",
            broker.name_any()
        )
        .red()
    );
    if error.is_retriable() {
        Action::requeue(Duration::from_secs(5))
    } else {
        Action::requeue(Duration::from_secs(30))
    }
}
