mod bindings;
mod brokers;
mod cache;
mod classes;
mod context;
mod instances;
mod resolver;

use std::sync::Arc;

use catalog_common::{config::Config, shutdown::shutdown_signal};
use clap::Parser;
use kube::{Client, runtime::events::EventSource};
use owo_colors::OwoColorize;
use tokio_util::sync::CancellationToken;

use context::Context;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    catalog_common::init();
    let config = Config::parse();

    println!("{}", "⚙️  Starting Service Catalog controller...".cyan());
    let client = Client::try_default().await?;

    let controller_pod = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "servicecatalog-controller".to_string());
    let reporter = EventSource {
        controller: "servicecatalog-controller".to_string(),
        controller_pod,
    };

    let context = Arc::new(Context::new(client.clone(), config, reporter));
    let shutdown = CancellationToken::new();

    let handles = vec![
        tokio::spawn(brokers::run(client.clone(), context.clone(), shutdown.clone())),
        tokio::spawn(classes::run_classes(client.clone(), context.clone(), shutdown.clone())),
        tokio::spawn(classes::run_plans(client.clone(), context.clone(), shutdown.clone())),
        tokio::spawn(instances::run(client.clone(), context.clone(), shutdown.clone())),
        tokio::spawn(bindings::run(client.clone(), context.clone(), shutdown.clone())),
    ];

    shutdown_signal().await;
    println!("{}", "shutting down, waiting for controllers to drain...".yellow());
    shutdown.cancel();
    for handle in handles {
        handle.await?;
    }

    Ok(())
}
