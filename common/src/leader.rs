//! Per-controller leader election. Each controller kind takes its own
//! named lease so one replica can lead the Broker controller while
//! another leads, say, the Binding controller, rather than one
//! cluster-wide lock serializing all five.

use std::{future::Future, time::Duration};

use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use owo_colors::OwoColorize;
use tokio_util::sync::CancellationToken;

use crate::colors::FG2;

/// Runs `spawn` only while this process holds the named lease, aborting and
/// respawning it as leadership is lost and regained. Returns once
/// `shutdown` is cancelled.
pub async fn run_elected<F, Fut>(
    client: Client,
    namespace: &str,
    lease_name: &str,
    shutdown: CancellationToken,
    spawn: F,
) where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let holder_id = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("servicecatalog-controller-{}", uuid::Uuid::new_v4()));
    let leadership = LeaseLock::new(
        client,
        namespace,
        LeaseLockParams {
            holder_id,
            lease_name: lease_name.to_string(),
            lease_ttl: Duration::from_secs(15),
        },
    );

    let mut task: Option<tokio::task::JoinHandle<()>> = None;
    let mut tick = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if let Some(t) = task.take() {
                    t.abort();
                    t.await.ok();
                }
                return;
            }
            _ = tick.tick() => {}
        }

        let lease = match leadership.try_acquire_or_renew().await {
            Ok(l) => l,
            Err(e) => {
                eprintln!("{lease_name}: leader election renew/acquire failed: {e}");
                if let Some(t) = task.take() {
                    t.abort();
                }
                continue;
            }
        };

        if matches!(lease, LeaseLockResult::Acquired(_)) {
            if task.is_none() {
                println!(
                    "{}",
                    format!("acquired leadership for {lease_name}").color(FG2)
                );
                task = Some(tokio::spawn(spawn()));
            }
        } else if let Some(t) = task.take() {
            eprintln!("{lease_name}: lost leadership; stopping");
            t.abort();
        }
    }
}
