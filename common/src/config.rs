use std::time::Duration;

use clap::Parser;

fn parse_dur(s: &str) -> Result<Duration, parse_duration::parse::Error> {
    parse_duration::parse(s)
}

/// Process-wide configuration, immutable once the controller starts.
/// Every field here is one of spec.md's configuration knobs; none of them
/// are watched for live reload.
#[derive(Parser, Debug, Clone)]
#[command(name = "servicecatalog-controller")]
pub struct Config {
    /// How often every cached object is re-reconciled regardless of events.
    #[arg(long, env = "RESYNC_INTERVAL", value_parser = parse_dur, default_value = "5m")]
    pub resync_interval: Duration,

    /// How often each Broker's catalog is refetched absent an explicit trigger.
    #[arg(long, env = "BROKER_RELIST_INTERVAL", value_parser = parse_dur, default_value = "15m")]
    pub broker_relist_interval: Duration,

    /// Per-call deadline for every outbound OSB HTTP request.
    #[arg(long, env = "OSB_API_TIMEOUT", value_parser = parse_dur, default_value = "60s")]
    pub osb_api_timeout: Duration,

    /// How long an in-progress operation may retry before being marked terminal.
    #[arg(long, env = "RECONCILIATION_RETRY_DURATION", value_parser = parse_dur, default_value = "7d")]
    pub reconciliation_retry_duration: Duration,

    /// Ceiling on the async-poller's exponential backoff.
    #[arg(long, env = "OPERATION_POLLING_MAXIMUM_BACKOFF_DURATION", value_parser = parse_dur, default_value = "20m")]
    pub operation_polling_maximum_backoff_duration: Duration,

    /// Worker concurrency per resource kind.
    #[arg(long, env = "CONCURRENT_SYNCS", default_value_t = 5)]
    pub concurrent_syncs: usize,

    #[arg(long, env = "CLUSTER_ID_CONFIGMAP_NAME", default_value = "cluster-info")]
    pub cluster_id_configmap_name: String,

    #[arg(long, env = "CLUSTER_ID_CONFIGMAP_NAMESPACE", default_value = "kube-system")]
    pub cluster_id_configmap_namespace: String,

    #[arg(long, env = "ORIGINATING_IDENTITY_ENABLED", default_value_t = false)]
    pub originating_identity_enabled: bool,

    #[arg(long, env = "ASYNC_BINDING_OPERATIONS_ENABLED", default_value_t = false)]
    pub async_binding_operations_enabled: bool,

    #[arg(long, env = "NAMESPACE", default_value = "default")]
    pub namespace: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_from_bare_binary_name() {
        let cfg = Config::parse_from(["servicecatalog-controller"]);
        assert_eq!(cfg.resync_interval, Duration::from_secs(300));
        assert_eq!(cfg.broker_relist_interval, Duration::from_secs(900));
        assert_eq!(cfg.osb_api_timeout, Duration::from_secs(60));
        assert_eq!(cfg.concurrent_syncs, 5);
        assert!(!cfg.originating_identity_enabled);
        assert!(!cfg.async_binding_operations_enabled);
    }
}
