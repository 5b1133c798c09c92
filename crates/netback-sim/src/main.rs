#![forbid(unsafe_code)]

use netback_engine::NetbackConfig;
use netback_sim::SimOptions;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = match NetbackConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!("invalid config: {err:#}");
            return Err(err.into());
        }
    };
    let options = SimOptions::from_env()?;
    tracing::info!(
        groups = config.worker_groups,
        execution = ?config.execution,
        copy_mode = ?config.tx_copy_mode,
        "netback-sim starting"
    );

    let report = netback_sim::run(config, &options)?;
    tracing::info!(
        sent = report.sent,
        received = report.received,
        corrupt = report.corrupt,
        strays = report.strays,
        tx_dropped = report.tx_dropped,
        rx_dropped = report.rx_dropped,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "traffic complete"
    );
    tracing::info!(bridge = ?report.bridge, hypercalls = ?report.hypervisor, "counters");

    if report.corrupt > 0 {
        anyhow::bail!("{} frames arrived corrupted", report.corrupt);
    }
    Ok(())
}
