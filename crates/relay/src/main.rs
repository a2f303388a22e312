use anyhow::Context;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hireflow_observability::init();

    let settings = hireflow_relay::RelaySettings::from_env().context("invalid relay configuration")?;

    hireflow_relay::run(settings, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for shutdown signal");
        }
    })
    .await
}
