use tokio_util::sync::CancellationToken;

use conductor_host::config::HostConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = HostConfig::load()?;
    conductor_observability::init_with(&config.log);

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => on_signal.cancel(),
            Err(err) => tracing::error!(error = %err, "failed to listen for ctrl-c"),
        }
    });

    conductor_host::run(config, shutdown).await
}
