use lagoon_relaymsg::irc::relaymsg::{ConfigHandle, RawRelayConfig, RelayConfig};
use lagoon_relaymsg::irc::server::{self, BoxError, BIND_ADDRS, SERVER_NAME};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!(server = %*SERVER_NAME, "lagoon relaymsg server starting");

    // A broken RELAYMSG configuration at startup is fatal; on REHASH it is not.
    let config = match RelayConfig::load(&RawRelayConfig::from_env(), &SERVER_NAME) {
        Ok(config) => config,
        Err(e) => {
            error!("invalid RELAYMSG configuration: {e}");
            return Err(e.into());
        }
    };
    info!(
        dialect = config.dialect().name(),
        ident = config.ident(),
        host = config.host(),
        "relaymsg enabled"
    );

    server::run(&BIND_ADDRS, ConfigHandle::new(config)).await
}
