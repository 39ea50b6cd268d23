// node: chat federation server binary.

use tracing::info;

#[tokio::main]
async fn main() {
    // Structured logging to stdout; RUST_LOG overrides the default level.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "node starting");

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "node.toml".to_owned());
    let config = match node::load_config_from_path(std::path::Path::new(&config_path)) {
        Ok(config) => {
            info!(
                server_id = %config.server_id,
                udp_port = config.network.udp_port,
                tcp_port = config.network.tcp_port,
                "config loaded"
            );
            config
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config from '{config_path}': {e}");
            std::process::exit(1);
        }
    };

    let running = match node::Node::start(config).await {
        Ok(node) => node,
        Err(e) => {
            eprintln!("FATAL: failed to start node: {e}");
            std::process::exit(1);
        }
    };

    // Bootstrap the mesh once at startup; rediscovery is operator-driven.
    running.discover().await;

    tokio::signal::ctrl_c()
        .await
        .expect("ctrl-c handler installation failed");
    running.shutdown().await;
}
