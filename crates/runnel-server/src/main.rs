use runnel_oplog::MemoryCluster;
use runnel_server::Server;
use runnel_stream::StreamConfig;

fn main() {
    tracing_subscriber::fmt::init();

    let addr = std::env::var("RUNNEL_ADDR").unwrap_or_else(|_| "0.0.0.0:9700".to_string());
    let shards = std::env::var("RUNNEL_SHARDS").unwrap_or_else(|_| "shard0".to_string());
    let shards: Vec<&str> = shards.split(',').map(str::trim).filter(|s| !s.is_empty()).collect();
    if shards.is_empty() {
        eprintln!("RUNNEL_SHARDS must name at least one shard");
        std::process::exit(1);
    }

    let config = StreamConfig::from_env().unwrap_or_else(|e| {
        eprintln!("invalid configuration: {e}");
        std::process::exit(1);
    });
    tracing::info!(?shards, pushdown = config.pushdown_enabled, "starting in-memory cluster");

    let server = Server::new(MemoryCluster::new(&shards), config, &addr).unwrap_or_else(|e| {
        eprintln!("failed to start: {e}");
        std::process::exit(1);
    });
    if let Err(e) = server.serve() {
        eprintln!("server failed: {e}");
        std::process::exit(1);
    }
}
