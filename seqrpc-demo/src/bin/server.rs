use clap::Parser;
use seqrpc::Server;
use seqrpc_demo::arith_service;
use std::sync::Arc;

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Listen address.
    #[arg(default_value = "0.0.0.0:8000")]
    pub addr: std::net::SocketAddr,

    /// Serve the HTTP CONNECT upgrade instead of raw TCP.
    #[arg(long, default_value_t = false)]
    pub http: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();

    let server = Arc::new(Server::new());
    server.register(arith_service().unwrap()).unwrap();

    let addr = if args.http {
        server.listen_http(args.addr).await.unwrap()
    } else {
        server.listen(args.addr).await.unwrap()
    };
    tracing::info!("serving Arith on {addr}...");

    server.join().await;
}
