use clap::Parser;
use seqrpc_demo::SumArgs;

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Server address, as scheme@address.
    #[arg(default_value = "tcp@127.0.0.1:8000")]
    pub addr: String,

    /// Number of concurrent calls.
    #[arg(short, long, default_value_t = 5)]
    pub count: i64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();

    let client = std::sync::Arc::new(seqrpc::x_dial(&args.addr).await.unwrap());

    let mut tasks = vec![];
    for i in 0..args.count {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let args = SumArgs {
                num1: i,
                num2: i * i,
            };
            let reply: i64 = client.call("Arith.Sum", &args).await.unwrap();
            tracing::info!("{} + {} = {}", args.num1, args.num2, reply);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
}
