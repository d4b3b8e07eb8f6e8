use clap::Parser;
use mirror::cache::{QueryOutcome, SnapshotSource, UpstreamQuery};
use std::net::SocketAddrV4;
use std::time::Duration;

/// Sends one A2S_INFO query and prints the decoded answer as JSON
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server or mirror to query, e.g. 127.0.0.1:27015
    address: SocketAddrV4,

    /// How long to wait for the answer in milliseconds
    #[arg(short = 't', long, default_value = "2500")]
    timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let query = UpstreamQuery::with_timeout(args.address, Duration::from_millis(args.timeout_ms));
    println!("Querying {}", query.target());

    match query.query().await {
        QueryOutcome::Fresh(snapshot) => {
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            println!("Raw response: {} bytes", snapshot.data.len());
        }
        QueryOutcome::TimedOut => {
            println!("No answer within {}ms", args.timeout_ms);
        }
        QueryOutcome::Unreachable(reason) => {
            println!("Query failed: {}", reason);
        }
    }

    Ok(())
}
