use anyhow::Result;
use clap::Parser;
use gatemap::{init_logging, PortMapper, VERSION};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about = "Gatemap gateway probe", long_about = None)]
struct Args {
    /// Local port the mapping would expose
    #[arg(short, long, default_value_t = 4789)]
    port: u16,

    /// How long to keep discovery running, in seconds
    #[arg(short, long, default_value_t = 30)]
    duration: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    println!("Gatemap v{} probing for gateways on the local network", VERSION);
    println!("Local port: {}", args.port);
    println!("Window: {}s", args.duration);
    println!();

    let mapper = PortMapper::start(args.port).await?;

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(args.duration)) => {}
        reason = mapper.closed() => {
            anyhow::bail!("discovery stopped early: {}", reason);
        }
    }

    let udns = mapper.registered_udns();
    if udns.is_empty() {
        println!("No gateways found.");
    } else {
        println!("Registered gateways:");
        for udn in udns {
            println!("  {}", udn);
        }
    }

    mapper.shutdown();
    Ok(())
}
