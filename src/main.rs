use clap::Parser;
use registry_pusher::cli::{Args, Runner};
use registry_pusher::logging::init_tracing;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after in-flight requests");
            on_signal.cancel();
        }
    });

    let runner = match Runner::new(&args) {
        Ok(runner) => runner,
        Err(e) => {
            eprintln!("❌ {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runner.run(&cancel).await {
        eprintln!("❌ {}", e);
        std::process::exit(1);
    }

    Ok(())
}
