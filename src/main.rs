mod cli;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing(verbose: bool, silent: bool) {
    let default = if silent {
        "cpt_driver=error"
    } else if verbose {
        "cpt_driver=debug"
    } else {
        "cpt_driver=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    let is_silent = args.silent;
    init_tracing(args.verbose, is_silent);

    match cli::run(args).await {
        Ok(()) => Ok(()),
        Err(e) => {
            if is_silent {
                println!("{:#}", e);
                std::process::exit(1);
            } else {
                Err(e)
            }
        }
    }
}
