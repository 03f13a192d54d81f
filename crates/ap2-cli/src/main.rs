use clap::Parser;

mod args;
mod roles;

use args::Cli;

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    if let Err(e) = roles::dispatch(cli).await {
        tracing::error!(error = ?e, "fatal");
        eprintln!("fatal: {e:?}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if std::env::var("AP2_LOG_JSON").ok().as_deref() == Some("1") {
        fmt().with_env_filter(filter).json().init();
    } else {
        fmt().with_env_filter(filter).init();
    }
}
