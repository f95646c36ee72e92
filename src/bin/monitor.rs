use clap::{Parser, Subcommand};
use tracing::{info, level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};
use union_monitor::{
    app::AppContext,
    config::{Secrets, read_config_file},
    util::mask_secret,
};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: String,

    /// Log level for this crate
    #[arg(long, default_value = "info")]
    log_level: LevelFilter,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum Command {
    /// Keep the session alive and watch the club limits (default)
    Run,
    /// Log in once and print the masked session cookie
    Login,
    /// Run one alert check and print its report
    Check,
}

fn init(level: LevelFilter) {
    let filter = filter::Targets::new().with_target("union_monitor", level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init(args.log_level);
    trace!("started with args: {args:?}");

    let config = read_config_file(&args.file)?;
    let context = AppContext::build(config, &Secrets::from_env())?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => {
            let running = context.start().await;
            wait_for_shutdown().await?;
            running.stop().await;
        }
        Command::Login => {
            let credential = context.login_once().await?;
            println!("{}", mask_secret(credential.token()));
        }
        Command::Check => {
            let report = context.check_once().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

async fn wait_for_shutdown() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("received Ctrl+C");
    }

    Ok(())
}
