//! eyewatch: device-monitoring dashboard backend.
//! `serve` runs the HTTP API, tracking controller and chat resolver in one
//! process; the other subcommands are thin clients or offline DB tools.

use clap::Parser;

mod api;
mod chat;
mod child;
mod cli;
mod client;
mod cmd_ingest;
mod generator;
mod server;
mod tracker;

fn init_tracing() {
    let filter = std::env::var("EYEWATCH_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();
    init_tracing();

    match args.command {
        cli::Command::Serve(opts) => {
            tracing::info!("eyewatch {} starting", env!("CARGO_PKG_VERSION"));
            server::run_server(opts).await?;
        }
        cli::Command::Status(opts) => client::cmd_status(&opts.server).await?,
        cli::Command::Start(opts) => {
            client::cmd_start(&opts.client.server, &opts.mac_address).await?;
        }
        cli::Command::Stop(opts) => client::cmd_stop(&opts.server).await?,
        cli::Command::Logs(opts) => {
            client::cmd_logs(&opts.client.server, &opts.category, &opts.mac_address).await?;
        }
        cli::Command::DeleteLogs(opts) => {
            client::cmd_delete_logs(
                &opts.client.server,
                &opts.mac_address,
                &opts.start,
                &opts.end,
                &opts.category,
            )
            .await?;
        }
        cli::Command::Ask(opts) => {
            let question = opts.question.join(" ");
            client::cmd_ask(&opts.client.server, &question, opts.conversation.as_deref()).await?;
        }
        cli::Command::Ingest(opts) => cmd_ingest::cmd_ingest(&opts)?,
        cli::Command::Register(opts) => cmd_ingest::cmd_register(&opts)?,
    }

    Ok(())
}
