use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use linkshaper::limits::bits_to_kbps;
use linkshaper::pipeline::QueueView;
use linkshaper::ShaperConfig;

#[derive(Parser)]
#[command(
    name = "linkshaper",
    about = "Keeps RouterOS queue limits tracking a DSL line's attainable rate",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one adjustment cycle (the cron / systemd-timer entry point)
    Adjust {
        /// Compute and log limits without touching the router
        #[arg(long)]
        dry_run: bool,
    },

    /// Read rates and queue state without changing anything
    Show {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialize tracing. Logs go to stderr so `show --json` stays parseable.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ShaperConfig::resolve(cli.config.as_deref())?;

    match cli.command {
        Commands::Adjust { dry_run } => {
            let report = linkshaper::adjust(&config, dry_run).await?;

            // Exit-code policy: a direction skipped because its queue is
            // missing on the device is a warning, not a failure -- the
            // process exits 0 and the next timer run tries again. Only
            // whole-cycle errors (connection, measurement) exit non-zero.
            if !report.fully_applied() {
                tracing::warn!("cycle finished with at least one direction unapplied");
            }
        }
        Commands::Show { json } => {
            let report = linkshaper::inspect(&config).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("\nDSL attainable rates");
                println!(
                    "  downstream: {:>12} bps ({} kbps)",
                    report.downstream.bits_per_second,
                    bits_to_kbps(report.downstream.bits_per_second)
                );
                println!(
                    "  upstream:   {:>12} bps ({} kbps)",
                    report.upstream.bits_per_second,
                    bits_to_kbps(report.upstream.bits_per_second)
                );
                println!("\nQueues (margin {:.0}%)", report.margin * 100.0);
                println!(
                    "{:<16} | {:<12} | {:<12} | Proposed",
                    "Queue", "Exists", "Current"
                );
                println!("{:-<16}-|-{:-<12}-|-{:-<12}-|-{:-<12}", "", "", "", "");
                print_queue_row(&report.download);
                print_queue_row(&report.upload);
                println!();
            }
        }
    }

    Ok(())
}

fn print_queue_row(view: &QueueView) {
    let current = view
        .current_bits
        .map(|b| b.to_string())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{:<16} | {:<12} | {:<12} | {}",
        view.queue,
        if view.exists { "yes" } else { "NO" },
        current,
        view.proposed_bits
    );
}
