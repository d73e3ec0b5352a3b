use clap::{Parser, Subcommand};
use leadsync::{FailedOperationsManager, SyncConfig};
use leadsync_http::serve;

#[derive(Parser)]
#[command(name = "leadsync", version, about = "Local sync daemon for the CRM webhook backend")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[arg(long, env = "LEADSYNC_DATA_DIR", default_value = "./data")]
    data_dir: String,
    #[arg(long, env = "LEADSYNC_BIND_ADDR", default_value = "127.0.0.1:7800")]
    bind_addr: String,
    /// Base URL of the webhook automations (ignored when webhooks.json exists)
    #[arg(long, env = "LEADSYNC_WEBHOOK_BASE_URL")]
    webhook_url: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Print the queued failed writes in the data directory as JSON and exit
    Failed,
}

fn run_failed(data_dir: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = SyncConfig::from_env();
    config.data_dir = data_dir.into();
    let failed = FailedOperationsManager::open(
        &config.failed_ops_dir(),
        config.retry.clone(),
        leadsync::clock::system(),
    )?;
    let records = failed.list();
    println!("{}", serde_json::to_string_pretty(&records)?);
    eprintln!("{} queued failed operation(s)", records.len());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Some(Command::Failed) => run_failed(&cli.data_dir),
        None => {
            std::env::set_var("LEADSYNC_DATA_DIR", &cli.data_dir);
            std::env::set_var("LEADSYNC_BIND_ADDR", &cli.bind_addr);
            if let Some(url) = &cli.webhook_url {
                std::env::set_var("LEADSYNC_WEBHOOK_BASE_URL", url);
            }
            serve().await
        }
    }
}
