//! Runs the postern MTA, or one of its operator commands

#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use postern::{Postern, config};

#[derive(Parser, Debug)]
#[command(name = "postern")]
#[command(about = "A mail transfer agent", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file, found through `POSTERN_CONFIG` or the default
    /// locations when not given
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the SMTP listeners and delivery workers (the default)
    Serve,
    /// Manage the IP addresses allowed to relay
    RelayIp {
        #[command(subcommand)]
        action: RelayIpAction,
    },
    /// Inspect and mark queued messages (file-backed spools only)
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
}

#[derive(Subcommand, Debug)]
enum RelayIpAction {
    Add { ip: String },
    #[command(alias = "remove")]
    Del { ip: String },
    List,
}

#[derive(Subcommand, Debug)]
enum QueueAction {
    List,
    /// Remove a message on its next delivery attempt
    Discard { id: String },
    /// Bounce a message to its sender on its next delivery attempt
    Bounce { id: String },
}

fn timestamp(time: std::time::SystemTime) -> String {
    chrono::DateTime::<chrono::Utc>::from(time).to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let path = match cli.config {
        Some(path) => path,
        None => config::find_config_file()?,
    };
    let postern = Postern::load(&path)?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => postern.run().await?,
        Commands::RelayIp { action } => {
            let admin = postern.admin();
            match action {
                RelayIpAction::Add { ip } => {
                    admin.add_relay_ip(&ip).await?;
                    println!("Added {ip}");
                }
                RelayIpAction::Del { ip } => {
                    admin.remove_relay_ip(&ip).await?;
                    println!("Removed {ip}");
                }
                RelayIpAction::List => {
                    for ip in admin.relay_ips().await? {
                        println!("{ip}");
                    }
                }
            }
        }
        Commands::Queue { action } => {
            let admin = postern.admin();
            match action {
                QueueAction::List => {
                    let records = admin.queued().await?;
                    println!(
                        "{:<26}  {:<12}  {:>5}  {:<20}  {:<30}  RECIPIENT",
                        "ID", "STATUS", "TRIES", "NEXT ATTEMPT", "SENDER"
                    );
                    for record in &records {
                        println!(
                            "{:<26}  {:<12}  {:>5}  {:<20}  {:<30}  {}",
                            record.id,
                            record.status,
                            record.delivery_failed_count,
                            timestamp(record.next_delivery_scheduled_at),
                            if record.mail_from.is_empty() {
                                "<>"
                            } else {
                                record.mail_from.as_str()
                            },
                            record.rcpt_to
                        );
                    }
                    println!("{} message(s) queued", records.len());
                }
                QueueAction::Discard { id } => {
                    let record = admin.discard(&id).await?;
                    println!("{} marked {}", record.id, record.status);
                }
                QueueAction::Bounce { id } => {
                    let record = admin.bounce(&id).await?;
                    println!("{} marked {}", record.id, record.status);
                }
            }
        }
    }

    Ok(())
}
