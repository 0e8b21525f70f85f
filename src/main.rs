use clap::{Parser, Subcommand};
use loragw_rs::logging::init_logger_with_level;
use loragw_rs::{log_info, Gateway, LoraServerSettings};

#[derive(Parser)]
#[command(name = "loragw")]
#[command(about = "LoRaWAN gateway core")]
struct Cli {
    /// Default log level (error, warn, info, debug, trace).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway until interrupted.
    Run {
        /// JSON settings file; builtin settings are used when omitted.
        #[arg(short, long)]
        config: Option<String>,
    },
    /// Print the effective settings and exit.
    ShowConfig {
        #[arg(short, long)]
        config: Option<String>,
    },
}

fn load_settings(config: Option<String>) -> anyhow::Result<LoraServerSettings> {
    Ok(match config {
        Some(path) => LoraServerSettings::from_json_file(path)?,
        None => LoraServerSettings::builtin(),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logger_with_level(&cli.log_level);

    match cli.command {
        Commands::Run { config } => {
            let settings = load_settings(config)?;
            let mut gateway = Gateway::bootstrap(settings).await?;
            gateway.start().await?;
            log_info("gateway started, waiting for radio traffic (ctrl-c to stop)");

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = gateway.node_events.recv() => match event {
                        Some(event) => log_info(&format!("session: {event:?}")),
                        None => break,
                    },
                    packet = gateway.radio_downlink.recv() => match packet {
                        Some(packet) => log_info(&format!(
                            "downlink for radio: {} bytes at tick {}",
                            packet.packet.len(),
                            packet.packet.timestamp_ms
                        )),
                        None => break,
                    },
                }
            }

            gateway.stop().await?;
            log_info("gateway stopped");
        }
        Commands::ShowConfig { config } => {
            let settings = load_settings(config)?;
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
    }

    Ok(())
}
