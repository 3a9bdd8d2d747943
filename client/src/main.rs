use clap::Parser;
use client::network::RelayClient;
use client::participant::{Participant, ParticipantOptions};
use log::info;
use shared::{GameConfig, DEFAULT_PORT};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Relay address (host:port or ws:// URL)
    #[arg(short = 's', long, default_value_t = format!("127.0.0.1:{}", DEFAULT_PORT))]
    server: String,

    /// Session to join
    #[arg(short = 'S', long)]
    session: String,

    /// Player identifier
    #[arg(short, long)]
    player: String,

    /// Role to claim; the first configured role leads
    #[arg(short, long)]
    role: String,

    /// Exercise parameters (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Submit a reflection at the start of every round
    #[arg(long)]
    reflect: bool,

    /// Seconds between leader moves
    #[arg(long, default_value = "5")]
    move_interval: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => GameConfig::load(path)?,
        None => GameConfig::default(),
    };

    info!(
        "Joining session {} as {} ({})",
        args.session, args.player, args.role
    );
    if config.is_leader_role(&args.role) {
        info!("Leading: this client authors the session state");
    }

    let relay = RelayClient::connect(&args.server, &args.session).await?;
    let mut options = ParticipantOptions::new(&args.player, &args.role);
    options.auto_reflect = args.reflect;
    options.move_interval = Duration::from_secs(args.move_interval.max(1));

    let mut participant = Participant::new(relay, config, options);
    participant.run().await?;

    info!("Done");
    Ok(())
}
