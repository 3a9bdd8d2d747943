use clap::Parser;
use log::{error, info};
use server::config::{RelayConfig, DEFAULT_INSTANCE_UTC_OFFSET_HOURS};
use server::network::RelayServer;
use server::relay::Relay;
use server::sink::{ActionSink, JsonLinesSink, NullSink};
use shared::{GameConfig, DEFAULT_PORT};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind to
    #[arg(short = 'H', long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Exercise parameters (JSON); built-in defaults are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Append recorded actions to this file as JSON lines
    #[arg(short, long)]
    action_log: Option<PathBuf>,

    /// UTC offset in hours for game instance labels
    #[arg(long, default_value_t = DEFAULT_INSTANCE_UTC_OFFSET_HOURS, allow_hyphen_values = true)]
    instance_utc_offset: i32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let game = match &args.config {
        Some(path) => GameConfig::load(path)?,
        None => GameConfig::default(),
    };
    let config = RelayConfig::from_game_config(&game, args.instance_utc_offset);
    info!(
        "Leader role: {}, {} rounds of {}s ({}s per session)",
        config.leader_role,
        game.round_count,
        game.round_duration_sec,
        game.session_duration_sec()
    );

    let sink: Box<dyn ActionSink> = match &args.action_log {
        Some(path) => Box::new(JsonLinesSink::spawn(path)),
        None => {
            info!("No action log configured, recorded actions are discarded");
            Box::new(NullSink)
        }
    };

    let address = format!("{}:{}", args.host, args.port);
    let server = RelayServer::bind(&address, Relay::new(config, sink)).await?;

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Relay failed: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
