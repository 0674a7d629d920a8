mod bot;
mod clock;
mod config;
mod market;
mod orders;
mod position;
mod risk;
mod store;
mod strategy;
mod types;
mod venue;

use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use bot::{Bot, StartupError};
use clock::SystemClock;
use config::{BotConfig, VenueCredentials};
use store::TradeStore;
use types::{Instrument, Timeframe};
use venue::{DydxClient, VenueClient};

const EXIT_OK: i32 = 0;
const EXIT_CONFIG: i32 = 1;
const EXIT_VENUE: i32 = 2;
const EXIT_CIRCUIT_BROKEN: i32 = 3;

#[derive(Parser)]
#[command(name = "dydx-breakout-bot")]
#[command(version = "0.1.0")]
#[command(about = "Automated resistance-breakout trading daemon for dYdX v4 testnet", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the trading daemon
    Start {
        /// Market to trade, e.g. ETH-USD
        #[arg(long)]
        instrument: Option<String>,

        /// Candle granularity: 1m, 5m, 15m, 30m, 1h, 4h, 1d
        #[arg(long)]
        timeframe: Option<Timeframe>,

        /// Volume multiple confirming a breakout
        #[arg(long)]
        volume_factor: Option<Decimal>,

        /// Sealed-candle lookback for the resistance level
        #[arg(long)]
        resistance_periods: Option<usize>,

        /// Take-profit distance as a multiple of entry risk
        #[arg(long)]
        risk_reward: Option<Decimal>,

        /// Notional per entry in USD
        #[arg(long)]
        position_size: Option<Decimal>,

        /// Record fills locally without sending orders to the venue
        #[arg(long, conflicts_with = "live")]
        simulation: bool,

        /// Submit real orders (requires credentials)
        #[arg(long)]
        live: bool,

        /// Control loop period in seconds
        #[arg(long)]
        update_interval: Option<u64>,

        /// Persist an open position on shutdown instead of closing it
        #[arg(long)]
        keep_position: bool,
    },
    /// Show the account snapshot and any open position
    Status,
    /// Capture venue credentials interactively
    Setup,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("failed to initialise logging");
    }

    let config_path = cli.config.clone();
    let code = match cli.command {
        Commands::Start {
            instrument,
            timeframe,
            volume_factor,
            resistance_periods,
            risk_reward,
            position_size,
            simulation,
            live,
            update_interval,
            keep_position,
        } => {
            let overrides = StartOverrides {
                instrument,
                timeframe,
                volume_factor,
                resistance_periods,
                risk_reward,
                position_size,
                simulation,
                live,
                update_interval,
                keep_position,
            };
            run_start(&config_path, overrides).await
        }
        Commands::Status => run_status(&config_path).await,
        Commands::Setup => run_setup(),
    };

    std::process::exit(code);
}

struct StartOverrides {
    instrument: Option<String>,
    timeframe: Option<Timeframe>,
    volume_factor: Option<Decimal>,
    resistance_periods: Option<usize>,
    risk_reward: Option<Decimal>,
    position_size: Option<Decimal>,
    simulation: bool,
    live: bool,
    update_interval: Option<u64>,
    keep_position: bool,
}

fn load_config(path: &str, overrides: Option<&StartOverrides>) -> Result<BotConfig, i32> {
    let mut config = match BotConfig::load(Path::new(path), false) {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {}", e);
            return Err(EXIT_CONFIG);
        }
    };

    if let Some(overrides) = overrides {
        if let Some(instrument) = &overrides.instrument {
            config.instrument = Instrument::new(instrument.clone());
        }
        if let Some(timeframe) = overrides.timeframe {
            config.timeframe = timeframe;
        }
        if let Some(volume_factor) = overrides.volume_factor {
            config.volume_factor = volume_factor;
        }
        if let Some(resistance_periods) = overrides.resistance_periods {
            config.resistance_periods = resistance_periods;
        }
        if let Some(risk_reward) = overrides.risk_reward {
            config.risk_reward_ratio = risk_reward;
        }
        if let Some(position_size) = overrides.position_size {
            config.position_size_usd = position_size;
        }
        if overrides.simulation {
            config.simulation_mode = true;
        }
        if overrides.live {
            config.simulation_mode = false;
        }
        if let Some(update_interval) = overrides.update_interval {
            config.update_interval_s = update_interval;
        }
        if overrides.keep_position {
            config.keep_position_on_shutdown = true;
        }
    }

    if let Err(e) = config.validate() {
        error!("configuration error: {}", e);
        return Err(EXIT_CONFIG);
    }
    Ok(config)
}

async fn run_start(config_path: &str, overrides: StartOverrides) -> i32 {
    let config = match load_config(config_path, Some(&overrides)) {
        Ok(config) => config,
        Err(code) => return code,
    };

    let credentials = if config.simulation_mode {
        VenueCredentials::public_only()
    } else {
        match VenueCredentials::from_env() {
            Ok(credentials) => credentials,
            Err(e) => {
                error!("configuration error: {}", e);
                return EXIT_CONFIG;
            }
        }
    };

    let venue: Arc<dyn VenueClient> = Arc::new(DydxClient::new(credentials));
    let clock = Arc::new(SystemClock);

    let mut bot = match Bot::new(config, venue, clock) {
        Ok(bot) => bot,
        Err(e) => {
            error!("startup failed: {}", e);
            return EXIT_CONFIG;
        }
    };

    match bot.run().await {
        Ok(()) => {
            info!("bot stopped");
            EXIT_OK
        }
        Err(StartupError::Venue(e)) => {
            error!("venue connectivity failed to initialise: {}", e);
            EXIT_VENUE
        }
        Err(StartupError::CircuitBroken) => {
            error!("circuit breaker already tripped by today's replayed trades");
            EXIT_CIRCUIT_BROKEN
        }
        Err(StartupError::Store(e)) => {
            error!("trade store unavailable: {}", e);
            EXIT_CONFIG
        }
    }
}

async fn run_status(config_path: &str) -> i32 {
    let config = match load_config(config_path, None) {
        Ok(config) => config,
        Err(code) => return code,
    };

    let store = match TradeStore::open(&config.data_dir) {
        Ok(store) => store,
        Err(e) => {
            error!("trade store unavailable: {}", e);
            return EXIT_CONFIG;
        }
    };

    println!("\n=== Bot Status ===");
    match store.load_open_position() {
        Some(position) => {
            println!(
                "Open position: {} {} {} @ ${} | SL ${} | TP ${}",
                position.side,
                position.size_base,
                position.instrument,
                position.entry_price,
                position.stop_loss,
                position.take_profit
            );
        }
        None => println!("Open position: none"),
    }

    let metrics = store.metrics();
    println!("Recorded trades: {}", metrics.total_trades);
    println!("Total P&L: ${:.2}", metrics.total_pnl);

    match VenueCredentials::from_env() {
        Ok(credentials) => {
            let client = DydxClient::new(credentials);
            match client.get_account().await {
                Ok(account) => {
                    println!("Equity: ${:.2}", account.equity_usd);
                    println!("Free collateral: ${:.2}", account.free_collateral_usd);
                }
                Err(e) => {
                    error!("failed to query account: {}", e);
                    return EXIT_VENUE;
                }
            }
        }
        Err(_) => {
            println!("Account: no credentials configured (run `setup`)");
        }
    }

    EXIT_OK
}

fn run_setup() -> i32 {
    println!("dYdX v4 testnet credential setup");
    println!("Values are written to .env in the current directory.\n");

    let address = match prompt("Wallet address (dydx1...): ") {
        Some(value) => value,
        None => return EXIT_CONFIG,
    };
    let subaccount = prompt("Subaccount number [0]: ").unwrap_or_default();
    let api_key = match prompt("API key: ") {
        Some(value) => value,
        None => return EXIT_CONFIG,
    };
    let api_secret = match prompt("API secret: ") {
        Some(value) => value,
        None => return EXIT_CONFIG,
    };

    let subaccount = if subaccount.is_empty() {
        "0".to_string()
    } else {
        subaccount
    };

    let contents = format!(
        "DYDX_ADDRESS={}\nDYDX_SUBACCOUNT={}\nDYDX_API_KEY={}\nDYDX_API_SECRET={}\n",
        address, subaccount, api_key, api_secret
    );
    match std::fs::write(".env", contents) {
        Ok(()) => {
            println!("\nCredentials saved to .env");
            EXIT_OK
        }
        Err(e) => {
            error!("failed to write .env: {}", e);
            EXIT_CONFIG
        }
    }
}

fn prompt(label: &str) -> Option<String> {
    print!("{}", label);
    std::io::stdout().flush().ok()?;
    let mut value = String::new();
    std::io::stdin().read_line(&mut value).ok()?;
    let value = value.trim().to_string();
    if value.is_empty() && !label.contains('[') {
        None
    } else {
        Some(value)
    }
}
