//! heartrelay: headless heart-rate relay.
//!
//! Reads heart rate from Pulsoid or a BLE strap and forwards it to Discord
//! Rich Presence and VRChat OSC. Display events go to stdout; commands are
//! read line by line from stdin:
//!
//!   source bluetooth|pulsoid
//!   presence on|off
//!   avatar on|off
//!   status
//!   quit

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use heartrelay::ble::transport::UnavailableCentral;
use heartrelay::ble::SensorCentral;
use heartrelay::cloud::PulsoidSource;
use heartrelay::config::{DEFAULT_CONFIG_FILE, DEFAULT_OSC_ADDRESS};
use heartrelay::journal::{ActivityLog, Journal, DEFAULT_LOG_DIR};
use heartrelay::monitor::DisplayChannel;
use heartrelay::sinks::{DiscordConnector, SystemProbe};
use heartrelay::{Command, DisplayEvent, Relay, RelayContext, RelayDeps, Settings, SourceSelection};

#[derive(Parser)]
#[command(
    name = "heartrelay",
    version,
    about = "Relay heart rate to Discord Rich Presence and VRChat OSC"
)]
struct Cli {
    /// Settings file (created on exit if missing)
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Directory for the daily activity and heart-rate journals
    #[arg(long, default_value = DEFAULT_LOG_DIR)]
    log_dir: PathBuf,

    /// Heart rate source, overriding the settings file (pulsoid, bluetooth)
    #[arg(long)]
    source: Option<SourceSelection>,

    /// Do not write journal files
    #[arg(long)]
    no_journal: bool,

    /// Start with Discord Rich Presence disabled
    #[arg(long)]
    disable_presence: bool,

    /// Start with VRChat OSC disabled
    #[arg(long)]
    disable_avatar: bool,

    /// VRChat OSC address, e.g. 127.0.0.1:9000
    #[arg(long)]
    osc_address: Option<String>,
}

impl Cli {
    fn apply_overrides(&self, settings: &mut Settings) {
        if let Some(source) = self.source {
            settings.hr_source = source;
        }
        if self.disable_presence {
            settings.discord_enabled = false;
        }
        if self.disable_avatar {
            settings.vrchat_enabled = false;
        }
        if let Some(address) = &self.osc_address {
            settings.osc_address = address.clone();
        }
    }
}

/// What a stdin line asks for.
#[derive(Debug, PartialEq)]
enum Input {
    Relay(Command),
    Status,
}

fn parse_input(line: &str) -> Result<Input> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let toggle = |word: &str| match word {
        "on" | "true" | "enable" => Ok(true),
        "off" | "false" | "disable" => Ok(false),
        other => bail!("expected on or off, got '{}'", other),
    };

    let input = match words.as_slice() {
        ["source", name] => Input::Relay(Command::SetSource(name.parse()?)),
        ["presence", state] | ["discord", state] => {
            Input::Relay(Command::SetPresenceEnabled(toggle(*state)?))
        }
        ["avatar", state] | ["vrchat", state] => {
            Input::Relay(Command::SetAvatarEnabled(toggle(*state)?))
        }
        ["status"] => Input::Status,
        ["quit"] | ["exit"] => Input::Relay(Command::Shutdown),
        _ => bail!("unknown command '{}'", line.trim()),
    };
    Ok(input)
}

async fn open_central() -> Arc<dyn SensorCentral> {
    #[cfg(feature = "ble-central")]
    {
        match heartrelay::ble::central::BtleCentral::new().await {
            Ok(central) => return Arc::new(central),
            Err(e) => log::warn!("Bluetooth unavailable: {}", e),
        }
    }
    #[cfg(not(feature = "ble-central"))]
    log::info!("Built without Bluetooth support; the bluetooth source will find no devices");

    Arc::new(UnavailableCentral)
}

/// Prints display events, skipping repeats of the same reading or status.
#[derive(Default)]
struct Console {
    last_rate: Option<String>,
    dots: Option<(bool, bool)>,
}

impl Console {
    fn show(&mut self, event: DisplayEvent) {
        match event {
            DisplayEvent::HeartRate(sample) => {
                let text = match sample {
                    Some(sample) => format!("♥ {}", sample),
                    None => "♥ --- BPM".to_string(),
                };
                if self.last_rate.as_deref() != Some(text.as_str()) {
                    println!("{}", text);
                    self.last_rate = Some(text);
                }
            }
            DisplayEvent::StatusDots { presence, avatar } => {
                if self.dots != Some((presence, avatar)) {
                    let dot = |on: bool| if on { "●" } else { "○" };
                    println!("Discord {}  VRChat {}", dot(presence), dot(avatar));
                    self.dots = Some((presence, avatar));
                }
            }
            DisplayEvent::Activity(message) => {
                println!("[{}] {}", Local::now().format("%H:%M:%S"), message);
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .format_timestamp(None)
        .init();

    let cli = Cli::parse();

    let mut settings = Settings::load(&cli.config);
    cli.apply_overrides(&mut settings);
    settings
        .osc_target()
        .with_context(|| format!("invalid OSC address (default is {})", DEFAULT_OSC_ADDRESS))?;

    let journal = if cli.no_journal {
        None
    } else {
        match Journal::open(&cli.log_dir) {
            Ok(journal) => Some(journal),
            Err(e) => {
                log::warn!("Journal disabled, cannot open {}: {}", cli.log_dir.display(), e);
                None
            }
        }
    };

    let (display, mut events) = DisplayChannel::pair();
    let activity = ActivityLog::new(display, journal);
    let ctx = Arc::new(RelayContext::new(settings, Some(cli.config.clone())));

    let deps = RelayDeps {
        central: open_central().await,
        cloud: Arc::new(PulsoidSource::new().context("failed to build HTTP client")?),
        presence: Arc::new(DiscordConnector),
        probe: Arc::new(SystemProbe::new()),
    };
    let relay = Arc::new(Relay::new(Arc::clone(&ctx), deps, activity.clone())?);

    let printer = tokio::spawn(async move {
        let mut console = Console::default();
        while let Some(event) = events.recv().await {
            console.show(event);
        }
    });

    activity.record(format!(
        "Starting heart rate relay (source: {}).",
        ctx.source()
    ));
    relay.start().await;

    let (input_tx, mut input_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            if input_tx.send(line).is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = input_rx.recv() => {
                let Some(line) = line else {
                    // stdin closed: keep running until Ctrl-C.
                    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
                    break;
                };
                match parse_input(&line) {
                    Ok(Input::Relay(Command::Shutdown)) => break,
                    Ok(Input::Relay(command)) => relay.dispatch(command).await,
                    Ok(Input::Status) => println!(
                        "source: {}  presence: {}  avatar: {}  link: {:?}",
                        ctx.source(),
                        ctx.presence_enabled(),
                        ctx.avatar_enabled(),
                        relay.link_state().await
                    ),
                    Err(e) => eprintln!("{}", e),
                }
            }
        }
    }

    activity.record("Shutting down.");
    relay.shutdown().await;
    if let Err(e) = ctx.save() {
        log::warn!("Failed to save settings to {}: {}", cli.config.display(), e);
    }

    // Let the last activity lines reach stdout.
    drop(activity);
    if tokio::time::timeout(Duration::from_millis(250), printer).await.is_err() {
        log::debug!("display printer still running at exit");
    }
    Ok(())
}
