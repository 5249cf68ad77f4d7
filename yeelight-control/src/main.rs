use std::cmp::max;
use std::io::{BufRead, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::debug;
use serde_json::Value;

use yeelight_control_lib::config::Settings;
use yeelight_control_lib::control_interface::{
    ControlSession, Effect, Power, Transition, RGB,
};
use yeelight_control_lib::error::ControlError;
use yeelight_control_lib::util::discovery::Device;
use yeelight_control_lib::util::traits::{LogObserver, WireObserver};
use yeelight_control_lib::{discover_devices, open_session, resolve_target};

/// Properties printed when no action is requested.
const ALL_PROPERTIES: [&str; 8] = [
    "power",
    "bright",
    "ct",
    "rgb",
    "hue",
    "sat",
    "color_mode",
    "name",
];

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    handle_cli(cli).await
}

/// This struct defines the command line interface of the application
#[derive(Parser)]
#[clap(
    name = "yeelight_control",
    about = "Discovers and controls Yeelight smart lights on the LAN",
    version
)]
pub struct Cli {
    /// Log wire traffic and discovery details
    #[clap(short, long, global = true)]
    pub verbose: bool,

    /// YAML file with timeouts, ports and scan settings
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Commands,
}

/// Supported output formats for the `discover` command.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum OutputFormat {
    /// Plain text format.
    Plaintext,
    /// JSON format.
    Json,
    /// YAML format.
    Yaml,
}

/// Subcommands available for the CLI
#[derive(Subcommand)]
pub enum Commands {
    /// Lists the lights found on the network
    #[clap(name = "discover")]
    Discover {
        /// Output format (plaintext, json, yaml)
        #[clap(short, long, value_enum, default_value_t = OutputFormat::Plaintext)]
        output: OutputFormat,

        /// Multicast search window in milliseconds
        #[clap(short = 't', long = "timeout")]
        timeout: Option<u64>,
    },
    /// Sends commands to one light
    #[clap(name = "control")]
    Control {
        /// IP address of the light (skips discovery)
        #[clap(long)]
        ip: Option<IpAddr>,

        /// Ensure the light is on
        #[clap(long, conflicts_with = "off")]
        on: bool,

        /// Turn the light off
        #[clap(long)]
        off: bool,

        /// Toggle the power state
        #[clap(long, conflicts_with_all = ["on", "off"])]
        toggle: bool,

        /// Hex color like FF9900 or #FF9900
        #[clap(long)]
        rgb: Option<String>,

        /// Brightness 1..100, out of range values are clamped
        #[clap(long, allow_negative_numbers = true)]
        bright: Option<i64>,

        /// Color temperature in kelvin
        #[clap(long)]
        ct: Option<u32>,

        /// Transition effect
        #[clap(long, value_enum, default_value_t = Effect::Smooth)]
        effect: Effect,

        /// Transition duration in milliseconds
        #[clap(long, value_parser = parse_duration, default_value = "300")]
        duration: Duration,
    },
}

fn parse_duration(s: &str) -> Result<Duration, &'static str> {
    let millis = s
        .parse::<u64>()
        .map_err(|_| "could not parse duration in milliseconds")?;
    Ok(Duration::from_millis(millis))
}

fn load_settings(path: Option<&Path>) -> Result<Settings> {
    match path {
        None => Ok(Settings::default()),
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file {}", path.display()))
        }
    }
}

async fn handle_cli(cli: Cli) -> Result<()> {
    let mut settings = load_settings(cli.config.as_deref())?;
    let observer: Arc<dyn WireObserver> = Arc::new(LogObserver);

    match cli.command {
        Commands::Discover { output, timeout } => {
            if let Some(timeout) = timeout {
                settings.discovery.window = Duration::from_millis(timeout);
            }
            let devices = discover_devices(&settings, observer).await;
            match output {
                OutputFormat::Plaintext => {
                    if devices.is_empty() {
                        println!("No bulbs found.");
                    } else {
                        pretty_print_devices(&devices);
                    }
                }
                OutputFormat::Json => {
                    let json = serde_json::to_string(&devices)?;
                    println!("{}", json);
                }
                OutputFormat::Yaml => {
                    let yaml = serde_yaml::to_string(&devices)?;
                    println!("{}", yaml);
                }
            }
        }
        Commands::Control {
            ip,
            on,
            off,
            toggle,
            rgb,
            bright,
            ct,
            effect,
            duration,
        } => {
            // Validate input before any network traffic.
            let rgb = rgb.as_deref().map(str::parse::<RGB>).transpose()?;

            let device = match resolve_target(ip, &settings, observer.clone()).await {
                Ok(device) => device,
                Err(ControlError::NoDevicesFound) => {
                    return Err(anyhow!("No bulbs found. Use --ip <addr>."));
                }
                Err(ControlError::AmbiguousSelection(devices)) => pick_device(devices)?,
                Err(e) => return Err(e.into()),
            };
            debug!("Controlling {} ({:?})", device, device.source);

            let mut session = open_session(&device, &settings.client, observer)
                .await
                .with_context(|| format!("Failed to connect to {}", device.socket_addr()))?;
            let transition = Transition { effect, duration };
            let result = run_actions(
                &mut session,
                transition,
                Actions {
                    on,
                    off,
                    toggle,
                    rgb,
                    bright,
                    ct,
                },
            )
            .await;
            session.close().await;
            result?;
        }
    }

    Ok(())
}

struct Actions {
    on: bool,
    off: bool,
    toggle: bool,
    rgb: Option<RGB>,
    bright: Option<i64>,
    ct: Option<u32>,
}

async fn run_actions(
    session: &mut ControlSession,
    transition: Transition,
    actions: Actions,
) -> Result<()> {
    if actions.off {
        print_result("set_power", session.set_power(Power::Off, transition, None).await?);
        return Ok(());
    }
    if actions.toggle {
        print_result("toggle", session.toggle().await?);
    }
    if actions.on {
        print_result("set_power", session.set_power(Power::On, transition, None).await?);
    }
    if let Some(bright) = actions.bright {
        print_result("set_bright", session.set_brightness(bright, transition).await?);
    }
    if let Some(ct) = actions.ct {
        print_result(
            "set_ct_abx",
            session.set_color_temperature(ct, transition).await?,
        );
    }
    if let Some(rgb) = actions.rgb {
        print_result("set_rgb", session.set_rgb(rgb, transition).await?);
    }

    if !actions.toggle
        && !actions.on
        && actions.bright.is_none()
        && actions.ct.is_none()
        && actions.rgb.is_none()
    {
        let values = session.query_properties(&ALL_PROPERTIES).await?;
        for (name, value) in ALL_PROPERTIES.iter().zip(values) {
            println!("{:<12}{}", name, value);
        }
    }
    Ok(())
}

fn print_result(method: &str, result: Vec<Value>) {
    println!("{}: {}", method, Value::Array(result));
}

/// Asks the user to choose among several devices.
fn pick_device(mut devices: Vec<Device>) -> Result<Device> {
    println!("Multiple bulbs found:");
    for (i, device) in devices.iter().enumerate() {
        println!("[{}] {}", i + 1, device);
    }

    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("Select number: ");
        std::io::stdout().flush()?;
        let line = lines
            .next()
            .ok_or_else(|| anyhow!("No selection made"))?
            .context("Failed to read selection")?;
        if let Ok(index) = line.trim().parse::<usize>() {
            if (1..=devices.len()).contains(&index) {
                return Ok(devices.swap_remove(index - 1));
            }
        }
    }
}

fn pretty_print_devices(devices: &[Device]) {
    let cell = |value: Option<String>| value.unwrap_or_else(|| "?".to_string());
    let rows: Vec<[String; 6]> = devices
        .iter()
        .map(|d| {
            [
                d.socket_addr().to_string(),
                cell(d.id.clone()),
                cell(d.model.clone()),
                cell(d.power.clone()),
                cell(d.brightness.map(|b| b.to_string())),
                format!("{:?}", d.source).to_lowercase(),
            ]
        })
        .collect();
    let header = ["Address", "Device ID", "Model", "Power", "Brightness", "Source"];

    // Determine the maximum width for each column
    let mut widths = header.map(str::len);
    for row in &rows {
        for (width, value) in widths.iter_mut().zip(row.iter()) {
            *width = max(*width, value.len());
        }
    }

    let print_row = |values: [&str; 6]| {
        let line: Vec<String> = values
            .iter()
            .zip(widths.iter())
            .map(|(value, width)| format!("{:<width$}", value, width = width + 2))
            .collect();
        println!("{}", line.join(" ").trim_end());
    };

    print_row(header);
    print_row(widths.map(|w| "-".repeat(w)).each_ref().map(String::as_str));
    for row in &rows {
        print_row(row.each_ref().map(String::as_str));
    }
}
