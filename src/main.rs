//! coolctl command-line interface
//!
//! Lists, initializes, monitors and configures supported coolers, fan
//! controllers and RGB devices.

use std::process::ExitCode;

use anyhow::{Context as _, Result, bail};
use clap::{Args as ClapArgs, Parser, Subcommand};
use serde_json::json;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use coolctl::discovery::select_one;
use coolctl::driver::{ConnectGuard, Driver, StatusItem};
use coolctl::transport::{DeviceDescriptor, Timeout};
use coolctl::utils::parsing::{parse_hex_u16, parse_speed};
use coolctl::{ColorRequest, Context, DeviceFilter, DriverError, Registry, Settings, UnsafeFeatures};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Cooler, fan controller and RGB device control tool
#[derive(Parser, Debug)]
#[command(name = "coolctl")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(flatten)]
    filter: FilterArgs,

    /// Comma-separated unsafe features to enable, e.g. smbus,vengeance_rgb
    #[arg(long = "unsafe", env = "COOLCTL_UNSAFE", value_name = "FEATURES")]
    unsafe_features: Option<String>,

    /// Print machine-readable JSON
    #[arg(long)]
    json: bool,

    /// Talk to devices directly even when a kernel driver is bound
    #[arg(long)]
    direct_access: bool,

    /// Per-transfer timeout in milliseconds
    #[arg(long, value_name = "MS")]
    timeout_ms: Option<u64>,

    /// Log discovery and protocol steps
    #[arg(short, long)]
    verbose: bool,

    /// Also log raw reports
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

/// Device selection flags.
#[derive(ClapArgs, Debug)]
struct FilterArgs {
    /// USB vendor id (hex)
    #[arg(long, value_parser = parse_hex_u16)]
    vendor: Option<u16>,

    /// USB product id (hex)
    #[arg(long, value_parser = parse_hex_u16)]
    product: Option<u16>,

    /// Device release number (hex)
    #[arg(long, value_parser = parse_hex_u16)]
    release: Option<u16>,

    /// Serial number
    #[arg(long)]
    serial: Option<String>,

    /// Bus name, e.g. usb1 or i2c-0
    #[arg(long)]
    bus: Option<String>,

    /// Address on the bus
    #[arg(long)]
    address: Option<String>,

    /// Case-insensitive substring of the description
    #[arg(short = 'm', long = "match", value_name = "TEXT")]
    pattern: Option<String>,

    /// Pick the Nth matching device (1-based)
    #[arg(short = 'n', long)]
    pick: Option<usize>,
}

impl FilterArgs {
    fn to_filter(&self) -> DeviceFilter {
        DeviceFilter {
            vendor: self.vendor,
            product: self.product,
            release: self.release,
            serial: self.serial.clone(),
            bus: self.bus.clone(),
            address: self.address.clone(),
            description: self.pattern.clone(),
            pick: self.pick,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List matching devices
    List,

    /// Initialize matching devices
    Initialize,

    /// Show status of matching devices
    Status,

    /// Configure a channel of the selected device
    Set {
        /// Channel name, e.g. fan, pump, ring or led1
        channel: String,

        #[command(subcommand)]
        action: SetAction,
    },
}

#[derive(Subcommand, Debug)]
enum SetAction {
    /// Fixed duty, or temperature/duty pairs for a profile
    Speed {
        #[arg(required = true, num_args = 1..)]
        values: Vec<String>,
    },

    /// Lighting mode and colors
    Color {
        /// Mode name, e.g. fixed, fading or spectrum-wave
        mode: String,

        /// Colors as hex, rgb(), hsv() or hsl()
        colors: Vec<String>,

        /// Animation speed: slowest, slower, normal, faster or fastest
        #[arg(long)]
        speed: Option<String>,

        /// Animation direction: forward or backward
        #[arg(long)]
        direction: Option<String>,
    },
}

// =============================================================================
// Main
// =============================================================================

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose, args.debug);

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            if let Some(hint) = e
                .chain()
                .find_map(|cause| cause.downcast_ref::<DriverError>())
                .and_then(DriverError::remediation)
            {
                eprintln!("Hint: {}", hint);
            }
            ExitCode::FAILURE
        }
    }
}

/// Log to stderr; `COOLCTL_LOG` overrides the level chosen by flags.
fn init_logging(verbose: bool, debug: bool) {
    let default = if debug {
        "coolctl=trace"
    } else if verbose {
        "coolctl=debug"
    } else {
        "coolctl=warn"
    };
    let filter = EnvFilter::try_from_env("COOLCTL_LOG").unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_context(args: &Args) -> Result<Context> {
    let settings = Settings::load().context("Failed to load settings")?;
    let mut ctx = Context::from_settings(&settings)?;

    if let Some(list) = &args.unsafe_features {
        ctx = ctx.with_unsafe_features(UnsafeFeatures::parse(list));
    }
    if args.direct_access {
        ctx = ctx.with_direct_access(true);
    }
    if let Some(ms) = args.timeout_ms {
        ctx = ctx.with_timeout(Timeout::from_millis(ms)?);
    }

    debug!(context = ?ctx, "context ready");
    Ok(ctx)
}

fn run(args: &Args) -> Result<()> {
    let ctx = build_context(args)?;
    let registry = Registry::with_defaults();
    let devices = registry.find(&ctx, &args.filter.to_filter())?;

    match &args.command {
        Command::List => cmd_list(&devices, args.json),
        Command::Initialize => cmd_report(devices, &ctx, args.json, |d, ctx| d.initialize(ctx)),
        Command::Status => cmd_report(devices, &ctx, args.json, |d, ctx| d.get_status(ctx)),
        Command::Set { channel, action } => {
            let mut driver = select_one(devices)?;
            let mut device = ConnectGuard::connect(driver.as_mut(), &ctx)
                .context("Failed to connect")?;
            cmd_set(&mut *device, &ctx, channel, action)
        }
    }
}

// =============================================================================
// Command Implementations
// =============================================================================

fn cmd_list(devices: &[Box<dyn Driver>], json: bool) -> Result<()> {
    if json {
        let list: Vec<_> = devices
            .iter()
            .map(|d| json!({ "driver": d.name(), "device": d.descriptor() }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&list)?);
        return Ok(());
    }

    if devices.is_empty() {
        println!("No supported devices found.");
    }
    for (i, device) in devices.iter().enumerate() {
        let descriptor = device.descriptor();
        println!("Device #{}: {}", i + 1, device.description());
        println!("├── Driver   {}", device.name());
        println!("├── Bus      {}", descriptor.bus);
        println!("├── Address  {}", descriptor.address);
        println!(
            "└── Id       {:04x}:{:04x}",
            descriptor.vendor_id, descriptor.product_id
        );
    }
    Ok(())
}

/// One device's report: description, descriptor and status items.
type Report = (String, DeviceDescriptor, Vec<StatusItem>);

/// Connect to every device and run `op`, collecting failures per device
/// instead of stopping at the first one.
fn collect_reports(
    devices: &mut [Box<dyn Driver>],
    ctx: &Context,
    op: impl Fn(&mut dyn Driver, &Context) -> coolctl::Result<Vec<StatusItem>>,
) -> (Vec<Report>, Vec<(String, anyhow::Error)>) {
    let mut reports = Vec::new();
    let mut failures = Vec::new();

    for driver in devices.iter_mut() {
        let description = driver.description().to_string();
        let descriptor = driver.descriptor().clone();
        let result = ConnectGuard::connect(driver.as_mut(), ctx)
            .context("Failed to connect")
            .and_then(|mut device| Ok(op(&mut *device, ctx)?));

        match result {
            Ok(items) => reports.push((description, descriptor, items)),
            Err(e) => {
                warn!(device = %descriptor.identity(), error = %format!("{:#}", e), "device failed");
                failures.push((description, e));
            }
        }
    }
    (reports, failures)
}

/// Connect to every device, run `op` and print what it returns.
fn cmd_report(
    mut devices: Vec<Box<dyn Driver>>,
    ctx: &Context,
    json: bool,
    op: impl Fn(&mut dyn Driver, &Context) -> coolctl::Result<Vec<StatusItem>>,
) -> Result<()> {
    if devices.is_empty() {
        bail!(DriverError::DeviceNotFound);
    }

    let (reports, failures) = collect_reports(&mut devices, ctx, op);

    if json {
        let list: Vec<_> = reports
            .iter()
            .map(|(description, descriptor, items)| {
                json!({ "description": description, "device": descriptor, "status": items })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&list)?);
    } else {
        for (description, _, items) in &reports {
            print_items(description, items);
        }
    }

    for (description, e) in &failures {
        eprintln!("Error: {}: {:#}", description, e);
    }
    if !failures.is_empty() {
        bail!("{} of {} devices failed", failures.len(), devices.len());
    }
    Ok(())
}

fn print_items(description: &str, items: &[StatusItem]) {
    println!("{}", description);
    let width = items.iter().map(|i| i.key.len()).max().unwrap_or(0);
    for (i, item) in items.iter().enumerate() {
        let branch = if i + 1 == items.len() { "└──" } else { "├──" };
        println!(
            "{} {:<width$}  {:>8}  {}",
            branch,
            item.key,
            item.value.to_string(),
            item.unit,
            width = width
        );
    }
    println!();
}

fn cmd_set(device: &mut dyn Driver, ctx: &Context, channel: &str, action: &SetAction) -> Result<()> {
    match action {
        SetAction::Speed { values } => {
            let setting = parse_speed(values)?;
            device.set_speed(ctx, channel, &setting)?;
            println!("✅ {} {} set to {}", device.description(), channel, setting);
        }
        SetAction::Color {
            mode,
            colors,
            speed,
            direction,
        } => {
            let request =
                ColorRequest::parse(mode, colors, speed.as_deref(), direction.as_deref())?;
            device.set_color(ctx, channel, &request)?;
            println!("✅ {} {} set to {}", device.description(), channel, request.mode);
        }
    }
    Ok(())
}
