use std::io;
use std::path::PathBuf;

use clap::Parser;
use log::{error, info, LevelFilter};

use antstream::{unbounded, AntError, Context, Request, Session, Settings, UsbDevice};

const SUCCESS: i32 = 0;
const FAILURE: i32 = 1;
const CONFIGURATION: i32 = 2;
const TRANSPORT: i32 = 3;

#[derive(Parser, Debug)]
#[command(
    name = "antstream",
    version,
    about = "Stream ANT+ sensor broadcasts as newline delimited JSON"
)]
struct Cli {
    /// Device configuration file, `-` reads stdin.
    #[arg(value_name = "CONFIG", default_value = "-")]
    config: PathBuf,

    /// USB vendor id of the ANT radio, decimal or 0x prefixed hex.
    #[arg(long, value_parser = parse_id)]
    vendor_id: Option<u16>,

    /// USB product id of the ANT radio, decimal or 0x prefixed hex.
    #[arg(long, value_parser = parse_id)]
    product_id: Option<u16>,

    /// Only emit heart rate records for new beats.
    #[arg(long)]
    new_beats_only: bool,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", env = "LOG_LEVEL", default_value = "info")]
    log_level: LevelFilter,
}

fn parse_id(value: &str) -> Result<u16, String> {
    let parsed = match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|e| format!("invalid USB id `{}`: {}", value, e))
}

fn exit_code(err: &AntError) -> i32 {
    match err {
        AntError::Configuration(_) => CONFIGURATION,
        e if e.is_transport() => TRANSPORT,
        _ => FAILURE,
    }
}

fn run(cli: Cli) -> antstream::Result<()> {
    let mut settings = Settings::load(&cli.config)?;
    if let Some(vendor_id) = cli.vendor_id {
        settings.usb.vendor_id = vendor_id;
    }
    if let Some(product_id) = cli.product_id {
        settings.usb.product_id = product_id;
    }
    settings.new_beats_only |= cli.new_beats_only;

    let (tx, rx) = unbounded();
    ctrlc::set_handler(move || {
        let _ = tx.send(Request::Quit);
    })?;

    let ctx = Context::new()?;
    let device = UsbDevice::open(&ctx, settings.usb.vendor_id, settings.usb.product_id)?;
    let mut session = Session::new(device, &settings, rx, io::stdout())?;
    info!("Streaming {} device(s), Ctrl-C to stop", settings.devices.len());
    session.run()
}

fn main() {
    let cli = Cli::parse();
    env_logger::Builder::new()
        .filter_level(cli.log_level)
        .target(env_logger::Target::Stderr)
        .init();

    match run(cli) {
        Ok(()) => std::process::exit(SUCCESS),
        Err(err) => {
            error!("{}", err);
            std::process::exit(exit_code(&err));
        }
    }
}
