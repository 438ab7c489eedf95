use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};
use xvf_dfu_core::{
    CachingFetcher, Chunker, DfuConfig, DfuError, DfuUpdater, FileFetcher, FirmwareFetcher,
    FirmwareImage, FirmwareSource, FirmwareVersion, MockBus, TracingObserver, md5_hex,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "XVF3800 DFU firmware tool", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check an image against its declared MD5
    Verify(FirmwareArgs),
    /// Show how an image would be split into DNLOAD frames
    Plan {
        /// Path to the firmware image
        image: PathBuf,
        /// Payload bytes per frame (defaults to the config value)
        #[arg(long)]
        max_xfer: Option<usize>,
        /// Configuration file
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Run a complete update against the emulated device
    Simulate {
        #[command(flatten)]
        firmware: FirmwareArgs,
        /// Version the emulated device runs before the update
        #[arg(long, default_value = "0.0.1")]
        device_version: String,
        /// Fail a frame write: SEQ:TIMES
        #[arg(long)]
        fail_frame: Vec<String>,
        /// Number of erase requests that never complete
        #[arg(long, default_value_t = 0)]
        stall_erases: u32,
        /// Restart the update this many times on transient failures
        #[arg(long, default_value_t = 1)]
        attempts: u32,
        /// Only flash when the device runs a different version
        #[arg(long)]
        if_needed: bool,
    },
    /// Write a configuration file with default values
    InitConfig {
        /// Output path
        #[arg(default_value = "xvf-dfu.toml")]
        output: PathBuf,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args, Debug)]
struct FirmwareArgs {
    /// Configuration file with a [firmware] section
    #[arg(long)]
    config: Option<PathBuf>,
    /// Firmware path or file:// URL
    #[arg(long)]
    image: Option<String>,
    /// Declared version (major.minor.patch)
    #[arg(long = "fw-version")]
    version: Option<String>,
    /// Declared MD5 checksum
    #[arg(long)]
    md5: Option<String>,
    /// Cache fetched images in this directory
    #[arg(long)]
    cache_dir: Option<PathBuf>,
}

impl FirmwareArgs {
    /// Merge command line values over the config file.
    fn resolve(&self) -> Result<(DfuConfig, FirmwareSource)> {
        let config = load_config(self.config.as_deref())?;
        let from_file = config.firmware.clone();

        let url = self
            .image
            .clone()
            .or_else(|| from_file.as_ref().map(|f| f.url.clone()))
            .context("no firmware image given (use --image or a [firmware] section)")?;
        let version = match &self.version {
            Some(v) => v.parse::<FirmwareVersion>()?,
            None => from_file
                .as_ref()
                .map(|f| f.version)
                .context("no firmware version given (use --fw-version)")?,
        };
        let md5 = self
            .md5
            .clone()
            .or_else(|| from_file.as_ref().map(|f| f.md5.clone()))
            .context("no firmware checksum given (use --md5)")?;

        let source = FirmwareSource { url, version, md5 };
        source.validate()?;
        Ok((config, source))
    }

    fn fetcher(&self) -> Box<dyn FirmwareFetcher> {
        match &self.cache_dir {
            Some(dir) => Box::new(CachingFetcher::new(FileFetcher::new(), dir.clone())),
            None => Box::new(FileFetcher::new()),
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<DfuConfig> {
    match path {
        Some(path) => DfuConfig::load_from_file(path)
            .with_context(|| format!("failed to load {}", path.display())),
        None => Ok(DfuConfig::default()),
    }
}

fn parse_fault(fault: &str) -> Result<(u16, u32)> {
    let (seq, times) = fault
        .split_once(':')
        .with_context(|| format!("fault '{fault}' is not SEQ:TIMES"))?;
    Ok((seq.trim().parse()?, times.trim().parse()?))
}

fn verify(args: &FirmwareArgs) -> Result<()> {
    let (_, source) = args.resolve()?;
    let data = args.fetcher().fetch(&source.url)?;
    let image = FirmwareImage::verified(data, source.version, &source.md5)?;
    println!("{}: OK", source.url);
    println!("  version: {}", image.version());
    println!("  bytes:   {}", image.len());
    println!("  md5:     {}", image.md5());
    Ok(())
}

fn plan(image: &Path, max_xfer: Option<usize>, config: Option<&Path>) -> Result<()> {
    let config = load_config(config)?;
    let size = max_xfer.unwrap_or(config.dfu.max_xfer);
    let data = std::fs::read(image).with_context(|| format!("failed to read {}", image.display()))?;
    let total = u32::try_from(data.len()).context("image larger than 4 GiB")?;
    let chunker = Chunker::new(total, size)?;

    println!("{}", image.display());
    println!("  bytes:       {}", total);
    println!("  md5:         {}", md5_hex(&data));
    println!("  frame size:  {}", chunker.chunk_size());
    println!("  data frames: {}", chunker.count());
    println!("  last frame:  {} bytes", chunker.last_len());
    if config.dfu.update_led {
        println!(
            "  requests:    {} (erase + LED + data + end + reboot)",
            chunker.count() + 4
        );
    } else {
        println!("  requests:    {} (erase + data + end + reboot)", chunker.count() + 3);
    }
    Ok(())
}

fn simulate(
    firmware: &FirmwareArgs,
    device_version: &str,
    faults: &[String],
    stall_erases: u32,
    attempts: u32,
    if_needed: bool,
) -> Result<()> {
    let (config, source) = firmware.resolve()?;
    let device_version: FirmwareVersion = device_version.parse()?;

    let mut bus = MockBus::new(device_version);
    bus.set_pending_version(source.version);
    bus.stall_erases(stall_erases);
    for fault in faults {
        let (seq, times) = parse_fault(fault)?;
        bus.fail_frame(seq, times);
    }
    let device = bus.clone();

    let mut updater = DfuUpdater::new(&mut bus, config);
    updater.subscribe(Arc::new(TracingObserver));
    updater.on_progress(|p| eprint!("\rProgress: {:5.1}%", p * 100.0));
    updater.on_end(|| eprintln!());
    updater.on_error(|code| eprintln!("\nUpdate failed: {code}"));

    let fetcher = firmware.fetcher();
    updater.load_firmware(&source, fetcher.as_ref())?;

    if if_needed {
        let check = updater.check_version()?;
        if !check.needs_update {
            println!("Device already runs {}", check.device);
            return Ok(());
        }
    }

    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        match updater.flash() {
            Ok(()) => {
                info!(attempt, "Update finished");
                println!(
                    "Device updated to {} ({} bytes received)",
                    device.version(),
                    device.received().len()
                );
                return Ok(());
            }
            Err(e) if e.is_retriable() && attempt < attempts => {
                warn!(attempt, error = %e, "Transient failure, restarting update");
            }
            Err(e) => return Err(e.into()),
        }
    }
    bail!("update did not complete")
}

fn init_config(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        bail!("{} exists (use --force to overwrite)", output.display());
    }
    DfuConfig::default().save_to_file(output)?;
    println!("Wrote {}", output.display());
    Ok(())
}

fn run(cli: &Cli) -> Result<()> {
    match &cli.command {
        Commands::Verify(args) => verify(args),
        Commands::Plan {
            image,
            max_xfer,
            config,
        } => plan(image, *max_xfer, config.as_deref()),
        Commands::Simulate {
            firmware,
            device_version,
            fail_frame,
            stall_erases,
            attempts,
            if_needed,
        } => simulate(
            firmware,
            device_version,
            fail_frame,
            *stall_erases,
            *attempts,
            *if_needed,
        ),
        Commands::InitConfig { output, force } => init_config(output, *force),
    }
}

fn main() {
    let cli = Cli::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if cli.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(&cli) {
        error!("Error: {:#}", e);
        let code = e
            .downcast_ref::<DfuError>()
            .map_or(1, |dfu| i32::from(dfu.code().as_u8()));
        std::process::exit(code);
    }
}
