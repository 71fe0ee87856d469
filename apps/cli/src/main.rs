use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;
use std::sync::{mpsc, Arc, Mutex};

use anyhow::Result;
use astra_core::{
    DeviceManager, DeviceStatus, DeviceUpdate, Event, EventObserver, FlashConfig, FlashImage,
    ManagerConfig, ManagerStatus,
};
use clap::{Parser, Subcommand};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "astra-update",
    author,
    version,
    about = "Astra USB boot and update utility",
    long_about = "Boots and flashes Astra SoC development boards over the USB recovery protocol."
)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Log file path (defaults to stderr)
    #[arg(short = 'l', long, global = true)]
    log: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short = 'D', long, global = true)]
    debug: bool,

    /// Keep serving devices after the first one completes
    #[arg(short = 'C', long, global = true)]
    continuous: bool,

    /// Temporary directory
    #[arg(short = 'T', long, global = true)]
    temp_dir: Option<PathBuf>,

    /// Comma-separated USB port prefixes to accept (e.g. "1-2,3-9")
    #[arg(short = 'F', long, global = true, default_value = "")]
    filter_ports: String,

    /// Enable USB debug logging
    #[arg(short = 'u', long, global = true)]
    usb_debug: bool,

    /// Plain progress messages instead of progress bars
    #[arg(short = 'S', long, global = true)]
    simple_progress: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Boot devices with a boot image
    Boot {
        /// Boot image directory
        boot_image: PathBuf,

        /// U-Boot command to run after boot
        #[arg(short = 'o', long, default_value = "")]
        boot_command: String,
    },
    /// Boot devices and flash an update image
    Update {
        /// Flash image path
        #[arg(default_value = "eMMCimg")]
        flash_image: PathBuf,

        /// Boot image collection directory
        #[arg(short = 'B', long, default_value = "astra-usbboot-images")]
        boot_image_collection: PathBuf,

        /// Chip name
        #[arg(short = 'c', long)]
        chip: Option<String>,

        /// Board name
        #[arg(short = 'b', long)]
        board: Option<String>,

        /// Boot image ID
        #[arg(short = 'i', long)]
        boot_image_id: Option<String>,

        /// Image type (emmc or spi)
        #[arg(short = 't', long)]
        image_type: Option<String>,

        /// Secure boot version (gen2 or genx)
        #[arg(short = 's', long)]
        secure_boot: Option<String>,

        /// Memory layout (1gb..4gb)
        #[arg(short = 'm', long)]
        memory_layout: Option<String>,
    },
}

/// Observer that hands events to the main loop over a channel.
struct ChannelObserver {
    tx: Mutex<mpsc::Sender<Event>>,
}

impl EventObserver for ChannelObserver {
    fn on_event(&self, event: &Event) {
        let _ = self.tx.lock().unwrap().send(event.clone());
    }
}

#[derive(Clone)]
struct FileWriter(Arc<Mutex<File>>);

impl std::io::Write for FileWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.lock().unwrap().flush()
    }
}

fn init_tracing(args: &Args) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(if args.debug {
            tracing::Level::DEBUG.into()
        } else {
            tracing::Level::WARN.into()
        })
        .from_env_lossy();

    match &args.log {
        Some(path) => {
            let writer = FileWriter(Arc::new(Mutex::new(File::create(path)?)));
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(move || writer.clone())
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

fn update_progress(
    progress: &MultiProgress,
    bars: &mut HashMap<(String, String), ProgressBar>,
    update: &DeviceUpdate,
) {
    let key = (update.device.clone(), update.image.clone());
    let bar = bars.entry(key).or_insert_with(|| {
        let bar = progress.add(ProgressBar::new(100));
        bar.set_style(
            ProgressStyle::with_template("{prefix}: [{bar:50}] {percent:>3}% {msg}")
                .expect("valid progress template")
                .progress_chars("=> "),
        );
        bar.set_prefix(update.device.clone());
        bar.set_message(update.image.clone());
        bar
    });
    bar.set_position(update.progress.round() as u64);
    if update.progress >= 100.0 {
        bar.finish();
    }
}

fn print_device_status(update: &DeviceUpdate) {
    match update.status {
        DeviceStatus::Added => println!("Detected Device: {}", update.device),
        DeviceStatus::BootStart => println!("Booting Device: {}", update.device),
        DeviceStatus::BootComplete => println!("Booting {} is complete", update.device),
        DeviceStatus::UpdateStart => println!("Updating Device: {}", update.device),
        DeviceStatus::UpdateComplete => println!("Device: {} Update Complete", update.device),
        DeviceStatus::BootFail => {
            println!("Device: {} Boot Failed: {}", update.device, update.message)
        }
        DeviceStatus::UpdateFail => {
            println!("Device: {} Update Failed: {}", update.device, update.message)
        }
        _ => {}
    }
}

fn run(args: Args) -> Result<bool> {
    // libusb writes to stderr and would fight the progress bars.
    let simple_progress = args.simple_progress || args.usb_debug;

    let (tx, rx) = mpsc::channel();
    let observer = Arc::new(ChannelObserver { tx: Mutex::new(tx) });

    let manager = DeviceManager::new(
        ManagerConfig {
            run_continuously: args.continuous,
            filter_ports: args.filter_ports.clone(),
            temp_dir: args.temp_dir.clone(),
            usb_debug: args.usb_debug,
        },
        observer,
    )?;

    match &args.command {
        Command::Boot {
            boot_image,
            boot_command,
        } => {
            println!("Astra Boot\n");
            manager.boot(boot_image, boot_command)?;
        }
        Command::Update {
            flash_image,
            boot_image_collection,
            chip,
            board,
            boot_image_id,
            image_type,
            secure_boot,
            memory_layout,
        } => {
            println!("Astra Update\n");
            let config = FlashConfig {
                image_type: image_type.clone(),
                chip: chip.clone(),
                board: board.clone(),
                boot_image: boot_image_id.clone(),
                secure_boot: secure_boot.clone(),
                memory_layout: memory_layout.clone(),
                ..Default::default()
            };
            let flash = FlashImage::load(flash_image, config)?;

            println!("Update Image: {} {}", flash.chip, flash.board);
            println!("    Image Type: {}", flash.kind);
            println!("    Secure Boot: {}", flash.secure_boot);
            println!("    Memory Layout: {}", flash.memory_layout);
            println!(
                "    Boot Image ID: {}\n",
                flash.boot_image_id.as_deref().unwrap_or("(best match)")
            );

            manager.update(flash, boot_image_collection)?;
        }
    }

    let progress = MultiProgress::new();
    let mut bars = HashMap::new();

    while let Ok(event) = rx.recv() {
        match event {
            Event::Manager(update) => match update.status {
                ManagerStatus::Start | ManagerStatus::Info => println!("{}\n", update.message),
                ManagerStatus::Failure => eprintln!("{}", update.message),
                ManagerStatus::Shutdown => {
                    info!("Manager requested shutdown");
                    break;
                }
            },
            Event::Device(update) => match update.status {
                DeviceStatus::ImageSendStart
                | DeviceStatus::ImageSendProgress
                | DeviceStatus::ImageSendComplete => {
                    if simple_progress {
                        println!(
                            "Device: {} Image: {} Progress: {:.0}",
                            update.device, update.image, update.progress
                        );
                    } else {
                        update_progress(&progress, &mut bars, &update);
                    }
                }
                _ => print_device_status(&update),
            },
        }
    }

    let failure = manager.shutdown();
    if failure {
        eprintln!(
            "Error reported: please check the logs retained in {}",
            manager.temp_dir().display()
        );
    }
    Ok(failure)
}

fn main() {
    let args = Args::parse();

    if let Err(e) = init_tracing(&args) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    match run(args) {
        Ok(false) => {}
        Ok(true) => std::process::exit(1),
        Err(e) => {
            eprintln!("FAILED: {e:#}");
            std::process::exit(1);
        }
    }
}
