//! v4l2-grab binary: list capture devices or dump frames to files.

use std::error::Error as _;
use std::path::PathBuf;
use std::process::ExitCode;
use std::rc::Rc;
use std::time::Duration;

use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use tracing::{info, warn, Level};

use v4l2_grab::query::enumerate_devices;
use v4l2_grab::{
    Backend, CaptureConfig, CaptureDevice, CaptureError, CaptureLoop, CaptureSession, DrmDevice,
    Frame, FrameConsumer, ImageDumper, MemoryBackend, Result, StopSignal, V4L2Device,
};

fn cli() -> Command {
    Command::new(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count)
                .global(true)
                .help("Increase log detail (-v debug, -vv trace)"),
        )
        .subcommand(Command::new("query").about("List capture devices"))
        .subcommand(
            Command::new("capture")
                .about("Stream frames from a device and write each one to a file")
                .arg(
                    Arg::new("device")
                        .short('d')
                        .long("device")
                        .value_name("PATH")
                        .value_parser(value_parser!(PathBuf))
                        .help("V4L2 device node [default: /dev/video0]"),
                )
                .arg(
                    Arg::new("buffers")
                        .short('n')
                        .long("buffers")
                        .value_name("N")
                        .value_parser(value_parser!(u32))
                        .help("Buffers in the ring [default: 3]"),
                )
                .arg(
                    Arg::new("memory")
                        .short('m')
                        .long("memory")
                        .value_parser(["mmap", "dmabuf"])
                        .help("Buffer memory [default: mmap]"),
                )
                .arg(
                    Arg::new("drm-card")
                        .long("drm-card")
                        .value_name("PATH")
                        .value_parser(value_parser!(PathBuf))
                        .help("DRM card for dmabuf memory [default: /dev/dri/card0]"),
                )
                .arg(
                    Arg::new("initial-queue")
                        .long("initial-queue")
                        .value_parser(["skip-first", "all"])
                        .help("Buffers queued on start [default: skip-first]"),
                )
                .arg(
                    Arg::new("timeout")
                        .short('t')
                        .long("timeout")
                        .value_name("MS")
                        .value_parser(value_parser!(u64))
                        .help("Wait per iteration in milliseconds [default: 5000]"),
                )
                .arg(
                    Arg::new("output")
                        .short('o')
                        .long("output")
                        .value_name("DIR")
                        .value_parser(value_parser!(PathBuf))
                        .help("Directory frames are written to [default: .]"),
                )
                .arg(
                    Arg::new("prefix")
                        .long("prefix")
                        .help("File name prefix [default: cap]"),
                )
                .arg(
                    Arg::new("count")
                        .short('c')
                        .long("count")
                        .value_name("FRAMES")
                        .value_parser(value_parser!(u64))
                        .help("Stop after this many frames (default: until Ctrl-C)"),
                ),
        )
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

fn config_from(matches: &ArgMatches) -> Result<CaptureConfig> {
    let mut config = CaptureConfig::default();
    if let Some(device) = matches.get_one::<PathBuf>("device") {
        config.device.clone_from(device);
    }
    if let Some(&count) = matches.get_one::<u32>("buffers") {
        config.buffer_count = count;
    }
    if let Some(memory) = matches.get_one::<String>("memory") {
        config.memory = memory.parse()?;
    }
    if let Some(card) = matches.get_one::<PathBuf>("drm-card") {
        config.drm_card.clone_from(card);
    }
    if let Some(policy) = matches.get_one::<String>("initial-queue") {
        config.initial_queue = policy.parse()?;
    }
    if let Some(&ms) = matches.get_one::<u64>("timeout") {
        config.wait_timeout = Duration::from_millis(ms);
    }
    if let Some(dir) = matches.get_one::<PathBuf>("output") {
        config.output_dir.clone_from(dir);
    }
    if let Some(prefix) = matches.get_one::<String>("prefix") {
        config.prefix.clone_from(prefix);
    }
    config.frame_limit = matches.get_one::<u64>("count").copied();
    config.validate()?;
    Ok(config)
}

fn query() {
    let devices = enumerate_devices();
    if devices.is_empty() {
        println!("No capture devices found");
    }
    for device in devices {
        println!("{device}");
    }
}

fn capture(config: &CaptureConfig) -> Result<()> {
    let stop = StopSignal::new();
    let handler_stop = stop.clone();
    if let Err(err) = ctrlc::set_handler(move || handler_stop.trigger()) {
        warn!(error = %err, "failed to install Ctrl-C handler");
    }

    let backend = match config.memory {
        MemoryBackend::Mmap => Backend::Mapped,
        MemoryBackend::DmaBuf => {
            let drm = DrmDevice::open(&config.drm_card)?;
            info!(card = %drm.path().display(), "exporting buffers from DRM card");
            Backend::Shared(Rc::new(drm))
        }
    };

    let device = V4L2Device::open(&config.device)?;
    let caps = device.capabilities();
    info!(
        path = %config.device.display(),
        card = %caps.card,
        driver = %caps.driver,
        "opened device"
    );

    let mut session =
        CaptureSession::open(device, config.buffer_count, &backend, config.initial_queue)?;
    let mut capture_loop = CaptureLoop::new(config.wait_timeout, stop.clone())?;
    let mut dumper = ImageDumper::new(&config.output_dir, &config.prefix)?;

    let limit = config.frame_limit;
    let mut consumer = |frame: &Frame<'_>| -> Result<()> {
        dumper.on_frame(frame)?;
        if limit.is_some_and(|limit| frame.number + 1 >= limit) {
            stop.trigger();
        }
        Ok(())
    };

    let delivered = capture_loop.run(&mut session, &mut consumer)?;
    info!(delivered, memory = %config.memory, "capture finished");
    Ok(())
}

fn report(err: &CaptureError) {
    eprintln!("Error: {err}");
    let mut source = err.source();
    while let Some(cause) = source {
        eprintln!("  caused by: {cause}");
        source = cause.source();
    }
}

fn main() -> ExitCode {
    let matches = cli().get_matches();
    init_logging(matches.get_count("verbose"));

    let result = match matches.subcommand() {
        Some(("capture", sub)) => config_from(sub).and_then(|config| capture(&config)),
        _ => {
            query();
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report(&err);
            ExitCode::FAILURE
        }
    }
}
