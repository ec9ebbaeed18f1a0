use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};

use ndib::codec::openh264::{OpenH264Decoder, OpenH264Encoder};
use ndib::protocol::DEFAULT_PORT;
use ndib::source::loopback::{self, LoopbackCapture, LoopbackOutput};
use ndib::source::SourceCapture;
use ndib::{Host, HostConfig, Join, JoinConfig};

#[derive(Parser)]
#[command(name = "ndib", version, about = "Point-to-point NDI bridge over UDP")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List sources visible on the local fabric
    Discover,
    /// Capture a local source and stream it to a peer
    Host {
        /// Destination host:port
        #[arg(long, default_value_t = format!("127.0.0.1:{DEFAULT_PORT}"))]
        target: String,
        /// Override the destination port
        #[arg(long)]
        port: Option<u16>,
        /// Video bitrate in Mbps
        #[arg(long, default_value_t = 10.0)]
        bitrate: f64,
        /// Source to capture (exact or partial name)
        #[arg(long)]
        source: Option<String>,
        /// Skip sources whose name contains this substring (repeatable;
        /// default "Bridge", so a co-located receiver is never captured)
        #[arg(long)]
        exclude: Vec<String>,
        /// Take the first matching source without prompting
        #[arg(long)]
        auto: bool,
    },
    /// Receive a stream and republish it locally
    Join {
        /// UDP port to listen on
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,
        /// Name the output appears under
        #[arg(long, default_value = "NDI Bridge")]
        name: String,
        /// Presentation delay in milliseconds (0 = real time)
        #[arg(long, default_value_t = 0)]
        buffer: u64,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    loopback::initialize();
    let code = match cli.command {
        Command::Discover => run_discover(),
        Command::Host {
            target,
            port,
            bitrate,
            source,
            exclude,
            auto,
        } => run_host(target, port, bitrate, source, exclude, auto),
        Command::Join { port, name, buffer } => run_join(port, name, buffer),
    };
    loopback::shutdown();
    code
}

fn run_discover() -> ExitCode {
    let mut capture = LoopbackCapture::new();
    if let Err(e) = capture.initialize() {
        eprintln!("error: {e}");
        return ExitCode::FAILURE;
    }
    match capture.discover(Duration::from_secs(10)) {
        Ok(sources) if !sources.is_empty() => {
            for (i, source) in sources.iter().enumerate() {
                println!("[{}] {}", i, source.name);
            }
            ExitCode::SUCCESS
        }
        Ok(_) => {
            eprintln!("no sources found");
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run_host(
    target: String,
    port: Option<u16>,
    bitrate: f64,
    source: Option<String>,
    exclude: Vec<String>,
    auto: bool,
) -> ExitCode {
    let target = match port {
        Some(port) => {
            let host = target.rsplit_once(':').map_or(target.as_str(), |(h, _)| h);
            format!("{host}:{port}")
        }
        None => target,
    };
    let exclude = if exclude.is_empty() {
        vec!["Bridge".to_string()]
    } else {
        exclude
    };

    let config = HostConfig {
        target,
        bitrate_bps: (bitrate * 1_000_000.0) as u32,
        source_name: source,
        exclude,
        auto_select: auto,
        ..HostConfig::default()
    };

    let mut host = Host::new(config);
    if let Err(e) = host.start(
        Box::new(LoopbackCapture::new()),
        Box::new(OpenH264Encoder::new()),
    ) {
        eprintln!("error: {e}");
        return ExitCode::FAILURE;
    }

    wait_for_shutdown();
    host.stop();
    ExitCode::SUCCESS
}

fn run_join(port: u16, name: String, buffer: u64) -> ExitCode {
    let config = JoinConfig {
        port,
        output_name: name.clone(),
        buffer: Duration::from_millis(buffer),
    };

    let mut join = Join::new(config);
    if let Err(e) = join.start(
        Box::new(LoopbackOutput::new(&name)),
        Box::new(OpenH264Decoder::new()),
    ) {
        eprintln!("error: {e}");
        return ExitCode::FAILURE;
    }

    wait_for_shutdown();
    join.stop();
    ExitCode::SUCCESS
}

/// Block until SIGINT or SIGTERM.
fn wait_for_shutdown() {
    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    if let Err(e) = ctrlc::set_handler(move || flag.store(false, Ordering::SeqCst)) {
        tracing::warn!(error = %e, "signal handler unavailable");
    }
    while running.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(100));
    }
    eprintln!("shutting down");
}
