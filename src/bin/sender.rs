use std::fs;
use std::path::PathBuf;
use std::process::exit;
use std::sync::Mutex;
use std::time::Duration;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use prodlink::record::{ProductLog, SinkSettings};
use prodlink::sender::{Sender, SenderConfig};
use prodlink::{control, fsutil, wire};

/// Watches input directories and forwards each file to a receiver over TCP,
/// rotating acknowledged files through a bounded sent area.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Destination TCP port
    #[arg(short = 'p', default_value_t = 5001)]
    port: u16,

    /// Destination host; repeat for fallback alternates
    #[arg(short = 'n', default_value = "localhost")]
    hosts: Vec<String>,

    /// Network timeout in seconds (per operation, and per outstanding ack)
    #[arg(short = 't', default_value_t = 30)]
    timeout: u64,

    /// Queue poll interval in seconds
    #[arg(short = 'i', default_value_t = 1)]
    poll_interval: u64,

    /// Queue TTL: plain seconds or a unit-suffixed value such as 90s/5m/2h/1d
    #[arg(short = 'l', value_parser = parse_ttl)]
    queue_ttl: Option<Duration>,

    /// Sliding-window size
    #[arg(short = 'w', default_value_t = 8)]
    window: usize,

    /// Retransmissions allowed per product; -1 is unbounded
    #[arg(short = 'r', default_value_t = -1, allow_negative_numbers = true)]
    max_retry: i32,

    /// I/O buffer size in bytes
    #[arg(short = 'b', value_parser = parse_bufsize, default_value_t = 16 * 1024)]
    bufsize: usize,

    /// Announce the connection under this WMO heading
    #[arg(short = 'c')]
    connect_wmo: Option<String>,

    /// Source identifier carried in the announcement
    #[arg(short = 's')]
    source: Option<String>,

    /// Strip a CCB preamble from transmitted files
    #[arg(short = 'x')]
    strip_ccb: bool,

    /// Input directory; repeat in decreasing priority order
    #[arg(short = 'D', default_value = "data")]
    dirs: Vec<PathBuf>,

    /// Hold the newest file back until a newer one appears
    #[arg(short = 'L')]
    wait_last_file: bool,

    /// Directory rescan interval in seconds (0 rescans only when idle)
    #[arg(short = 'I', default_value_t = 0)]
    refresh_interval: u64,

    /// Stop scanning once this many candidates are queued
    #[arg(short = 'Q', default_value_t = 1024)]
    max_queue_len: usize,

    /// Sent-area rotation size
    #[arg(short = 'N', default_value_t = 100)]
    sent_count: u32,

    /// Sent directory
    #[arg(short = 'S', default_value = "sent")]
    sent_dir: PathBuf,

    /// Fail directory
    #[arg(short = 'F', default_value = "fail")]
    fail_dir: PathBuf,

    /// Stay in the foreground and log to stderr
    #[arg(short = 'd')]
    debug: bool,

    /// Verbosity, 0 (errors only) through 4 (trace)
    #[arg(short = 'v', default_value_t = 2)]
    verbose: u8,

    /// Keep rotated product logs instead of replacing the previous one
    #[arg(short = 'a')]
    archive: bool,

    /// Log directory
    #[arg(short = 'P')]
    log_dir: Option<PathBuf>,
}

fn parse_ttl(s: &str) -> Result<Duration, String> {
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

fn parse_bufsize(s: &str) -> Result<usize, String> {
    let v: usize = s.parse().map_err(|e| format!("{e}"))?;
    let min = wire::HDR_LEN + 1;
    let max = 1024 * 1024;
    if (min..=max).contains(&v) {
        Ok(v)
    } else {
        Err(format!("buffer size must be within [{min}, {max}]"))
    }
}

fn filter_for(verbose: u8) -> &'static str {
    match verbose {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    }
}

fn init_tracing(
    debug: bool,
    verbose: u8,
    sink: &SinkSettings,
    program: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_new(filter_for(verbose))?;
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        fs::create_dir_all(&sink.dir)?;
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(sink.dir.join(format!("{program}.log")))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .init();
    }
    Ok(())
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // clap's exit codes differ from ours; argument faults are 1.
            let _ = e.print();
            exit(1);
        }
    };
    exit(run(args));
}

fn run(args: Args) -> i32 {
    if args.hosts.is_empty() || args.dirs.is_empty() {
        eprintln!("at least one host and one input directory are required");
        return 1;
    }
    if args.sent_count < 1 {
        eprintln!("the sent rotation size must be at least 1");
        return 1;
    }
    if args.wait_last_file && args.sent_count < 2 {
        eprintln!("the sent rotation size must be at least 2 when holding the last file back");
        return 1;
    }
    if args.window < 1 {
        eprintln!("the window must hold at least one product");
        return 1;
    }

    let program = match &args.source {
        Some(source) => format!("sender-{source}"),
        None => "sender".to_owned(),
    };

    let sink = SinkSettings::from_env(args.log_dir.clone(), args.archive);
    if let Err(e) = init_tracing(args.debug, args.verbose, &sink, &program) {
        eprintln!("cannot initialize logging: {e}");
        return 2;
    }

    if let Err(e) = control::install_handlers() {
        error!("cannot install signal handlers: {e}");
        return 2;
    }

    for dir in [&args.sent_dir, &args.fail_dir] {
        if let Err(e) = fs::create_dir_all(dir) {
            error!("cannot create {}: {e}", dir.display());
            return 2;
        }
    }

    let log = if args.debug {
        ProductLog::disabled()
    } else {
        match ProductLog::open(sink, &format!("{program}.product")) {
            Ok(log) => log,
            Err(e) => {
                error!("cannot open the product sink: {e}");
                return 2;
            }
        }
    };

    let pid_file = fsutil::write_pid_file("sender", args.source.as_deref(), args.port);

    let cfg = SenderConfig {
        hosts: args.hosts,
        port: args.port,
        timeout: Duration::from_secs(args.timeout.max(1)),
        poll_interval: Duration::from_secs(args.poll_interval.max(1)),
        queue_ttl: args.queue_ttl,
        window_size: args.window,
        max_retry: args.max_retry,
        bufsize: args.bufsize,
        connect_wmo: args.connect_wmo,
        source: args.source,
        strip_ccb: args.strip_ccb,
        dirs: args.dirs,
        wait_last_file: args.wait_last_file,
        refresh_interval: args.refresh_interval,
        max_queue_len: args.max_queue_len.max(1),
        sent_count: args.sent_count,
        sent_dir: args.sent_dir,
        fail_dir: args.fail_dir,
    };

    let mut engine = Sender::new(cfg, log);
    let status = match engine.run() {
        Ok(()) => {
            if control::shutting_down() {
                4
            } else {
                0
            }
        }
        Err(e) => {
            error!("sender failed: {e}");
            3
        }
    };

    if let Some(path) = pid_file {
        fsutil::remove_pid_file(&path);
    }
    status
}
