use std::fs;
use std::path::PathBuf;
use std::process::exit;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use prodlink::dispatch::Dispatcher;
use prodlink::record::SinkSettings;
use prodlink::recv::{DefaultHooks, ReceiverConfig};
use prodlink::{control, fsutil, wire};

/// Listens for sender connections and reconstructs each transferred file
/// under the output directory, acknowledging every product.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Listen TCP port
    #[arg(short = 'p', default_value_t = 5001)]
    port: u16,

    /// Worker cap; 0 services each connection inline
    #[arg(short = 'w', default_value_t = 4)]
    max_worker: usize,

    /// Network timeout in seconds
    #[arg(short = 't', default_value_t = 60)]
    timeout: u64,

    /// I/O buffer size in bytes
    #[arg(short = 'b', value_parser = parse_bufsize, default_value_t = 16 * 1024)]
    bufsize: usize,

    /// Suffix distinguishing this instance's logs and pid file
    #[arg(short = 's')]
    source: Option<String>,

    /// Output directory
    #[arg(short = 'D', default_value = "incoming")]
    outdir: PathBuf,

    /// Overwrite colliding output files instead of waiting them out
    #[arg(short = 'O')]
    overwrite: bool,

    /// Toggle received files readable once fully written
    #[arg(short = 'P')]
    toggle_perms: bool,

    /// Require the first product to announce this WMO heading
    #[arg(short = 'c')]
    connect_wmo: Option<String>,

    /// Log directory
    #[arg(short = 'l')]
    log_dir: Option<PathBuf>,

    /// Verbosity, 0 (errors only) through 4 (trace)
    #[arg(short = 'v', default_value_t = 2)]
    verbose: u8,

    /// Keep rotated product logs instead of replacing the previous one
    #[arg(short = 'a')]
    archive: bool,

    /// Stay in the foreground and log to stderr
    #[arg(short = 'd')]
    debug: bool,
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
            let _ = e.print();
            exit(1);
        }
    };
    exit(run(args));
}

fn run(args: Args) -> i32 {
    let program = match &args.source {
        Some(source) => format!("receiver-{source}"),
        None => "receiver".to_owned(),
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

    if let Err(e) = fs::create_dir_all(&args.outdir) {
        error!("cannot create {}: {e}", args.outdir.display());
        return 2;
    }

    let pid_file = fsutil::write_pid_file("receiver", args.source.as_deref(), args.port);

    let cfg = ReceiverConfig {
        port: args.port,
        max_worker: args.max_worker,
        timeout: Duration::from_secs(args.timeout.max(1)),
        bufsize: args.bufsize,
        source_suffix: args.source,
        outdir: args.outdir,
        overwrite: args.overwrite,
        toggle_perms: args.toggle_perms,
        connect_wmo: args.connect_wmo,
    };

    let worker_sink = if args.debug { None } else { Some(sink) };
    let mut dispatcher = Dispatcher::new(cfg, Arc::new(DefaultHooks), worker_sink);

    if let Err(e) = dispatcher.bind() {
        error!("cannot bind port {}: {e}", args.port);
        return 2;
    }

    let mut status = 0;
    if let Err(e) = dispatcher.run() {
        error!("receiver failed: {e}");
        status |= 3;
    }
    if dispatcher.saw_error() {
        status |= 3;
    }
    if control::shutting_down() {
        status |= 4;
    }

    if let Some(path) = pid_file {
        fsutil::remove_pid_file(&path);
    }
    status
}
