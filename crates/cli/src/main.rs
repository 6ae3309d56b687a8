use std::io::{self, Read};
use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use relay::{Server, ServerConfig, TrackInfo};
use tracing_subscriber::EnvFilter;

/// Units per second fed from stdin.
const FEED_RATE: u32 = 25;

#[derive(Parser)]
#[command(
    name = "rtsp-relay",
    about = "RTSP server relaying stdin (and optional media files) over RTP"
)]
struct Args {
    /// Bind address (host:port)
    #[arg(long, short, default_value = "0.0.0.0:8554")]
    bind: String,

    /// Mount path for the stdin stream
    #[arg(long, short, default_value = "/stream")]
    mount: String,

    /// Serve .ulaw/.alaw/.l16 files from this directory
    #[arg(long)]
    media_root: Option<PathBuf>,

    /// First server RTP port
    #[arg(long, default_value_t = 5000)]
    port_min: u16,

    /// Last server RTCP port
    #[arg(long, default_value_t = 65534)]
    port_max: u16,

    /// Bytes of stdin per buffer unit
    #[arg(long, default_value_t = 1400)]
    chunk_size: usize,

    /// RTP clock rate of the stdin stream
    #[arg(long, default_value_t = 90000)]
    clock_rate: u32,

    /// RTP payload type of the stdin stream (dynamic 96 if unset)
    #[arg(long)]
    payload_type: Option<u8>,

    /// Encoding name of the stdin stream (e.g. PCMU), fills static payload fields
    #[arg(long)]
    encoding: Option<String>,
}

impl Args {
    fn track_info(&self) -> TrackInfo {
        let mut info = TrackInfo::new("track1").with_clock_rate(self.clock_rate);
        if let Some(pt) = self.payload_type {
            info = info.with_payload_type(pt);
        }
        if let Some(encoding) = &self.encoding {
            info = info.with_encoding(encoding);
        }
        info
    }

    fn config(&self) -> ServerConfig {
        let config = ServerConfig::default()
            .with_bind(&self.bind)
            .with_port_range(self.port_min, self.port_max);
        match &self.media_root {
            Some(root) => config.with_media_root(root),
            None => config,
        }
    }
}

/// Fill `buf` from `reader`, short only at end of input.
fn read_chunk(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    if args.chunk_size == 0 {
        eprintln!("--chunk-size must be positive");
        return ExitCode::FAILURE;
    }

    let mut server = Server::new(args.config());
    let feed = match server.add_live_mount(&args.mount, args.track_info()) {
        Ok(feed) => feed,
        Err(e) => {
            eprintln!("Failed to create mount {}: {}", args.mount, e);
            return ExitCode::FAILURE;
        }
    };
    server.set_default_mount(&args.mount);

    if let Err(e) = server.start() {
        eprintln!("Failed to start server: {}", e);
        return ExitCode::FAILURE;
    }
    tracing::info!(bind = %args.bind, mount = %args.mount, "relaying stdin");

    let step = (args.clock_rate / FEED_RATE).max(1);
    let interval = Duration::from_secs(1) / FEED_RATE;
    let started = Instant::now();
    let mut stdin = io::stdin().lock();
    let mut buf = vec![0u8; args.chunk_size];
    let mut units: u32 = 0;

    loop {
        let n = match read_chunk(&mut stdin, &mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::error!(error = %e, "stdin read failed");
                break;
            }
        };

        // Feed at the rate the timestamps claim.
        let due = started + interval * units;
        if let Some(wait) = due.checked_duration_since(Instant::now()) {
            thread::sleep(wait);
        }

        if !feed.push(buf[..n].to_vec(), units.wrapping_mul(step), true) {
            tracing::warn!("live source gone");
            break;
        }
        units = units.wrapping_add(1);
    }

    tracing::info!(units, "stdin finished");
    feed.finish();

    if let Err(e) = server.stop() {
        tracing::warn!(error = %e, "stop failed");
    }
    ExitCode::SUCCESS
}
