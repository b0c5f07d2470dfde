use anyhow::{bail, Result};
use chrono::{TimeZone, Utc};
use clap::Parser;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use timekeeper::net::{describe_endpoint, NetGuard};
use timekeeper::ntp::NtpClient;
use timekeeper::timer::ElapsedTimer;
use timekeeper::{NtpTimeService, ServerEndpoint, ServiceConfig, TimerScheduler};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// NTP server as host or host:port; repeat for a pool
    #[arg(short, long = "server")]
    servers: Vec<ServerEndpoint>,

    /// JSON service config; CLI flags override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    interval_secs: Option<u64>,

    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Discard replies with a longer round trip; 0 accepts any
    #[arg(long)]
    max_delay_ms: Option<u64>,

    /// Weight of each new sample in the published offset, in (0, 1]
    #[arg(long)]
    smoothing_alpha: Option<f64>,

    /// Query every server once and exit
    #[arg(long, default_value_t = false)]
    once: bool,

    /// Print status as JSON
    #[arg(long, default_value_t = false)]
    json: bool,

    #[arg(long, default_value_t = 10)]
    status_secs: u64,
}

fn format_utc_us(unix_us: i64) -> String {
    let secs = unix_us.div_euclid(1_000_000);
    let nanos = (unix_us.rem_euclid(1_000_000) * 1_000) as u32;
    match Utc.timestamp_opt(secs, nanos) {
        chrono::LocalResult::Single(t) => t.format("%Y-%m-%d %H:%M:%S%.6f UTC").to_string(),
        _ => format!("{}us", unix_us),
    }
}

fn build_config(args: &Args) -> Result<ServiceConfig> {
    let mut config = match &args.config {
        Some(path) => ServiceConfig::from_json_file(path)?,
        None => ServiceConfig::default(),
    };
    if !args.servers.is_empty() {
        config.servers = args.servers.clone();
    }
    if let Some(secs) = args.interval_secs {
        config.poll_interval_ms = secs.saturating_mul(1_000);
    }
    if let Some(ms) = args.timeout_ms {
        config.query_timeout_ms = ms;
    }
    if let Some(ms) = args.max_delay_ms {
        config.max_delay_ms = ms;
    }
    if let Some(alpha) = args.smoothing_alpha {
        config.smoothing_alpha = alpha;
    }
    config.validate()?;
    Ok(config)
}

fn run_once(config: &ServiceConfig, json: bool) -> Result<()> {
    let client = NtpClient::new();
    let mut any_ok = false;
    for server in &config.servers {
        describe_endpoint(&server.host, server.port);
        match client.query(&server.host, server.port, config.query_timeout()) {
            Ok(sample) => {
                any_ok = true;
                if json {
                    let line = serde_json::json!({
                        "server": server.to_string(),
                        "offset_us": sample.offset_us,
                        "delay_us": sample.delay_us,
                        "stratum": sample.stratum,
                        "utc": format_utc_us(client.get_utc_time_us()),
                    });
                    println!("{}", line);
                } else {
                    info!(
                        "{}: offset {}us, delay {}us, stratum {} -> {}",
                        server,
                        sample.offset_us,
                        sample.delay_us,
                        sample.stratum,
                        format_utc_us(client.get_utc_time_us())
                    );
                }
            }
            Err(e) => warn!("{}: {} (code {})", server, e, e.code()),
        }
    }
    if !any_ok {
        bail!("no server answered");
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::builder()
        .format_timestamp(None)
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let args = Args::parse();
    let config = build_config(&args)?;

    let guard = NetGuard::acquire()?;
    info!("Socket subsystem ready (ret_code {})", guard.ret_code());

    if args.once {
        return run_once(&config, args.json);
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    ctrlc::set_handler(move || {
        info!("Ctrl+C received. Shutting down...");
        r.store(false, Ordering::SeqCst);
    })?;

    let scheduler = TimerScheduler::new();
    let service = NtpTimeService::start(config.clone(), &scheduler, NtpClient::new())?;
    scheduler.start()?;

    let status_every = Duration::from_secs(args.status_secs.max(1));
    let stale_after = config.poll_interval() * 3;
    let mut last_log = ElapsedTimer::started();

    while running.load(Ordering::SeqCst) {
        if last_log.has_expired(status_every) {
            if args.json {
                match serde_json::to_string(&service.status()) {
                    Ok(line) => println!("{}", line),
                    Err(e) => error!("Failed to serialize status: {}", e),
                }
            } else {
                let status = service.status();
                info!(
                    "UTC {} | offset {}us delay {}us | server {} | err {} | cycles {}/{} failed",
                    format_utc_us(service.get_utc_time_us()),
                    status.offset_us,
                    status.delay_us,
                    status.server.as_deref().unwrap_or("-"),
                    status.last_error_code,
                    status.failed_cycles,
                    status.cycles
                );
                if service.is_stale(stale_after) {
                    warn!("No successful sync in the last {:?}", stale_after);
                }
            }
            last_log.start();
        }
        thread::sleep(Duration::from_millis(100));
    }

    service.shutdown();
    scheduler.stop();
    info!("Exiting.");
    Ok(())
}
