//! Command-line peer
//!
//! Runs one side of a bidirectional relay: captures local audio and sends it
//! to `--peer`, plays whatever the peer sends back. Run the same binary on
//! the other machine with the ports swapped.
//!
//! ```text
//! peer --peer 192.168.1.20 --send-port 5001 --receive-port 5002
//! peer --peer 192.168.1.10 --send-port 5002 --receive-port 5001
//! ```

use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lan_audio_relay::{
    audio::{list_sinks, list_sources, open_sink, open_source, DeviceInfo, FrameSource, SyntheticSource},
    codec::CodecPreference,
    config::AppConfig,
    AudioSession,
};

/// Interval between statistics reports
const STATS_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let matches = cli().get_matches();

    if matches.get_flag("list-devices") {
        print_devices();
        return Ok(());
    }

    tracing::info!("═══════════════════════════════════════════════════════════════");
    tracing::info!("              LAN Audio Relay - Bidirectional Peer             ");
    tracing::info!("═══════════════════════════════════════════════════════════════");

    let config_path = matches
        .get_one::<PathBuf>("config")
        .cloned()
        .or_else(AppConfig::default_path);

    let mut config = match &config_path {
        Some(path) => {
            tracing::info!("Config file: {}", path.display());
            AppConfig::load_or_default(path)
        }
        None => AppConfig::default(),
    };
    apply_overrides(&mut config, &matches);

    let source: Box<dyn FrameSource> = match matches.get_one::<f32>("tone") {
        Some(&frequency) => {
            tracing::info!("Sending a {} Hz test tone", frequency);
            Box::new(SyntheticSource::sine(config.audio.codec_params(), frequency))
        }
        None => open_source(&config.audio).device,
    };
    let sink = open_sink(&config.audio);
    if let Some(reason) = &sink.fallback_reason {
        tracing::warn!("Playback disabled: {}", reason);
    }

    let mut session = AudioSession::start(config, source, sink.device)
        .context("failed to start audio session")?;

    if let Some(reason) = session.codec_fallback() {
        tracing::warn!("Codec fallback to {}: {}", session.codec_kind(), reason);
    }

    // Only persist a configuration that actually worked
    if let Some(path) = &config_path {
        if let Err(e) = session.config().save(path) {
            tracing::warn!("Failed to save config to {}: {}", path.display(), e);
        }
    }

    tracing::info!("Capture:  {}", session.source_name());
    tracing::info!("Playback: {}", session.sink_name());
    if let Some(addr) = session.local_addr() {
        tracing::info!("Receiving on {}", addr);
    }

    let running = Arc::new(AtomicBool::new(true));
    ctrlc_handler(running.clone())?;

    tracing::info!("Streaming - press Ctrl+C to stop");

    let json_stats = matches.get_flag("json-stats");
    let mut last_stats_time = Instant::now();

    while running.load(Ordering::Relaxed) {
        tokio::time::sleep(Duration::from_millis(100)).await;

        for e in session.poll_device_errors() {
            tracing::warn!("Device error: {}", e);
        }

        if last_stats_time.elapsed() >= STATS_INTERVAL {
            last_stats_time = Instant::now();
            print_stats(&session, json_stats);
        }
    }

    tracing::info!("Shutting down...");
    session.stop();
    print_stats(&session, json_stats);

    Ok(())
}

fn cli() -> Command {
    Command::new("peer")
        .version(env!("CARGO_PKG_VERSION"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file (default: per-user config directory)")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("peer")
                .short('p')
                .long("peer")
                .value_name("ADDRESS")
                .help("Remote peer address"),
        )
        .arg(
            Arg::new("send-port")
                .long("send-port")
                .value_name("PORT")
                .help("Port the peer receives our audio on")
                .value_parser(value_parser!(u16).range(1..)),
        )
        .arg(
            Arg::new("receive-port")
                .long("receive-port")
                .value_name("PORT")
                .help("Local port to receive audio on")
                .value_parser(value_parser!(u16)),
        )
        .arg(
            Arg::new("input")
                .long("input")
                .value_name("DEVICE")
                .help("Capture device id or name"),
        )
        .arg(
            Arg::new("output")
                .long("output")
                .value_name("DEVICE")
                .help("Playback device id or name"),
        )
        .arg(
            Arg::new("codec")
                .long("codec")
                .value_name("CODEC")
                .help("Preferred codec")
                .value_parser(["opus", "raw"]),
        )
        .arg(
            Arg::new("volume")
                .long("volume")
                .value_name("0.0-1.0")
                .help("Playback volume")
                .value_parser(value_parser!(f32)),
        )
        .arg(
            Arg::new("tone")
                .long("tone")
                .value_name("HZ")
                .help("Send a sine test tone instead of capturing")
                .value_parser(value_parser!(f32)),
        )
        .arg(
            Arg::new("json-stats")
                .long("json-stats")
                .help("Log statistics as JSON")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("list-devices")
                .short('l')
                .long("list-devices")
                .help("List audio devices and exit")
                .action(ArgAction::SetTrue),
        )
}

fn apply_overrides(config: &mut AppConfig, matches: &ArgMatches) {
    if let Some(peer) = matches.get_one::<String>("peer") {
        config.network.peer_address = peer.clone();
    }
    if let Some(&port) = matches.get_one::<u16>("send-port") {
        config.network.send_port = port;
    }
    if let Some(&port) = matches.get_one::<u16>("receive-port") {
        config.network.receive_port = port;
    }
    if let Some(input) = matches.get_one::<String>("input") {
        config.audio.input_device = Some(input.clone());
    }
    if let Some(output) = matches.get_one::<String>("output") {
        config.audio.output_device = Some(output.clone());
    }
    if let Some(codec) = matches.get_one::<String>("codec") {
        config.audio.codec = match codec.as_str() {
            "raw" => CodecPreference::Raw,
            _ => CodecPreference::Opus,
        };
    }
    if let Some(&volume) = matches.get_one::<f32>("volume") {
        config.audio.volume = volume.clamp(0.0, 1.0);
    }
}

fn print_device_list(title: &str, devices: &[DeviceInfo]) {
    println!("{}:", title);
    if devices.is_empty() {
        println!("  (none)");
    }
    for device in devices {
        let default_marker = if device.is_default { " [default]" } else { "" };
        let kind = device
            .kind
            .map(|k| format!(" ({:?})", k).to_lowercase())
            .unwrap_or_default();
        println!("  {}{}{}", device.id, kind, default_marker);
    }
}

fn print_devices() {
    println!();
    print_device_list("Capture sources", &list_sources());
    println!();
    print_device_list("Playback devices", &list_sinks());
    println!();
}

fn print_stats(session: &AudioSession, json: bool) {
    let stats = session.stats();

    if json {
        match serde_json::to_string(&stats) {
            Ok(line) => tracing::info!("{}", line),
            Err(e) => tracing::warn!("Failed to serialize stats: {}", e),
        }
        return;
    }

    let sender = &stats.streamer.sender;
    let receiver = &stats.streamer.receiver;
    tracing::info!(
        "Sent {} packets ({} KB), received {} ({} KB), lost {}, buffer {}/{}, underruns {}, overflows {}",
        sender.packets_sent,
        sender.bytes_sent / 1024,
        receiver.packets_received,
        receiver.bytes_received / 1024,
        receiver.packets_lost,
        stats.playback.queued,
        stats.playback.capacity,
        stats.playback.underruns,
        stats.playback.overflows,
    );
}

fn ctrlc_handler(running: Arc<AtomicBool>) -> Result<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .context("failed to install Ctrl+C handler")
}
