//! End-to-end transport tests over 127.0.0.1

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use lan_audio_relay::audio::{create_shared_buffer, FrameSink, FrameSource, NullSink, SyntheticSource};
use lan_audio_relay::codec::{negotiate, CodecKind, CodecParams, CodecPreference};
use lan_audio_relay::config::{AppConfig, NetworkConfig};
use lan_audio_relay::network::{AudioStreamer, ReceivedPacket, StreamerState};
use lan_audio_relay::AudioSession;

const FRAMES: u32 = 50;

fn network_config() -> NetworkConfig {
    NetworkConfig {
        peer_address: "127.0.0.1".to_string(),
        bind_address: "127.0.0.1".to_string(),
        receive_port: 0,
        recv_timeout_ms: 20,
        ..NetworkConfig::default()
    }
}

fn params() -> CodecParams {
    CodecParams {
        sample_rate: 48000,
        channels: 2,
        frame_size: 960,
        bitrate: 64_000,
    }
}

fn any_local() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

#[test]
fn test_fifty_frames_arrive_in_order_without_loss() {
    let config = network_config();
    let selection = negotiate(params(), CodecPreference::Raw).unwrap();
    assert_eq!(selection.kind, CodecKind::Raw);

    let buffer = create_shared_buffer(10);
    let sequences = Arc::new(Mutex::new(Vec::new()));

    let on_receive = {
        let decoder = Mutex::new(selection.decoder);
        let buffer = buffer.clone();
        let sequences = sequences.clone();
        Arc::new(move |packet: ReceivedPacket| {
            sequences.lock().push(packet.sequence);
            let outcome = decoder.lock().decode_or_silence(&packet.payload);
            assert!(!outcome.is_substitute());
            buffer.push(outcome.into_frame());
        })
    };

    // Listener never sends, so its target is irrelevant
    let listener = AudioStreamer::new(&config, "127.0.0.1:9".parse().unwrap(), any_local(), on_receive);
    listener.start().unwrap();
    let listen_addr = listener.local_addr().unwrap();

    let talker = AudioStreamer::new(&config, listen_addr, any_local(), Arc::new(|_: ReceivedPacket| {}));
    talker.start().unwrap();

    let mut encoder = selection.encoder;
    let frame = vec![1000i16; params().samples_per_frame()];
    for expected in 0..FRAMES {
        let payload = encoder.encode(&frame).unwrap();
        assert_eq!(talker.send(payload), Some(expected));
        thread::sleep(Duration::from_millis(1));
    }

    assert!(wait_until(Duration::from_secs(5), || {
        listener.stats().receiver.packets_received == FRAMES as u64
    }));

    let stats = listener.stats();
    assert_eq!(stats.receiver.packets_received, 50);
    assert_eq!(stats.receiver.packets_lost, 0);
    assert_eq!(stats.receiver.bytes_received, 50 * (12 + 960 * 2 * 2));
    assert_eq!(*sequences.lock(), (0..FRAMES).collect::<Vec<_>>());

    let talker_stats = talker.stats();
    assert_eq!(talker_stats.sender.packets_sent, 50);
    assert_eq!(talker_stats.sender.send_errors, 0);

    // Nothing is pulling, so the buffer holds only the newest frames
    assert_eq!(buffer.len(), buffer.capacity());
    assert_eq!(buffer.capacity(), 20);
    assert_eq!(buffer.stats().overflows, 30);

    talker.stop();
    listener.stop();
}

#[test]
fn test_buffer_stays_bounded_under_steady_playback() {
    let config = network_config();
    let params = params();
    let selection = negotiate(params, CodecPreference::Raw).unwrap();

    let buffer = create_shared_buffer(10);
    let peak = Arc::new(AtomicUsize::new(0));

    let on_receive = {
        let decoder = Mutex::new(selection.decoder);
        let buffer = buffer.clone();
        let peak = peak.clone();
        Arc::new(move |packet: ReceivedPacket| {
            buffer.push(decoder.lock().decode_or_silence(&packet.payload).into_frame());
            peak.fetch_max(buffer.len(), Ordering::SeqCst);
        })
    };

    let listener = AudioStreamer::new(&config, "127.0.0.1:9".parse().unwrap(), any_local(), on_receive);
    listener.start().unwrap();
    let talker = AudioStreamer::new(&config, listener.local_addr().unwrap(), any_local(), Arc::new(|_: ReceivedPacket| {}));
    talker.start().unwrap();

    let mut sink = NullSink::new(params);
    sink.start(buffer.clone()).unwrap();

    let mut encoder = selection.encoder;
    let frame = vec![500i16; params.samples_per_frame()];
    let period = params.frame_duration();
    let mut next = Instant::now();
    for _ in 0..FRAMES {
        talker.send(encoder.encode(&frame).unwrap());
        assert!(buffer.len() <= buffer.capacity());

        next += period;
        if let Some(wait) = next.checked_duration_since(Instant::now()) {
            thread::sleep(wait);
        }
    }

    assert!(wait_until(Duration::from_secs(5), || {
        listener.stats().receiver.packets_received == FRAMES as u64
    }));
    assert!(wait_until(Duration::from_secs(2), || buffer.is_empty()));
    sink.stop();

    let stats = listener.stats();
    assert_eq!(stats.receiver.packets_received, 50);
    assert_eq!(stats.receiver.packets_lost, 0);
    assert!(peak.load(Ordering::SeqCst) <= buffer.capacity());
    assert_eq!(buffer.stats().frames_played, 50 - buffer.stats().overflows);

    talker.stop();
    listener.stop();
}

#[test]
fn test_retarget_while_streaming() {
    let config = network_config();
    let counter = |hits: Arc<Mutex<u32>>| Arc::new(move |_: ReceivedPacket| *hits.lock() += 1);

    let first_hits = Arc::new(Mutex::new(0));
    let second_hits = Arc::new(Mutex::new(0));
    let first = AudioStreamer::new(&config, "127.0.0.1:9".parse().unwrap(), any_local(), counter(first_hits.clone()));
    let second = AudioStreamer::new(&config, "127.0.0.1:9".parse().unwrap(), any_local(), counter(second_hits.clone()));
    first.start().unwrap();
    second.start().unwrap();

    let talker = AudioStreamer::new(&config, first.local_addr().unwrap(), any_local(), Arc::new(|_: ReceivedPacket| {}));
    talker.start().unwrap();

    talker.send(&[0u8; 16]);
    assert!(wait_until(Duration::from_secs(2), || *first_hits.lock() == 1));

    talker.update_target(second.local_addr().unwrap());
    assert_eq!(talker.target(), second.local_addr().unwrap());
    assert_eq!(talker.send(&[0u8; 16]), Some(1));
    assert!(wait_until(Duration::from_secs(2), || *second_hits.lock() == 1));
    assert_eq!(*first_hits.lock(), 1);
    assert_eq!(talker.state(), StreamerState::Streaming);
}

#[test]
fn test_never_started_streamer_stops_cleanly() {
    let streamer = AudioStreamer::new(
        &network_config(),
        "127.0.0.1:9".parse().unwrap(),
        any_local(),
        Arc::new(|_: ReceivedPacket| {}),
    );
    streamer.stop();
    streamer.stop();
    assert_eq!(streamer.state(), StreamerState::Idle);
    assert_eq!(streamer.send(&[1, 2, 3]), None);
}

fn session_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.network = network_config();
    // Placeholder until the other side's port is known
    config.network.send_port = 9;
    config.audio.codec = CodecPreference::Raw;
    config
}

fn synthetic_devices(config: &AppConfig, frequency: f32) -> (Box<dyn FrameSource>, Box<dyn FrameSink>) {
    let params = config.audio.codec_params();
    (
        Box::new(SyntheticSource::sine(params, frequency)),
        Box::new(NullSink::new(params)),
    )
}

#[test]
fn test_two_sessions_exchange_audio() {
    let config_a = session_config();
    let (source, sink) = synthetic_devices(&config_a, 440.0);
    let mut a = AudioSession::start(config_a, source, sink).unwrap();

    let mut config_b = session_config();
    config_b.network.send_port = a.local_addr().unwrap().port();
    let (source, sink) = synthetic_devices(&config_b, 660.0);
    let mut b = AudioSession::start(config_b, source, sink).unwrap();

    a.update_target(b.local_addr().unwrap());

    assert!(wait_until(Duration::from_secs(5), || {
        a.stats().streamer.receiver.packets_received >= 10
            && b.stats().streamer.receiver.packets_received >= 10
    }));

    for stats in [a.stats(), b.stats()] {
        assert_eq!(stats.codec.kind, CodecKind::Raw);
        assert!(stats.codec.frames_encoded > 0);
        assert!(stats.codec.frames_decoded >= 10);
        assert_eq!(stats.codec.decode_fallbacks, 0);
        assert!(stats.playback.queued <= stats.playback.capacity);
    }

    a.stop();
    b.stop();
    assert!(!a.is_running());
    assert_eq!(b.local_addr(), None);
}
