use std::thread;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use voxsync_core::{
    EncoderHint, MemorySink, OpusPacketDecoder, RelayEncoder, StreamConfig, StreamEngine,
    TalkEvent, TalkEventKind,
};

const RATE: u32 = 24_000;

fn tone(seconds: f64) -> Vec<u8> {
    let samples = (seconds * f64::from(RATE)) as usize;
    (0..samples)
        .map(|i| {
            let t = i as f32 / RATE as f32;
            ((t * 220.0 * std::f32::consts::TAU).sin() * 8_000.0) as i16
        })
        .flat_map(i16::to_le_bytes)
        .collect()
}

fn encode(seconds: f64) -> Vec<Vec<u8>> {
    let mut relay = RelayEncoder::new(RATE, 1, EncoderHint::Voice).expect("relay encoder");
    let mut packets = Vec::new();
    for chunk in tone(seconds).chunks(RATE as usize / 5) {
        packets.extend(relay.push(chunk));
    }
    packets.extend(relay.flush());
    packets
}

fn next_talk_event(
    engine: &mut StreamEngine,
    rx: &mut broadcast::Receiver<TalkEvent>,
    timeout: Duration,
) -> TalkEvent {
    let start = Instant::now();
    loop {
        engine.tick(1.0 / 60.0);
        match rx.try_recv() {
            Ok(ev) => return ev,
            Err(TryRecvError::Empty) => {
                if start.elapsed() >= timeout {
                    panic!("timed out waiting for talk event");
                }
                thread::sleep(Duration::from_millis(5));
            }
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Closed) => panic!("talk channel closed unexpectedly"),
        }
    }
}

#[test]
fn first_audio_latency_under_500ms() {
    let packets = encode(1.2);
    let mut engine = StreamEngine::new(StreamConfig::default(), Box::new(MemorySink::new()));
    let mut talk_rx = engine.subscribe_talk();
    let feeder = engine.feeder();

    let start = Instant::now();
    let handle = thread::spawn(move || {
        let mut decoder = OpusPacketDecoder::new();
        decoder.init(RATE, 1).expect("decoder init");
        for packet in &packets {
            feeder
                .push_packet(&mut decoder, packet)
                .expect("push packet");
            thread::sleep(Duration::from_millis(2));
        }
        feeder.finish_stream();
    });

    let first = next_talk_event(&mut engine, &mut talk_rx, Duration::from_secs(2));
    let elapsed = start.elapsed();
    handle.join().expect("producer thread panicked");

    assert_eq!(first.kind, TalkEventKind::Started);
    assert!(
        elapsed < Duration::from_millis(500),
        "first audio too late: {:?} (target < 500ms)",
        elapsed
    );
}

#[test]
fn relayed_stream_plays_out_completely() {
    let packets = encode(2.0);
    let sink = MemorySink::new();
    let mut engine = StreamEngine::new(StreamConfig::default(), Box::new(sink.clone()));
    let mut talk_rx = engine.subscribe_talk();
    let mut decoder = OpusPacketDecoder::new();
    decoder.init(RATE, 1).expect("decoder init");

    for packet in &packets {
        engine.push_packet(&mut decoder, packet).expect("push packet");
    }
    engine.finish_stream();

    let stats = decoder.stats();
    assert_eq!(stats.rejected, 0);
    assert_eq!(stats.generation_gaps, 0);

    // Every decoded byte reaches the sink; 2 s of source plus frame padding.
    let queued = sink.queued_bytes();
    assert_eq!(queued % 2, 0);
    let seconds = queued as f64 / f64::from(RATE * 2);
    assert!((2.0..2.1).contains(&seconds), "queued {seconds} s");

    for _ in 0..(3 * 60) {
        engine.tick(1.0 / 60.0);
    }
    let kinds: Vec<TalkEventKind> = std::iter::from_fn(|| talk_rx.try_recv().ok())
        .map(|e| e.kind)
        .collect();
    assert_eq!(kinds, vec![TalkEventKind::Started, TalkEventKind::Finished]);
    assert!(!engine.is_talking());
}
