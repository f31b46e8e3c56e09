use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::Serialize;
use tracing_subscriber::EnvFilter;
use voxsync_core::{
    EncoderHint, MemorySink, OpusPacketDecoder, RelayEncoder, StreamConfig, StreamEngine,
    TalkEventKind,
};

/// Host frame rate the replay ticks at.
const TICK_HZ: f64 = 60.0;

/// Source PCM handed to the relay encoder per push.
const PUSH_MS: usize = 100;

/// Give up on a replay after this much simulated time past the content.
const REPLAY_SLACK_SECS: f64 = 5.0;

#[derive(Debug)]
struct Args {
    fixtures_dir: PathBuf,
    iterations: usize,
    output: Option<PathBuf>,
    jitter_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
struct CaseResult {
    file: String,
    category: String,
    iteration: usize,
    audio_seconds: f64,
    packets: usize,
    compression_ratio: f64,
    encode_ms_per_packet: f64,
    decode_ms_per_packet: f64,
    time_to_first_audio_ms: Option<f64>,
    sessions: usize,
    rejected_packets: u64,
}

#[derive(Debug, Clone, Serialize)]
struct CategorySummary {
    category: String,
    runs: usize,
    p50_encode_ms: f64,
    p95_encode_ms: f64,
    p50_decode_ms: f64,
    p95_decode_ms: f64,
    p50_first_audio_ms: f64,
    p95_first_audio_ms: f64,
    avg_compression_ratio: f64,
    split_session_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
struct Summary {
    fixtures_dir: String,
    iterations: usize,
    jitter_ms: f64,
    total_runs: usize,
    total_files: usize,
    p50_first_audio_ms: f64,
    p95_first_audio_ms: f64,
    avg_compression_ratio: f64,
    categories: Vec<CategorySummary>,
    cases: Vec<CaseResult>,
}

/// One fixture as interleaved 16-bit little-endian PCM.
struct Fixture {
    name: String,
    category: String,
    pcm: Vec<u8>,
    sample_rate: u32,
    channels: u16,
}

/// Deterministic jitter source so runs are comparable.
struct Lcg(u64);

impl Lcg {
    fn next_unit(&mut self) -> f64 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        (self.0 >> 11) as f64 / (1u64 << 53) as f64
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("voxsync=info")),
        )
        .init();

    if let Err(e) = run() {
        eprintln!("benchmark failed: {e}");
        std::process::exit(1);
    }
}

fn parse_args() -> Result<Args, String> {
    let mut fixtures_dir: Option<PathBuf> = None;
    let mut iterations: usize = 1;
    let mut output: Option<PathBuf> = None;
    let mut jitter_ms: f64 = 40.0;

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--fixtures" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --fixtures".into());
                };
                fixtures_dir = Some(PathBuf::from(v));
            }
            "--iterations" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --iterations".into());
                };
                iterations = v
                    .parse::<usize>()
                    .map_err(|_| "invalid value for --iterations".to_string())?
                    .clamp(1, 10);
            }
            "--output" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --output".into());
                };
                output = Some(PathBuf::from(v));
            }
            "--jitter-ms" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --jitter-ms".into());
                };
                jitter_ms = v
                    .parse::<f64>()
                    .map_err(|_| "invalid value for --jitter-ms".to_string())?
                    .clamp(0.0, 2_000.0);
            }
            "--help" | "-h" => {
                println!(
                    "Usage: cargo run -p voxsync-core --bin benchmark -- \\
  [--fixtures <dir>] [--iterations <n>] [--jitter-ms <ms>] [--output <file.json>]"
                );
                std::process::exit(0);
            }
            other => {
                return Err(format!("unknown argument: {other}"));
            }
        }
    }

    let fixtures_dir = fixtures_dir.unwrap_or_else(|| PathBuf::from("benchmarks/fixtures"));
    Ok(Args {
        fixtures_dir,
        iterations,
        output,
        jitter_ms,
    })
}

fn collect_wavs(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), String> {
    let entries = std::fs::read_dir(dir).map_err(|e| e.to_string())?;
    for entry in entries {
        let entry = entry.map_err(|e| e.to_string())?;
        let path = entry.path();
        if path.is_dir() {
            collect_wavs(&path, out)?;
            continue;
        }
        let is_wav = path
            .extension()
            .and_then(|s| s.to_str())
            .is_some_and(|s| s.eq_ignore_ascii_case("wav"));
        if is_wav {
            out.push(path);
        }
    }
    Ok(())
}

/// Read any hound-supported WAV as i16 PCM, downmixing past two channels.
fn read_wav_pcm16(path: &Path) -> Result<(Vec<i16>, u32, u16), String> {
    let mut reader = hound::WavReader::open(path).map_err(|e| e.to_string())?;
    let spec = reader.spec();

    let interleaved: Vec<i16> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .map(|s| {
                s.map(|v| (v.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16)
                    .map_err(|e| e.to_string())
            })
            .collect::<Result<Vec<_>, _>>()?,
        hound::SampleFormat::Int if spec.bits_per_sample <= 16 => reader
            .samples::<i16>()
            .map(|s| s.map_err(|e| e.to_string()))
            .collect::<Result<Vec<_>, _>>()?,
        hound::SampleFormat::Int => {
            let shift = spec.bits_per_sample.saturating_sub(16);
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| (v >> shift) as i16).map_err(|e| e.to_string()))
                .collect::<Result<Vec<_>, _>>()?
        }
    };

    if spec.channels <= 2 {
        return Ok((interleaved, spec.sample_rate, spec.channels.max(1)));
    }

    let channels = usize::from(spec.channels);
    let mono = interleaved
        .chunks(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|v| i32::from(*v)).sum();
            (sum / channels as i32) as i16
        })
        .collect();
    Ok((mono, spec.sample_rate, 1))
}

fn category_for(path: &Path) -> String {
    let joined = path.to_string_lossy().to_ascii_lowercase();
    if joined.contains("short") {
        "short_utterance".into()
    } else if joined.contains("long") {
        "long_form".into()
    } else if joined.contains("music") {
        "music".into()
    } else {
        "speech".into()
    }
}

/// Three seconds of a gliding tone, used when no fixtures are present.
fn synthetic_fixture() -> Fixture {
    let sample_rate = 24_000u32;
    let pcm = (0..sample_rate as usize * 3)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            let freq = 180.0 + 60.0 * (t * 2.0).sin();
            ((t * freq * std::f32::consts::TAU).sin() * 9_000.0) as i16
        })
        .flat_map(i16::to_le_bytes)
        .collect();
    Fixture {
        name: "synthetic-glide".into(),
        category: "synthetic".into(),
        pcm,
        sample_rate,
        channels: 1,
    }
}

fn load_fixtures(dir: &Path) -> Result<Vec<Fixture>, String> {
    if !dir.exists() {
        println!(
            "fixtures directory not found: {}; using a synthetic fixture",
            dir.display()
        );
        return Ok(vec![synthetic_fixture()]);
    }

    let mut wav_files = Vec::new();
    collect_wavs(dir, &mut wav_files)?;
    wav_files.sort();
    if wav_files.is_empty() {
        return Err(format!("no .wav fixtures found in {}", dir.display()));
    }

    wav_files
        .iter()
        .map(|path| {
            let (samples, sample_rate, channels) =
                read_wav_pcm16(path).map_err(|e| format!("{}: {e}", path.display()))?;
            Ok(Fixture {
                name: path.strip_prefix(dir).unwrap_or(path).display().to_string(),
                category: category_for(path),
                pcm: samples.iter().flat_map(|v| v.to_le_bytes()).collect(),
                sample_rate,
                channels,
            })
        })
        .collect()
}

fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let idx = ((sorted.len() - 1) as f64 * p.clamp(0.0, 1.0)).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Encode, decode, then replay one fixture through a `StreamEngine`.
fn run_case(fixture: &Fixture, iteration: usize, jitter_ms: f64) -> Result<CaseResult, String> {
    let mut relay = RelayEncoder::new(fixture.sample_rate, fixture.channels, EncoderHint::Voice)
        .map_err(|e| e.to_string())?;
    let format = relay.format();

    let push_bytes = fixture.sample_rate as usize * usize::from(fixture.channels) * 2 * PUSH_MS
        / 1_000;
    let started = Instant::now();
    let mut packets = Vec::new();
    for chunk in fixture.pcm.chunks(push_bytes.max(2)) {
        packets.extend(relay.push(chunk));
    }
    packets.extend(relay.flush());
    let encode_ms = started.elapsed().as_secs_f64() * 1000.0;
    if packets.is_empty() {
        return Err(format!("{}: encoder produced no packets", fixture.name));
    }

    let mut decoder = OpusPacketDecoder::new();
    decoder
        .init(format.sample_rate, format.channels)
        .map_err(|e| e.to_string())?;
    let started = Instant::now();
    let mut durations = Vec::with_capacity(packets.len());
    let mut decoded_bytes = 0usize;
    for packet in &packets {
        let pcm = decoder.decode(packet);
        durations.push(voxsync_core::audio::pcm_duration_secs(
            pcm.len(),
            format.sample_rate,
            format.channels,
        ));
        decoded_bytes += pcm.len();
    }
    let decode_ms = started.elapsed().as_secs_f64() * 1000.0;

    let packet_bytes: usize = packets.iter().map(Vec::len).sum();
    let audio_seconds = voxsync_core::audio::pcm_duration_secs(
        decoded_bytes,
        format.sample_rate,
        format.channels,
    );

    // Packets leave the sender in real time and arrive in order, each
    // delayed by up to `jitter_ms`.
    let mut rng = Lcg(0x5eed ^ iteration as u64);
    let mut arrivals = Vec::with_capacity(packets.len());
    let mut sent_at = 0.0f64;
    let mut last_arrival = 0.0f64;
    for duration in &durations {
        let arrival = (sent_at + rng.next_unit() * jitter_ms / 1000.0).max(last_arrival);
        arrivals.push(arrival);
        last_arrival = arrival;
        sent_at += duration;
    }

    let sink = MemorySink::new();
    let mut engine = StreamEngine::new(StreamConfig::default(), Box::new(sink));
    let mut talk = engine.subscribe_talk();
    let mut replay_decoder = OpusPacketDecoder::new();
    replay_decoder
        .init(format.sample_rate, format.channels)
        .map_err(|e| e.to_string())?;

    let dt = 1.0 / TICK_HZ;
    let deadline = last_arrival + audio_seconds + REPLAY_SLACK_SECS;
    let mut clock = 0.0f64;
    let mut next = 0usize;
    let mut first_audio: Option<f64> = None;
    let mut sessions = 0usize;
    while clock < deadline {
        while next < packets.len() && arrivals[next] <= clock {
            engine
                .push_packet(&mut replay_decoder, &packets[next])
                .map_err(|e| e.to_string())?;
            next += 1;
            if next == packets.len() {
                engine.finish_stream();
            }
        }
        engine.tick(dt);
        while let Ok(event) = talk.try_recv() {
            if event.kind == TalkEventKind::Started {
                sessions += 1;
                first_audio.get_or_insert(clock);
            }
        }
        if next == packets.len() && !engine.is_talking() && first_audio.is_some() {
            break;
        }
        clock += dt;
    }

    let packet_count = packets.len() as f64;
    Ok(CaseResult {
        file: fixture.name.clone(),
        category: fixture.category.clone(),
        iteration,
        audio_seconds,
        packets: packets.len(),
        compression_ratio: if packet_bytes == 0 {
            0.0
        } else {
            decoded_bytes as f64 / packet_bytes as f64
        },
        encode_ms_per_packet: encode_ms / packet_count,
        decode_ms_per_packet: decode_ms / packet_count,
        time_to_first_audio_ms: first_audio.map(|s| s * 1000.0),
        sessions,
        rejected_packets: replay_decoder.stats().rejected,
    })
}

fn summarize(category: String, rows: &[CaseResult]) -> CategorySummary {
    let encode = rows.iter().map(|r| r.encode_ms_per_packet).collect::<Vec<_>>();
    let decode = rows.iter().map(|r| r.decode_ms_per_packet).collect::<Vec<_>>();
    let first = rows
        .iter()
        .filter_map(|r| r.time_to_first_audio_ms)
        .collect::<Vec<_>>();
    let ratios = rows.iter().map(|r| r.compression_ratio).collect::<Vec<_>>();
    let split = rows.iter().filter(|r| r.sessions > 1).count();

    CategorySummary {
        category,
        runs: rows.len(),
        p50_encode_ms: percentile(&encode, 0.50),
        p95_encode_ms: percentile(&encode, 0.95),
        p50_decode_ms: percentile(&decode, 0.50),
        p95_decode_ms: percentile(&decode, 0.95),
        p50_first_audio_ms: percentile(&first, 0.50),
        p95_first_audio_ms: percentile(&first, 0.95),
        avg_compression_ratio: mean(&ratios),
        split_session_rate: if rows.is_empty() {
            0.0
        } else {
            split as f64 / rows.len() as f64
        },
    }
}

fn run() -> Result<(), String> {
    let args = parse_args()?;
    let fixtures = load_fixtures(&args.fixtures_dir)?;

    println!(
        "Running voxsync benchmark on {} fixtures (iterations={}, jitter={}ms)",
        fixtures.len(),
        args.iterations,
        args.jitter_ms
    );

    let mut cases = Vec::new();
    for fixture in &fixtures {
        for iteration in 1..=args.iterations {
            let case = run_case(fixture, iteration, args.jitter_ms)?;
            println!(
                "{} [{iteration}/{iters}] {packets} packets, first audio {first}",
                case.file,
                iters = args.iterations,
                packets = case.packets,
                first = case
                    .time_to_first_audio_ms
                    .map_or_else(|| "never".to_string(), |ms| format!("{ms:.0} ms")),
            );
            cases.push(case);
        }
    }

    let mut grouped: BTreeMap<String, Vec<CaseResult>> = BTreeMap::new();
    for row in &cases {
        grouped
            .entry(row.category.clone())
            .or_default()
            .push(row.clone());
    }
    let categories = grouped
        .into_iter()
        .map(|(name, rows)| summarize(name, &rows))
        .collect();

    let first = cases
        .iter()
        .filter_map(|r| r.time_to_first_audio_ms)
        .collect::<Vec<_>>();
    let ratios = cases.iter().map(|r| r.compression_ratio).collect::<Vec<_>>();
    let summary = Summary {
        fixtures_dir: args.fixtures_dir.display().to_string(),
        iterations: args.iterations,
        jitter_ms: args.jitter_ms,
        total_runs: cases.len(),
        total_files: fixtures.len(),
        p50_first_audio_ms: percentile(&first, 0.50),
        p95_first_audio_ms: percentile(&first, 0.95),
        avg_compression_ratio: mean(&ratios),
        categories,
        cases,
    };

    println!(
        "Done. runs={} first-audio p50={:.0}ms p95={:.0}ms compression={:.1}x",
        summary.total_runs,
        summary.p50_first_audio_ms,
        summary.p95_first_audio_ms,
        summary.avg_compression_ratio
    );

    let json = serde_json::to_string_pretty(&summary).map_err(|e| e.to_string())?;
    if let Some(out) = args.output {
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        std::fs::write(&out, json).map_err(|e| e.to_string())?;
        println!("Wrote benchmark report: {}", out.display());
    } else {
        println!("{json}");
    }

    Ok(())
}
