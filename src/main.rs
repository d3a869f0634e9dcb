use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{Level, info};

use waav_audio_graph::config::MixerConfig;
use waav_audio_graph::graph::BufferPool;
use waav_audio_graph::{
    AsyncAudioReadBuffer, AsyncAudioWriteBuffer, AudioConcatenator, AudioGraph, AudioMetrics,
    AudioSampleFormat, AudioSplitter, BucketAudioSampleTarget, ChannelToken, FixedAudioSampleSource,
    LinearMixer, NodeOptions, NullAudioSampleTarget, PushPullBuffer, ReadOutcome, StreamingConfig,
    connect,
};

const SAMPLE_RATE_HZ: u32 = 16000;
const CHUNK_FRAMES: usize = 320;
const IDLE_POLL: Duration = Duration::from_millis(2);
const MAX_IDLE_POLLS: usize = 5000;

/// WaaV Audio Graph - streaming buffer and fan component demos
#[derive(Parser, Debug)]
#[command(name = "waav-audio-graph")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Maximum log level
    #[arg(short = 'l', long = "log-level", default_value = "info")]
    log_level: Level,

    /// Length of each synthetic input (ms)
    #[arg(long = "duration-ms", default_value_t = 500)]
    duration_ms: u64,

    /// Demo to run; all of them when omitted
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Commands {
    /// Relay a tone across two graphs through the async read, write and push-pull buffers
    Relay,
    /// Mix two tones into one stream
    Mix,
    /// Split one tone to two targets
    Split,
    /// Play two tones back to back
    Concat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if it exists (must be done before config loading)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    tracing_subscriber::fmt().with_max_level(cli.log_level).init();

    let config = match &cli.config {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            StreamingConfig::from_file(path).map_err(|e| anyhow!(e.to_string()))?
        }
        None => StreamingConfig::from_env().map_err(|e| anyhow!(e.to_string()))?,
    };

    let demos = match cli.command {
        Some(command) => vec![command],
        None => vec![Commands::Relay, Commands::Mix, Commands::Split, Commands::Concat],
    };
    let input_frames = (SAMPLE_RATE_HZ as u64 * cli.duration_ms / 1000) as usize;

    let mut results = serde_json::Map::new();
    for demo in demos {
        let (name, result) = match demo {
            Commands::Relay => ("relay", relay(&config, input_frames).await?),
            Commands::Mix => ("mix", mix(&config, input_frames).await?),
            Commands::Split => ("split", split(input_frames).await?),
            Commands::Concat => ("concat", concat(&config, input_frames).await?),
        };
        info!(demo = name, "Demo finished");
        results.insert(name.to_string(), result);
    }

    let report = json!({
        "demos": results,
        "metrics": AudioMetrics::global().snapshot(),
        "buffer_pool": BufferPool::global().stats(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn mono() -> anyhow::Result<AudioSampleFormat> {
    AudioSampleFormat::mono(SAMPLE_RATE_HZ).map_err(|e| anyhow!(e.to_string()))
}

fn tone(frequency_hz: f32, frames: usize, amplitude: f32) -> Vec<f32> {
    let step = std::f32::consts::TAU * frequency_hz / SAMPLE_RATE_HZ as f32;
    (0..frames)
        .map(|i| amplitude * (step * i as f32).sin())
        .collect()
}

/// Pull `bucket` until its source finishes, `limit` frames arrived or it stays idle too long
async fn pull_until_finished(
    bucket: &BucketAudioSampleTarget,
    limit: usize,
    cancel: &CancellationToken,
) -> anyhow::Result<bool> {
    let mut idle_polls = 0;
    while bucket.frames() < limit {
        match bucket.read_from_input(CHUNK_FRAMES, cancel).await? {
            ReadOutcome::Finished => return Ok(true),
            ReadOutcome::Samples(0) => {
                idle_polls += 1;
                if idle_polls > MAX_IDLE_POLLS {
                    anyhow::bail!("no audio arrived after {} polls", MAX_IDLE_POLLS);
                }
                tokio::time::sleep(IDLE_POLL).await;
            }
            ReadOutcome::Samples(_) => idle_polls = 0,
        }
    }
    Ok(false)
}

async fn relay(config: &StreamingConfig, frames: usize) -> anyhow::Result<serde_json::Value> {
    let format = mono()?;
    let cancel = CancellationToken::new();
    let producer = AudioGraph::new("producer");
    let consumer = AudioGraph::new("consumer");

    // Pull across graphs
    let source = FixedAudioSampleSource::new(
        producer.clone(),
        format,
        tone(440.0, frames, 0.5),
        NodeOptions::named("tone"),
    )?;
    let read_buffer = AsyncAudioReadBuffer::new(
        producer.clone(),
        consumer.clone(),
        format,
        &config.read_buffer,
        NodeOptions::named("prefetch"),
    )?;
    let pulled = BucketAudioSampleTarget::new(consumer.clone(), format, NodeOptions::named("pulled"));
    connect(source.clone(), read_buffer.clone()).await?;
    connect(read_buffer.clone(), pulled.clone()).await?;
    let pull_finished = pull_until_finished(&pulled, usize::MAX, &cancel).await?;

    // Push across graphs
    let source = FixedAudioSampleSource::new(
        producer.clone(),
        format,
        tone(440.0, frames, 0.5),
        NodeOptions::named("tone"),
    )?;
    let write_buffer = AsyncAudioWriteBuffer::new(
        producer.clone(),
        consumer.clone(),
        format,
        &config.write_buffer,
        NodeOptions::named("decoupler"),
    )?;
    let pushed = BucketAudioSampleTarget::new(consumer.clone(), format, NodeOptions::named("pushed"));
    connect(source.clone(), write_buffer.clone()).await?;
    connect(write_buffer.clone(), pushed.clone()).await?;
    source.write_all_to_output(CHUNK_FRAMES, &cancel).await?;

    // Push in, pull out
    let source = FixedAudioSampleSource::new(
        producer.clone(),
        format,
        tone(440.0, frames, 0.5),
        NodeOptions::named("tone"),
    )?;
    let relay = PushPullBuffer::new(
        producer.clone(),
        consumer.clone(),
        format,
        &config.push_pull,
        NodeOptions::named("relay"),
    )?;
    let relayed = BucketAudioSampleTarget::new(consumer.clone(), format, NodeOptions::named("relayed"));
    connect(source.clone(), relay.clone()).await?;
    connect(relay.clone(), relayed.clone()).await?;
    source.write_all_to_output(CHUNK_FRAMES, &cancel).await?;
    let relay_finished = pull_until_finished(&relayed, usize::MAX, &cancel).await?;

    Ok(json!({
        "input_frames": frames,
        "read_buffer": { "frames": pulled.frames(), "finished": pull_finished },
        "write_buffer": {
            "frames": pushed.frames(),
            "dropped": frames.saturating_sub(pushed.frames()),
        },
        "push_pull": { "frames": relayed.frames(), "finished": relay_finished },
        "graphs": { "producer": producer.stats(), "consumer": consumer.stats() },
    }))
}

async fn mix(config: &StreamingConfig, frames: usize) -> anyhow::Result<serde_json::Value> {
    let format = mono()?;
    let cancel = CancellationToken::new();
    let graph = AudioGraph::new("mix");

    let mixer_config = MixerConfig {
        read_forever: false,
        ..config.mixer.clone()
    };
    let mixer = LinearMixer::new(graph.clone(), format, &mixer_config, NodeOptions::named("mixer"))?;
    let mut events = mixer.subscribe();

    for (token, frequency, length) in [("low", 220.0, frames), ("high", 880.0, frames / 2)] {
        let source = FixedAudioSampleSource::new(
            graph.clone(),
            format,
            tone(frequency, length, 0.25),
            NodeOptions::named(token),
        )?;
        mixer
            .add_input(source, Some(ChannelToken::from(token)), true)
            .await?;
    }

    let bucket = BucketAudioSampleTarget::new(graph.clone(), format, NodeOptions::named("mixed"));
    connect(mixer.clone(), bucket.clone()).await?;
    let finished = pull_until_finished(&bucket, usize::MAX, &cancel).await?;

    let mut completed = Vec::new();
    while let Ok(event) = events.try_recv() {
        completed.push(event.token.to_string());
    }

    Ok(json!({
        "frames": bucket.frames(),
        "finished": finished,
        "completed_inputs": completed,
        "graph": graph.stats(),
    }))
}

async fn split(frames: usize) -> anyhow::Result<serde_json::Value> {
    let format = mono()?;
    let cancel = CancellationToken::new();
    let graph = AudioGraph::new("split");

    let source = FixedAudioSampleSource::new(
        graph.clone(),
        format,
        tone(440.0, frames, 0.5),
        NodeOptions::named("tone"),
    )?;
    let splitter = AudioSplitter::new(graph.clone(), format, NodeOptions::named("splitter"));
    connect(source.clone(), splitter.clone()).await?;

    let puller = BucketAudioSampleTarget::new(graph.clone(), format, NodeOptions::named("puller"));
    let copy = BucketAudioSampleTarget::new(graph.clone(), format, NodeOptions::named("copy"));
    splitter.add_output(puller.clone()).await?;
    splitter.add_output(copy.clone()).await?;
    let discard = NullAudioSampleTarget::new(graph.clone(), format, NodeOptions::named("discard"));
    splitter.add_output(discard.clone()).await?;

    let finished = pull_until_finished(&puller, usize::MAX, &cancel).await?;
    let identical = puller.samples() == copy.samples();

    Ok(json!({
        "outputs": splitter.output_count(),
        "puller_frames": puller.frames(),
        "copy_frames": copy.frames(),
        "discarded_frames": discard.frames_discarded(),
        "identical": identical,
        "finished": finished,
    }))
}

async fn concat(config: &StreamingConfig, frames: usize) -> anyhow::Result<serde_json::Value> {
    let format = mono()?;
    let cancel = CancellationToken::new();
    let graph = AudioGraph::new("concat");

    let concatenator = AudioConcatenator::new(
        graph.clone(),
        format,
        &config.concatenator,
        NodeOptions::named("playlist"),
    );
    let mut events = concatenator.subscribe();

    let first = FixedAudioSampleSource::new(
        graph.clone(),
        format,
        tone(330.0, frames, 0.5),
        NodeOptions::named("first"),
    )?;
    let second = FixedAudioSampleSource::new(
        graph.clone(),
        format,
        tone(660.0, frames, 0.5),
        NodeOptions::named("second"),
    )?;
    concatenator
        .add_input(first, Some(ChannelToken::from("first")), true)
        .await?;
    concatenator
        .add_input(second, Some(ChannelToken::from("second")), true)
        .await?;

    let bucket = BucketAudioSampleTarget::new(graph.clone(), format, NodeOptions::named("played"));
    connect(concatenator.clone(), bucket.clone()).await?;

    // A read-forever concatenator never finishes, so stop after the inputs plus a tail of silence
    let limit = frames * 2 + CHUNK_FRAMES;
    let finished = pull_until_finished(&bucket, limit, &cancel)
        .await
        .context("concatenator demo stalled")?;

    let mut completed = Vec::new();
    while let Ok(event) = events.try_recv() {
        completed.push(event.token.to_string());
    }

    Ok(json!({
        "frames": bucket.frames(),
        "finished": finished,
        "completed_inputs": completed,
        "graph": graph.stats(),
    }))
}

