use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use beacon_voice::voice::frame::{AudioChunk, rms};
use beacon_voice::voice::tts::TtsEvent;
use beacon_voice::voice::{AudioCaptureSource, DeviceOutput, PlaybackScheduler, SpeechSynthesisClient};
use beacon_voice::{Config, Daemon};

/// Render tick used by the device test commands
const TEST_TICK: Duration = Duration::from_millis(33);

/// Beacon Voice - real-time voice conversation for AI assistants
#[derive(Parser)]
#[command(name = "beacon-voice", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the voice conversation (default)
    Run,
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output through the playback scheduler
    TestSpeaker,
    /// Speak text through the synthesis service
    TestTts {
        /// Text to speak
        #[arg(default_value = "Hello! This is a test of the text to speech system.")]
        text: String,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,beacon_voice=info",
        1 => "info,beacon_voice=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

#[allow(clippy::future_not_send)]
async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load()?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            tracing::debug!(?config, "loaded configuration");
            tracing::info!("beacon voice ready - start speaking");
            Daemon::new(config).run().await?;
            Ok(())
        }
        Command::TestMic { duration } => test_mic(&config, duration).await,
        Command::TestSpeaker => test_speaker(&config).await,
        Command::TestTts { text } => test_tts(&config, &text).await,
        Command::Config => {
            println!("{config:#?}");
            Ok(())
        }
    }
}

/// Test microphone input
#[allow(clippy::future_not_send)]
async fn test_mic(config: &Config, duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let mut capture = AudioCaptureSource::open(config.frame_size)?;
    let mut frames = capture.start()?;

    println!("Sample rate: {} Hz", capture.sample_rate());
    println!("---");

    for i in 0..duration {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        let mut samples = Vec::new();
        while let Ok(Some(frame)) = tokio::time::timeout_at(deadline, frames.recv()).await {
            samples.extend_from_slice(frame.samples());
        }

        let energy = rms(&samples);
        let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "#".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!(
            "[{:2}s] RMS: {:.4} | Peak: {:.4} | [{}]",
            i + 1,
            energy,
            peak,
            meter
        );
    }

    capture.stop();

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Test speaker output with a sine wave split into scheduled chunks
#[allow(clippy::future_not_send)]
async fn test_speaker(config: &Config) -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let sample_rate = config.tts.sample_rate;
    let output = DeviceOutput::open(sample_rate)?;
    let mut scheduler = PlaybackScheduler::new(config.playback, output.clock(), output.sink());

    let frequency = 440.0_f32;
    let chunk_len = usize::try_from(sample_rate / 10)?;
    scheduler.begin_session("speaker-test");

    #[allow(clippy::cast_precision_loss)]
    for sequence in 0..20_u64 {
        let offset = usize::try_from(sequence)? * chunk_len;
        let samples: Vec<f32> = (offset..offset + chunk_len)
            .map(|i| {
                let t = i as f32 / sample_rate as f32;
                (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3 // 30% volume
            })
            .collect();
        scheduler.enqueue(AudioChunk::new("speaker-test", sequence, samples, sample_rate));
    }
    scheduler.close_session("speaker-test");

    while !scheduler.tick().finished {
        tokio::time::sleep(TEST_TICK).await;
    }

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");

    Ok(())
}

/// Speak text through the synthesis service and the playback scheduler
#[allow(clippy::future_not_send)]
async fn test_tts(config: &Config, text: &str) -> anyhow::Result<()> {
    println!("Testing TTS with text: \"{text}\"\n");

    let output = DeviceOutput::open(config.tts.sample_rate)?;
    let mut scheduler = PlaybackScheduler::new(config.playback, output.clock(), output.sink());
    let (mut tts, mut inbound) = SpeechSynthesisClient::new(config.tts.clone());

    let session = tts.open_session(&config.tts.voice_id)?;
    scheduler.begin_session(&session.session_id);
    tts.send_fragment(&session.session_id, text, true)?;
    println!("Synthesizing speech...");

    let mut ticker = tokio::time::interval(TEST_TICK);
    let mut chunks = 0_usize;
    loop {
        tokio::select! {
            Some(message) = inbound.recv() => {
                for event in tts.handle_inbound(message) {
                    match event {
                        TtsEvent::Audio(chunk) => {
                            chunks += 1;
                            scheduler.enqueue(chunk);
                        }
                        TtsEvent::Gap { expected, received, .. } => {
                            println!("Audio gap: expected chunk {expected}, got {received}");
                        }
                        TtsEvent::Done { session_id } => {
                            println!("Got {chunks} chunks of audio");
                            scheduler.close_session(&session_id);
                            if chunks == 0 {
                                return Ok(());
                            }
                        }
                        TtsEvent::Failed { error, .. } => {
                            anyhow::bail!("TTS synthesis failed: {error}");
                        }
                    }
                }
            }
            _ = ticker.tick() => {
                if scheduler.tick().finished {
                    break;
                }
            }
        }
    }

    println!("\n---");
    println!("If you heard the speech, TTS is working!");

    Ok(())
}
