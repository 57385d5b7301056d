use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use murmur::config::Config;
use murmur::voice::{
    AudioCapture, AudioPlayback, CaptureConfig, FrameSource, Microphone, PiperProcess,
    PiperServer, Speaker, Synthesizer, TtsBackend, WhisperClient, calculate_rms,
    resolve_piper_executable,
};
use murmur::{Assistant, History, Input, OllamaClient, Output, StdinPrompter, console};

/// Murmur - talk to a local LLM with your voice
#[derive(Parser)]
#[command(name = "murmur", version, about)]
struct Cli {
    /// Type instead of speaking
    #[arg(long)]
    text: bool,

    /// Keep listening after each reply without asking
    #[arg(long)]
    continuous: bool,

    /// Stop recording when you stop speaking
    #[arg(long)]
    vad: bool,

    /// Print replies without speaking them
    #[arg(long)]
    no_speech: bool,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
    /// Synthesize text and play it or save it
    Say {
        /// Text to speak
        #[arg(default_value = "Hello! This is a test of the text to speech system.")]
        text: String,
        /// Write a WAV file instead of playing
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List models on the Ollama server
    Models,
    /// Show the resolved configuration
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Missing .env is fine
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let config = Config::load();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => config.as_ref().map_or_else(
            |_| std::env::var("LOG_LEVEL").unwrap_or_else(|_| "warn".to_string()),
            |c| c.log_level.clone(),
        ),
        1 => "info,murmur=debug".to_string(),
        2 => "debug".to_string(),
        _ => "trace".to_string(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&filter).unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let result = match config {
        Ok(config) => run(cli, config).await,
        Err(e) => Err(e.into()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            console::error(&format!("Fatal error: {e}"));
            ExitCode::FAILURE
        }
    }
}

#[allow(clippy::future_not_send)]
async fn run(cli: Cli, mut config: Config) -> anyhow::Result<()> {
    if let Some(cmd) = cli.command {
        return match cmd {
            Command::TestMic { duration } => test_mic(&config, duration).await,
            Command::TestSpeaker => test_speaker().await,
            Command::Say { text, output } => say(&config, &text, output).await,
            Command::Models => list_models(&config).await,
            Command::Config => {
                show_config(&config);
                Ok(())
            }
        };
    }

    // CLI flags win over environment and file
    config.mode.text |= cli.text;
    config.mode.continuous |= cli.continuous;
    config.vad.enabled |= cli.vad;
    config.mode.speech = !cli.no_speech;
    config.validate()?;

    tracing::info!(
        text = config.mode.text,
        continuous = config.mode.continuous,
        vad = config.vad.enabled,
        "starting murmur"
    );

    console::banner();
    console::show_config(&config);

    let llm = OllamaClient::new(&config.ollama.url, config.ollama.model.clone(), config.ollama.stream)?;
    if !llm.check_connection().await {
        console::warning(&format!(
            "Cannot reach Ollama at {}. Make sure it is running (ollama serve).",
            config.ollama.url
        ));
    }

    let input = if config.mode.text {
        Input::Text
    } else {
        Input::Voice {
            microphone: Box::new(build_microphone(&config)?),
            transcriber: Box::new(WhisperClient::new(
                &config.whisper.url,
                config.whisper.model.clone(),
                config.whisper.api,
            )?),
            language: config.whisper.language.clone(),
        }
    };

    let history = History::new(config.ollama.system_prompt.clone(), config.ollama.max_history);

    // Cancel the session on Ctrl+C
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received");
            token.cancel();
        }
    });

    let mut assistant = Assistant::new(input, Box::new(llm), Box::new(StdinPrompter::new()?), history)
        .with_cancel(cancel);

    if config.mode.continuous {
        assistant = assistant.continuous(config.mode.turn_pause);
    }

    if config.mode.speech {
        assistant = assistant.with_output(Output {
            synthesizer: build_synthesizer(&config)?,
            speaker: Box::new(AudioPlayback::new()?),
        });
    }

    console::instructions(&config);
    assistant.run().await?;

    Ok(())
}

fn build_microphone(config: &Config) -> anyhow::Result<Microphone> {
    let source = FrameSource::new(CaptureConfig {
        sample_rate: config.audio.sample_rate,
        channels: config.audio.channels,
        ..CaptureConfig::default()
    })?;

    if config.vad.enabled {
        let detector = config.vad.detector.build(&config.vad.silero_model)?;
        tracing::info!(detector = %config.vad.detector, "speech gate enabled");
        Ok(Microphone::gated(source, config.vad.gate_params(), detector)
            .with_progress(console::gate_progress))
    } else {
        Ok(Microphone::fixed(
            source,
            Duration::from_secs(config.audio.record_seconds),
        ))
    }
}

fn build_synthesizer(config: &Config) -> anyhow::Result<Box<dyn Synthesizer>> {
    let synthesizer: Box<dyn Synthesizer> = match config.tts.backend {
        TtsBackend::Process => {
            let executable = resolve_piper_executable(&config.tts.piper_dir)?;
            Box::new(PiperProcess::new(executable, config.voice_model_path())?)
        }
        TtsBackend::Server => Box::new(PiperServer::new(&config.tts.url, config.tts.voice.clone())?),
    };
    tracing::info!(backend = %config.tts.backend, voice = %config.tts.voice, "synthesizer ready");
    Ok(synthesizer)
}

/// Test microphone input
#[allow(clippy::future_not_send)]
async fn test_mic(config: &Config, duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let mut capture = AudioCapture::with_config(config.audio.sample_rate, config.audio.channels)?;
    capture.start()?;

    println!("Sample rate: {} Hz", capture.sample_rate());
    println!("---");

    for i in 0..duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let samples = capture.peek_buffer();
        let energy = calculate_rms(&samples);
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

        capture.clear_buffer();
    }

    capture.stop();

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: arecord -l (to list devices)");
    println!("  3. Try: pavucontrol (to check levels)");

    Ok(())
}

/// Test speaker output with a sine wave
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    AudioPlayback::new()?;
    tokio::task::spawn_blocking(|| AudioPlayback::play_tone_blocking(440.0, 2.0, 24_000))
        .await??;

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Try: pavucontrol (to check output levels)");

    Ok(())
}

/// Synthesize text with the configured backend
async fn say(config: &Config, text: &str, output: Option<PathBuf>) -> anyhow::Result<()> {
    println!("Synthesizing: \"{text}\"");

    let synthesizer = build_synthesizer(config)?;
    let speech = synthesizer.synthesize(text).await?;
    println!(
        "Got {} samples at {} Hz ({:.1}s)",
        speech.samples.len(),
        speech.sample_rate,
        speech.duration_secs()
    );

    if let Some(path) = output {
        speech.save_wav(&path)?;
        println!("Saved to {}", path.display());
    } else {
        AudioPlayback::new()?.play(speech).await?;
    }

    Ok(())
}

/// List models installed on the Ollama server
async fn list_models(config: &Config) -> anyhow::Result<()> {
    let client = OllamaClient::new(&config.ollama.url, config.ollama.model.clone(), false)?;
    let models = client.list_models().await?;

    if models.is_empty() {
        println!("No models installed. Try: ollama pull {}", client.model());
        return Ok(());
    }

    println!("Models on {}:", client.base_url());
    for name in models {
        let marker = if name == client.model() { "*" } else { " " };
        println!(" {marker} {name}");
    }

    Ok(())
}

fn show_config(config: &Config) {
    console::show_config(config);
    match murmur::config::config_file_path() {
        Some(path) if path.exists() => println!("Config file: {}", path.display()),
        Some(path) => println!("Config file: {} (not present)", path.display()),
        None => println!("Config file: unavailable"),
    }
}
