//! User-facing console output
//!
//! Everything here goes to stdout for the person at the keyboard;
//! diagnostics go through `tracing` to stderr.

use std::io::Write;

use crossterm::style::Stylize;

use crate::config::Config;
use crate::voice::GateState;

const RULE: &str = "==================================================";

/// Startup banner
pub fn banner() {
    println!();
    println!("{}", RULE.dark_cyan());
    println!("{}", "  murmur - local voice assistant".bold());
    println!("{}", RULE.dark_cyan());
}

/// Print the resolved configuration
pub fn show_config(config: &Config) {
    let section = |title: &str| println!("\n{}", title.bold().cyan());
    let field = |name: &str, value: &dyn std::fmt::Display| println!("  {name:<16}{value}");

    println!("\n{}", RULE.dark_grey());
    println!("{}", "CONFIGURATION".bold());
    println!("{}", RULE.dark_grey());

    section("LLM (Ollama)");
    field("Model:", &config.ollama.model);
    field("URL:", &config.ollama.url);
    field("Streaming:", &config.ollama.stream);
    field("History:", &config.ollama.max_history);

    section("Speech-to-Text (Whisper)");
    field("Server:", &config.whisper.url);
    field("API:", &config.whisper.api);
    field("Model:", &config.whisper.model);
    field("Language:", &config.whisper.language);

    section("Text-to-Speech (Piper)");
    field("Voice:", &config.tts.voice);
    field("Backend:", &config.tts.backend);
    field("Speech:", &config.mode.speech);

    section("Audio");
    field("Sample rate:", &format!("{} Hz", config.audio.sample_rate));
    field("Channels:", &config.audio.channels);
    field("Record time:", &format!("{} seconds", config.audio.record_seconds));
    field("VAD:", &config.vad.enabled);
    if config.vad.enabled {
        field("Detector:", &config.vad.detector);
        field("Threshold:", &config.vad.threshold);
    }

    section("Mode");
    field("Continuous:", &config.mode.continuous);
    field("Text only:", &config.mode.text);

    println!("{}\n", RULE.dark_grey());
}

/// How to drive the session in the current mode
pub fn instructions(config: &Config) {
    println!("{}", "Instructions:".bold());
    if config.mode.text {
        println!("  Type your message and press Enter.");
    } else if config.vad.enabled {
        println!("  Speak naturally; recording stops when you pause.");
    } else {
        println!(
            "  Speak after the prompt; recording lasts {} seconds.",
            config.audio.record_seconds
        );
    }
    if !config.mode.text && !config.mode.continuous {
        println!("  Press Enter to speak again, or 'q' to quit.");
    }
    println!("  Say or type 'reset' to clear the conversation.");
    println!("  Say or type 'exit', 'quit' or 'bye' to leave.");
    println!("  Press Ctrl+C at any time to stop.\n");
}

pub fn user_line(text: &str) {
    println!("\n{} {text}", "You:".bold().green());
}

pub fn assistant_line(text: &str) {
    println!("{} {text}\n", "Assistant:".bold().blue());
}

pub fn status(text: &str) {
    println!("{}", text.dark_grey());
}

pub fn warning(text: &str) {
    println!("{}", text.yellow());
}

pub fn error(text: &str) {
    eprintln!("{}", text.red().bold());
}

/// Speech gate progress marks, one character per report
pub fn gate_progress(state: GateState) {
    let mark = match state {
        GateState::Idle | GateState::Listening => ".".dark_grey(),
        GateState::Speaking => "*".green(),
        GateState::TrailingSilence => "-".yellow(),
    };
    print!("{mark}");
    let _ = std::io::stdout().flush();
}
