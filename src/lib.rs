//! Murmur - local spoken-dialogue assistant
//!
//! Glues a local speech-to-text server (Whisper), a local chat-completion
//! server (Ollama) and a local text-to-speech engine (Piper) into a
//! turn-based conversation.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   frames   ┌─────────────┐  utterance  ┌─────────────┐
//! │ Frame Source │──────────▶│ Speech Gate │────────────▶│ Transcriber │
//! └──────────────┘ (bounded)  └─────────────┘             └──────┬──────┘
//!                                                               │ text
//! ┌──────────────┐   reply    ┌─────────────┐   prompt    ┌──────▼──────┐
//! │ Synthesizer  │◀──────────│  Assistant  │────────────▶│  Responder  │
//! │  + Speaker   │            │  (+History) │◀────────────│  (Ollama)   │
//! └──────────────┘            └─────────────┘             └─────────────┘
//! ```

pub mod assistant;
pub mod config;
pub mod console;
pub mod error;
pub mod history;
pub mod llm;
pub mod voice;

pub use assistant::{Assistant, Command, Input, Output, Prompter, StdinPrompter, TurnResult};
pub use config::Config;
pub use error::{Error, Result};
pub use history::{Exchange, History, Role};
pub use llm::{OllamaClient, Responder};
