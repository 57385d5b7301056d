//! Turn orchestration
//!
//! One turn: acquire input (typed line or gated voice + transcription),
//! handle control words, ask the responder, commit the exchange, speak the
//! reply. Responder failures become substitute replies; transcription and
//! synthesis failures skip their step. Only prompt I/O errors end the loop.

use std::io::BufRead;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::history::History;
use crate::llm::Responder;
use crate::voice::{GateStop, Speaker, Synthesizer, Transcriber, VoiceInput};
use crate::{Error, Result, console};

/// Reply used when the responder times out
pub const TIMEOUT_APOLOGY: &str = "I'm sorry, I'm taking too long to respond. Please try again.";

/// Prompt shown between single-shot voice turns
pub const CONTINUE_PROMPT: &str = "Press Enter to speak again, or 'q' to quit...";

/// Outcome of one turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnResult {
    /// A reply was produced; keep going
    Continue,
    /// Leave the loop
    Exit,
    /// Nothing to answer (empty input, no speech, reset)
    Skip,
}

/// Control words recognized in user input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Exit,
    Reset,
}

impl Command {
    /// Match typed input exactly, ignoring case and surrounding whitespace
    #[must_use]
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_lowercase().as_str() {
            "exit" | "quit" | "bye" => Some(Self::Exit),
            "reset" => Some(Self::Reset),
            _ => None,
        }
    }

    /// Match a transcript, which usually carries trailing punctuation
    #[must_use]
    pub fn parse_spoken(transcript: &str) -> Option<Self> {
        Self::parse(transcript.trim().trim_end_matches(|c: char| c.is_ascii_punctuation()))
    }
}

/// Reply substituted for a failed responder call
#[must_use]
pub fn substitute_reply(error: &Error) -> String {
    if error.is_timeout() {
        TIMEOUT_APOLOGY.to_string()
    } else {
        format!("I encountered an error: {error}")
    }
}

/// Line-oriented user prompts
#[async_trait]
pub trait Prompter: Send {
    /// Show `prompt` and read one line; `None` at end of input
    ///
    /// # Errors
    ///
    /// Returns error if reading fails
    async fn read_line(&mut self, prompt: &str) -> Result<Option<String>>;
}

/// Prompter over the process stdin
///
/// Lines are read on a dedicated thread so a pending prompt never blocks
/// runtime shutdown; the thread is left parked in its read on exit.
pub struct StdinPrompter {
    lines: mpsc::Receiver<std::io::Result<String>>,
}

impl StdinPrompter {
    /// # Errors
    ///
    /// Returns error if the reader thread cannot be spawned
    pub fn new() -> Result<Self> {
        Self::from_reader(std::io::BufReader::new(std::io::stdin()))
    }

    /// Prompter over any line source, read on its own thread
    ///
    /// # Errors
    ///
    /// Returns error if the reader thread cannot be spawned
    pub fn from_reader<R>(reader: R) -> Result<Self>
    where
        R: BufRead + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(1);

        std::thread::Builder::new()
            .name("stdin-reader".to_string())
            .spawn(move || {
                for line in reader.lines() {
                    let failed = line.is_err();
                    if tx.blocking_send(line).is_err() || failed {
                        break;
                    }
                }
            })?;

        Ok(Self { lines: rx })
    }
}

#[async_trait]
impl Prompter for StdinPrompter {
    async fn read_line(&mut self, prompt: &str) -> Result<Option<String>> {
        use std::io::Write;

        print!("{prompt}");
        std::io::stdout().flush()?;
        match self.lines.recv().await {
            Some(line) => Ok(Some(line?)),
            None => Ok(None),
        }
    }
}

/// Where user input comes from
pub enum Input {
    /// Typed lines
    Text,
    /// Microphone plus transcription
    Voice {
        microphone: Box<dyn VoiceInput>,
        transcriber: Box<dyn Transcriber>,
        language: String,
    },
}

/// Synthesizer and speaker for replies
pub struct Output {
    pub synthesizer: Box<dyn Synthesizer>,
    pub speaker: Box<dyn Speaker>,
}

/// Conversation loop
pub struct Assistant {
    input: Input,
    output: Option<Output>,
    responder: Box<dyn Responder>,
    prompter: Box<dyn Prompter>,
    history: History,
    continuous: bool,
    turn_pause: Duration,
    cancel: CancellationToken,
}

impl Assistant {
    #[must_use]
    pub fn new(
        input: Input,
        responder: Box<dyn Responder>,
        prompter: Box<dyn Prompter>,
        history: History,
    ) -> Self {
        Self {
            input,
            output: None,
            responder,
            prompter,
            history,
            continuous: false,
            turn_pause: Duration::from_millis(500),
            cancel: CancellationToken::new(),
        }
    }

    /// Speak replies through `output`
    #[must_use]
    pub fn with_output(mut self, output: Output) -> Self {
        self.output = Some(output);
        self
    }

    /// Start the next voice turn without asking, after `pause`
    #[must_use]
    pub const fn continuous(mut self, pause: Duration) -> Self {
        self.continuous = true;
        self.turn_pause = pause;
        self
    }

    /// Stop when `cancel` fires
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub const fn history(&self) -> &History {
        &self.history
    }

    const fn is_voice(&self) -> bool {
        matches!(self.input, Input::Voice { .. })
    }

    /// Run until an exit command, end of input, or cancellation
    ///
    /// # Errors
    ///
    /// Returns error if reading user input fails
    pub async fn run(&mut self) -> Result<()> {
        let cancel = self.cancel.clone();

        loop {
            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    console::warning("\nInterrupted by user");
                    break;
                }
                outcome = self.cycle() => outcome?,
            };

            if outcome == TurnResult::Exit {
                break;
            }
        }

        console::status("\nGoodbye!");
        Ok(())
    }

    /// One turn followed by the continuation decision
    async fn cycle(&mut self) -> Result<TurnResult> {
        match self.run_turn().await? {
            TurnResult::Exit => Ok(TurnResult::Exit),
            _ => self.continuation().await,
        }
    }

    /// Drive one turn end to end
    ///
    /// # Errors
    ///
    /// Returns error if reading user input fails
    pub async fn run_turn(&mut self) -> Result<TurnResult> {
        let Some((text, command)) = self.acquire().await? else {
            return Ok(TurnResult::Exit);
        };

        match command {
            Some(Command::Exit) => return Ok(TurnResult::Exit),
            Some(Command::Reset) => {
                self.history.reset();
                console::status("Conversation reset");
                return Ok(TurnResult::Skip);
            }
            None => {}
        }

        if text.is_empty() {
            return Ok(TurnResult::Skip);
        }

        console::status("Thinking...");
        let context = self.history.as_context();
        let reply = match self.responder.respond(&context, &text).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!(error = %e, "responder failed");
                substitute_reply(&e)
            }
        };

        self.history.append_pair(text, reply.clone());
        console::assistant_line(&reply);

        self.speak(&reply).await;

        Ok(TurnResult::Continue)
    }

    /// Read the next input; `None` means end of input
    async fn acquire(&mut self) -> Result<Option<(String, Option<Command>)>> {
        match &self.input {
            Input::Text => {
                let Some(line) = self.prompter.read_line("You: ").await? else {
                    return Ok(None);
                };
                let text = line.trim().to_string();
                let command = Command::parse(&text);
                Ok(Some((text, command)))
            }
            Input::Voice {
                microphone,
                transcriber,
                language,
            } => {
                let text = listen(microphone.as_ref(), transcriber.as_ref(), language, &self.cancel)
                    .await;
                match text {
                    Listened::Cancelled => Ok(None),
                    Listened::Nothing => Ok(Some((String::new(), None))),
                    Listened::Text(text) => {
                        console::user_line(&text);
                        let command = Command::parse_spoken(&text);
                        Ok(Some((text, command)))
                    }
                }
            }
        }
    }

    async fn speak(&self, text: &str) {
        let Some(output) = &self.output else {
            return;
        };
        if text.trim().is_empty() {
            return;
        }

        let speech = match output.synthesizer.synthesize(text).await {
            Ok(speech) => speech,
            Err(e) => {
                tracing::warn!(error = %e, "synthesis failed");
                console::warning("TTS unavailable");
                return;
            }
        };

        if let Err(e) = output.speaker.play(speech).await {
            tracing::warn!(error = %e, "playback failed");
            console::warning("Audio device not available");
        }
    }

    /// Decide whether another turn follows
    async fn continuation(&mut self) -> Result<TurnResult> {
        if !self.is_voice() {
            return Ok(TurnResult::Continue);
        }

        if self.continuous {
            if !self.turn_pause.is_zero() {
                tokio::time::sleep(self.turn_pause).await;
            }
            return Ok(TurnResult::Continue);
        }

        match self.prompter.read_line(CONTINUE_PROMPT).await? {
            Some(choice) if choice.trim().eq_ignore_ascii_case("q") => Ok(TurnResult::Exit),
            Some(_) => Ok(TurnResult::Continue),
            None => Ok(TurnResult::Exit),
        }
    }
}

enum Listened {
    Text(String),
    Nothing,
    Cancelled,
}

async fn listen(
    microphone: &dyn VoiceInput,
    transcriber: &dyn Transcriber,
    language: &str,
    cancel: &CancellationToken,
) -> Listened {
    console::status("Listening...");

    let captured = match microphone.listen(cancel).await {
        Ok(captured) => captured,
        Err(e) => {
            tracing::error!(error = %e, "capture failed");
            console::error(&format!("Error: {e}"));
            return Listened::Nothing;
        }
    };
    println!();

    if captured.stop == GateStop::Cancelled {
        return Listened::Cancelled;
    }
    if captured.stop.is_abnormal() {
        console::warning("Recording stopped early");
    }
    if captured.utterance.is_empty() {
        console::warning("No speech detected");
        return Listened::Nothing;
    }

    let sample_rate = captured.utterance.sample_rate();
    let samples = captured.utterance.into_samples();

    console::status("Transcribing...");
    match transcriber.transcribe(&samples, sample_rate, language).await {
        Ok(text) if text.trim().is_empty() => {
            console::warning("No speech detected");
            Listened::Nothing
        }
        Ok(text) => Listened::Text(text.trim().to_string()),
        Err(e) => {
            tracing::warn!(error = %e, "transcription failed");
            console::warning("Could not transcribe audio");
            Listened::Nothing
        }
    }
}
