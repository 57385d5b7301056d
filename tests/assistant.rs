//! Conversation loop tests with scripted input, responder and speaker

use std::io::{BufReader, Cursor, Read};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use murmur::assistant::{CONTINUE_PROMPT, TIMEOUT_APOLOGY};
use murmur::voice::{GateStop, Utterance};
use murmur::{
    Assistant, Exchange, History, Input, Output, Prompter, Role, StdinPrompter, TurnResult,
};

mod common;

use common::{
    MockResponder, MockSpeaker, MockSynthesizer, MockTranscriber, MockVoice, Reply,
    ScriptedPrompter, captured, utterance,
};

const SYSTEM: &str = "You are a helpful voice assistant.";

fn history() -> History {
    History::new(SYSTEM.to_string(), 10)
}

fn text_assistant(lines: &[&str], responder: &MockResponder) -> Assistant {
    Assistant::new(
        Input::Text,
        Box::new(responder.clone()),
        Box::new(ScriptedPrompter::new(lines)),
        history(),
    )
}

fn voice_assistant(
    voice: MockVoice,
    transcriber: &MockTranscriber,
    prompter: &ScriptedPrompter,
    responder: &MockResponder,
) -> Assistant {
    Assistant::new(
        Input::Voice {
            microphone: Box::new(voice),
            transcriber: Box::new(transcriber.clone()),
            language: "en".to_string(),
        },
        Box::new(responder.clone()),
        Box::new(prompter.clone()),
        history(),
    )
}

fn entries(assistant: &Assistant) -> Vec<Exchange> {
    assistant.history().entries().cloned().collect()
}

fn pair(user: &str, assistant: &str) -> Vec<Exchange> {
    vec![Exchange::user(user), Exchange::assistant(assistant)]
}

#[tokio::test]
async fn test_text_turn_records_exchange() {
    let responder = MockResponder::answering("hi there");
    let mut assistant = text_assistant(&["hello"], &responder);

    let result = assistant.run_turn().await.unwrap();

    assert_eq!(result, TurnResult::Continue);
    assert_eq!(entries(&assistant), pair("hello", "hi there"));

    let calls = responder.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1, "hello");
    // Context is the system prelude alone on the first turn
    assert_eq!(calls[0].0, vec![Exchange::system(SYSTEM)]);
}

#[tokio::test]
async fn test_context_carries_previous_turns() {
    let responder = MockResponder::new(vec![
        Reply::Text("first reply".to_string()),
        Reply::Text("second reply".to_string()),
    ]);
    let mut assistant = text_assistant(&["one", "two"], &responder);

    assistant.run_turn().await.unwrap();
    assistant.run_turn().await.unwrap();

    let calls = responder.calls();
    let roles: Vec<Role> = calls[1].0.iter().map(|e| e.role).collect();
    assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant]);
    assert_eq!(calls[1].0[1].content, "one");
    assert_eq!(calls[1].1, "two");
    assert_eq!(assistant.history().len(), 4);
}

#[tokio::test]
async fn test_typed_input_is_trimmed() {
    let responder = MockResponder::answering("sure");
    let mut assistant = text_assistant(&["   what time is it?  "], &responder);

    assistant.run_turn().await.unwrap();

    assert_eq!(responder.calls()[0].1, "what time is it?");
}

#[tokio::test]
async fn test_empty_line_skips_without_responder() {
    let responder = MockResponder::default();
    let mut assistant = text_assistant(&["   "], &responder);

    assert_eq!(assistant.run_turn().await.unwrap(), TurnResult::Skip);
    assert_eq!(responder.call_count(), 0);
    assert!(assistant.history().is_empty());
}

#[tokio::test]
async fn test_reset_clears_history() {
    let responder = MockResponder::answering("hi there");
    let mut assistant = text_assistant(&["hello", "RESET", "again"], &responder);

    assistant.run_turn().await.unwrap();
    assert_eq!(assistant.history().len(), 2);

    assert_eq!(assistant.run_turn().await.unwrap(), TurnResult::Skip);
    assert!(assistant.history().is_empty());
    assert_eq!(assistant.history().as_context(), vec![Exchange::system(SYSTEM)]);

    // Next request sees only the prelude
    assistant.run_turn().await.unwrap();
    assert_eq!(responder.calls()[1].0, vec![Exchange::system(SYSTEM)]);
}

#[tokio::test]
async fn test_exit_words_end_the_session() {
    for word in ["exit", "Quit", " BYE "] {
        let responder = MockResponder::default();
        let mut assistant = text_assistant(&[word], &responder);

        assert_eq!(assistant.run_turn().await.unwrap(), TurnResult::Exit, "{word}");
        assert_eq!(responder.call_count(), 0);
    }
}

#[tokio::test]
async fn test_end_of_input_exits() {
    let responder = MockResponder::default();
    let mut assistant = text_assistant(&[], &responder);

    assert_eq!(assistant.run_turn().await.unwrap(), TurnResult::Exit);
}

#[tokio::test]
async fn test_responder_timeout_substitutes_apology() {
    let responder = MockResponder::new(vec![Reply::Timeout]);
    let mut assistant = text_assistant(&["tell me a long story"], &responder);

    assert_eq!(assistant.run_turn().await.unwrap(), TurnResult::Continue);
    assert_eq!(
        entries(&assistant),
        pair("tell me a long story", TIMEOUT_APOLOGY)
    );
}

#[tokio::test]
async fn test_responder_error_substitutes_message() {
    let responder = MockResponder::new(vec![Reply::Refused]);
    let mut assistant = text_assistant(&["hello"], &responder);

    assert_eq!(assistant.run_turn().await.unwrap(), TurnResult::Continue);

    let entries = entries(&assistant);
    assert_eq!(entries.len(), 2);
    assert!(entries[1].content.starts_with("I encountered an error:"));
    assert!(entries[1].content.contains("connection refused"));
}

#[tokio::test]
async fn test_history_stays_bounded() {
    let responder = MockResponder::default();
    let lines: Vec<String> = (0..8).map(|i| format!("message {i}")).collect();
    let lines: Vec<&str> = lines.iter().map(String::as_str).collect();
    let mut assistant = Assistant::new(
        Input::Text,
        Box::new(responder.clone()),
        Box::new(ScriptedPrompter::new(&lines)),
        History::new(SYSTEM.to_string(), 4),
    );

    for _ in 0..8 {
        assistant.run_turn().await.unwrap();
    }

    let entries = entries(&assistant);
    assert_eq!(entries.len(), 4);
    assert_eq!(entries[0].content, "message 6");
    assert_eq!(entries[2].content, "message 7");
}

#[tokio::test]
async fn test_reply_is_spoken() {
    let responder = MockResponder::answering("hi there");
    let synthesizer = MockSynthesizer::default();
    let speaker = MockSpeaker::default();
    let mut assistant = text_assistant(&["hello"], &responder).with_output(Output {
        synthesizer: Box::new(synthesizer.clone()),
        speaker: Box::new(speaker.clone()),
    });

    assert_eq!(assistant.run_turn().await.unwrap(), TurnResult::Continue);
    assert_eq!(synthesizer.texts(), vec!["hi there".to_string()]);
    assert_eq!(speaker.played().len(), 1);
    assert!(!speaker.played()[0].is_empty());
}

#[tokio::test]
async fn test_synthesis_failure_keeps_turn() {
    let responder = MockResponder::answering("hi there");
    let speaker = MockSpeaker::default();
    let mut assistant = text_assistant(&["hello"], &responder).with_output(Output {
        synthesizer: Box::new(MockSynthesizer::failing()),
        speaker: Box::new(speaker.clone()),
    });

    assert_eq!(assistant.run_turn().await.unwrap(), TurnResult::Continue);
    assert_eq!(assistant.history().len(), 2);
    assert!(speaker.played().is_empty());
}

#[tokio::test]
async fn test_voice_turn_transcribes_and_replies() {
    let voice = MockVoice::new(vec![captured(utterance(20), GateStop::Silence)]);
    let transcriber = MockTranscriber::new(&[" What's the weather? "]);
    let responder = MockResponder::answering("Sunny.");
    let prompter = ScriptedPrompter::default();
    let mut assistant = voice_assistant(voice, &transcriber, &prompter, &responder);

    assert_eq!(assistant.run_turn().await.unwrap(), TurnResult::Continue);
    assert_eq!(transcriber.call_count(), 1);
    assert_eq!(
        entries(&assistant),
        pair("What's the weather?", "Sunny.")
    );
}

#[tokio::test]
async fn test_voice_without_speech_skips_transcription() {
    let voice = MockVoice::new(vec![captured(Utterance::new(), GateStop::MaxDuration)]);
    let transcriber = MockTranscriber::new(&["never used"]);
    let responder = MockResponder::default();
    let mut assistant =
        voice_assistant(voice, &transcriber, &ScriptedPrompter::default(), &responder);

    assert_eq!(assistant.run_turn().await.unwrap(), TurnResult::Skip);
    assert_eq!(transcriber.call_count(), 0);
    assert_eq!(responder.call_count(), 0);
}

#[tokio::test]
async fn test_empty_transcript_skips_responder() {
    let voice = MockVoice::new(vec![captured(utterance(10), GateStop::Silence)]);
    let transcriber = MockTranscriber::new(&["   "]);
    let responder = MockResponder::default();
    let mut assistant =
        voice_assistant(voice, &transcriber, &ScriptedPrompter::default(), &responder);

    assert_eq!(assistant.run_turn().await.unwrap(), TurnResult::Skip);
    assert_eq!(transcriber.call_count(), 1);
    assert_eq!(responder.call_count(), 0);
    assert!(assistant.history().is_empty());
}

#[tokio::test]
async fn test_aborted_capture_still_transcribes_partial_audio() {
    let voice = MockVoice::new(vec![captured(
        utterance(8),
        GateStop::DetectorFailed("vad error: model crashed".to_string()),
    )]);
    let transcriber = MockTranscriber::new(&["turn on the"]);
    let responder = MockResponder::answering("Turn on what?");
    let mut assistant =
        voice_assistant(voice, &transcriber, &ScriptedPrompter::default(), &responder);

    assert_eq!(assistant.run_turn().await.unwrap(), TurnResult::Continue);
    assert_eq!(responder.calls()[0].1, "turn on the");
}

#[tokio::test]
async fn test_spoken_exit_with_punctuation() {
    let voice = MockVoice::new(vec![captured(utterance(10), GateStop::Silence)]);
    let transcriber = MockTranscriber::new(&["Bye."]);
    let responder = MockResponder::default();
    let mut assistant =
        voice_assistant(voice, &transcriber, &ScriptedPrompter::default(), &responder);

    assert_eq!(assistant.run_turn().await.unwrap(), TurnResult::Exit);
    assert_eq!(responder.call_count(), 0);
}

#[tokio::test]
async fn test_cancelled_capture_exits_turn() {
    let voice = MockVoice::new(vec![captured(utterance(3), GateStop::Cancelled)]);
    let transcriber = MockTranscriber::default();
    let responder = MockResponder::default();
    let mut assistant =
        voice_assistant(voice, &transcriber, &ScriptedPrompter::default(), &responder);

    assert_eq!(assistant.run_turn().await.unwrap(), TurnResult::Exit);
    assert_eq!(transcriber.call_count(), 0);
}

#[tokio::test]
async fn test_text_session_runs_until_exit_word() {
    let responder = MockResponder::new(vec![
        Reply::Text("hi".to_string()),
        Reply::Text("fine".to_string()),
    ]);
    let mut assistant = text_assistant(&["hello", "", "how are you", "quit", "never read"], &responder);

    assistant.run().await.unwrap();

    assert_eq!(responder.call_count(), 2);
    assert_eq!(assistant.history().len(), 4);
}

#[tokio::test]
async fn test_text_session_ends_at_end_of_input() {
    let responder = MockResponder::default();
    let mut assistant = text_assistant(&["hello"], &responder);

    assistant.run().await.unwrap();

    assert_eq!(responder.call_count(), 1);
}

#[tokio::test]
async fn test_single_shot_voice_asks_before_next_turn() {
    let voice = MockVoice::new(vec![
        captured(utterance(10), GateStop::Silence),
        captured(utterance(10), GateStop::Silence),
    ]);
    let transcriber = MockTranscriber::new(&["first", "second"]);
    let responder = MockResponder::default();
    let prompter = ScriptedPrompter::new(&["", "q"]);
    let mut assistant = voice_assistant(voice, &transcriber, &prompter, &responder);

    assistant.run().await.unwrap();

    assert_eq!(responder.call_count(), 2);
    assert_eq!(prompter.prompts(), vec![CONTINUE_PROMPT.to_string(); 2]);
}

#[tokio::test]
async fn test_single_shot_voice_prompts_after_skip() {
    let voice = MockVoice::new(vec![captured(Utterance::new(), GateStop::MaxDuration)]);
    let prompter = ScriptedPrompter::new(&["Q"]);
    let responder = MockResponder::default();
    let mut assistant =
        voice_assistant(voice, &MockTranscriber::default(), &prompter, &responder);

    assistant.run().await.unwrap();

    assert_eq!(prompter.prompts().len(), 1);
    assert_eq!(responder.call_count(), 0);
}

#[tokio::test]
async fn test_continuous_voice_never_prompts() {
    let voice = MockVoice::new(vec![
        captured(utterance(10), GateStop::Silence),
        captured(utterance(10), GateStop::Silence),
        captured(utterance(10), GateStop::Silence),
    ]);
    let transcriber = MockTranscriber::new(&["one", "two", "three"]);
    let responder = MockResponder::default();
    let prompter = ScriptedPrompter::default();
    let mut assistant = voice_assistant(voice, &transcriber, &prompter, &responder)
        .continuous(Duration::ZERO);

    // Script runs dry with a cancelled capture, which ends the loop
    assistant.run().await.unwrap();

    assert_eq!(responder.call_count(), 3);
    assert!(prompter.prompts().is_empty());
}

#[tokio::test]
async fn test_cancelled_session_returns_cleanly() {
    let cancel = CancellationToken::new();
    cancel.cancel();

    let responder = MockResponder::default();
    let mut assistant = text_assistant(&["hello", "again"], &responder).with_cancel(cancel);

    assistant.run().await.unwrap();

    assert_eq!(responder.call_count(), 0);
    assert!(assistant.history().is_empty());
}

/// Reader whose read never returns, like a terminal nobody types into
struct SilentTerminal;

impl Read for SilentTerminal {
    fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            std::thread::park();
        }
    }
}

#[tokio::test]
async fn test_stdin_prompter_reads_lines_then_end() {
    let mut prompter = StdinPrompter::from_reader(Cursor::new("hello\nagain\n")).unwrap();

    assert_eq!(prompter.read_line("> ").await.unwrap().as_deref(), Some("hello"));
    assert_eq!(prompter.read_line("> ").await.unwrap().as_deref(), Some("again"));
    assert_eq!(prompter.read_line("> ").await.unwrap(), None);
}

#[test]
fn test_interrupt_at_pending_prompt_shuts_down_promptly() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();
    let started = Instant::now();

    let outcome = runtime.block_on(async {
        let prompter = StdinPrompter::from_reader(BufReader::new(SilentTerminal)).unwrap();
        let cancel = CancellationToken::new();
        let mut assistant = Assistant::new(
            Input::Text,
            Box::new(MockResponder::default()),
            Box::new(prompter),
            history(),
        )
        .with_cancel(cancel.clone());

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });

        tokio::time::timeout(Duration::from_secs(2), assistant.run()).await
    });
    drop(runtime);

    assert!(matches!(outcome, Ok(Ok(()))), "read_line ignored the interrupt");
    assert!(started.elapsed() < Duration::from_secs(3), "runtime shutdown waited on the reader");
}
