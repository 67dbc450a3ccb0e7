//! Coach Simulator
//!
//! Runs a practice session in the terminal. Each typed line is delivered as a
//! final speech-recognition result, so the real turn controller (silence
//! detection, guard, timers, feedback) runs unchanged.
//!
//! Commands: `:next`, `:skip`, `:back`, `:end`, `:resume`, `:edit <text>`,
//! `~<text>` (interim result).
//!
//! Environment: `COACH_KIND` (interview | negotiation), `COACH_PROMPTS`
//! (JSON array of prompts), `COACH_TARGET` (role or offer being practiced).

use coach_core::{
    ChatClient, ChatCompletion, ChatFeedbackGenerator, CoachConfig, MockChat, Prompt, SessionKind, SessionMeta,
};
use coach_voice::{
    create_best_tts, AudioOutput, ChannelRecognizer, ControllerDeps, RecognizerFeed, SessionHandle, SessionNotice,
    VoiceSession,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[coach-sim] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = CoachConfig::load().expect("load CoachConfig");
    let kind: SessionKind = std::env::var("COACH_KIND")
        .ok()
        .map(|k| k.parse().expect("COACH_KIND"))
        .unwrap_or_default();
    let prompts = match std::env::var("COACH_PROMPTS") {
        Ok(path) => load_prompts(&path).expect("load COACH_PROMPTS"),
        Err(_) => kind.default_prompts(),
    };
    let mut meta = SessionMeta::new(kind, config.session.duration_secs);
    if let Ok(target) = std::env::var("COACH_TARGET") {
        meta = meta.with_target(target);
    }

    let chat: Arc<dyn ChatCompletion> = match ChatClient::from_config(&config) {
        Some(client) => {
            tracing::info!(model = client.model(), "using chat service for feedback");
            Arc::new(client)
        }
        None => Arc::new(MockChat::default()),
    };
    let feedback = Arc::new(ChatFeedbackGenerator::new(chat, &config));

    let (recognizer, feed) = ChannelRecognizer::new();
    let deps = ControllerDeps {
        recognizer: Box::new(recognizer),
        synthesizer: create_best_tts(&config),
        output: audio_output(),
        voice: config.voice.clone(),
    };
    let (session, handle, notices) = VoiceSession::new(config.session.clone(), meta, deps, feedback);

    println!("🎯 {} · {} prompts · {}s", kind.label(), prompts.len(), config.session.duration_secs);
    println!("Type your answers. Pause {}s to submit, or use :next / :skip / :back / :end.\n", config.session.silence_timeout_ms / 1000);

    tokio::spawn(print_notices(notices));
    tokio::spawn(read_stdin(handle.clone(), feed));
    let ctrl_c = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("CTRL-C received; ending session");
            let _ = ctrl_c.end();
        }
    });

    match session.run(prompts).await {
        Ok(outcome) => {
            println!("\n🏁 finished ({:?}) with {} answers\n", outcome.reason, outcome.transcript.len());
            match serde_json::to_string_pretty(&outcome) {
                Ok(json) => println!("{}", json),
                Err(e) => tracing::warn!(error = %e, "could not render outcome"),
            }
        }
        Err(e) => {
            eprintln!("[coach-sim] session failed: {}", e);
            std::process::exit(1);
        }
    }
}

fn load_prompts(path: &str) -> Result<Vec<Prompt>, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)?;
    let prompts: Vec<Prompt> = serde_json::from_str(&raw)?;
    if prompts.is_empty() {
        return Err(format!("{} contains no prompts", path).into());
    }
    Ok(prompts)
}

#[cfg(feature = "playback")]
fn audio_output() -> Arc<dyn AudioOutput> {
    Arc::new(coach_voice::RodioOutput::new())
}

#[cfg(not(feature = "playback"))]
fn audio_output() -> Arc<dyn AudioOutput> {
    Arc::new(coach_voice::NullOutput)
}

async fn print_notices(mut notices: mpsc::UnboundedReceiver<SessionNotice>) {
    while let Some(notice) = notices.recv().await {
        match notice {
            SessionNotice::PromptStarted { index, text } => println!("\n🤖 [{}] {}", index + 1, text),
            SessionNotice::PhaseChanged { to, .. } => tracing::debug!(%to, "phase"),
            SessionNotice::InterimText(text) => println!("   … {}", text),
            SessionNotice::DraftUpdated(text) if !text.is_empty() => println!("   ✎ {}", text),
            SessionNotice::DraftUpdated(_) => {}
            SessionNotice::TurnRecorded { index, turn } => {
                println!("   ✅ answer {} recorded after {}s", index + 1, turn.elapsed_secs())
            }
            SessionNotice::TranscriptTruncated { len } => println!("   ⏮️ transcript back to {} answers", len),
            SessionNotice::CaptureStopped { reason } => {
                println!("   🎤 microphone closed ({:?}); type :resume to reopen", reason)
            }
            SessionNotice::Completed { reason, turns, .. } => {
                println!("   🏁 {:?} after {} answers; generating feedback…", reason, turns)
            }
        }
    }
}

async fn read_stdin(handle: SessionHandle, feed: RecognizerFeed) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let sent = match line {
            ":next" => handle.next(),
            ":skip" => handle.skip(),
            ":back" => handle.previous(),
            ":end" => handle.end(),
            ":resume" => handle.resume(),
            _ => {
                if let Some(text) = line.strip_prefix(":edit ") {
                    handle.edit_draft(text, None)
                } else if let Some(text) = line.strip_prefix('~') {
                    feed.interim_text(text);
                    Ok(())
                } else {
                    if !feed.final_text(line) {
                        println!("   (microphone is closed; wait for the prompt to finish)");
                    }
                    Ok(())
                }
            }
        };
        if sent.is_err() {
            break;
        }
    }
}
