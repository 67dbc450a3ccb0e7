//! **Bot speech**: voice a prompt and report when it is done.
//!
//! Each utterance runs in its own task: synthesize (through a small cache),
//! report `Started`, play, report `Ended` or `Failed`. Whatever goes wrong, an
//! end is always reported: silent or unplayable audio falls back to waiting an
//! estimate based on text length, and a watchdog bounds playback that never
//! finishes. `stop` cancels the task outright, so a cancelled utterance
//! reports nothing.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use coach_core::SessionSettings;

use crate::error::VoiceResult;
use crate::event::SessionEvent;
use crate::output::AudioOutput;
use crate::tts::SpeechSynthesizer;

/// Extra time allowed on top of three estimates before playback is abandoned.
const WATCHDOG_SLACK: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UtteranceId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpeechEventKind {
    Started,
    Ended,
    /// The utterance is over, but synthesis or playback failed along the way.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeechEvent {
    pub utterance: UtteranceId,
    pub kind: SpeechEventKind,
}

impl SpeechEvent {
    /// Whether the bot has stopped talking after this event.
    pub fn is_finished(&self) -> bool {
        !matches!(self.kind, SpeechEventKind::Started)
    }
}

/// Bounded `(voice, text)` → audio cache. Once full, new entries are not stored.
pub struct SynthesisCache {
    entries: DashMap<(String, String), Arc<Vec<u8>>>,
    capacity: usize,
}

impl SynthesisCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub async fn get_or_synthesize(
        &self,
        synthesizer: &dyn SpeechSynthesizer,
        voice: &str,
        text: &str,
    ) -> VoiceResult<Arc<Vec<u8>>> {
        let key = (voice.to_string(), text.to_string());
        if let Some(hit) = self.entries.get(&key) {
            debug!(chars = text.len(), "synthesis cache hit");
            return Ok(Arc::clone(hit.value()));
        }

        let audio = Arc::new(synthesizer.synthesize(voice, text).await?);
        if !audio.is_empty() && self.entries.len() < self.capacity {
            self.entries.insert(key, Arc::clone(&audio));
        }
        Ok(audio)
    }
}

fn watchdog(estimate: Duration) -> Duration {
    estimate * 3 + WATCHDOG_SLACK
}

pub struct BotSpeechPlayer {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    output: Arc<dyn AudioOutput>,
    cache: Arc<SynthesisCache>,
    voice: String,
    settings: SessionSettings,
    inbox: mpsc::UnboundedSender<SessionEvent>,
    current: Option<(UtteranceId, CancellationToken)>,
    next_id: u64,
}

impl BotSpeechPlayer {
    pub fn new(
        synthesizer: Arc<dyn SpeechSynthesizer>,
        output: Arc<dyn AudioOutput>,
        voice: impl Into<String>,
        settings: &SessionSettings,
        inbox: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            synthesizer,
            output,
            cache: Arc::new(SynthesisCache::new(settings.synthesis_cache_entries)),
            voice: voice.into(),
            settings: settings.clone(),
            inbox,
            current: None,
            next_id: 1,
        }
    }

    /// Start voicing `text`, interrupting anything already playing.
    pub fn speak(&mut self, text: &str) -> UtteranceId {
        self.stop();

        let id = UtteranceId(self.next_id);
        self.next_id += 1;
        let token = CancellationToken::new();
        self.current = Some((id, token.clone()));

        let task = Utterance {
            id,
            text: text.to_string(),
            voice: self.voice.clone(),
            estimate: self.settings.speech_estimate(text),
            synthesizer: Arc::clone(&self.synthesizer),
            output: Arc::clone(&self.output),
            cache: Arc::clone(&self.cache),
            inbox: self.inbox.clone(),
        };
        info!("🗣️ speaking utterance {} ({} chars)", id.0, text.chars().count());
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => debug!(utterance = id.0, "utterance cancelled"),
                _ = task.run() => {}
            }
        });
        id
    }

    /// Silence the bot. Idempotent.
    pub fn stop(&mut self) {
        if let Some((id, token)) = self.current.take() {
            token.cancel();
            self.output.stop();
            debug!(utterance = id.0, "bot speech stopped");
        }
    }

    /// Forget the finished utterance without touching the output.
    pub fn finished(&mut self, id: UtteranceId) {
        if matches!(self.current, Some((current, _)) if current == id) {
            self.current = None;
        }
    }

    pub fn current(&self) -> Option<UtteranceId> {
        self.current.as_ref().map(|(id, _)| *id)
    }

    pub fn cache(&self) -> &SynthesisCache {
        &self.cache
    }
}

impl Drop for BotSpeechPlayer {
    fn drop(&mut self) {
        if let Some((_, token)) = self.current.take() {
            token.cancel();
        }
    }
}

struct Utterance {
    id: UtteranceId,
    text: String,
    voice: String,
    estimate: Duration,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    output: Arc<dyn AudioOutput>,
    cache: Arc<SynthesisCache>,
    inbox: mpsc::UnboundedSender<SessionEvent>,
}

impl Utterance {
    fn report(&self, kind: SpeechEventKind) {
        let _ = self.inbox.send(SessionEvent::Speech(SpeechEvent {
            utterance: self.id,
            kind,
        }));
    }

    async fn run(self) {
        let audio = self
            .cache
            .get_or_synthesize(self.synthesizer.as_ref(), &self.voice, &self.text)
            .await;
        self.report(SpeechEventKind::Started);

        let outcome = match audio {
            Ok(audio) if audio.is_empty() => {
                debug!(utterance = self.id.0, estimate = ?self.estimate, "no audio; waiting estimated duration");
                tokio::time::sleep(self.estimate).await;
                SpeechEventKind::Ended
            }
            Ok(audio) => match tokio::time::timeout(watchdog(self.estimate), self.output.play(audio)).await {
                Ok(Ok(())) => SpeechEventKind::Ended,
                Ok(Err(e)) => {
                    warn!(utterance = self.id.0, error = %e, "playback failed; waiting estimated duration");
                    tokio::time::sleep(self.estimate).await;
                    SpeechEventKind::Failed(e.to_string())
                }
                Err(_) => {
                    warn!(utterance = self.id.0, "playback watchdog expired");
                    self.output.stop();
                    SpeechEventKind::Failed("playback never finished".to_string())
                }
            },
            Err(e) => {
                warn!(utterance = self.id.0, error = %e, "synthesis failed; waiting estimated duration");
                tokio::time::sleep(self.estimate).await;
                SpeechEventKind::Failed(e.to_string())
            }
        };
        self.report(outcome);
    }
}
