//! Audio output for synthesized bot speech.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::{VoiceError, VoiceResult};

/// Plays encoded audio. `play` resolves when playback has finished.
#[async_trait]
pub trait AudioOutput: Send + Sync {
    async fn play(&self, audio: Arc<Vec<u8>>) -> VoiceResult<()>;

    /// Cut playback short. Safe to call when nothing is playing.
    fn stop(&self);
}

/// No audio device. Every `play` fails, so the speech player falls back to a timed estimate.
#[derive(Debug, Default)]
pub struct NullOutput;

#[async_trait]
impl AudioOutput for NullOutput {
    async fn play(&self, _audio: Arc<Vec<u8>>) -> VoiceResult<()> {
        Err(VoiceError::Playback("no audio output configured".to_string()))
    }

    fn stop(&self) {}
}

#[cfg(feature = "playback")]
pub use rodio_output::RodioOutput;

#[cfg(feature = "playback")]
mod rodio_output {
    use super::*;
    use rodio::{OutputStream, Sink, Source};
    use std::io::Cursor;
    use std::sync::Mutex;
    use tracing::info;

    /// Default output device through `rodio`.
    ///
    /// `OutputStream` is not `Send`, so each utterance opens the device on a
    /// blocking thread and parks there until the sink drains. The live sink is
    /// shared so `stop` can silence it from the event loop.
    #[derive(Default)]
    pub struct RodioOutput {
        current: Arc<Mutex<Option<Arc<Sink>>>>,
    }

    impl RodioOutput {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl AudioOutput for RodioOutput {
        async fn play(&self, audio: Arc<Vec<u8>>) -> VoiceResult<()> {
            if audio.is_empty() {
                return Ok(());
            }
            let slot = Arc::clone(&self.current);
            tokio::task::spawn_blocking(move || -> VoiceResult<()> {
                let (_stream, handle) =
                    OutputStream::try_default().map_err(|e| VoiceError::Playback(e.to_string()))?;
                let sink = Arc::new(Sink::try_new(&handle).map_err(|e| VoiceError::Playback(e.to_string()))?);
                let source = rodio::Decoder::new(Cursor::new(audio.as_ref().clone()))
                    .map_err(|e| VoiceError::Playback(format!("Decode failed: {}", e)))?;
                sink.append(source.convert_samples::<f32>());
                if let Ok(mut current) = slot.lock() {
                    *current = Some(Arc::clone(&sink));
                }
                sink.sleep_until_end();
                if let Ok(mut current) = slot.lock() {
                    *current = None;
                }
                Ok(())
            })
            .await
            .map_err(|e| VoiceError::Playback(format!("playback task failed: {}", e)))?
        }

        fn stop(&self) {
            if let Ok(mut current) = self.current.lock() {
                if let Some(sink) = current.take() {
                    sink.stop();
                    info!("🔇 bot speech interrupted");
                }
            }
        }
    }
}
