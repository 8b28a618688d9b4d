use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

/// Upper bound on a single listen, in line with the kiosk's five second prompt window.
pub const DEFAULT_LISTEN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpeechError {
    #[error("timed out waiting for speech")]
    Timeout,
    #[error("no intelligible speech in the captured audio")]
    NoSpeech,
    #[error("speech service error: {0}")]
    Service(String),
}

// One bounded listen-and-transcribe operation. Implementations own the
// microphone for the duration of the call; the session never issues two
// listens at once.
#[async_trait]
#[cfg_attr(test, automock)]
pub trait SpeechRecognizer: Send + Sync {
    async fn listen(&self, timeout: Duration) -> Result<String, SpeechError>;
}
