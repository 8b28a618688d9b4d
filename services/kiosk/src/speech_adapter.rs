use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use kiosk_core::speech::{SpeechError, SpeechRecognizer};
use kiosk_native_utils::audio::{self, TRANSCRIPTION_SAMPLE_RATE};
use kiosk_native_utils::capture::{self, CaptureError, CaptureSettings};
use reqwest::{Client, multipart};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// Client for an OpenAI-compatible `/audio/transcriptions` endpoint.
pub struct TranscriptionClient {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<SecretString>,
}

impl TranscriptionClient {
    pub fn new(
        base_url: String,
        model: String,
        api_key: Option<SecretString>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .context("Failed to build transcription HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            api_key,
        })
    }

    pub async fn transcribe(&self, wav: Vec<u8>) -> Result<String> {
        let file = multipart::Part::bytes(wav)
            .file_name("utterance.wav")
            .mime_str("audio/wav")?;
        let form = multipart::Form::new()
            .text("model", self.model.clone())
            .part("file", file);

        let mut request = self
            .client
            .post(format!("{}/audio/transcriptions", self.base_url))
            .multipart(form);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }

        let resp = request
            .send()
            .await
            .context("Transcription request failed")?
            .error_for_status()
            .context("Transcription endpoint returned an error status")?
            .json::<TranscriptionResponse>()
            .await
            .context("Failed to decode transcription response")?;
        Ok(resp.text)
    }
}

/// Listens on the local microphone and transcribes one utterance remotely.
pub struct MicrophoneRecognizer {
    device: Option<String>,
    capture: CaptureSettings,
    transcriber: TranscriptionClient,
}

impl MicrophoneRecognizer {
    pub fn new(device: Option<String>, transcriber: TranscriptionClient) -> Self {
        Self {
            device,
            capture: CaptureSettings::default(),
            transcriber,
        }
    }

    pub fn capture_settings(&self) -> &CaptureSettings {
        &self.capture
    }
}

#[async_trait]
impl SpeechRecognizer for MicrophoneRecognizer {
    async fn listen(&self, timeout: Duration) -> Result<String, SpeechError> {
        let device = self.device.clone();
        let settings = self.capture.clone();

        let wav = tokio::task::spawn_blocking(move || record_wav(device, &settings, timeout))
            .await
            .map_err(|e| SpeechError::Service(format!("capture task failed: {e}")))??;

        let text = self
            .transcriber
            .transcribe(wav)
            .await
            .map_err(|e| SpeechError::Service(format!("{e:#}")))?;
        let text = non_empty_transcript(&text)?;
        tracing::info!("Heard: {:?}", text);
        Ok(text)
    }
}

fn record_wav(
    device: Option<String>,
    settings: &CaptureSettings,
    timeout: Duration,
) -> Result<Vec<u8>, SpeechError> {
    let utterance = capture::record_utterance(device, settings, timeout).map_err(capture_error)?;
    let wav = audio::resample(
        &utterance.samples,
        utterance.sample_rate,
        TRANSCRIPTION_SAMPLE_RATE,
    )
    .and_then(|samples| audio::encode_wav(&samples, TRANSCRIPTION_SAMPLE_RATE))
    .map_err(|e| SpeechError::Service(format!("failed to encode recording: {e:#}")))?;
    Ok(wav)
}

fn capture_error(e: CaptureError) -> SpeechError {
    match e {
        CaptureError::Timeout => SpeechError::Timeout,
        CaptureError::Device(e) => SpeechError::Service(format!("{e:#}")),
    }
}

fn non_empty_transcript(text: &str) -> Result<String, SpeechError> {
    let text = text.trim();
    if text.is_empty() {
        Err(SpeechError::NoSpeech)
    } else {
        Ok(text.to_string())
    }
}
