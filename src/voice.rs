//! Voice transcoding adapter: speech-to-text and text-to-speech via hosted
//! cloud APIs.
//!
//! Both conversions are delegated entirely to the speech service. The
//! adapter is constructed disabled when no credentials are configured, and
//! transport layers check `enabled()` before routing voice messages — a
//! missing key never crashes the voice path, it just refuses it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::config::ServerConfig;

const STT_ENDPOINT: &str = "https://speech.googleapis.com/v1/speech:recognize";
const TTS_ENDPOINT: &str = "https://texttospeech.googleapis.com/v1/text:synthesize";

/// Inbound audio format: mono 16 kHz linear PCM.
const INPUT_SAMPLE_RATE_HZ: u32 = 16_000;

/// Voice-specific failures, kept distinct so a client can fall back to text.
#[derive(Debug, Error)]
pub enum VoiceError {
    #[error("transcription failed: {0}")]
    Transcription(String),
    #[error("speech synthesis failed: {0}")]
    Synthesis(String),
    #[error("voice support is disabled")]
    Disabled,
}

/// Speech service seam: audio → text and text → audio.
#[async_trait]
pub trait SpeechClient: Send + Sync {
    /// Transcribe mono 16 kHz LINEAR16 PCM to text. An empty transcript is
    /// an error — it must never be mistaken for "the user said nothing".
    async fn transcribe(&self, audio: &[u8]) -> Result<String, VoiceError>;

    /// Synthesize text as compressed audio with the given voice.
    async fn synthesize(&self, text: &str, voice: &str) -> Result<Vec<u8>, VoiceError>;
}

// ---------------------------------------------------------------------------
// Hosted speech client
// ---------------------------------------------------------------------------

pub struct CloudSpeechClient {
    client: reqwest::Client,
    api_key: String,
    stt_url: String,
    tts_url: String,
}

impl CloudSpeechClient {
    pub fn new(api_key: &str, timeout: Duration) -> Self {
        Self::with_endpoints(api_key, STT_ENDPOINT, TTS_ENDPOINT, timeout)
    }

    /// Point the client at different endpoints (tests use a local stub).
    pub fn with_endpoints(api_key: &str, stt_url: &str, tts_url: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to create HTTP client");

        Self {
            client,
            api_key: api_key.to_string(),
            stt_url: stt_url.to_string(),
            tts_url: tts_url.to_string(),
        }
    }
}

#[derive(Deserialize)]
struct RecognizeResponse {
    #[serde(default)]
    results: Vec<RecognizeResult>,
}

#[derive(Deserialize)]
struct RecognizeResult {
    #[serde(default)]
    alternatives: Vec<RecognizeAlternative>,
}

#[derive(Deserialize)]
struct RecognizeAlternative {
    transcript: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SynthesizeResponse {
    audio_content: String,
}

#[async_trait]
impl SpeechClient for CloudSpeechClient {
    async fn transcribe(&self, audio: &[u8]) -> Result<String, VoiceError> {
        let body = json!({
            "config": {
                "encoding": "LINEAR16",
                "sampleRateHertz": INPUT_SAMPLE_RATE_HZ,
                "languageCode": "en-US",
            },
            "audio": {
                "content": base64::engine::general_purpose::STANDARD.encode(audio),
            },
        });

        let response = self
            .client
            .post(&self.stt_url)
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(|e| VoiceError::Transcription(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VoiceError::Transcription(format!("status {status}: {body}")));
        }

        let parsed: RecognizeResponse = response
            .json()
            .await
            .map_err(|e| VoiceError::Transcription(e.to_string()))?;

        let transcript = parsed
            .results
            .iter()
            .filter_map(|r| r.alternatives.first())
            .map(|a| a.transcript.as_str())
            .collect::<Vec<_>>()
            .join(" ");

        if transcript.trim().is_empty() {
            return Err(VoiceError::Transcription("empty transcript".into()));
        }
        Ok(transcript)
    }

    async fn synthesize(&self, text: &str, voice: &str) -> Result<Vec<u8>, VoiceError> {
        let body = json!({
            "input": {"text": text},
            "voice": {"languageCode": "en-US", "name": voice},
            "audioConfig": {"audioEncoding": "MP3"},
        });

        let response = self
            .client
            .post(&self.tts_url)
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(|e| VoiceError::Synthesis(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VoiceError::Synthesis(format!("status {status}: {body}")));
        }

        let parsed: SynthesizeResponse = response
            .json()
            .await
            .map_err(|e| VoiceError::Synthesis(e.to_string()))?;

        base64::engine::general_purpose::STANDARD
            .decode(&parsed.audio_content)
            .map_err(|e| VoiceError::Synthesis(format!("bad audio payload: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// The voice feature as seen by the transport layer.
///
/// Wraps an optional speech client; when constructed without one the
/// feature is observably disabled and both conversions fail with
/// `VoiceError::Disabled`.
pub struct VoiceAdapter {
    client: Option<Arc<dyn SpeechClient>>,
    voice: String,
}

impl VoiceAdapter {
    pub fn new(client: Arc<dyn SpeechClient>, voice: &str) -> Self {
        Self {
            client: Some(client),
            voice: voice.to_string(),
        }
    }

    pub fn disabled() -> Self {
        Self {
            client: None,
            voice: String::new(),
        }
    }

    /// Build from configuration: enabled only when a speech key is present.
    pub fn from_config(config: &ServerConfig) -> Self {
        match &config.speech_api_key {
            Some(key) => {
                tracing::info!(voice = %config.speech_voice, "Voice transcoding enabled");
                Self::new(
                    Arc::new(CloudSpeechClient::new(key, config.upstream_timeout)),
                    &config.speech_voice,
                )
            }
            None => {
                tracing::info!("No speech API key configured, voice transcoding disabled");
                Self::disabled()
            }
        }
    }

    pub fn enabled(&self) -> bool {
        self.client.is_some()
    }

    /// Decode a base64 audio chunk and transcribe it.
    pub async fn transcribe(&self, audio_base64: &str) -> Result<String, VoiceError> {
        let client = self.client.as_ref().ok_or(VoiceError::Disabled)?;
        let audio = base64::engine::general_purpose::STANDARD
            .decode(audio_base64)
            .map_err(|e| VoiceError::Transcription(format!("invalid base64 audio: {e}")))?;
        client.transcribe(&audio).await
    }

    /// Synthesize response text, returning base64 audio for the wire.
    pub async fn synthesize(&self, text: &str) -> Result<String, VoiceError> {
        let client = self.client.as_ref().ok_or(VoiceError::Disabled)?;
        let audio = client.synthesize(text, &self.voice).await?;
        Ok(base64::engine::general_purpose::STANDARD.encode(audio))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoSpeech;

    #[async_trait]
    impl SpeechClient for EchoSpeech {
        async fn transcribe(&self, audio: &[u8]) -> Result<String, VoiceError> {
            Ok(format!("transcript of {} bytes", audio.len()))
        }

        async fn synthesize(&self, text: &str, _voice: &str) -> Result<Vec<u8>, VoiceError> {
            Ok(text.as_bytes().to_vec())
        }
    }

    struct SilentSpeech;

    #[async_trait]
    impl SpeechClient for SilentSpeech {
        async fn transcribe(&self, _audio: &[u8]) -> Result<String, VoiceError> {
            Err(VoiceError::Transcription("empty transcript".into()))
        }

        async fn synthesize(&self, _text: &str, _voice: &str) -> Result<Vec<u8>, VoiceError> {
            Err(VoiceError::Synthesis("no audio produced".into()))
        }
    }

    #[tokio::test]
    async fn disabled_adapter_refuses_both_directions() {
        let adapter = VoiceAdapter::disabled();
        assert!(!adapter.enabled());
        assert!(matches!(
            adapter.transcribe("UklGRg==").await,
            Err(VoiceError::Disabled)
        ));
        assert!(matches!(
            adapter.synthesize("hello").await,
            Err(VoiceError::Disabled)
        ));
    }

    #[tokio::test]
    async fn adapter_round_trips_base64() {
        let adapter = VoiceAdapter::new(Arc::new(EchoSpeech), "test-voice");
        assert!(adapter.enabled());

        let audio = base64::engine::general_purpose::STANDARD.encode(b"pcm-bytes");
        let transcript = adapter.transcribe(&audio).await.unwrap();
        assert_eq!(transcript, "transcript of 9 bytes");

        let synthesized = adapter.synthesize("hi").await.unwrap();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(synthesized)
            .unwrap();
        assert_eq!(decoded, b"hi");
    }

    #[tokio::test]
    async fn invalid_base64_is_a_transcription_error() {
        let adapter = VoiceAdapter::new(Arc::new(EchoSpeech), "test-voice");
        assert!(matches!(
            adapter.transcribe("not base64 !!!").await,
            Err(VoiceError::Transcription(_))
        ));
    }

    #[tokio::test]
    async fn empty_transcript_surfaces_as_an_error() {
        let adapter = VoiceAdapter::new(Arc::new(SilentSpeech), "test-voice");
        let err = adapter
            .transcribe(&base64::engine::general_purpose::STANDARD.encode(b"audio"))
            .await
            .unwrap_err();
        assert!(matches!(err, VoiceError::Transcription(_)));
    }

    #[tokio::test]
    async fn from_config_tracks_key_presence() {
        let adapter = VoiceAdapter::from_config(&ServerConfig::default());
        assert!(!adapter.enabled());

        let adapter = VoiceAdapter::from_config(&ServerConfig {
            speech_api_key: Some("key".into()),
            ..ServerConfig::default()
        });
        assert!(adapter.enabled());
    }
}
