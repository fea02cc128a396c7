use std::collections::HashMap;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use futures_util::future::join_all;
use serde::Deserialize;
use thiserror::Error;
use tracing::{trace, warn};
use uuid::Uuid;

use parley_types::events::ServerEvent;

use crate::calls::{CallState, TranslationPreference};
use crate::error::GatewayError;
use crate::{ConnCtx, Coordinator};

#[derive(Debug, Error)]
#[error("{0}")]
pub struct TranslationFailure(pub String);

/// External transcription/translation collaborator. One invocation turns an
/// audio chunk into caption text in the requested target language.
#[async_trait]
pub trait Translator: Send + Sync {
    async fn transcribe_and_translate(
        &self,
        audio: Vec<u8>,
        source_language: Option<String>,
        target_language: String,
    ) -> Result<String, TranslationFailure>;
}

/// HTTP-backed translator. An unconfigured endpoint reports unavailability
/// per request instead of failing startup, so chat and calls keep working
/// without the collaborator.
pub struct HttpTranslator {
    client: reqwest::Client,
    endpoint: Option<String>,
}

#[derive(Deserialize)]
struct CaptionResponse {
    caption: String,
}

impl HttpTranslator {
    pub fn new(endpoint: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }
}

#[async_trait]
impl Translator for HttpTranslator {
    async fn transcribe_and_translate(
        &self,
        audio: Vec<u8>,
        source_language: Option<String>,
        target_language: String,
    ) -> Result<String, TranslationFailure> {
        let Some(endpoint) = &self.endpoint else {
            return Err(TranslationFailure(
                "Translation service is unavailable.".into(),
            ));
        };

        let body = serde_json::json!({
            "audio": B64.encode(&audio),
            "source_language": source_language.unwrap_or_else(|| "auto".into()),
            "target_language": target_language,
        });

        let response = self
            .client
            .post(endpoint)
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| {
                warn!("Translation request failed: {}", e);
                TranslationFailure("Unable to complete translation request.".into())
            })?;

        let parsed: CaptionResponse = response.json().await.map_err(|e| {
            warn!("Malformed translation response: {}", e);
            TranslationFailure("Unable to complete translation request.".into())
        })?;
        Ok(parsed.caption)
    }
}

impl Coordinator {
    /// Register or update a participant's caption preference for a call.
    pub async fn set_translation_preferences(
        &self,
        ctx: &ConnCtx,
        call_id: Uuid,
        enabled: bool,
        target_language: String,
        source_language: Option<String>,
    ) -> Result<(), GatewayError> {
        let target_language = target_language.trim().to_string();
        if enabled && target_language.is_empty() {
            return Err(GatewayError::validation("Target language is required."));
        }

        self.calls()
            .set_preference(
                call_id,
                ctx.user_id,
                TranslationPreference {
                    enabled,
                    target_language,
                    source_language,
                },
            )
            .await
    }

    /// Turn one audio chunk into captions for every participant that asked
    /// for them. The collaborator is invoked once per distinct target
    /// language, not once per participant; a collaborator failure surfaces
    /// as a session-scoped `translation_error` and never touches the call.
    pub async fn relay_transcription_chunk(
        &self,
        ctx: &ConnCtx,
        call_id: Uuid,
        audio_chunk: String,
        source_language: Option<String>,
    ) -> Result<(), GatewayError> {
        // Stragglers after hangup are dropped like late ICE candidates.
        let Some(session) = self.calls().get(call_id).await else {
            return Ok(());
        };
        if !session.is_participant(ctx.user_id) {
            return Err(GatewayError::session("You are not part of this call."));
        }
        if session.state != CallState::Active {
            return Ok(());
        }

        let audio = B64
            .decode(&audio_chunk)
            .map_err(|_| GatewayError::validation("Invalid audio chunk encoding."))?;
        trace!(
            "{} ({}) audio chunk for call {} ({} bytes)",
            ctx.username,
            ctx.user_id,
            call_id,
            audio.len()
        );

        // Group caption recipients by target language so each language is
        // translated exactly once.
        let mut by_language: HashMap<String, Vec<Uuid>> = HashMap::new();
        for (user_id, pref) in session.prefs.iter().filter(|(_, p)| p.enabled) {
            by_language
                .entry(pref.target_language.clone())
                .or_default()
                .push(*user_id);
        }
        if by_language.is_empty() {
            return Ok(());
        }

        let hint = source_language.or_else(|| {
            session
                .prefs
                .get(&ctx.user_id)
                .and_then(|p| p.source_language.clone())
        });

        let translator = self.translator().clone();
        let jobs = by_language.into_iter().map(|(language, recipients)| {
            let translator = translator.clone();
            let audio = audio.clone();
            let hint = hint.clone();
            async move {
                let result = translator
                    .transcribe_and_translate(audio, hint, language.clone())
                    .await;
                (language, recipients, result)
            }
        });

        let mut failure = None;
        for (language, recipients, result) in join_all(jobs).await {
            match result {
                Ok(caption) => {
                    for user_id in recipients {
                        self.presence()
                            .send_to_identity(
                                user_id,
                                None,
                                ServerEvent::TranslatedCaption {
                                    session_id: call_id,
                                    speaker_id: ctx.user_id,
                                    language: language.clone(),
                                    caption: caption.clone(),
                                },
                            )
                            .await;
                    }
                }
                Err(e) => failure = Some(e),
            }
        }

        // One error event per chunk, delivered to both participants —
        // the session is the failure domain.
        if let Some(TranslationFailure(error)) = failure {
            let event = ServerEvent::TranslationError {
                session_id: call_id,
                error,
            };
            self.presence()
                .send_to_identity(session.caller, None, event.clone())
                .await;
            self.presence()
                .send_to_identity(session.callee, None, event)
                .await;
        }

        Ok(())
    }
}
