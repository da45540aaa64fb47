//! JSON messages of the live session socket.
//!
//! Client → server: one `setup` message, then `realtimeInput` audio chunks.
//! Server → client: `setupComplete`, then `serverContent` carrying audio
//! parts, `interrupted`, and `turnComplete` flags. Unknown fields and message
//! kinds are ignored.

use serde::{Deserialize, Serialize};

use super::{SessionConfig, TransportEvent};
use crate::{
    codec::WireChunk,
    error::{Result, VoiceError},
};

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupMessage<'a> {
    setup: Setup<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Setup<'a> {
    model: &'a str,
    generation_config: GenerationConfig<'a>,
    system_instruction: Content<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig<'a> {
    response_modalities: [&'static str; 1],
    speech_config: SpeechConfig<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig<'a> {
    voice_config: VoiceConfig<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig<'a> {
    prebuilt_voice_config: PrebuiltVoice<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoice<'a> {
    voice_name: &'a str,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    parts: [TextPart<'a>; 1],
}

#[derive(Debug, Serialize)]
struct TextPart<'a> {
    text: &'a str,
}

impl<'a> SetupMessage<'a> {
    pub fn new(config: &'a SessionConfig) -> Self {
        Self {
            setup: Setup {
                model: &config.model,
                generation_config: GenerationConfig {
                    response_modalities: ["AUDIO"],
                    speech_config: SpeechConfig {
                        voice_config: VoiceConfig {
                            prebuilt_voice_config: PrebuiltVoice {
                                voice_name: &config.voice,
                            },
                        },
                    },
                },
                system_instruction: Content {
                    parts: [TextPart {
                        text: &config.system_instruction,
                    }],
                },
            },
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInputMessage<'a> {
    realtime_input: RealtimeInput<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput<'a> {
    media_chunks: [MediaChunk<'a>; 1],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MediaChunk<'a> {
    mime_type: &'a str,
    data: &'a str,
}

impl<'a> RealtimeInputMessage<'a> {
    pub fn new(chunk: &'a WireChunk) -> Self {
        Self {
            realtime_input: RealtimeInput {
                media_chunks: [MediaChunk {
                    mime_type: &chunk.mime_type,
                    data: &chunk.data,
                }],
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<ServerContent>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    #[serde(default)]
    interrupted: bool,
    #[serde(default)]
    turn_complete: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    data: String,
}

/// Translate one server message into transport events.
///
/// Within a message, audio parts come first (in part order), then
/// `Interrupted`, then `TurnComplete`. Parts without audio are skipped.
///
/// # Errors
/// `VoiceError::Protocol` when the text is not a server message object.
pub fn parse_server_message(text: &str) -> Result<Vec<TransportEvent>> {
    let message: ServerMessage =
        serde_json::from_str(text).map_err(|e| VoiceError::Protocol(e.to_string()))?;
    let mut events = Vec::new();

    if message.setup_complete.is_some() {
        events.push(TransportEvent::Ready);
    }

    if let Some(content) = message.server_content {
        let parts = content.model_turn.map(|turn| turn.parts).unwrap_or_default();
        for part in parts {
            let Some(inline) = part.inline_data else {
                continue;
            };
            if inline.data.is_empty() {
                continue;
            }
            events.push(TransportEvent::AudioChunk(WireChunk::from_inline(
                inline.data,
                inline.mime_type,
            )));
        }
        if content.interrupted {
            events.push(TransportEvent::Interrupted);
        }
        if content.turn_complete {
            events.push(TransportEvent::TurnComplete);
        }
    }

    Ok(events)
}
