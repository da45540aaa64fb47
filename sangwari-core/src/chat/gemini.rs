//! `generateContent` client for text chat.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ChatTurn, CompletionClient};
use crate::error::{Result, VoiceError};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_CHAT_MODEL: &str = "gemini-2.5-flash";

/// Persona for text chat.
pub const CHAT_PERSONA: &str = "You are Sangwari, a friendly AI companion from Chhattisgarh, India.
Your personality is warm, casual, and helpful.
Language rules:
1. Speak primarily in a mix of Hindi and Chhattisgarhi (Hinglish/Chhattisgarhi transliteration is fine).
2. Use Chhattisgarhi greetings like \"Jai Johar\", \"Sangwari\", \"Ka haal he?\".
3. Keep responses short and conversational (maximum 2-3 sentences).
4. Do not be overly formal. Be like a village friend.

General Information:
1. You are created by Tanmay, Gyanendra, Vishal, Rimee, a developer group from Chhattisgarh.";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    system_instruction: Content<'a>,
    contents: Vec<Content<'a>>,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: [TextPart<'a>; 1],
}

#[derive(Debug, Serialize)]
struct TextPart<'a> {
    text: &'a str,
}

impl<'a> Content<'a> {
    fn text(role: Option<&'static str>, text: &'a str) -> Self {
        Self {
            role,
            parts: [TextPart { text }],
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Default, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Default, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Default, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

fn build_request<'a>(
    persona: &'a str,
    history: &'a [ChatTurn],
    message: &'a str,
) -> GenerateRequest<'a> {
    let mut contents: Vec<Content<'a>> = history
        .iter()
        .map(|turn| Content::text(Some(turn.role.as_str()), &turn.text))
        .collect();
    contents.push(Content::text(Some("user"), message));
    GenerateRequest {
        system_instruction: Content::text(None, persona),
        contents,
    }
}

/// Concatenated text parts of the first candidate.
fn reply_text(response: GenerateResponse) -> Result<String> {
    let candidate = response
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| VoiceError::Completion("response has no candidates".into()))?;
    Ok(candidate
        .content
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default())
}

pub struct GeminiChatClient {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    persona: String,
}

impl GeminiChatClient {
    /// # Errors
    /// `VoiceError::Completion` if the key is empty.
    pub fn new(api_key: String) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(VoiceError::Completion("an API key is required for chat".into()));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            model: DEFAULT_CHAT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            persona: CHAT_PERSONA.to_string(),
        })
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.base_url, self.model)
    }
}

#[async_trait]
impl CompletionClient for GeminiChatClient {
    async fn complete(&self, history: &[ChatTurn], message: &str) -> Result<String> {
        let request = build_request(&self.persona, history, message);
        debug!(model = self.model.as_str(), turns = history.len(), "chat completion request");

        let response = self
            .client
            .post(self.endpoint())
            .query(&[("key", self.api_key.as_str())])
            .json(&request)
            .send()
            .await
            .map_err(|e| VoiceError::Completion(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(VoiceError::Completion(format!("{status}: {body}")));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| VoiceError::Completion(format!("invalid response: {e}")))?;
        reply_text(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::Role;
    use serde_json::{json, Value};

    #[test]
    fn request_replays_history_then_message() {
        let history = vec![
            ChatTurn::new(Role::Model, "Jai Johar"),
            ChatTurn::new(Role::User, "hi"),
            ChatTurn::new(Role::Model, "hello"),
        ];
        let value: Value =
            serde_json::to_value(build_request("persona", &history, "how are you")).unwrap();
        assert_eq!(
            value,
            json!({
                "systemInstruction": { "parts": [{ "text": "persona" }] },
                "contents": [
                    { "role": "model", "parts": [{ "text": "Jai Johar" }] },
                    { "role": "user", "parts": [{ "text": "hi" }] },
                    { "role": "model", "parts": [{ "text": "hello" }] },
                    { "role": "user", "parts": [{ "text": "how are you" }] }
                ]
            })
        );
    }

    #[test]
    fn reply_joins_text_parts_of_first_candidate() {
        let response: GenerateResponse = serde_json::from_value(json!({
            "candidates": [
                { "content": { "parts": [{ "text": "Jai " }, { "text": "Johar!" }] } },
                { "content": { "parts": [{ "text": "ignored" }] } }
            ]
        }))
        .unwrap();
        assert_eq!(reply_text(response).unwrap(), "Jai Johar!");
    }

    #[test]
    fn missing_candidates_is_an_error() {
        let response: GenerateResponse = serde_json::from_value(json!({})).unwrap();
        assert!(matches!(reply_text(response), Err(VoiceError::Completion(_))));
    }

    #[test]
    fn empty_key_rejected_and_endpoint_built() {
        assert!(GeminiChatClient::new("  ".into()).is_err());
        let client = GeminiChatClient::new("k".into())
            .unwrap()
            .with_base_url("http://localhost:9/v1/")
            .with_model("m1");
        assert_eq!(client.endpoint(), "http://localhost:9/v1/models/m1:generateContent");
    }
}
