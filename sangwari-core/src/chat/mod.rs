//! Text chat with the assistant.
//!
//! [`ChatSession`] keeps the transcript and replays a bounded window of it to
//! a [`CompletionClient`] on every message. Failures never surface to the
//! user as errors: the session answers with a fixed apology instead.

pub mod gemini;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::error::Result;

pub use gemini::GeminiChatClient;

/// First message of every chat.
pub const GREETING: &str = "Jai Johar! Main Sangwari haan. Tumar ka sewa kar sakat ho?";

/// Reply used when the completion call fails.
pub const FALLBACK_REPLY: &str = "Maaf karna sangwari, kuch gadbad ho gaya. Phir se bolo?";

/// Default number of prior turns replayed with each message.
pub const DEFAULT_MAX_HISTORY_TURNS: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Model => "model",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatTurn {
    pub role: Role,
    pub text: String,
    /// Unix epoch milliseconds.
    pub timestamp_ms: i64,
}

impl ChatTurn {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Single-shot text completion over a conversation.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Reply to `message` given the prior `history` (oldest first).
    ///
    /// # Errors
    /// `VoiceError::Completion` on transport or service failure.
    async fn complete(&self, history: &[ChatTurn], message: &str) -> Result<String>;
}

pub struct ChatSession<C: CompletionClient> {
    client: C,
    turns: Vec<ChatTurn>,
    max_history_turns: usize,
}

impl<C: CompletionClient> ChatSession<C> {
    pub fn new(client: C) -> Self {
        Self::with_history_limit(client, DEFAULT_MAX_HISTORY_TURNS)
    }

    pub fn with_history_limit(client: C, max_history_turns: usize) -> Self {
        Self {
            client,
            turns: vec![ChatTurn::new(Role::Model, GREETING)],
            max_history_turns,
        }
    }

    /// Full transcript, greeting included.
    pub fn turns(&self) -> &[ChatTurn] {
        &self.turns
    }

    /// Send one user message and return the reply turn.
    ///
    /// Blank input is ignored and returns `None`.
    pub async fn send(&mut self, text: &str) -> Option<&ChatTurn> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }

        let start = self.turns.len().saturating_sub(self.max_history_turns);
        // Only a failed request gets the fallback; an empty reply is kept.
        let reply = match self.client.complete(&self.turns[start..], text).await {
            Ok(reply) => {
                if reply.trim().is_empty() {
                    debug!("completion returned no text");
                }
                reply
            }
            Err(e) => {
                error!("chat completion failed: {e}");
                FALLBACK_REPLY.to_string()
            }
        };

        self.turns.push(ChatTurn::new(Role::User, text));
        self.turns.push(ChatTurn::new(Role::Model, reply));
        self.turns.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VoiceError;
    use parking_lot::Mutex;

    /// Records every call and answers from a script.
    #[derive(Default)]
    struct ScriptedClient {
        calls: Mutex<Vec<(Vec<(Role, String)>, String)>>,
        fail: bool,
        silent: bool,
    }

    #[async_trait]
    impl CompletionClient for ScriptedClient {
        async fn complete(&self, history: &[ChatTurn], message: &str) -> Result<String> {
            let seen = history.iter().map(|t| (t.role, t.text.clone())).collect();
            self.calls.lock().push((seen, message.to_string()));
            if self.fail {
                return Err(VoiceError::Completion("quota exceeded".into()));
            }
            if self.silent {
                return Ok(String::new());
            }
            Ok(format!("echo: {message}"))
        }
    }

    #[tokio::test]
    async fn starts_with_greeting_and_replays_history_in_order() {
        let mut session = ChatSession::new(ScriptedClient::default());
        assert_eq!(session.turns().len(), 1);
        assert_eq!(session.turns()[0].text, GREETING);

        let reply = session.send("  hello  ").await.unwrap().text.clone();
        assert_eq!(reply, "echo: hello");
        session.send("second").await.unwrap();

        let calls = session.client.calls.lock();
        assert_eq!(calls[0].0, vec![(Role::Model, GREETING.to_string())]);
        assert_eq!(calls[0].1, "hello");
        let roles: Vec<_> = calls[1].0.iter().map(|(r, _)| *r).collect();
        assert_eq!(roles, vec![Role::Model, Role::User, Role::Model]);
        assert_eq!(calls[1].1, "second");
        drop(calls);

        assert_eq!(session.turns().len(), 5);
    }

    #[tokio::test]
    async fn blank_input_is_ignored() {
        let mut session = ChatSession::new(ScriptedClient::default());
        assert!(session.send("   \n").await.is_none());
        assert_eq!(session.turns().len(), 1);
        assert!(session.client.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn failure_answers_with_fallback() {
        let client = ScriptedClient {
            fail: true,
            ..ScriptedClient::default()
        };
        let mut session = ChatSession::new(client);
        let reply = session.send("kaise ho").await.unwrap();
        assert_eq!(reply.role, Role::Model);
        assert_eq!(reply.text, FALLBACK_REPLY);
        assert_eq!(session.turns()[1].text, "kaise ho");
    }

    #[tokio::test]
    async fn empty_reply_is_kept_as_is() {
        let client = ScriptedClient {
            silent: true,
            ..ScriptedClient::default()
        };
        let mut session = ChatSession::new(client);
        let reply = session.send("hmm").await.unwrap();
        assert_eq!(reply.role, Role::Model);
        assert_eq!(reply.text, "");
        assert_eq!(session.turns().len(), 3);
    }

    #[tokio::test]
    async fn history_window_keeps_newest_turns() {
        let mut session = ChatSession::with_history_limit(ScriptedClient::default(), 2);
        session.send("one").await;
        session.send("two").await;
        session.send("three").await;

        let calls = session.client.calls.lock();
        let last = &calls[2].0;
        assert_eq!(
            last,
            &vec![
                (Role::User, "two".to_string()),
                (Role::Model, "echo: two".to_string())
            ]
        );
    }

    #[test]
    fn turn_serializes_camel_case() {
        let turn = ChatTurn {
            role: Role::User,
            text: "hi".into(),
            timestamp_ms: 7,
        };
        let json = serde_json::to_string(&turn).unwrap();
        assert_eq!(json, r#"{"role":"user","text":"hi","timestampMs":7}"#);
    }
}
