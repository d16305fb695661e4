//! The text-generation capability as seen by the memory layer.
//!
//! `mgl-core` only ever talks to `Arc<dyn TextGenerator>`, so the fragile
//! parts (network, model output) can be swapped for a script in tests.

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::client::LlmClient;
use crate::error::LlmError;
use crate::types::ChatTurn;

/// "Given a prompt, return text."
///
/// Implementations must be assumed unreliable: callers always provide a
/// fallback for `Err`.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Generate a completion for `prompt`, given prior `history` and a
    /// `system_prompt` describing the task.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError`] when the backend is unavailable, times out, or
    /// answers with something that is not text.
    async fn generate(
        &self,
        prompt: &str,
        history: &[ChatTurn],
        system_prompt: &str,
    ) -> Result<String, LlmError>;

    /// Identity of the backing model, for logs and statistics.
    fn model_name(&self) -> &str;
}

#[async_trait]
impl TextGenerator for LlmClient {
    async fn generate(
        &self,
        prompt: &str,
        history: &[ChatTurn],
        system_prompt: &str,
    ) -> Result<String, LlmError> {
        let request = self
            .request(system_prompt, prompt)
            .with_history(history.to_vec());
        let response = LlmClient::generate(self, &request).await?;
        debug!(
            model = %response.model,
            tokens = response.tokens_generated,
            latency_ms = response.latency_ms,
            "LLM generation complete"
        );
        Ok(response.text)
    }

    fn model_name(&self) -> &str {
        self.model()
    }
}

/// A generator that is never available: the "no LLM" deployment.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableGenerator;

#[async_trait]
impl TextGenerator for UnavailableGenerator {
    async fn generate(
        &self,
        _prompt: &str,
        _history: &[ChatTurn],
        _system_prompt: &str,
    ) -> Result<String, LlmError> {
        Err(LlmError::Unavailable("No LLM provider configured".into()))
    }

    fn model_name(&self) -> &str {
        "none"
    }
}

/// A prompt as received by [`ScriptedGenerator`].
#[derive(Debug, Clone)]
pub struct RecordedPrompt {
    /// User prompt.
    pub prompt: String,
    /// System prompt.
    pub system_prompt: String,
    /// Number of history turns passed along.
    pub history_len: usize,
}

/// A generator that replays canned replies in order.
///
/// Each call pops the next scripted reply; once the script is exhausted the
/// generator reports itself unavailable. Every prompt is recorded so tests
/// can assert on what was asked.
#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    replies: Mutex<VecDeque<Result<String, String>>>,
    calls: Mutex<Vec<RecordedPrompt>>,
}

impl ScriptedGenerator {
    /// Create a generator that answers with `replies`, in order.
    #[must_use]
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(|r| Ok(r.into())).collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queue a successful reply.
    pub fn push_reply(&self, reply: impl Into<String>) {
        self.replies.lock().push_back(Ok(reply.into()));
    }

    /// Queue a failure.
    pub fn push_failure(&self, message: impl Into<String>) {
        self.replies.lock().push_back(Err(message.into()));
    }

    /// Every prompt received so far.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedPrompt> {
        self.calls.lock().clone()
    }

    /// How many times `generate` was called.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate(
        &self,
        prompt: &str,
        history: &[ChatTurn],
        system_prompt: &str,
    ) -> Result<String, LlmError> {
        self.calls.lock().push(RecordedPrompt {
            prompt: prompt.to_string(),
            system_prompt: system_prompt.to_string(),
            history_len: history.len(),
        });

        match self.replies.lock().pop_front() {
            Some(Ok(text)) => Ok(text),
            Some(Err(message)) => Err(LlmError::RequestFailed(message)),
            None => Err(LlmError::Unavailable("script exhausted".into())),
        }
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_replies_in_order_then_unavailable() {
        let generator = ScriptedGenerator::new(["first", "second"]);
        generator.push_failure("boom");

        assert_eq!(generator.generate("a", &[], "s").await.expect("first"), "first");
        assert_eq!(generator.generate("b", &[], "s").await.expect("second"), "second");
        assert!(matches!(
            generator.generate("c", &[], "s").await,
            Err(LlmError::RequestFailed(_))
        ));
        assert!(matches!(
            generator.generate("d", &[], "s").await,
            Err(LlmError::Unavailable(_))
        ));

        let calls = generator.calls();
        assert_eq!(calls.len(), 4);
        assert_eq!(calls[1].prompt, "b");
        assert_eq!(calls[0].system_prompt, "s");
    }

    #[tokio::test]
    async fn unavailable_generator_always_fails() {
        let generator = UnavailableGenerator;
        let history = [ChatTurn::user("hello")];
        assert!(generator.generate("x", &history, "y").await.is_err());
        assert_eq!(generator.model_name(), "none");
    }
}
