//! Deterministic in-process model for tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::traits::{ChatMessage, ChatModel};

/// Replays a fixed list of fragments. Optionally fails after `fail_after`
/// fragments to simulate an upstream reset.
pub struct ScriptedModel {
    fragments: Vec<String>,
    completion: String,
    fail_after: Option<usize>,
    prompts: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedModel {
    pub fn new<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fragments: fragments.into_iter().map(Into::into).collect(),
            completion: "Scripted Title".into(),
            fail_after: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_completion(mut self, completion: impl Into<String>) -> Self {
        self.completion = completion.into();
        self
    }

    pub fn failing_after(mut self, fragments: usize) -> Self {
        self.fail_after = Some(fragments);
        self
    }

    /// Every prompt this model has been called with, in call order.
    pub fn prompts(&self) -> Vec<Vec<ChatMessage>> {
        self.prompts.lock().clone()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn complete(&self, messages: &[ChatMessage]) -> anyhow::Result<String> {
        self.prompts.lock().push(messages.to_vec());
        Ok(self.completion.clone())
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        tx: mpsc::UnboundedSender<String>,
    ) -> anyhow::Result<String> {
        self.prompts.lock().push(messages.to_vec());
        let mut full = String::new();
        for (i, fragment) in self.fragments.iter().enumerate() {
            if self.fail_after == Some(i) {
                anyhow::bail!("scripted upstream failure after {i} fragments");
            }
            full.push_str(fragment);
            let _ = tx.send(fragment.clone());
            tokio::task::yield_now().await;
        }
        if self.fail_after == Some(self.fragments.len()) {
            anyhow::bail!("scripted upstream failure at end of stream");
        }
        Ok(full)
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
