mod scripted;
mod vertex;

pub use self::scripted::ScriptedModel;
pub use self::vertex::VertexAiClient;

use async_trait::async_trait;

use crate::error::{Error, Result};

/// Text-in, text-out language model. Responses carry no guarantee of
/// containing well-formed SQL.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// Stand-in used when no model endpoint is configured; every call fails.
pub struct UnavailableModel {
    reason: String,
}

impl UnavailableModel {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl LanguageModel for UnavailableModel {
    fn name(&self) -> &str {
        "unavailable"
    }

    async fn complete(&self, _prompt: &str) -> Result<String> {
        Err(Error::LanguageModel(self.reason.clone()))
    }
}
