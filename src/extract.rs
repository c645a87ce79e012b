use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::llm::{ChatRequest, LlmClient, LlmError};
use crate::memory::CategoryMemory;
use crate::prompt::{PromptVariant, SYSTEM_PROMPT};
use crate::record::{ExtractedFields, ExtractionReply};

/// Captions shorter than this are not worth a model call.
pub const MIN_CAPTION_CHARS: usize = 10;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub rate_limit_base: Duration,
    pub rate_limit_step: Duration,
}

impl RetryPolicy {
    /// Linear backoff: `base + step * attempt`, unless the server said how
    /// long to wait.
    pub fn rate_limit_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        retry_after.unwrap_or(self.rate_limit_base + self.rate_limit_step * attempt)
    }
}

/// A successful extraction.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub reply: ExtractionReply,
    pub fields: ExtractedFields,
    pub attempts: u32,
}

#[derive(Debug)]
pub enum Outcome {
    Extracted(Extraction),
    /// The caption was unusable; the model was not called.
    Rejected,
    /// Attempts ran out on this row.
    Failed { attempts: u32, reason: String },
    /// Quota exhausted; the whole pass must save and stop.
    Stop(String),
}

pub fn is_usable_caption(caption: Option<&str>) -> bool {
    match caption {
        Some(text) => {
            let t = text.trim();
            t.chars().count() >= MIN_CAPTION_CHARS && !t.eq_ignore_ascii_case("nan")
        }
        None => false,
    }
}

pub struct Extractor<'a> {
    client: &'a dyn LlmClient,
    model: String,
    variant: PromptVariant,
    policy: RetryPolicy,
}

impl<'a> Extractor<'a> {
    pub fn new(
        client: &'a dyn LlmClient,
        model: impl Into<String>,
        variant: PromptVariant,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            client,
            model: model.into(),
            variant,
            policy,
        }
    }

    /// Extract one caption. On success the new category labels are added
    /// to `memory` before returning.
    pub fn extract(&self, caption: Option<&str>, memory: &mut CategoryMemory) -> Outcome {
        let caption = match caption {
            Some(c) if is_usable_caption(Some(c)) => c.trim(),
            _ => return Outcome::Rejected,
        };

        let user = self.variant.render(&memory.snapshot(), caption);
        let request = ChatRequest {
            model: &self.model,
            system: SYSTEM_PROMPT,
            user: &user,
        };

        let mut last_error = String::from("no attempts made");
        for attempt in 0..self.policy.max_attempts {
            let attempts = attempt + 1;
            match self.client.complete(&request) {
                Ok(text) => match ExtractionReply::parse(&text) {
                    Ok(reply) => {
                        let fields = reply.to_fields();
                        let added = memory.learn(fields.categories());
                        if added > 0 {
                            debug!(added, total = memory.len(), "learned new categories");
                        }
                        return Outcome::Extracted(Extraction {
                            reply,
                            fields,
                            attempts,
                        });
                    }
                    Err(e) => {
                        warn!(attempt = attempts, error = %e, "malformed model reply");
                        last_error = e.to_string();
                    }
                },
                Err(LlmError::QuotaExhausted(msg)) => return Outcome::Stop(msg),
                Err(LlmError::RateLimited { retry_after }) => {
                    last_error = "rate limited".to_string();
                    if attempts < self.policy.max_attempts {
                        let wait = self.policy.rate_limit_delay(attempt, retry_after);
                        warn!(
                            "Rate limited (attempt {}/{}), sleeping {:.1}s",
                            attempts,
                            self.policy.max_attempts,
                            wait.as_secs_f64()
                        );
                        thread::sleep(wait);
                    }
                }
                Err(e) => {
                    warn!(attempt = attempts, error = %e, "extraction request failed");
                    last_error = e.to_string();
                }
            }
        }

        Outcome::Failed {
            attempts: self.policy.max_attempts,
            reason: last_error,
        }
    }
}
