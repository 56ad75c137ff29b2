//! Token accounting for responses that carry no usage block.
//!
//! Prompt tokens follow the provider's published chat accounting: a fixed overhead per
//! message, an adjustment per `name` field, the BPE length of every field value and three
//! tokens priming the assistant reply. Both counters use the `cl100k_base` encoding.

use std::sync::OnceLock;

use serde_json::Value;
use tiktoken_rs::CoreBPE;
use tracing::warn;

use crate::errors::Error;
use crate::models::ChatMessage;

/// Model assumed when a request names none.
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo-0613";

const GPT_35_TURBO_CANONICAL: &str = "gpt-3.5-turbo-0613";
const GPT_4_CANONICAL: &str = "gpt-4-0613";

// every reply is primed with <|start|>assistant<|message|>
const REPLY_PRIMING_TOKENS: i64 = 3;

static TOKENIZER: OnceLock<CoreBPE> = OnceLock::new();

/// Per-message accounting constants of a model family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageOverhead {
    pub tokens_per_message: i64,
    pub tokens_per_name: i64,
}

impl MessageOverhead {
    /// Looks up the accounting constants for `model`.
    ///
    /// Undated `gpt-3.5-turbo` and `gpt-4` variants resolve to a pinned snapshot of their family
    /// (with a warning, since the provider may change them). Anything else is unsupported.
    pub fn for_model(model: &str) -> Result<Self, Error> {
        match model {
            "gpt-3.5-turbo-0613" | "gpt-3.5-turbo-16k-0613" | "gpt-4-0314" | "gpt-4-32k-0314" | "gpt-4-0613" | "gpt-4-32k-0613" => {
                Ok(Self {
                    tokens_per_message: 3,
                    tokens_per_name: 1,
                })
            }
            // every message follows <|start|>{role/name}\n{content}<|end|>\n, a name replaces the role
            "gpt-3.5-turbo-0301" => Ok(Self {
                tokens_per_message: 4,
                tokens_per_name: -1,
            }),
            m if m.contains("gpt-3.5-turbo") => {
                warn!(model = m, "gpt-3.5-turbo may update over time, counting tokens as {GPT_35_TURBO_CANONICAL}");
                Self::for_model(GPT_35_TURBO_CANONICAL)
            }
            m if m.contains("gpt-4") => {
                warn!(model = m, "gpt-4 may update over time, counting tokens as {GPT_4_CANONICAL}");
                Self::for_model(GPT_4_CANONICAL)
            }
            m => Err(Error::UnsupportedModel { model: m.to_string() }),
        }
    }
}

fn tokenizer() -> Result<&'static CoreBPE, Error> {
    if let Some(bpe) = TOKENIZER.get() {
        return Ok(bpe);
    }
    let bpe = tiktoken_rs::cl100k_base().map_err(|e| Error::Tokenizer { message: e.to_string() })?;
    // a concurrent initializer may have won, either value is identical
    let _ = TOKENIZER.set(bpe);
    TOKENIZER.get().ok_or_else(|| Error::Tokenizer {
        message: "tokenizer failed to initialize".to_string(),
    })
}

fn encoded_len(bpe: &CoreBPE, text: &str) -> i64 {
    bpe.encode_ordinary(text).len() as i64
}

fn value_tokens(bpe: &CoreBPE, value: &Value) -> i64 {
    match value {
        Value::Null => 0,
        Value::String(s) => encoded_len(bpe, s),
        other => encoded_len(bpe, &other.to_string()),
    }
}

/// Counts the BPE tokens of `text`.
pub fn count_tokens(text: &str) -> Result<u64, Error> {
    let bpe = tokenizer()?;
    Ok(bpe.encode_ordinary(text).len() as u64)
}

/// Estimates the prompt tokens the provider charges for `messages` under `model`.
pub fn count_message_tokens(messages: &[ChatMessage], model: &str) -> Result<u64, Error> {
    let overhead = MessageOverhead::for_model(model)?;
    let bpe = tokenizer()?;

    let mut total: i64 = 0;
    for message in messages {
        total += overhead.tokens_per_message;
        total += encoded_len(bpe, &message.role);
        total += value_tokens(bpe, &message.content);
        if let Some(name) = &message.name {
            total += encoded_len(bpe, name);
            total += overhead.tokens_per_name;
        }
        for value in message.extra.values() {
            total += value_tokens(bpe, value);
        }
    }
    total += REPLY_PRIMING_TOKENS;

    Ok(total.max(0) as u64)
}
