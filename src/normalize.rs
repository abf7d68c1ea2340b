//! Turns whatever the backend sent back into one answer string.

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::dispatch::RawResponse;
use crate::error::ChatError;
use crate::session::ChatMessage;

/// Object fields tried in order when the body is a JSON object.
pub const ANSWER_FIELDS: [&str; 5] = ["answer", "response", "message", "text", "content"];

pub const ERROR_NOTICE: &str = "⚠️ Error getting a response from the chatbot. Please try again.";
pub const EMPTY_ANSWER_NOTICE: &str = "⚠️ The chatbot returned an empty answer.";

#[derive(Debug, PartialEq)]
pub enum ResponseShape<'a> {
    Object(Map<String, Value>),
    /// A JSON string literal, already unescaped.
    EncodedString(String),
    PlainText(&'a str),
}

impl<'a> ResponseShape<'a> {
    pub fn classify(body: &'a str) -> Self {
        match serde_json::from_str::<Value>(body) {
            Ok(Value::Object(map)) => ResponseShape::Object(map),
            Ok(Value::String(s)) => ResponseShape::EncodedString(s),
            _ => ResponseShape::PlainText(body),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            ResponseShape::Object(_) => "object",
            ResponseShape::EncodedString(_) => "encoded_string",
            ResponseShape::PlainText(_) => "plain_text",
        }
    }

    fn into_text(self, body: &str) -> String {
        match self {
            ResponseShape::Object(map) => ANSWER_FIELDS
                .iter()
                .find_map(|field| map.get(*field).and_then(Value::as_str))
                .map(str::to_string)
                .unwrap_or_else(|| {
                    debug!("no answer field in JSON object, using raw body");
                    body.to_string()
                }),
            ResponseShape::EncodedString(s) => s,
            ResponseShape::PlainText(text) => text.to_string(),
        }
    }
}

/// Strips one leading and one trailing `"` only when both are present.
pub fn strip_wrapping_quotes(text: &str) -> &str {
    if text.len() >= 2 && text.starts_with('"') && text.ends_with('"') {
        &text[1..text.len() - 1]
    } else {
        text
    }
}

pub fn normalize(raw: &RawResponse) -> String {
    let body = raw.body();
    if raw.is_decoded() {
        return body.to_string();
    }
    let shape = ResponseShape::classify(body);
    debug!(shape = shape.name(), len = body.len(), "normalizing response");
    let text = shape.into_text(body);
    strip_wrapping_quotes(&text).to_string()
}

/// The bot message a finished turn produces. Never empty.
pub fn reply_for(outcome: Result<RawResponse, ChatError>) -> ChatMessage {
    match outcome {
        Ok(raw) => {
            let answer = normalize(&raw);
            if answer.trim().is_empty() {
                warn!("backend returned an empty answer");
                ChatMessage::notice(EMPTY_ANSWER_NOTICE)
            } else {
                ChatMessage::bot(answer)
            }
        }
        Err(e) => {
            warn!(error = %e, "turn failed");
            ChatMessage::notice(ERROR_NOTICE)
        }
    }
}
