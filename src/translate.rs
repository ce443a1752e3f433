//! Inbound chat payload → provider request translation.
//!
//! The chat widget sends `{model?, messages: [{role, text}]}` with its own
//! role vocabulary (`user`, `ai`, `system`). Providers expect
//! `{role, content}` with their own vocabulary, so roles go through a
//! [`RoleTable`] loaded from configuration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TranslateError {
    #[error("Malformed request: {0}")]
    MalformedRequest(String),
}

/// One message as sent by the chat widget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub text: String,
}

/// Inbound request body. Unknown fields (attachments metadata etc.) are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundPayload {
    #[serde(default)]
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
}

/// One message in the provider's shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendMessage {
    pub role: String,
    pub content: String,
}

/// A translated request, ready for a [`GenerationBackend`](crate::backend::GenerationBackend).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    /// Requested model, if the client named one.
    pub model: Option<String>,

    /// Conversation in input order.
    pub messages: Vec<BackendMessage>,
}

impl GenerationRequest {
    /// Text of the most recent `user` message, if any.
    pub fn last_user_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
    }
}

/// Declarative role mapping. Roles without an entry pass through unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleTable {
    mappings: BTreeMap<String, String>,
}

impl Default for RoleTable {
    fn default() -> Self {
        Self::new(BTreeMap::from([("ai".to_string(), "assistant".to_string())]))
    }
}

impl RoleTable {
    pub fn new(mappings: BTreeMap<String, String>) -> Self {
        Self { mappings }
    }

    pub fn map<'a>(&'a self, role: &'a str) -> &'a str {
        self.mappings.get(role).map(String::as_str).unwrap_or(role)
    }
}

/// Converts widget payloads into [`GenerationRequest`]s.
#[derive(Debug, Clone, Default)]
pub struct RequestTranslator {
    roles: RoleTable,
}

impl RequestTranslator {
    pub fn new(roles: RoleTable) -> Self {
        Self { roles }
    }

    /// Parse and translate a raw JSON request body.
    pub fn translate(&self, body: &[u8]) -> Result<GenerationRequest, TranslateError> {
        let payload: InboundPayload = serde_json::from_slice(body)
            .map_err(|e| TranslateError::MalformedRequest(e.to_string()))?;
        self.translate_payload(payload)
    }

    /// Translate an already-parsed payload.
    pub fn translate_payload(
        &self,
        payload: InboundPayload,
    ) -> Result<GenerationRequest, TranslateError> {
        if payload.messages.is_empty() {
            return Err(TranslateError::MalformedRequest(
                "messages must not be empty".to_string(),
            ));
        }

        let messages = payload
            .messages
            .into_iter()
            .map(|m| BackendMessage {
                role: self.roles.map(&m.role).to_string(),
                content: m.text,
            })
            .collect();

        Ok(GenerationRequest {
            model: payload.model.filter(|m| !m.is_empty()),
            messages,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translator() -> RequestTranslator {
        RequestTranslator::default()
    }

    #[test]
    fn test_ai_role_maps_to_assistant() {
        let req = translator()
            .translate(br#"{"messages": [{"role": "ai", "text": "hi"}]}"#)
            .unwrap();
        assert_eq!(
            req.messages,
            vec![BackendMessage {
                role: "assistant".to_string(),
                content: "hi".to_string(),
            }]
        );
        assert_eq!(req.model, None);
    }

    #[test]
    fn test_order_preserved_and_other_roles_pass_through() {
        let body = br#"{
            "model": "x",
            "messages": [
                {"role": "system", "text": "be brief"},
                {"role": "user", "text": "one"},
                {"role": "ai", "text": "two"},
                {"role": "user", "text": "three"}
            ]
        }"#;
        let req = translator().translate(body).unwrap();
        let roles: Vec<&str> = req.messages.iter().map(|m| m.role.as_str()).collect();
        let texts: Vec<&str> = req.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(roles, ["system", "user", "assistant", "user"]);
        assert_eq!(texts, ["be brief", "one", "two", "three"]);
        assert_eq!(req.model.as_deref(), Some("x"));
        assert_eq!(req.last_user_text(), Some("three"));
    }

    #[test]
    fn test_custom_table() {
        let table = RoleTable::new(BTreeMap::from([
            ("ai".to_string(), "model".to_string()),
            ("system".to_string(), "developer".to_string()),
        ]));
        let req = RequestTranslator::new(table)
            .translate(br#"{"messages": [{"role": "system", "text": "a"}, {"role": "ai", "text": "b"}]}"#)
            .unwrap();
        assert_eq!(req.messages[0].role, "developer");
        assert_eq!(req.messages[1].role, "model");
    }

    #[test]
    fn test_malformed_inputs() {
        let cases: &[&[u8]] = &[
            b"not json",
            br#"{"model": "x"}"#,
            br#"{"messages": "hello"}"#,
            br#"{"messages": [{"text": "no role"}]}"#,
            br#"{"messages": [{"role": "user"}]}"#,
            br#"{"messages": [{"role": "user", "text": 5}]}"#,
            br#"{"messages": []}"#,
        ];
        for body in cases {
            let err = translator().translate(body).unwrap_err();
            assert!(
                matches!(err, TranslateError::MalformedRequest(_)),
                "expected malformed for {:?}",
                String::from_utf8_lossy(body)
            );
        }
    }

    #[test]
    fn test_extra_fields_ignored_and_empty_model_dropped() {
        let req = translator()
            .translate(br#"{"model": "", "messages": [{"role": "user", "text": "hi", "files": []}], "stream": true}"#)
            .unwrap();
        assert_eq!(req.model, None);
        assert_eq!(req.messages.len(), 1);
    }
}
