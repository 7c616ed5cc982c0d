//! The signed message envelope.
//!
//! A [`Message`] is immutable once built: every field is private and the
//! only way to attach a signature is [`Message::sign`], which consumes the
//! unsigned value and returns the signed one.  A reply is always a fresh
//! message built through [`Message::reply`].
//!
//! The signature covers the SHA-256 digest of the canonical JSON encoding
//! of every field except the signature itself.  Parameters live in a
//! `BTreeMap`, so the encoding is independent of insertion order.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::MessageError;
use crate::types::{params, Operation, QualifiedName};

/// Envelope protocol version.
pub const PROTOCOL_VERSION: u16 = 1;

/// Service tag used when a builder is not told otherwise.
pub const DEFAULT_SERVICE: &str = "canopy";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    sender: QualifiedName,
    sender_service: String,
    recipient: QualifiedName,
    recipient_service: String,
    operation: Operation,
    conversation_id: String,
    reply_with: String,
    #[serde(default)]
    in_reply_to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reply_by: Option<DateTime<Utc>>,
    #[serde(default)]
    parameters: BTreeMap<String, Value>,
    version: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    signature: Option<String>,
}

/// Borrowed view of the signed fields, in declaration order.
#[derive(Serialize)]
struct SignedFields<'a> {
    sender: &'a QualifiedName,
    sender_service: &'a str,
    recipient: &'a QualifiedName,
    recipient_service: &'a str,
    operation: &'a Operation,
    conversation_id: &'a str,
    reply_with: &'a str,
    in_reply_to: &'a str,
    reply_by: &'a Option<DateTime<Utc>>,
    parameters: &'a BTreeMap<String, Value>,
    version: u16,
}

impl Message {
    pub fn builder(
        sender: QualifiedName,
        recipient: QualifiedName,
        operation: Operation,
    ) -> MessageBuilder {
        MessageBuilder::new(sender, recipient, operation)
    }

    pub fn sender(&self) -> &QualifiedName {
        &self.sender
    }

    pub fn sender_service(&self) -> &str {
        &self.sender_service
    }

    pub fn recipient(&self) -> &QualifiedName {
        &self.recipient
    }

    pub fn recipient_service(&self) -> &str {
        &self.recipient_service
    }

    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn reply_with(&self) -> &str {
        &self.reply_with
    }

    /// Correlation id of the answered message, empty for a conversation opener.
    pub fn in_reply_to(&self) -> &str {
        &self.in_reply_to
    }

    pub fn reply_by(&self) -> Option<DateTime<Utc>> {
        self.reply_by
    }

    pub fn parameters(&self) -> &BTreeMap<String, Value> {
        &self.parameters
    }

    pub fn parameter(&self, key: &str) -> Option<&Value> {
        self.parameters.get(key)
    }

    pub fn parameter_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    pub fn signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    /// True when sender and recipient live in different containers.
    pub fn crosses_containers(&self) -> bool {
        self.sender.container() != self.recipient.container()
    }

    /// SHA-256 digest of the canonical encoding of the signed fields.
    pub fn signing_digest(&self) -> Result<[u8; 32], MessageError> {
        let fields = SignedFields {
            sender: &self.sender,
            sender_service: &self.sender_service,
            recipient: &self.recipient,
            recipient_service: &self.recipient_service,
            operation: &self.operation,
            conversation_id: &self.conversation_id,
            reply_with: &self.reply_with,
            in_reply_to: &self.in_reply_to,
            reply_by: &self.reply_by,
            parameters: &self.parameters,
            version: self.version,
        };
        let canonical = serde_json::to_vec(&fields)?;
        Ok(Sha256::digest(&canonical).into())
    }

    /// Signs the message, replacing any previous signature.
    pub fn sign(mut self, key: &SigningKey) -> Result<Self, MessageError> {
        let digest = self.signing_digest()?;
        let signature: Signature = key.sign(&digest);
        self.signature = Some(hex::encode(signature.to_bytes()));
        Ok(self)
    }

    /// Verifies the attached signature against `key`.
    pub fn verify(&self, key: &VerifyingKey) -> Result<(), MessageError> {
        let encoded = self.signature.as_deref().ok_or(MessageError::Unsigned)?;
        let raw = hex::decode(encoded).map_err(|e| MessageError::MalformedSignature(e.to_string()))?;
        let bytes: [u8; 64] = raw
            .try_into()
            .map_err(|_| MessageError::MalformedSignature("expected 64 bytes".into()))?;
        let signature = Signature::from_bytes(&bytes);
        let digest = self.signing_digest()?;
        key.verify(&digest, &signature)
            .map_err(|_| MessageError::InvalidSignature)
    }

    /// Starts a reply: sender and recipient swap, the conversation is kept
    /// and `in_reply_to` points at this message's `reply_with`.
    pub fn reply(&self, operation: Operation) -> MessageBuilder {
        MessageBuilder::new(self.recipient.clone(), self.sender.clone(), operation)
            .sender_service(self.recipient_service.clone())
            .recipient_service(self.sender_service.clone())
            .conversation_id(self.conversation_id.clone())
            .in_reply_to(self.reply_with.clone())
    }

    /// The `MessageNotUnderstoodInfo` answer to this message.
    pub fn not_understood(&self) -> Message {
        self.reply(Operation::MessageNotUnderstoodInfo)
            .parameter(params::OPERATION, self.operation.as_str())
            .build()
    }

    /// The `OperationNotPermittedInfo` answer to this message.
    pub fn not_permitted(&self, reason: &str) -> Message {
        self.reply(Operation::OperationNotPermittedInfo)
            .parameter(params::OPERATION, self.operation.as_str())
            .parameter(params::REASON, reason)
            .build()
    }
}

/// Builder for unsigned messages.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    sender: QualifiedName,
    sender_service: String,
    recipient: QualifiedName,
    recipient_service: String,
    operation: Operation,
    conversation_id: Option<String>,
    in_reply_to: String,
    reply_by: Option<DateTime<Utc>>,
    parameters: BTreeMap<String, Value>,
}

impl MessageBuilder {
    fn new(sender: QualifiedName, recipient: QualifiedName, operation: Operation) -> Self {
        Self {
            sender,
            sender_service: DEFAULT_SERVICE.to_owned(),
            recipient,
            recipient_service: DEFAULT_SERVICE.to_owned(),
            operation,
            conversation_id: None,
            in_reply_to: String::new(),
            reply_by: None,
            parameters: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn sender_service(mut self, service: impl Into<String>) -> Self {
        self.sender_service = service.into();
        self
    }

    #[must_use]
    pub fn recipient_service(mut self, service: impl Into<String>) -> Self {
        self.recipient_service = service.into();
        self
    }

    #[must_use]
    pub fn conversation_id(mut self, id: impl Into<String>) -> Self {
        self.conversation_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn in_reply_to(mut self, id: impl Into<String>) -> Self {
        self.in_reply_to = id.into();
        self
    }

    #[must_use]
    pub fn reply_by(mut self, deadline: DateTime<Utc>) -> Self {
        self.reply_by = Some(deadline);
        self
    }

    #[must_use]
    pub fn parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Finalizes the message with a fresh `reply_with` id.
    pub fn build(self) -> Message {
        Message {
            sender: self.sender,
            sender_service: self.sender_service,
            recipient: self.recipient,
            recipient_service: self.recipient_service,
            operation: self.operation,
            conversation_id: self
                .conversation_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            reply_with: Uuid::new_v4().to_string(),
            in_reply_to: self.in_reply_to,
            reply_by: self.reply_by,
            parameters: self.parameters,
            version: PROTOCOL_VERSION,
            signature: None,
        }
    }
}
