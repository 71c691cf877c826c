use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Error, Result};

const HANDLE_ENGINE: base64::engine::GeneralPurpose =
    base64::engine::general_purpose::URL_SAFE_NO_PAD;

/// Opaque reference to a span that any process can decode and address later.
///
/// The encoded form is what crosses the wire (e.g. the `span_id` chat event);
/// it carries the span's own id and the id of the root span it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TraceHandle {
    span_id: String,
    root_id: String,
}

#[derive(Serialize, Deserialize)]
struct HandleWire {
    s: String,
    r: String,
}

impl TraceHandle {
    /// Fresh root span handle.
    pub fn new_root() -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        Self {
            span_id: id.clone(),
            root_id: id,
        }
    }

    /// Fresh handle for a span nested under `parent`.
    pub fn child_of(parent: &TraceHandle) -> Self {
        Self {
            span_id: uuid::Uuid::new_v4().to_string(),
            root_id: parent.root_id.clone(),
        }
    }

    pub fn span_id(&self) -> &str {
        &self.span_id
    }

    pub fn root_id(&self) -> &str {
        &self.root_id
    }

    pub fn is_root(&self) -> bool {
        self.span_id == self.root_id
    }

    pub fn encode(&self) -> String {
        let wire = HandleWire {
            s: self.span_id.clone(),
            r: self.root_id.clone(),
        };
        // HandleWire has only string fields, serialization cannot fail.
        let json = serde_json::to_vec(&wire).unwrap_or_default();
        HANDLE_ENGINE.encode(json)
    }

    pub fn decode(token: &str) -> Result<Self> {
        let bytes = HANDLE_ENGINE
            .decode(token.trim())
            .map_err(|e| Error::Trace(format!("malformed trace handle: {e}")))?;
        let wire: HandleWire = serde_json::from_slice(&bytes)
            .map_err(|e| Error::Trace(format!("malformed trace handle: {e}")))?;
        if wire.s.is_empty() || wire.r.is_empty() {
            return Err(Error::Trace("trace handle has empty ids".to_string()));
        }
        Ok(Self {
            span_id: wire.s,
            root_id: wire.r,
        })
    }
}

impl fmt::Display for TraceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl From<TraceHandle> for String {
    fn from(handle: TraceHandle) -> Self {
        handle.encode()
    }
}

impl TryFrom<String> for TraceHandle {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::decode(&value)
    }
}

/// Fields to overwrite on an existing span. `None` leaves the field as-is;
/// metadata objects are merged key by key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpanUpdate {
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub metadata: Option<serde_json::Value>,
}

/// External tracing collaborator. Every operation is addressed by handle so
/// callers never rely on an in-process span object surviving between requests.
#[async_trait]
pub trait TraceSink: Send + Sync {
    async fn open_span(
        &self,
        span: &TraceHandle,
        parent: Option<&TraceHandle>,
        name: &str,
        metadata: serde_json::Value,
    ) -> Result<()>;

    async fn update_span(&self, span: &TraceHandle, update: SpanUpdate) -> Result<()>;

    async fn close_span(&self, span: &TraceHandle) -> Result<()>;
}

/// Sink used when tracing is disabled.
pub struct NoopTraceSink;

#[async_trait]
impl TraceSink for NoopTraceSink {
    async fn open_span(
        &self,
        _span: &TraceHandle,
        _parent: Option<&TraceHandle>,
        _name: &str,
        _metadata: serde_json::Value,
    ) -> Result<()> {
        Ok(())
    }

    async fn update_span(&self, _span: &TraceHandle, _update: SpanUpdate) -> Result<()> {
        Ok(())
    }

    async fn close_span(&self, _span: &TraceHandle) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_survives_encode_decode() {
        let root = TraceHandle::new_root();
        let child = TraceHandle::child_of(&root);
        let decoded = TraceHandle::decode(&child.encode()).unwrap();
        assert_eq!(decoded, child);
        assert_eq!(decoded.root_id(), root.span_id());
        assert!(!decoded.is_root());
        assert!(root.is_root());
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            TraceHandle::decode("not a handle!"),
            Err(Error::Trace(_))
        ));
        let empty = HANDLE_ENGINE.encode(br#"{"s":"","r":""}"#);
        assert!(TraceHandle::decode(&empty).is_err());
    }

    #[test]
    fn handle_serializes_as_token_string() {
        let handle = TraceHandle::new_root();
        let json = serde_json::to_value(&handle).unwrap();
        assert_eq!(json, serde_json::Value::String(handle.encode()));
        let back: TraceHandle = serde_json::from_value(json).unwrap();
        assert_eq!(back, handle);
    }
}
