use bytes::Bytes;
use serde_json::Value;

use crate::signal::envelope::is_reply;
use crate::{AppError, AppResult};

/// One decoded frame payload: a non-empty list of signal nodes.
///
/// A request frame carries a single request node. A reply frame carries
/// the echoed request node followed by a sibling bearing the reply
/// marker, which keeps request/reply correlation inside the document
/// itself instead of a broker.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalDocument {
    nodes: Vec<Value>,
}

impl SignalDocument {
    pub fn new(nodes: Vec<Value>) -> AppResult<SignalDocument> {
        if nodes.is_empty() {
            return Err(AppError::FormatError(
                "document root must hold at least one signal node".to_string(),
            ));
        }
        if let Some(node) = nodes.iter().find(|node| !node.is_object()) {
            return Err(AppError::FormatError(format!(
                "signal node is not an object: {}",
                node
            )));
        }
        Ok(SignalDocument { nodes })
    }

    /// Builds the correlated reply document: the echoed request with the
    /// reply placed immediately after it as a following sibling.
    pub fn correlated(request: Value, reply: Value) -> SignalDocument {
        SignalDocument {
            nodes: vec![request, reply],
        }
    }

    /// Decodes and validates payload bytes. Anything that is not a JSON
    /// array of objects is a format error: the payload cannot be routed
    /// and the byte stream cannot be trusted past it.
    pub fn parse(bytes: &[u8]) -> AppResult<SignalDocument> {
        let root: Value = serde_json::from_slice(bytes)
            .map_err(|e| AppError::FormatError(format!("payload is not a valid document: {}", e)))?;
        let Value::Array(nodes) = root else {
            return Err(AppError::FormatError(
                "document root must be a node list".to_string(),
            ));
        };
        SignalDocument::new(nodes)
    }

    pub fn encode(&self) -> Bytes {
        // serializing Vec<Value> cannot fail
        Bytes::from(serde_json::to_vec(&self.nodes).unwrap())
    }

    pub fn nodes(&self) -> &[Value] {
        &self.nodes
    }

    pub fn into_nodes(self) -> Vec<Value> {
        self.nodes
    }

    /// "Find the reply to signal X": the first following sibling of the
    /// node at `request_index` that carries the reply marker.
    pub fn find_reply(&self, request_index: usize) -> Option<&Value> {
        self.nodes
            .iter()
            .skip(request_index + 1)
            .find(|node| is_reply(node))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_parse_rejects_non_array_roots() {
        for bytes in [&b"{}"[..], b"42", b"\"signal\"", b"null", b"[]"] {
            assert!(matches!(
                SignalDocument::parse(bytes),
                Err(AppError::FormatError(_))
            ));
        }
    }

    #[test]
    fn test_parse_rejects_non_object_nodes() {
        assert!(matches!(
            SignalDocument::parse(b"[{\"target\":\"x\"}, 3]"),
            Err(AppError::FormatError(_))
        ));
    }

    #[test]
    fn test_encode_parse_round_trip() {
        let doc = SignalDocument::new(vec![json!({
            "target": "tree/list",
            "sender": "sig://front/1",
            "receiver": "sig://solver",
        })])
        .unwrap();
        let bytes = doc.encode();
        assert_eq!(SignalDocument::parse(&bytes).unwrap(), doc);
    }

    #[test]
    fn test_find_reply_takes_first_following_sibling() {
        let request = json!({"target": "ping", "sender": "/c", "receiver": "/s"});
        let reply = json!({"reply": true, "target": "ping", "reason": "nope"});
        let doc = SignalDocument::correlated(request.clone(), reply.clone());

        assert_eq!(doc.find_reply(0), Some(&reply));
        // nothing follows the reply itself
        assert_eq!(doc.find_reply(1), None);
    }
}
