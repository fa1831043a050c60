// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use serde_json::{json, Value};

/// Field distinguishing a reply node from a request node. Correlation is
/// positional: the reply to a request is the first following sibling
/// bearing this marker.
pub const REPLY_MARKER: &str = "reply";

pub fn is_reply(node: &Value) -> bool {
    node.get(REPLY_MARKER).and_then(Value::as_bool) == Some(true)
}

/// Logical content of one signal node.
///
/// Extraction is lenient on purpose: missing fields come out empty so a
/// rejection reply can still echo whatever the sender did provide.
/// `well_formed_error` is the mandatory-field gate.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub target: String,
    pub sender: String,
    pub receiver: String,
    pub clientid: Option<String>,
    pub args: Option<Value>,
}

impl Envelope {
    pub fn from_node(node: &Value) -> Envelope {
        let field = |name: &str| {
            node.get(name)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        Envelope {
            target: field("target"),
            sender: field("sender"),
            receiver: field("receiver"),
            clientid: node
                .get("clientid")
                .and_then(Value::as_str)
                .map(str::to_string),
            args: node.get("args").cloned(),
        }
    }

    /// Names the first missing mandatory field, for the rejection reason.
    pub fn well_formed_error(&self) -> Option<String> {
        for (name, value) in [
            ("target", &self.target),
            ("sender", &self.sender),
            ("receiver", &self.receiver),
        ] {
            if value.is_empty() {
                return Some(format!("signal is missing mandatory field '{}'", name));
            }
        }
        None
    }

    /// Overwrites any claimed client identity with the authoritative one.
    pub fn stamp_clientid(node: &mut Value, clientid: &str) {
        if let Some(map) = node.as_object_mut() {
            map.insert("clientid".to_string(), Value::String(clientid.to_string()));
        }
    }

    /// Builds the reply node for a handled signal, echoing the original
    /// target/sender/receiver so the caller can tell which outstanding
    /// request this answers.
    pub fn reply_ok(request: &Value, result: Value) -> Value {
        let mut reply = Envelope::reply_base(request);
        reply["result"] = result;
        reply
    }

    /// Builds the rejection reply: same echo plus a human-readable reason,
    /// so the remote caller gets a diagnostic instead of hanging.
    pub fn reply_rejected(request: &Value, reason: &str) -> Value {
        let mut reply = Envelope::reply_base(request);
        reply["reason"] = Value::String(reason.to_string());
        reply
    }

    fn reply_base(request: &Value) -> Value {
        let echo = |name: &str| request.get(name).cloned().unwrap_or(Value::String(String::new()));
        json!({
            REPLY_MARKER: true,
            "target": echo("target"),
            "sender": echo("sender"),
            "receiver": echo("receiver"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_all_fields() {
        let node = json!({
            "target": "options/set",
            "sender": "sig://front/7",
            "receiver": "sig://solver",
            "clientid": "claimed-identity",
            "args": {"path": "/mesh/density", "value": 0.5},
        });
        let envelope = Envelope::from_node(&node);
        assert_eq!(envelope.target, "options/set");
        assert_eq!(envelope.sender, "sig://front/7");
        assert_eq!(envelope.receiver, "sig://solver");
        assert_eq!(envelope.clientid.as_deref(), Some("claimed-identity"));
        assert_eq!(envelope.args.unwrap()["path"], "/mesh/density");
        assert!(Envelope::from_node(&node).well_formed_error().is_none());
    }

    #[test]
    fn test_missing_target_is_named_in_the_reason() {
        let node = json!({"sender": "/c", "receiver": "/s"});
        let reason = Envelope::from_node(&node).well_formed_error().unwrap();
        assert!(reason.contains("target"));
    }

    #[test]
    fn test_non_string_target_is_rejected() {
        let node = json!({"target": 42, "sender": "/c", "receiver": "/s"});
        assert!(Envelope::from_node(&node).well_formed_error().is_some());
    }

    #[test]
    fn test_stamp_overwrites_claimed_clientid() {
        let mut node = json!({"target": "t", "clientid": "liar"});
        Envelope::stamp_clientid(&mut node, "client-3");
        assert_eq!(node["clientid"], "client-3");
    }

    #[test]
    fn test_rejection_echoes_request_fields() {
        let request = json!({"target": "ping", "sender": "/client", "receiver": "/server"});
        let reply = Envelope::reply_rejected(&request, "no handler registered");
        assert!(is_reply(&reply));
        assert_eq!(reply["sender"], "/client");
        assert_eq!(reply["receiver"], "/server");
        assert_eq!(reply["reason"], "no handler registered");
    }

    #[test]
    fn test_request_node_is_not_a_reply() {
        assert!(!is_reply(&json!({"target": "ping"})));
        assert!(!is_reply(&json!({"reply": "yes"})));
        assert!(is_reply(&json!({"reply": true})));
    }
}
