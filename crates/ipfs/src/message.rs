use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Value as JsonValue;

/// Messages exchanged on a machine's topic. Undecodable payloads and unknown
/// kinds are dropped by subscribers, so the wire format can grow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TopicMessage {
    /// Reader -> writer: please append these expressions to the log.
    ReqInputs {
        expressions: Vec<JsonValue>,
        nonce: String,
    },
    /// Writer -> all subscribers: inputs were appended. Carries the nonce of
    /// the originating request when the append was remote, so the requester
    /// can match its acknowledgement.
    NewInputs {
        results: Vec<JsonValue>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        nonce: Option<String>,
    },
}

impl TopicMessage {
    /// Decode a raw topic payload, ignoring anything that isn't ours.
    pub fn decode(data: &[u8]) -> Option<Self> {
        serde_json::from_slice(data).ok()
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("TopicMessage serialization is infallible")
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::message::TopicMessage;

    #[test]
    fn test_wire_round_trip() {
        let req = TopicMessage::ReqInputs {
            expressions: vec![json!(9)],
            nonce: "abc123".to_string(),
        };
        assert_eq!(TopicMessage::decode(&req.encode()), Some(req));

        let ack = TopicMessage::NewInputs {
            results: vec![json!(9)],
            nonce: None,
        };
        let encoded = ack.encode();
        // An absent nonce is omitted from the wire entirely.
        assert!(!String::from_utf8(encoded.clone()).unwrap().contains("nonce"));
        assert_eq!(TopicMessage::decode(&encoded), Some(ack));
    }

    #[test]
    fn test_unknown_kinds_ignored() {
        assert_eq!(TopicMessage::decode(b"{\"type\":\"gossip\",\"x\":1}"), None);
        assert_eq!(TopicMessage::decode(b"not json"), None);
    }

    #[test]
    fn test_tag_spelling() {
        let req = TopicMessage::ReqInputs {
            expressions: vec![],
            nonce: "n".to_string(),
        };
        let json: serde_json::Value = serde_json::from_slice(&req.encode()).unwrap();
        assert_eq!(json["type"], "req_inputs");
    }
}
