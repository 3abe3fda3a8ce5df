//! Command codec for replicated log payloads
//!
//! Commands travel through the Raft log as MessagePack maps with string
//! keys (`{"op": ..., "key": ..., "value": ...}`), so any client that can
//! produce that shape can propose mutations.

use serde::{Deserialize, Serialize};

/// Operations a command can carry. Anything unrecognized decodes to
/// `Unknown` and is a no-op on apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Set,
    Delete,
    Unknown,
}

/// One proposed mutation. `value` is ignored for DELETE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    #[serde(default)]
    pub op: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub value: String,
}

impl Command {
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Command {
        Command {
            op: "SET".to_string(),
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<String>) -> Command {
        Command {
            op: "DELETE".to_string(),
            key: key.into(),
            value: String::new(),
        }
    }

    pub fn op(&self) -> Op {
        match self.op.as_str() {
            "SET" => Op::Set,
            "DELETE" => Op::Delete,
            _ => Op::Unknown,
        }
    }

    /// A command with an unknown op or an empty key must not mutate the
    /// store.
    pub fn is_valid(&self) -> bool {
        self.op() != Op::Unknown && !self.key.is_empty()
    }

    /// Serializes as a MessagePack map with string field names. The named
    /// form keeps the wire bytes identical to what the Python and C++
    /// clients produce for the same dictionary.
    pub fn encode(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec_named(self)
    }

    /// Decodes a payload. Unknown map fields are ignored; missing fields
    /// default to the empty string.
    pub fn decode(bytes: &[u8]) -> Result<Command, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        for cmd in [
            Command::set("user_123", "msgpack_optimization_active"),
            Command::delete("user_123"),
            Command::set("", ""),
        ] {
            let bytes = cmd.encode().unwrap();
            let decoded = Command::decode(&bytes).unwrap();
            assert_eq!(decoded, cmd);
        }
    }

    #[test]
    fn test_encodes_as_three_field_map() {
        let bytes = Command::set("k", "v").encode().unwrap();
        // fixmap with 3 entries, the layout the C++ peer expects.
        assert_eq!(bytes[0], 0x83);
    }

    #[test]
    fn test_unknown_op() {
        let cmd = Command {
            op: "UPSERT".to_string(),
            key: "k".to_string(),
            value: "v".to_string(),
        };
        let decoded = Command::decode(&cmd.encode().unwrap()).unwrap();
        assert_eq!(decoded.op(), Op::Unknown);
        assert!(!decoded.is_valid());
    }

    #[test]
    fn test_missing_fields_default_to_empty() {
        #[derive(Serialize)]
        struct OnlyValue {
            value: String,
        }
        let bytes = rmp_serde::to_vec_named(&OnlyValue {
            value: "v".to_string(),
        })
        .unwrap();

        let decoded = Command::decode(&bytes).unwrap();
        assert_eq!(decoded.op(), Op::Unknown);
        assert!(decoded.key.is_empty());
        assert!(!decoded.is_valid());
    }

    #[test]
    fn test_extra_fields_are_ignored() {
        #[derive(Serialize)]
        struct Extended {
            op: String,
            key: String,
            value: String,
            ttl: u64,
        }
        let bytes = rmp_serde::to_vec_named(&Extended {
            op: "SET".to_string(),
            key: "k".to_string(),
            value: "v".to_string(),
            ttl: 30,
        })
        .unwrap();

        let decoded = Command::decode(&bytes).unwrap();
        assert_eq!(decoded, Command::set("k", "v"));
    }

    #[test]
    fn test_empty_key_is_invalid() {
        let decoded = Command::decode(&Command::set("", "v").encode().unwrap()).unwrap();
        assert_eq!(decoded.op(), Op::Set);
        assert!(!decoded.is_valid());
    }

    #[test]
    fn test_garbage_fails_to_decode() {
        assert!(Command::decode(&[0xc1, 0xff, 0x00]).is_err());
    }
}
