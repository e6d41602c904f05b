//! Wire message constants and envelope helpers.
//!
//! Every peer message is a JSON object with two required integer fields,
//! `msg_type` and `msg_cmd`. Commands are numbered per type.

use serde_json::{json, Map, Value};

pub const MSG_REG: u32 = 0;
pub const MSG_SYS: u32 = 1;
pub const MSG_BLOCK: u32 = 2;
pub const MSG_TX: u32 = 3;
pub const MSG_PROBE: u32 = 4;

pub const REG_REQ: u32 = 0;
pub const REG_RSP: u32 = 1;
pub const REG_VERIFY_REQ: u32 = 2;
pub const REG_VERIFY_RSP: u32 = 3;

pub const SYS_PING: u32 = 0;
pub const SYS_PONG: u32 = 1;

pub const BLOCK_BROADCAST: u32 = 0;
pub const BLOCK_BRIEF_REQ: u32 = 1;
pub const BLOCK_BRIEF_RSP: u32 = 2;
pub const BLOCK_DETAIL_REQ: u32 = 3;
pub const BLOCK_DETAIL_RSP: u32 = 4;

pub const TX_BROADCAST: u32 = 0;

/// Protocol version. Major is `version / 10_000`; peers with differing
/// majors refuse each other at registration without banning.
pub const ASKCOIN_VERSION: u32 = 10_000;

/// Same-major version gate applied to both REG messages.
pub fn version_compatible(a: u32, b: u32) -> bool {
    a / 10_000 == b / 10_000
}

/// Start a message envelope with `msg_type` and `msg_cmd` set.
pub fn envelope(msg_type: u32, msg_cmd: u32) -> Map<String, Value> {
    let mut doc = Map::new();
    doc.insert("msg_type".into(), json!(msg_type));
    doc.insert("msg_cmd".into(), json!(msg_cmd));
    doc
}

/// Read the `msg_type` / `msg_cmd` pair; `None` when absent or not u32.
pub fn type_and_cmd(doc: &Value) -> Option<(u32, u32)> {
    let t = doc.get("msg_type")?.as_u64()?;
    let c = doc.get("msg_cmd")?.as_u64()?;

    if t > u32::MAX as u64 || c > u32::MAX as u64 {
        return None;
    }

    Some((t as u32, c as u32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trip() {
        let doc = Value::Object(envelope(MSG_SYS, SYS_PING));
        assert_eq!(type_and_cmd(&doc), Some((MSG_SYS, SYS_PING)));
    }

    #[test]
    fn missing_fields_rejected() {
        assert_eq!(type_and_cmd(&json!({"msg_type": 1})), None);
        assert_eq!(type_and_cmd(&json!({"msg_type": "x", "msg_cmd": 0})), None);
    }

    #[test]
    fn version_gate_is_major_only() {
        assert!(version_compatible(10_000, 10_001));
        assert!(version_compatible(10_000, 19_999));
        assert!(!version_compatible(10_000, 20_000));
    }
}
