//! Success bodies for executed runs.
//!
//! The same body that goes to the client is what lands in the idempotent
//! cache, so replays are byte-identical: `serde_json` object keys serialize
//! in sorted order, making the rendering deterministic.

use serde_json::{Value as JsonValue, json};

/// 200 body for an executed charge run.
pub fn charge_success(
    data: JsonValue,
    reference: &str,
    signature: Option<&str>,
    duration_ms: u64,
) -> JsonValue {
    json!({
        "success": true,
        "data": data,
        "reference": reference,
        "signature": signature,
        "duration_ms": duration_ms,
    })
}

/// 200 body for an executed reward claim.
pub fn reward_success(
    data: JsonValue,
    reference: &str,
    reward_amount: u64,
    reward_signature: &str,
    duration_ms: u64,
) -> JsonValue {
    json!({
        "success": true,
        "reward_paid": true,
        "reward_amount": reward_amount.to_string(),
        "reward_signature": reward_signature,
        "data": data,
        "reference": reference,
        "duration_ms": duration_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn charge_body_shape() {
        let body = charge_success(json!({"sum": 3}), "ref", Some("sig"), 128);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["sum"], 3);
        assert_eq!(body["reference"], "ref");
        assert_eq!(body["signature"], "sig");
        assert_eq!(body["duration_ms"], 128);
    }

    #[test]
    fn rendering_is_deterministic() {
        let a = charge_success(json!({"b": 1, "a": 2}), "ref", None, 5).to_string();
        let b = charge_success(json!({"a": 2, "b": 1}), "ref", None, 5).to_string();
        assert_eq!(a, b);
    }

    #[test]
    fn reward_body_marks_payment() {
        let body = reward_success(json!({"ok": true}), "ref", 5_000, "sig", 90);
        assert_eq!(body["reward_paid"], true);
        assert_eq!(body["reward_amount"], "5000");
        assert_eq!(body["reward_signature"], "sig");
    }
}
