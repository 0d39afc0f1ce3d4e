use core_types::{Envelope, EnvelopeStatus};
use serde::Deserialize;
use serde_json::Value;

/// Strips a success envelope (`status == "success"` plus a `data` field) and
/// returns the payload. Anything else, including bare payloads such as the
/// health probes, comes back unchanged. Never fails.
pub fn unwrap_envelope(raw: Value) -> Value {
    match raw {
        Value::Object(mut map)
            if map.get("status").and_then(Value::as_str) == Some("success")
                && map.contains_key("data") =>
        {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

/// A success envelope that carries no `data` key at all. `unwrap_envelope`
/// passes these through untouched, so decoders must reject them first.
pub fn is_success_without_data(raw: &Value) -> bool {
    raw.get("data").is_none()
        && Envelope::<Value>::deserialize(raw).is_ok_and(|envelope| envelope.is_success())
}

/// Message of an error envelope, if `raw` is one.
pub fn error_envelope_message(raw: &Value) -> Option<String> {
    let envelope = Envelope::<Value>::deserialize(raw).ok()?;
    if envelope.status != EnvelopeStatus::Error {
        return None;
    }
    let message = envelope
        .message
        .or_else(|| raw.get("error").map(value_text))
        .or_else(|| raw.get("detail").map(value_text))
        .unwrap_or_else(|| "backend reported an error".to_string());
    Some(message)
}

/// Best-effort reason from a non-2xx body: `detail`, `error` or `message`.
pub fn error_body_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    ["detail", "error", "message"]
        .iter()
        .find_map(|key| value.get(*key))
        .map(value_text)
}

fn value_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn success_envelope_yields_data() {
        let raw = json!({"status": "success", "data": {"x": 1}, "request_id": "r1"});
        assert_eq!(unwrap_envelope(raw), json!({"x": 1}));
        let raw = json!({"status": "success", "data": [1, 2, 3]});
        assert_eq!(unwrap_envelope(raw), json!([1, 2, 3]));
    }

    #[test]
    fn non_envelopes_pass_through() {
        for raw in [
            json!({"status": "ok"}),
            json!({"status": "success"}),
            json!({"status": "error", "data": {"x": 1}, "message": "boom"}),
            json!({"data": {"x": 1}}),
            json!([1, 2]),
            json!("plain"),
            Value::Null,
        ] {
            assert_eq!(unwrap_envelope(raw.clone()), raw);
        }
    }

    #[test]
    fn unwrap_is_idempotent_for_single_level() {
        let raw = json!({"status": "success", "data": {"status": "healthy", "details": {}}});
        let once = unwrap_envelope(raw);
        let twice = unwrap_envelope(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn error_envelope_message_prefers_message_field() {
        let raw = json!({"status": "error", "message": "registry offline"});
        assert_eq!(error_envelope_message(&raw).as_deref(), Some("registry offline"));
        let raw = json!({"status": "error", "error": "rate_limited", "code": 429});
        assert_eq!(error_envelope_message(&raw).as_deref(), Some("rate_limited"));
        assert_eq!(error_envelope_message(&json!({"status": "healthy"})), None);
        assert_eq!(error_envelope_message(&json!({"status": "success", "data": 1})), None);
    }

    #[test]
    fn success_without_data_is_detected() {
        assert!(is_success_without_data(&json!({"status": "success"})));
        assert!(is_success_without_data(&json!({"status": "success", "request_id": "r1"})));
        assert!(!is_success_without_data(&json!({"status": "success", "data": null})));
        assert!(!is_success_without_data(&json!({"status": "ok"})));
        assert!(!is_success_without_data(&json!({"status": "error", "message": "x"})));
        assert!(!is_success_without_data(&json!([1, 2])));
    }

    #[test]
    fn error_body_message_reads_fastapi_detail() {
        assert_eq!(
            error_body_message(r#"{"detail":"unauthorized"}"#).as_deref(),
            Some("unauthorized")
        );
        assert_eq!(error_body_message("<html>bad gateway</html>"), None);
    }
}
