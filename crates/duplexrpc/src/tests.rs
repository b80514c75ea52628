use serde_json::json;
use serde_json::Value;

use crate::*;

/// JSON behind a fixed prefix, so tests can tell which transformer ran.
struct Prefixed;

impl Transformer for Prefixed {
    fn stringify(&self, value: &Value) -> Result<String> {
        Ok(format!("x:{}", Json.stringify(value)?))
    }

    fn parse(&self, frame: &str) -> Result<Value> {
        let body = frame
            .strip_prefix("x:")
            .ok_or_else(|| Error::Parse("missing prefix".into()))?;
        Json.parse(body)
    }
}

fn frame(value: Value) -> String {
    value.to_string()
}

// ============================================================================
//  WIRE SHAPES
// ============================================================================

#[test]
fn test_request_wire_shape() -> anyhow::Result<()> {
    let request = RequestEnvelope::new("7", vec!["debug".into(), "ping".into()], RouteType::Query, json!({"n": 1}));
    let text = ClientEnvelope::from(request).encode(&Json)?;
    let value: Value = serde_json::from_str(&text)?;

    assert_eq!(value, json!({
        "protocol": "dassie-rpc-01",
        "type": "request",
        "id": "7",
        "path": ["debug", "ping"],
        "routeType": "query",
        "input": {"n": 1},
    }));
    Ok(())
}

#[test]
fn test_response_wire_shapes() -> anyhow::Result<()> {
    let ok = ServerEnvelope::from(ResponseEnvelope::success("1", json!("pong"))).encode(&Json)?;
    let err = ServerEnvelope::from(ResponseEnvelope::error("2", "nope")).encode(&Json)?;

    assert_eq!(serde_json::from_str::<Value>(&ok)?, json!({
        "protocol": "dassie-rpc-01",
        "type": "response",
        "id": "1",
        "result": {"type": "success", "data": "pong"},
    }));
    assert_eq!(serde_json::from_str::<Value>(&err)?, json!({
        "protocol": "dassie-rpc-01",
        "type": "response",
        "id": "2",
        "result": {"type": "error", "message": "nope"},
    }));
    Ok(())
}

#[test]
fn test_event_and_cancel_wire_shapes() -> anyhow::Result<()> {
    let event = ServerEnvelope::from(EventEnvelope::new("3", vec![json!(1), json!(2)])).encode(&Json)?;
    let cancel = ClientEnvelope::from(CancelEnvelope::new("3")).encode(&Json)?;

    assert_eq!(serde_json::from_str::<Value>(&event)?, json!({
        "protocol": "dassie-rpc-01", "type": "event", "id": "3", "data": [1, 2],
    }));
    assert_eq!(serde_json::from_str::<Value>(&cancel)?, json!({
        "protocol": "dassie-rpc-01", "type": "cancel", "id": "3",
    }));
    Ok(())
}

// ============================================================================
//  DECODING
// ============================================================================

#[test]
fn test_decode_request_without_input() {
    let text = frame(json!({
        "protocol": PROTOCOL,
        "type": "request",
        "id": "1",
        "path": ["ping"],
        "routeType": "subscription",
    }));

    let envelope = ClientEnvelope::decode(&Json, &text).expect("decode");
    match envelope {
        ClientEnvelope::Request(request) => {
            assert_eq!(request.id, "1");
            assert_eq!(request.path, vec!["ping".to_string()]);
            assert_eq!(request.route_type, RouteType::Subscription);
            assert_eq!(request.input, Value::Null);
        }
        other => panic!("Expected Request, got {:?}", other),
    }
}

#[test]
fn test_decode_success_without_data() {
    let text = frame(json!({
        "protocol": PROTOCOL,
        "type": "response",
        "id": "4",
        "result": {"type": "success"},
    }));

    let envelope = ServerEnvelope::decode(&Json, &text).expect("decode");
    assert_eq!(envelope, ServerEnvelope::Response(ResponseEnvelope::success("4", Value::Null)));
    assert_eq!(envelope.id(), "4");
}

#[test]
fn test_decode_rejects_foreign_protocol_tag() {
    let text = frame(json!({"protocol": "other-rpc-02", "type": "cancel", "id": "1"}));

    let err = ClientEnvelope::decode(&Json, &text).unwrap_err();
    assert_eq!(err, Error::ProtocolMismatch("other-rpc-02".into()));
}

#[test]
fn test_decode_rejects_missing_protocol_tag() {
    let text = frame(json!({"type": "cancel", "id": "1"}));

    let err = ClientEnvelope::decode(&Json, &text).unwrap_err();
    assert!(matches!(err, Error::InvalidEnvelope(_)), "got {:?}", err);
}

#[test]
fn test_decode_rejects_wrong_direction() {
    // A server must not accept server-originated envelopes.
    let text = ServerEnvelope::from(ResponseEnvelope::success("1", Value::Null))
        .encode(&Json)
        .unwrap();

    let err = ClientEnvelope::decode(&Json, &text).unwrap_err();
    assert!(matches!(err, Error::InvalidEnvelope(_)), "got {:?}", err);
}

#[test]
fn test_decode_rejects_unknown_route_type() {
    let text = frame(json!({
        "protocol": PROTOCOL,
        "type": "request",
        "id": "1",
        "path": [],
        "routeType": "stream",
    }));

    assert!(matches!(ClientEnvelope::decode(&Json, &text), Err(Error::InvalidEnvelope(_))));
}

#[test]
fn test_decode_rejects_empty_event_batch() {
    let text = frame(json!({"protocol": PROTOCOL, "type": "event", "id": "1", "data": []}));

    let err = ServerEnvelope::decode(&Json, &text).unwrap_err();
    assert_eq!(err, Error::InvalidEnvelope("event batch is empty".into()));
}

#[test]
fn test_decode_malformed_text() {
    let err = ClientEnvelope::decode(&Json, "{not json").unwrap_err();
    assert!(matches!(err, Error::Parse(_)), "got {:?}", err);

    let err = ClientEnvelope::decode(&Json, "[1, 2, 3]").unwrap_err();
    assert!(matches!(err, Error::InvalidEnvelope(_)), "got {:?}", err);
}

// ============================================================================
//  TRANSFORMERS
// ============================================================================

#[test]
fn test_custom_transformer_is_used_both_ways() {
    let envelope = ClientEnvelope::from(CancelEnvelope::new("9"));
    let text = envelope.encode(&Prefixed).unwrap();
    assert!(text.starts_with("x:{"));

    let decoded = ClientEnvelope::decode(&Prefixed, &text).unwrap();
    assert_eq!(decoded, envelope);

    // Plain JSON cannot read the prefixed frame.
    assert!(matches!(ClientEnvelope::decode(&Json, &text), Err(Error::Parse(_))));
}

#[test]
fn test_route_type_display() {
    assert_eq!(RouteType::Query.to_string(), "query");
    assert_eq!(RouteType::Mutation.to_string(), "mutation");
    assert_eq!(RouteType::Subscription.to_string(), "subscription");
}
