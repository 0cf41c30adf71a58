use super::*;
use serde_json::json;

fn body(value: Value) -> Vec<u8> {
    serde_json::to_vec(&value).unwrap()
}

#[test]
fn test_parse_current_envelope() {
    let envelope = TaskEnvelope::parse(&body(json!({
        "task_id": "t-1",
        "operation_data": {
            "operation": {
                "tipo": "arqueo",
                "detalle": {"fecha": "08112024", "caja": "204"}
            }
        }
    })))
    .unwrap();

    assert_eq!(envelope.task_id.as_deref(), Some("t-1"));
    assert_eq!(envelope.kind.as_deref(), Some("arqueo"));
    assert_eq!(envelope.payload["caja"], "204");
}

#[test]
fn test_parse_legacy_envelope() {
    let envelope = TaskEnvelope::parse(&body(json!({
        "task_id": 17,
        "operation_data": {
            "operation": {"fecha": "08112024", "caja": "204"}
        }
    })))
    .unwrap();

    assert_eq!(envelope.task_id.as_deref(), Some("17"));
    assert!(envelope.kind.is_none());
    assert_eq!(envelope.payload["fecha"], "08112024");
}

#[test]
fn test_parse_without_task_id() {
    let envelope = TaskEnvelope::parse(&body(json!({
        "operation_data": {"operation": {"caja": "204"}}
    })))
    .unwrap();
    assert!(envelope.task_id.is_none());
}

#[test]
fn test_parse_rejects_malformed_bodies() {
    assert!(matches!(
        TaskEnvelope::parse(b"not json"),
        Err(BusError::Parse(_))
    ));
    assert!(matches!(
        TaskEnvelope::parse(&body(json!({"task_id": "t-1"}))),
        Err(BusError::Parse(_))
    ));
    assert!(matches!(
        TaskEnvelope::parse(&body(json!({
            "task_id": "t-1",
            "operation_data": {"operation": {"tipo": "arqueo", "detalle": "oops"}}
        }))),
        Err(BusError::Parse(_))
    ));
}

#[test]
fn test_result_message_shape() {
    let result = OperationResult::rejected("Validation error: bad amount");
    let message = ResultMessage::new(Some("t-1".to_string()), result);

    let value: Value = serde_json::from_slice(&message.to_json().unwrap()).unwrap();
    assert_eq!(value["status"], "FAILED");
    assert_eq!(value["operation_id"], "t-1");
    assert_eq!(value["result"]["status"], "FAILED");
    assert_eq!(value["result"]["error"], "Validation error: bad amount");
    assert_eq!(value["result"]["legacy_session_open"], false);
    assert!(value["result"]["duration"].is_string());
}
