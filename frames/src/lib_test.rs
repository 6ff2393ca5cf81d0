use super::*;

fn sample_frame() -> Frame {
    Frame {
        id: "id-1".to_owned(),
        ts: 42,
        room: Some("room-1".to_owned()),
        sender: "participant-1".to_owned(),
        kind: Kind::ReorderConfirm,
        object_id: Some("object-1".to_owned()),
        sequence: Some(7),
        data: serde_json::json!({
            "rank": "a0V",
            "selected": true,
            "tags": ["a", "b"],
            "nested": {"k": "v"},
            "nil": null
        }),
    }
}

fn encode_wire(wire: &WireFrame) -> Vec<u8> {
    let mut bytes = Vec::new();
    wire.encode(&mut bytes).expect("encode");
    bytes
}

#[test]
fn kind_numeric_mapping_matches_wire_enum() {
    assert_eq!(Kind::Create.as_i32(), 0);
    assert_eq!(Kind::ReorderRequest.as_i32(), 3);
    assert_eq!(Kind::ReorderConfirm.as_i32(), 4);
    assert_eq!(Kind::LockStateResponse.as_i32(), 8);
}

#[test]
fn every_kind_survives_the_wire() {
    let kinds = [
        Kind::Create,
        Kind::Update,
        Kind::Delete,
        Kind::ReorderRequest,
        Kind::ReorderConfirm,
        Kind::Lock,
        Kind::Unlock,
        Kind::LockStateRequest,
        Kind::LockStateResponse,
    ];
    for kind in kinds {
        assert_eq!(Kind::from_i32(kind.as_i32()).expect("kind"), kind);
    }
}

#[test]
fn kind_from_wire_rejects_out_of_range_value() {
    let err = Kind::from_i32(99).expect_err("kind should be invalid");
    assert!(matches!(err, CodecError::InvalidKind(99)));
}

#[test]
fn encode_decode_preserves_frame() {
    let frame = sample_frame();
    let decoded = decode_frame(&encode_frame(&frame)).expect("decode should succeed");
    assert_eq!(decoded, frame);
}

#[test]
fn sequence_stays_integral_across_the_wire() {
    let mut frame = sample_frame();
    frame.sequence = Some(u64::from(u32::MAX) + 5);
    let decoded = decode_frame(&encode_frame(&frame)).expect("decode");
    assert_eq!(decoded.sequence, Some(u64::from(u32::MAX) + 5));
}

#[test]
fn decode_frame_rejects_malformed_bytes() {
    let err = decode_frame(&[0xff, 0x00, 0x01]).expect_err("bytes should fail");
    assert!(matches!(err, CodecError::Decode(_)));
}

#[test]
fn decode_frame_rejects_invalid_wire_kind() {
    let wire = WireFrame {
        id: "id-1".to_owned(),
        ts: 1,
        room: None,
        sender: "p".to_owned(),
        kind: 77,
        object_id: None,
        sequence: None,
        data: Some(json_to_proto_value(&serde_json::json!({}))),
    };

    let err = decode_frame(&encode_wire(&wire)).expect_err("kind should fail");
    assert!(matches!(err, CodecError::InvalidKind(77)));
}

#[test]
fn decode_frame_defaults_missing_data_to_empty_object() {
    let wire = WireFrame {
        id: "id-1".to_owned(),
        ts: 1,
        room: None,
        sender: "p".to_owned(),
        kind: Kind::LockStateRequest.as_i32(),
        object_id: None,
        sequence: None,
        data: None,
    };

    let frame = decode_frame(&encode_wire(&wire)).expect("decode");
    assert_eq!(frame.data, serde_json::json!({}));
}

#[test]
fn decode_frame_converts_nan_number_to_json_null() {
    let wire = WireFrame {
        id: "id-1".to_owned(),
        ts: 1,
        room: None,
        sender: "p".to_owned(),
        kind: Kind::Update.as_i32(),
        object_id: None,
        sequence: None,
        data: Some(prost_types::Value { kind: Some(prost_types::value::Kind::NumberValue(f64::NAN)) }),
    };

    let frame = decode_frame(&encode_wire(&wire)).expect("decode");
    assert_eq!(frame.data, Value::Null);
}

#[test]
fn integer_json_numbers_stay_integers() {
    let mut frame = sample_frame();
    frame.data = serde_json::json!({"x": 2, "nested": {"w": -40}, "list": [3, 0]});

    let decoded = decode_frame(&encode_frame(&frame)).expect("decode");
    assert_eq!(decoded.data, frame.data);
    assert!(decoded.data["x"].is_i64());
}

#[test]
fn fractional_numbers_stay_floats() {
    let mut frame = sample_frame();
    frame.data = serde_json::json!({"x": 2.5, "huge": 1e300});

    let decoded = decode_frame(&encode_frame(&frame)).expect("decode");
    assert_eq!(decoded.data["x"], serde_json::json!(2.5));
    assert!(decoded.data["huge"].is_f64());
}

#[test]
fn kind_serializes_as_camel_case_json() {
    assert_eq!(serde_json::to_string(&Kind::ReorderRequest).expect("serialize"), "\"reorderRequest\"");
    assert_eq!(serde_json::to_string(&Kind::Lock).expect("serialize"), "\"lock\"");
    assert_eq!(
        serde_json::from_str::<Kind>("\"lockStateResponse\"").expect("deserialize"),
        Kind::LockStateResponse
    );
}

#[test]
fn kind_label_matches_json_name() {
    let json = serde_json::to_string(&Kind::LockStateRequest).expect("serialize");
    assert_eq!(json.trim_matches('"'), Kind::LockStateRequest.as_str());
}
