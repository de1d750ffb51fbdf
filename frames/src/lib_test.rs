use super::*;

fn sample_frame() -> Frame {
    let mut metadata = Map::new();
    metadata.insert("notebook_id".to_owned(), Value::from("nb-1"));
    Frame {
        kind: "update_notebook".to_owned(),
        client_id: Some("client01".to_owned()),
        request_id: Some("req00001".to_owned()),
        initiator_id: None,
        body: Value::from(serde_json::json!({
            "updates": [
                {"op": "replace", "path": ["cell_inputs", "a", "code"], "value": "1 + 1"}
            ],
            "ok": true,
            "nil": null,
            "x": 1.25
        })),
        metadata,
    }
}

#[test]
fn encode_decode_round_trip_preserves_frame() {
    let frame = sample_frame();
    let bytes = encode_frame(&frame).expect("encode");
    let decoded = decode_frame(&bytes).expect("decode should succeed");
    assert_eq!(decoded, frame);
}

#[test]
fn nested_values_round_trip() {
    let value = Value::from(serde_json::json!({
        "rows": [{"id": 1, "name": "a"}, {"id": -2, "name": "b"}],
        "meta": {"next": null, "count": 2.5, "big": 18_446_744_073_709_551_615_u64}
    }));
    let decoded = decode(&encode(&value).expect("encode")).expect("decode");
    assert_eq!(decoded, value);
}

#[test]
fn every_typed_array_kind_round_trips() {
    let arrays = [
        TypedArray::Int8(vec![-128, 0, 127]),
        TypedArray::UInt8(vec![0, 1, 255]),
        TypedArray::Int16(vec![-32_768, 7, 32_767]),
        TypedArray::UInt16(vec![0, 65_535]),
        TypedArray::Int32(vec![i32::MIN, -1, i32::MAX]),
        TypedArray::UInt32(vec![0, u32::MAX]),
        TypedArray::Float32(vec![1.5, -0.25]),
        TypedArray::Float64(vec![std::f64::consts::PI, -1e300]),
    ];
    for arr in arrays {
        let value = Value::TypedArray(arr);
        let decoded = decode(&encode(&value).expect("encode")).expect("decode");
        assert_eq!(decoded, value);
    }
}

#[test]
fn typed_arrays_use_engine_extension_codes() {
    let expected: [(TypedArray, i8); 8] = [
        (TypedArray::Int8(vec![1]), 0x11),
        (TypedArray::UInt8(vec![1]), 0x12),
        (TypedArray::Int16(vec![1]), 0x13),
        (TypedArray::UInt16(vec![1]), 0x14),
        (TypedArray::Int32(vec![1]), 0x15),
        (TypedArray::UInt32(vec![1]), 0x16),
        (TypedArray::Float32(vec![1.0]), 0x17),
        (TypedArray::Float64(vec![1.0]), 0x18),
    ];
    for (arr, code) in expected {
        let bytes = encode(&Value::TypedArray(arr)).expect("encode");
        let wire = rmpv::decode::read_value(&mut bytes.as_slice()).expect("msgpack");
        let rmpv::Value::Ext(actual, _) = wire else {
            panic!("expected extension value");
        };
        assert_eq!(actual, code);
    }
}

#[test]
fn int16_payload_is_little_endian() {
    let bytes = encode(&Value::TypedArray(TypedArray::Int16(vec![0x0102]))).expect("encode");
    let wire = rmpv::decode::read_value(&mut bytes.as_slice()).expect("msgpack");
    assert_eq!(wire, rmpv::Value::Ext(0x13, vec![0x02, 0x01]));
}

#[test]
fn timestamp_round_trips_as_extension_0x0d() {
    let value = Value::Timestamp(1_700_000_000_123);
    let bytes = encode(&value).expect("encode");
    let wire = rmpv::decode::read_value(&mut bytes.as_slice()).expect("msgpack");
    assert_eq!(
        wire,
        rmpv::Value::Ext(0x0d, 1_700_000_000_123_i64.to_le_bytes().to_vec())
    );
    assert_eq!(decode(&bytes).expect("decode"), value);
}

#[test]
fn negative_timestamps_within_safe_range_round_trip() {
    let value = Value::Timestamp(-MAX_SAFE_INTEGER);
    assert_eq!(decode(&encode(&value).expect("encode")).expect("decode"), value);
}

#[test]
fn decoding_timestamp_beyond_safe_range_fails() {
    let wire = rmpv::Value::Ext(0x0d, (MAX_SAFE_INTEGER + 1).to_le_bytes().to_vec());
    let mut bytes = Vec::new();
    rmpv::encode::write_value(&mut bytes, &wire).expect("msgpack");

    let err = decode(&bytes).expect_err("timestamp should be rejected");
    assert_eq!(err, CodecError::OutOfRange(MAX_SAFE_INTEGER + 1));
    assert!(err.to_string().contains("value out of range"));
}

#[test]
fn encoding_timestamp_beyond_safe_range_fails_loudly() {
    let err = encode(&Value::Timestamp(i64::MAX)).expect_err("timestamp should be rejected");
    assert!(matches!(err, CodecError::OutOfRange(i64::MAX)));
}

#[test]
fn misaligned_typed_array_payload_is_rejected() {
    let wire = rmpv::Value::Ext(0x15, vec![1, 2, 3]);
    let mut bytes = Vec::new();
    rmpv::encode::write_value(&mut bytes, &wire).expect("msgpack");

    let err = decode(&bytes).expect_err("payload should be rejected");
    assert!(matches!(err, CodecError::Misaligned { code: 0x15, len: 3, width: 4 }));
}

#[test]
fn unknown_extension_is_preserved() {
    let value = Value::Ext { code: 0x42, data: vec![9, 9] };
    assert_eq!(decode(&encode(&value).expect("encode")).expect("decode"), value);
}

#[test]
fn decode_rejects_truncated_bytes() {
    // fixarray of two elements with only one present
    let err = decode(&[0x92, 0x01]).expect_err("bytes should fail");
    assert!(matches!(err, CodecError::Decode(_)));
}

#[test]
fn decode_rejects_trailing_bytes() {
    let err = decode(&[0x01, 0x02]).expect_err("bytes should fail");
    assert_eq!(err, CodecError::TrailingBytes(1));
}

#[test]
fn decode_rejects_non_string_map_keys() {
    let wire = rmpv::Value::Map(vec![(rmpv::Value::from(1), rmpv::Value::Nil)]);
    let mut bytes = Vec::new();
    rmpv::encode::write_value(&mut bytes, &wire).expect("msgpack");

    assert!(matches!(decode(&bytes), Err(CodecError::NonStringKey(_))));
}

#[test]
fn decode_frame_requires_type_tag() {
    let bytes = encode(&Value::from(serde_json::json!({"body": {}}))).expect("encode");
    let err = decode_frame(&bytes).expect_err("frame should fail");
    assert!(matches!(err, CodecError::InvalidFrame(_)));
}

#[test]
fn decode_frame_rejects_non_map_value() {
    let bytes = encode(&Value::from(3_i64)).expect("encode");
    assert!(matches!(decode_frame(&bytes), Err(CodecError::InvalidFrame(_))));
}

#[test]
fn decode_frame_reads_message_key_as_body() {
    let bytes = encode(&Value::from(serde_json::json!({
        "type": "notebook_diff",
        "initiator_id": "other",
        "message": {"patches": []},
        "notebook_id": "nb-1"
    })))
    .expect("encode");

    let frame = decode_frame(&bytes).expect("decode");
    assert_eq!(frame.kind, "notebook_diff");
    assert_eq!(frame.initiator_id.as_deref(), Some("other"));
    assert_eq!(frame.body, Value::from(serde_json::json!({"patches": []})));
    assert_eq!(frame.meta_str("notebook_id"), Some("nb-1"));
}

#[test]
fn decode_frame_defaults_missing_body_to_empty_map() {
    let bytes = encode(&Value::from(serde_json::json!({"type": "ping"}))).expect("encode");
    let frame = decode_frame(&bytes).expect("decode");
    assert_eq!(frame.body, Value::empty_map());
    assert!(frame.metadata.is_empty());
}

#[test]
fn encode_frame_omits_absent_ids() {
    let frame = Frame {
        kind: "ping".to_owned(),
        body: Value::empty_map(),
        ..Frame::default()
    };
    let value = decode(&encode_frame(&frame).expect("encode")).expect("decode");
    let keys = value.as_map().expect("map").keys().cloned().collect::<Vec<_>>();
    assert_eq!(keys, vec!["body".to_owned(), "type".to_owned()]);
}
