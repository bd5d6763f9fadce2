use super::*;

fn payload(frame: &[u8]) -> &[u8] {
    let len = i32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
    assert_eq!(len as usize, frame.len() - 4, "length prefix");
    &frame[4..]
}

#[test]
fn connect_request_uses_the_native_field_layout() {
    let frame = ConnectRequest::new_session(30_000).to_frame();
    let body = payload(&frame);

    // version + zxid + timeout + session + password(4 + 16) + read-only flag
    assert_eq!(body.len(), 4 + 8 + 4 + 8 + 4 + 16 + 1);
    let decoded = ConnectRequest::decode(body).expect("decode");
    assert_eq!(decoded.timeout_ms, 30_000);
    assert_eq!(decoded.session_id, 0);
    assert_eq!(decoded.password.len(), 16);
}

#[test]
fn connect_response_without_read_only_flag_still_decodes() {
    let mut w = JuteWriter::new();
    w.write_i32(0)
        .write_i32(4_000)
        .write_i64(0x1234)
        .write_buffer(Some(&[7u8; 16][..]));
    let decoded = ConnectResponse::decode(&w.into_inner()).expect("decode");
    assert_eq!(decoded.timeout_ms, 4_000);
    assert_eq!(decoded.session_id, 0x1234);
    assert!(!decoded.read_only);
}

#[test]
fn request_frames_carry_xid_and_op_code() {
    let request = Request::SetData {
        path: "/config".into(),
        data: b"v2".to_vec(),
        version: -1,
    };
    let frame = request.to_frame(7);
    let body = payload(&frame);
    let mut r = JuteReader::new(body);
    assert_eq!(r.read_i32().expect("xid"), 7);
    assert_eq!(r.read_i32().expect("op"), 5);
    assert_eq!(r.read_str("path").expect("path"), "/config");
    assert_eq!(r.read_buffer().expect("data"), Some(b"v2".to_vec()));
    assert_eq!(r.read_i32().expect("version"), -1);
    assert_eq!(r.remaining(), 0);
}

#[test]
fn create_request_decodes_back_with_acl_and_flags() {
    let request = Request::Create {
        path: "/locks/lock-".into(),
        data: Vec::new(),
        acl: AclEntry::open_unsafe(),
        flags: 3,
    };
    let frame = request.to_frame(42);
    let (xid, decoded) = Request::decode(payload(&frame)).expect("decode");
    assert_eq!(xid, 42);
    assert_eq!(decoded, request);
}

#[test]
fn unknown_op_codes_are_rejected() {
    let mut w = JuteWriter::new();
    w.write_i32(1).write_i32(99);
    assert_eq!(
        Request::decode(&w.into_inner()),
        Err(ProtocolError::UnknownOpCode(99))
    );
}

#[test]
fn children_reply_decodes_names_and_stat() {
    let stat = Stat {
        num_children: 2,
        cversion: 4,
        ..Stat::default()
    };
    let mut w = JuteWriter::new();
    w.write_i32(2).write_str("a").write_str("b").write_stat(&stat);
    let (children, decoded_stat) = decode_children(&w.into_inner()).expect("decode");
    assert_eq!(children, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(decoded_stat, stat);
}

#[test]
fn null_data_buffer_decodes_as_empty_payload() {
    let mut w = JuteWriter::new();
    w.write_buffer(None).write_stat(&Stat::default());
    let (data, _) = decode_data(&w.into_inner()).expect("decode");
    assert!(data.is_empty());
}

#[test]
fn truncated_stat_reports_missing_bytes() {
    let err = decode_stat(&[0u8; 10]).expect_err("truncated");
    assert!(matches!(err, ProtocolError::Truncated { needed: 8, .. }));
}

#[test]
fn watcher_event_body_follows_the_reply_header() {
    let mut w = JuteWriter::new();
    ReplyHeader {
        xid: NOTIFICATION_XID,
        zxid: -1,
        err: 0,
    }
    .write(&mut w);
    RawWatchEvent {
        event_type: 3,
        state: 3,
        path: "/config".into(),
    }
    .write(&mut w);

    let bytes = w.into_inner();
    let mut r = JuteReader::new(&bytes);
    let header = ReplyHeader::read(&mut r).expect("header");
    assert_eq!(header.xid, NOTIFICATION_XID);
    let event = RawWatchEvent::decode(&mut r).expect("event");
    assert_eq!(event.event_type, 3);
    assert_eq!(event.path, "/config");
}

#[test]
fn frame_length_limits_are_enforced() {
    assert_eq!(check_frame_len(16), Ok(16));
    assert_eq!(check_frame_len(-3), Err(ProtocolError::NegativeLength(-3)));
    assert!(matches!(
        check_frame_len(i32::MAX),
        Err(ProtocolError::FrameTooLarge(_))
    ));
}
