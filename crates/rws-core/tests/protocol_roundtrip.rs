//! Integration tests for the rws-core protocol layer.
//!
//! These tests drive the public API end to end: envelopes are serialized,
//! wrapped in frames, split across arbitrary read boundaries, reassembled by
//! the streaming decoder and parsed back, the way the client's read loop does.

use rws_core::{
    compute_accept_key, decode_envelope, decode_text, encode_control, encode_envelope, encode_text,
    protocol::handshake::{find_head_end, SOCKET_ID_HEADER},
    validate_upgrade, Command, Envelope, FrameDecoder, MessageIdGenerator, Opcode, ProtocolError,
    Recipient, UpgradeRequest, UpgradeResponse, WsUrl,
};
use serde_json::json;

/// Builds a string of exactly `len` bytes mixing 2-byte and 1-byte characters.
fn text_of_len(len: usize) -> String {
    let mut s = String::with_capacity(len);
    while s.len() + 2 <= len {
        s.push('é');
    }
    while s.len() < len {
        s.push('a');
    }
    s
}

fn assert_text_roundtrip(len: usize) {
    let original = text_of_len(len);
    assert_eq!(original.len(), len);
    let bytes = encode_text(&original).expect("encode must succeed");
    let decoded = decode_text(&bytes).expect("decode must succeed");
    assert_eq!(decoded, original, "round trip failed for length {len}");
}

#[test]
fn test_text_roundtrip_every_short_length() {
    for len in 0..=1024 {
        assert_text_roundtrip(len);
    }
}

#[test]
fn test_text_roundtrip_across_full_16_bit_range() {
    let boundaries = [125, 126, 127, 65_534, 65_535];
    for len in boundaries.into_iter().chain((1025..=65_535).step_by(251)) {
        assert_text_roundtrip(len);
    }
}

#[test]
fn test_text_longer_than_16_bits_is_rejected() {
    let too_long = "a".repeat(65_536);
    assert_eq!(encode_text(&too_long), Err(ProtocolError::PayloadTooLarge(65_536)));
}

#[test]
fn test_streamed_envelopes_survive_byte_by_byte_delivery() {
    // Arrange – three envelopes and a ping, concatenated on one wire
    let ids = MessageIdGenerator::new();
    let envelopes = vec![
        Envelope::new(ids.next_id(), 11, 0u64, Command::InfoSocketId, None),
        Envelope::new(ids.next_id(), 11, vec![12u64, 13], Command::SocketSend, Some(json!("x".repeat(300)))),
        Envelope::new(ids.next_id(), 11, "lobby", Command::RoomSend, Some(json!({"k": [1, 2, 3]}))),
    ];
    let mut wire = Vec::new();
    for env in &envelopes {
        wire.extend(encode_text(&encode_envelope(env).unwrap()).unwrap());
    }
    wire.extend(encode_control(Opcode::Ping));

    // Act – feed one byte at a time
    let mut decoder = FrameDecoder::new();
    let mut frames = Vec::new();
    for byte in &wire {
        decoder.extend(std::slice::from_ref(byte));
        while let Some(frame) = decoder.next_frame().unwrap() {
            frames.push(frame);
        }
    }

    // Assert
    assert_eq!(frames.len(), 4);
    assert_eq!(frames[3].opcode, Opcode::Ping);
    for (frame, env) in frames.into_iter().take(3).zip(&envelopes) {
        let decoded = decode_envelope(&frame.into_text().unwrap()).unwrap();
        assert_eq!(&decoded, env);
    }
    assert_eq!(decoder.buffered_len(), 0);
}

#[test]
fn test_route_envelope_carries_uri_and_body() {
    let env = Envelope::new(
        1,
        2,
        0u64,
        Command::Route,
        Some(json!({"uri": "/returned/back/42", "body": {"a": 1}})),
    );

    let decoded = decode_envelope(&encode_envelope(&env).unwrap()).unwrap();

    assert!(decoded.is_route());
    assert_eq!(decoded.to, Recipient::RELAY);
    assert_eq!(decoded.payload.unwrap()["uri"], "/returned/back/42");
}

#[test]
fn test_handshake_request_and_response_fit_together() {
    // Arrange – build a request and play the relay's part by hand
    let url = WsUrl::parse("ws://localhost:3211?authkey=TRTmrt").unwrap();
    let request = UpgradeRequest::new(url, vec!["jsonRWS".to_string()]);
    let request_text = String::from_utf8(request.to_bytes()).unwrap();
    let sent_key = request_text
        .lines()
        .find_map(|l| l.strip_prefix("Sec-WebSocket-Key: "))
        .unwrap()
        .to_string();

    let response_bytes = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Protocol: jsonRWS\r\n\
         {}: 210129163129492100\r\n\r\n",
        compute_accept_key(&sent_key),
        SOCKET_ID_HEADER,
    );

    // Act
    let head_len = find_head_end(response_bytes.as_bytes()).unwrap();
    let response = UpgradeResponse::parse(&response_bytes.as_bytes()[..head_len]).unwrap();
    let negotiated = validate_upgrade(&response, request.key(), request.protocols()).unwrap();

    // Assert
    assert_eq!(negotiated.as_deref(), Some("jsonRWS"));
    assert_eq!(response.socket_id(), Some(210_129_163_129_492_100));
}
