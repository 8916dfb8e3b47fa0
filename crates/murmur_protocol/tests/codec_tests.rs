use murmur_domain::{ChatMessage, MessageId, SessionId};
use murmur_protocol::{
	ClientEvent, CodecError, DEFAULT_MAX_FRAME_SIZE, EditEvent, JoinEvent, MessageEvent, ServerEvent, TypingEvent,
	decode_client_event, encode_server_event,
};
use proptest::prelude::*;

fn sample_message() -> ChatMessage {
	ChatMessage {
		message_id: MessageId::new("msg_1700000000000_abcd").expect("valid MessageId"),
		content: "hello".to_string(),
		session_id: SessionId::new("u1").expect("valid SessionId"),
		timestamp: 1_700_000_000_000,
		edited_at: None,
		nickname: Some("fox".to_string()),
		signature: "deadbeef".to_string(),
	}
}

#[test]
fn decodes_join_with_and_without_session_id() {
	let ev = decode_client_event(r#"{"type":"join","sessionId":"u1","timestamp":5}"#, DEFAULT_MAX_FRAME_SIZE)
		.expect("decode join");
	assert_eq!(
		ev,
		ClientEvent::Join(JoinEvent {
			session_id: Some("u1".to_string()),
			timestamp: 5,
		})
	);

	let ev = decode_client_event(r#"{"type":"join"}"#, DEFAULT_MAX_FRAME_SIZE).expect("decode bare join");
	assert_eq!(ev, ClientEvent::Join(JoinEvent::default()));
}

#[test]
fn decodes_message_with_optional_fields() {
	let ev = decode_client_event(
		r#"{"type":"message","content":"hi","sessionId":"u1","timestamp":7,"signature":"ab","nickname":"fox"}"#,
		DEFAULT_MAX_FRAME_SIZE,
	)
	.expect("decode message");

	match ev {
		ClientEvent::Message(MessageEvent {
			content,
			session_id,
			timestamp,
			signature,
			nickname,
		}) => {
			assert_eq!(content, "hi");
			assert_eq!(session_id.as_deref(), Some("u1"));
			assert_eq!(timestamp, 7);
			assert_eq!(signature.as_deref(), Some("ab"));
			assert_eq!(nickname.as_deref(), Some("fox"));
		}
		other => panic!("expected Message, got: {other:?}"),
	}
}

#[test]
fn missing_content_decodes_as_empty() {
	let ev = decode_client_event(r#"{"type":"message","sessionId":"u1"}"#, DEFAULT_MAX_FRAME_SIZE).expect("decode");
	match ev {
		ClientEvent::Message(m) => assert!(m.content.is_empty()),
		other => panic!("expected Message, got: {other:?}"),
	}
}

#[test]
fn decodes_edit_and_typing() {
	let ev = decode_client_event(
		r#"{"type":"edit","messageId":"msg_1","newContent":"fixed","sessionId":"u1","timestamp":9}"#,
		DEFAULT_MAX_FRAME_SIZE,
	)
	.expect("decode edit");
	assert_eq!(
		ev,
		ClientEvent::Edit(EditEvent {
			message_id: "msg_1".to_string(),
			new_content: "fixed".to_string(),
			session_id: Some("u1".to_string()),
			timestamp: 9,
			signature: None,
		})
	);

	let ev = decode_client_event(r#"{"type":"typing","sessionId":"u1","typing":true}"#, DEFAULT_MAX_FRAME_SIZE)
		.expect("decode typing");
	assert_eq!(
		ev,
		ClientEvent::Typing(TypingEvent {
			session_id: Some("u1".to_string()),
			typing: true,
		})
	);
}

#[test]
fn unknown_and_missing_types_are_distinguished() {
	match decode_client_event(r#"{"type":"shout","content":"x"}"#, DEFAULT_MAX_FRAME_SIZE) {
		Err(CodecError::UnknownType(t)) => assert_eq!(t, "shout"),
		other => panic!("expected UnknownType, got: {other:?}"),
	}

	assert!(matches!(
		decode_client_event(r#"{"content":"x"}"#, DEFAULT_MAX_FRAME_SIZE),
		Err(CodecError::MissingType)
	));

	assert!(matches!(
		decode_client_event("not json", DEFAULT_MAX_FRAME_SIZE),
		Err(CodecError::Json(_))
	));
}

#[test]
fn message_event_flattens_fields_next_to_type() {
	let text = encode_server_event(&ServerEvent::Message(sample_message())).expect("encode");
	let v: serde_json::Value = serde_json::from_str(&text).expect("json");

	assert_eq!(v["type"], "message");
	assert_eq!(v["messageId"], "msg_1700000000000_abcd");
	assert_eq!(v["content"], "hello");
	assert_eq!(v["sessionId"], "u1");
	assert!(v["editedAt"].is_null());
	assert_eq!(v["signature"], "deadbeef");
}

#[test]
fn message_edited_wraps_full_message() {
	let mut msg = sample_message();
	msg.edited_at = Some(1_700_000_000_500);

	let text = encode_server_event(&ServerEvent::MessageEdited { message: msg }).expect("encode");
	let v: serde_json::Value = serde_json::from_str(&text).expect("json");

	assert_eq!(v["type"], "message_edited");
	assert_eq!(v["message"]["messageId"], "msg_1700000000000_abcd");
	assert_eq!(v["message"]["editedAt"], 1_700_000_000_500_i64);
}

#[test]
fn small_events_use_expected_shapes() {
	let cases = [
		(ServerEvent::UserCount { count: 3 }, r#"{"type":"user_count","count":3}"#),
		(
			ServerEvent::Typing {
				session_id: SessionId::new("u2").expect("valid SessionId"),
				typing: false,
			},
			r#"{"type":"typing","sessionId":"u2","typing":false}"#,
		),
		(ServerEvent::system("welcome"), r#"{"type":"system","content":"welcome"}"#),
		(ServerEvent::error("nope"), r#"{"type":"error","content":"nope"}"#),
	];

	for (event, expected) in cases {
		assert_eq!(encode_server_event(&event).expect("encode"), expected);
	}
}

proptest! {
	#[test]
	fn decoder_never_panics_on_arbitrary_text(s in ".{0,256}") {
		let _ = decode_client_event(&s, DEFAULT_MAX_FRAME_SIZE);
	}

	#[test]
	fn message_content_survives_decode(content in "\\PC{0,200}") {
		let text = serde_json::json!({"type": "message", "content": content, "sessionId": "u1"}).to_string();
		match decode_client_event(&text, DEFAULT_MAX_FRAME_SIZE) {
			Ok(ClientEvent::Message(m)) => prop_assert_eq!(m.content, content),
			other => prop_assert!(false, "unexpected decode result: {:?}", other),
		}
	}
}
