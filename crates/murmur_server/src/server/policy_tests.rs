#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};

use murmur_domain::{ChatMessage, MessageId, SessionId};
use proptest::prelude::*;

use crate::server::policy::{
	AdmissionError, AdmissionPolicy, PolicyConfig, PolicyViolation, check_edit_ownership, check_edit_window, check_rate,
	sanitize_content, validate_content, validate_nickname,
};
use crate::server::registry::SessionMeta;

fn ip(n: u8) -> IpAddr {
	IpAddr::V4(Ipv4Addr::new(10, 1, 0, n))
}

fn meta_with(times: &[i64]) -> SessionMeta {
	let mut meta = SessionMeta::new(ip(1), 0);
	for t in times {
		meta.record_message(*t, 60_000);
	}
	meta
}

fn message_owned_by(owner: &str, ts: i64) -> ChatMessage {
	ChatMessage {
		message_id: MessageId::new("msg_1").unwrap(),
		content: "hi".to_string(),
		session_id: SessionId::new(owner).unwrap(),
		timestamp: ts,
		edited_at: None,
		nickname: None,
		signature: String::new(),
	}
}

#[test]
fn sanitize_strips_controls_and_trims() {
	assert_eq!(sanitize_content("  a\u{0}b\u{1F}c\u{7F}  "), "abc");
	assert_eq!(sanitize_content("line\nbreak"), "linebreak");
	assert_eq!(sanitize_content("안녕 하세요"), "안녕 하세요");
}

#[test]
fn content_length_counts_characters_not_bytes() {
	let cfg = PolicyConfig::default();
	assert!(validate_content(&"가".repeat(500), &cfg).is_ok());
	assert_eq!(
		validate_content(&"가".repeat(501), &cfg),
		Err(PolicyViolation::ContentTooLong { len: 501, max: 500 })
	);
	assert_eq!(validate_content("   ", &cfg), Err(PolicyViolation::EmptyContent));
}

#[test]
fn nickname_blank_is_absent() {
	let cfg = PolicyConfig::default();
	assert_eq!(validate_nickname(None, &cfg), Ok(None));
	assert_eq!(validate_nickname(Some("  "), &cfg), Ok(None));
	assert_eq!(validate_nickname(Some(&"x".repeat(20)), &cfg), Ok(Some("x".repeat(20))));
	assert!(validate_nickname(Some(&"x".repeat(21)), &cfg).is_err());
}

#[test]
fn first_message_skips_cooldown() {
	let cfg = PolicyConfig::default();
	assert!(check_rate(&SessionMeta::new(ip(1), 5_000), 5_000, &cfg).is_ok());
}

#[test]
fn cooldown_reports_remaining_time() {
	let cfg = PolicyConfig::default();
	let meta = meta_with(&[10_000]);
	assert_eq!(
		check_rate(&meta, 10_400, &cfg),
		Err(PolicyViolation::Cooldown { retry_after_ms: 600 })
	);
	assert!(check_rate(&meta, 11_000, &cfg).is_ok());
}

#[test]
fn cooldown_is_checked_before_window_cap() {
	let cfg = PolicyConfig::default();
	let times = (0..30).map(|i| 100_000 + i * 1_000).collect::<Vec<_>>();
	let meta = meta_with(&times);

	assert!(matches!(
		check_rate(&meta, 129_500, &cfg),
		Err(PolicyViolation::Cooldown { .. })
	));
	assert_eq!(
		check_rate(&meta, 130_000, &cfg),
		Err(PolicyViolation::RateLimited { max: 30 })
	);
}

#[test]
fn ownership_is_by_session_id() {
	let msg = message_owned_by("u1", 0);
	assert!(check_edit_ownership(&msg, &SessionId::new("u1").unwrap()).is_ok());
	assert_eq!(
		check_edit_ownership(&msg, &SessionId::new("u2").unwrap()),
		Err(PolicyViolation::NotOwner)
	);
}

#[test]
fn edit_window_exact_boundary_is_expired() {
	let cfg = PolicyConfig::default();
	assert!(check_edit_window(0, 599_999, &cfg).is_ok());
	assert!(check_edit_window(0, 600_000, &cfg).is_err());
	assert!(check_edit_window(0, 600_001, &cfg).is_err());
}

#[test]
fn origin_rules() {
	let open = AdmissionPolicy::default();
	assert!(open.check_origin(Some("https://anything.example")).is_ok());

	let restricted = AdmissionPolicy {
		allowed_origins: vec!["https://chat.example.org".to_string()],
		..AdmissionPolicy::default()
	};
	assert!(restricted.check_origin(None).is_ok());
	assert!(restricted.check_origin(Some("https://chat.example.org")).is_ok());
	assert!(restricted.check_origin(Some("http://127.0.0.1:5173")).is_ok());
	assert!(restricted.check_origin(Some("http://localhost")).is_ok());

	let err = restricted.check_origin(Some("https://other.example")).unwrap_err();
	assert_eq!(err.status_code(), 403);
	assert_eq!(err.to_string(), "Unauthorized Origin");
	assert!(restricted.check_origin(Some("not a url")).is_err());
}

#[test]
fn ip_deny_and_allow_lists() {
	let policy = AdmissionPolicy {
		denied_ips: HashSet::from([ip(9)]),
		allowed_ips: Some(HashSet::from([ip(1), ip(9)])),
		..AdmissionPolicy::default()
	};

	assert!(policy.check_ip(ip(1)).is_ok());
	assert_eq!(policy.check_ip(ip(9)), Err(AdmissionError::AccessDenied(ip(9))));
	assert_eq!(policy.check_ip(ip(2)), Err(AdmissionError::AccessDenied(ip(2))));
	assert_eq!(AdmissionError::AccessDenied(ip(2)).to_string(), "Access Denied");
}

#[test]
fn capacity_rejects_at_cap() {
	let policy = AdmissionPolicy::default();
	assert!(policy.check_capacity(ip(1), 4).is_ok());

	let err = policy.check_capacity(ip(1), 5).unwrap_err();
	assert_eq!(err.status_code(), 429);
	assert_eq!(err.to_string(), "Too many connections from this IP");
}

proptest! {
	#[test]
	fn sanitized_content_has_no_controls_or_outer_whitespace(input in "\\PC{0,40}[\\x00-\\x1F\\x7F]{0,5}\\PC{0,40}") {
		let out = sanitize_content(&input);
		let has_control = out.chars().any(|c| matches!(c, '\u{0}'..='\u{1F}' | '\u{7F}'));
		prop_assert!(!has_control, "control character survived in {:?}", out);
		prop_assert_eq!(out.trim(), out.as_str());
	}

	#[test]
	fn accepted_content_is_non_empty_and_bounded(input in "\\PC{0,600}") {
		let cfg = PolicyConfig::default();
		let content = sanitize_content(&input);
		if validate_content(&content, &cfg).is_ok() {
			prop_assert!(!content.trim().is_empty());
			prop_assert!(content.chars().count() <= cfg.max_message_chars);
		}
	}

	#[test]
	fn within_cooldown_is_always_rejected(last in 0i64..1_000_000_000, gap in 0i64..1_000) {
		let cfg = PolicyConfig::default();
		let meta = meta_with(&[last]);
		let is_cooldown = matches!(check_rate(&meta, last + gap, &cfg), Err(PolicyViolation::Cooldown { .. }));
		prop_assert!(is_cooldown);
	}

	#[test]
	fn trailing_window_never_exceeds_cap(gaps in proptest::collection::vec(1_000i64..5_000, 1..120)) {
		let cfg = PolicyConfig::default();
		let mut meta = SessionMeta::new(ip(1), 0);
		let mut accepted: Vec<i64> = Vec::new();
		let mut now = 1_000_000;

		for gap in gaps {
			now += gap;
			if check_rate(&meta, now, &cfg).is_ok() {
				meta.record_message(now, cfg.rate_window_ms);
				accepted.push(now);
			}
			let in_window = accepted.iter().filter(|t| **t > now - cfg.rate_window_ms).count();
			prop_assert!(in_window <= cfg.max_messages_per_window as usize);
		}
	}

	#[test]
	fn edit_window_splits_at_ten_minutes(created in 0i64..1_000_000_000, elapsed in 0i64..1_200_000) {
		let cfg = PolicyConfig::default();
		let ok = check_edit_window(created, created + elapsed, &cfg).is_ok();
		prop_assert_eq!(ok, elapsed < 600_000);
	}
}
