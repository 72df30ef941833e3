use agora_protocol::{
	DEFAULT_MAX_FRAME_SIZE, FrameDecoder, FramingError, decode_frame, encode_frame, encode_frame_default, envelope, pb,
	try_decode_frame_from_buffer,
};
use bytes::BytesMut;
use proptest::prelude::*;

fn whisper_envelope(text: &str) -> pb::Envelope {
	envelope(
		"req-7",
		pb::envelope::Msg::SendWhisper(pb::SendWhisper {
			destination_session_id: "b".to_string(),
			text: text.to_string(),
		}),
	)
}

#[test]
fn envelope_survives_framing() {
	let env = whisper_envelope("psst");
	let frame = encode_frame_default(&env).expect("encode");
	let (decoded, used) = decode_frame::<pb::Envelope>(&frame, DEFAULT_MAX_FRAME_SIZE).expect("decode");

	assert_eq!(used, frame.len());
	match decoded.msg {
		Some(pb::envelope::Msg::SendWhisper(w)) => {
			assert_eq!(w.destination_session_id, "b");
			assert_eq!(w.text, "psst");
		}
		other => panic!("expected SendWhisper, got: {other:?}"),
	}
	assert_eq!(decoded.request_id, "req-7");
}

#[test]
fn history_preserves_message_order() {
	let messages = (0..5)
		.map(|i| pb::Message {
			session: "a".to_string(),
			text: format!("m{i}"),
			date: "2024-05-01T12:00:00.000Z".to_string(),
		})
		.collect::<Vec<_>>();
	let env = envelope("", pb::envelope::Msg::History(pb::History { messages }));

	let frame = encode_frame_default(&env).expect("encode");
	let (decoded, _) = decode_frame::<pb::Envelope>(&frame, DEFAULT_MAX_FRAME_SIZE).expect("decode");

	let Some(pb::envelope::Msg::History(h)) = decoded.msg else {
		panic!("expected History");
	};
	let texts = h.messages.iter().map(|m| m.text.as_str()).collect::<Vec<_>>();
	assert_eq!(texts, ["m0", "m1", "m2", "m3", "m4"]);
}

#[test]
fn encode_rejects_too_large() {
	let env = whisper_envelope(&"a".repeat(2048));
	let err = encode_frame(&env, 64).unwrap_err();
	match err {
		FramingError::FrameTooLarge { len, max } => {
			assert!(len > max);
			assert_eq!(max, 64);
		}
		other => panic!("unexpected error: {other:?}"),
	}
}

#[test]
fn garbage_payload_is_a_decode_error() {
	let mut buf = BytesMut::new();
	buf.extend_from_slice(&3u32.to_be_bytes());
	buf.extend_from_slice(&[0xff, 0xff, 0xff]);

	let err = try_decode_frame_from_buffer::<pb::Envelope>(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap_err();
	assert!(matches!(err, FramingError::Decode(_)), "unexpected error: {err:?}");
}

proptest! {
	#[test]
	fn decoder_reassembles_arbitrary_splits(texts in prop::collection::vec("[a-z]{1,40}", 1..8), split in 0usize..512) {
		let envs = texts.iter().map(|t| whisper_envelope(t)).collect::<Vec<_>>();
		let mut bytes = Vec::new();
		for env in &envs {
			bytes.extend(encode_frame_default(env).expect("encode"));
		}

		let split = split.min(bytes.len());
		let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_SIZE);
		let mut out = Vec::new();

		decoder.extend(&bytes[..split]);
		while let Some(env) = decoder.next_frame::<pb::Envelope>().expect("decode") {
			out.push(env);
		}
		decoder.extend(&bytes[split..]);
		while let Some(env) = decoder.next_frame::<pb::Envelope>().expect("decode") {
			out.push(env);
		}

		prop_assert_eq!(out, envs);
	}
}
