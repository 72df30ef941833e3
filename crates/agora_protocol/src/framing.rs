#![forbid(unsafe_code)]

use bytes::BytesMut;
use prost::Message;
use thiserror::Error;

/// Default maximum frame payload size.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 256 * 1024;

/// Size of the big-endian length prefix.
pub const FRAME_PREFIX_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum FramingError {
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge { len: usize, max: usize },

	#[error("insufficient data: need={need} have={have}")]
	InsufficientData { need: usize, have: usize },

	#[error("protobuf decode error: {0}")]
	Decode(#[from] prost::DecodeError),

	#[error("protobuf encode error: {0}")]
	Encode(#[from] prost::EncodeError),
}

/// Encode a protobuf message into a length-prefixed frame.
pub fn encode_frame<M: Message>(msg: &M, max_frame_size: usize) -> Result<Vec<u8>, FramingError> {
	let payload_len = msg.encoded_len();
	if payload_len > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len: payload_len,
			max: max_frame_size,
		});
	}

	let mut out = Vec::with_capacity(frame_len_from_payload_len(payload_len));
	out.extend_from_slice(&(payload_len as u32).to_be_bytes());
	msg.encode(&mut out)?;
	Ok(out)
}

/// Encode a frame using `DEFAULT_MAX_FRAME_SIZE`.
pub fn encode_frame_default<M: Message>(msg: &M) -> Result<Vec<u8>, FramingError> {
	encode_frame(msg, DEFAULT_MAX_FRAME_SIZE)
}

/// Total frame length (prefix + payload).
#[inline]
pub fn frame_len_from_payload_len(payload_len: usize) -> usize {
	FRAME_PREFIX_LEN + payload_len
}

fn read_prefix(src: &[u8], max_frame_size: usize) -> Result<Option<usize>, FramingError> {
	if src.len() < FRAME_PREFIX_LEN {
		return Ok(None);
	}

	let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
	if len > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len,
			max: max_frame_size,
		});
	}

	Ok(Some(len))
}

/// Decode a single frame from the start of `src`, returning the message and bytes consumed.
pub fn decode_frame<M: Message + Default>(src: &[u8], max_frame_size: usize) -> Result<(M, usize), FramingError> {
	let Some(len) = read_prefix(src, max_frame_size)? else {
		return Err(FramingError::InsufficientData {
			need: FRAME_PREFIX_LEN,
			have: src.len(),
		});
	};

	let need = frame_len_from_payload_len(len);
	if src.len() < need {
		return Err(FramingError::InsufficientData { need, have: src.len() });
	}

	let msg = M::decode(&src[FRAME_PREFIX_LEN..need])?;
	Ok((msg, need))
}

/// Try to decode a single frame from a growable buffer, consuming it on success.
pub fn try_decode_frame_from_buffer<M: Message + Default>(
	buf: &mut BytesMut,
	max_frame_size: usize,
) -> Result<Option<M>, FramingError> {
	let Some(len) = read_prefix(buf, max_frame_size)? else {
		return Ok(None);
	};

	let need = frame_len_from_payload_len(len);
	if buf.len() < need {
		return Ok(None);
	}

	let frame = buf.split_to(need);
	let msg = M::decode(&frame[FRAME_PREFIX_LEN..])?;
	Ok(Some(msg))
}

/// Incremental decoder for a byte stream carrying back-to-back frames.
#[derive(Debug)]
pub struct FrameDecoder {
	buf: BytesMut,
	max_frame_size: usize,
}

impl FrameDecoder {
	pub fn new(max_frame_size: usize) -> Self {
		Self {
			buf: BytesMut::with_capacity(16 * 1024),
			max_frame_size,
		}
	}

	/// Append bytes read from the stream.
	pub fn extend(&mut self, bytes: &[u8]) {
		self.buf.extend_from_slice(bytes);
	}

	/// Decode the next complete frame, if one is buffered.
	pub fn next_frame<M: Message + Default>(&mut self) -> Result<Option<M>, FramingError> {
		try_decode_frame_from_buffer(&mut self.buf, self.max_frame_size)
	}

	/// Bytes buffered but not yet decoded.
	pub fn buffered(&self) -> usize {
		self.buf.len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[derive(Clone, PartialEq, ::prost::Message)]
	struct TestMsg {
		#[prost(string, tag = "1")]
		s: String,
		#[prost(uint32, tag = "2")]
		n: u32,
	}

	#[test]
	fn decode_requires_full_prefix() {
		let err = decode_frame::<TestMsg>(&[0, 0], DEFAULT_MAX_FRAME_SIZE).unwrap_err();
		match err {
			FramingError::InsufficientData { need, have } => {
				assert_eq!(need, FRAME_PREFIX_LEN);
				assert_eq!(have, 2);
			}
			other => panic!("unexpected error: {other:?}"),
		}
	}

	#[test]
	fn decoder_yields_back_to_back_frames() {
		let a = TestMsg {
			s: "first".to_string(),
			n: 1,
		};
		let b = TestMsg {
			s: "second".to_string(),
			n: 2,
		};

		let mut bytes = encode_frame_default(&a).expect("encode a");
		bytes.extend(encode_frame_default(&b).expect("encode b"));

		let mut decoder = FrameDecoder::new(DEFAULT_MAX_FRAME_SIZE);
		decoder.extend(&bytes[..3]);
		assert!(decoder.next_frame::<TestMsg>().expect("ok").is_none());

		decoder.extend(&bytes[3..]);
		assert_eq!(decoder.next_frame::<TestMsg>().expect("ok"), Some(a));
		assert_eq!(decoder.next_frame::<TestMsg>().expect("ok"), Some(b));
		assert!(decoder.next_frame::<TestMsg>().expect("ok").is_none());
		assert_eq!(decoder.buffered(), 0);
	}

	#[test]
	fn decoder_rejects_oversized_prefix() {
		let mut decoder = FrameDecoder::new(16);
		decoder.extend(&64u32.to_be_bytes());
		assert!(matches!(
			decoder.next_frame::<TestMsg>(),
			Err(FramingError::FrameTooLarge { len: 64, max: 16 })
		));
	}
}
