#![forbid(unsafe_code)]

use bytes::{Buf, BufMut, BytesMut};
use prost::Message;
use thiserror::Error;

/// Upper bound on one frame's payload unless a caller configures a smaller one.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Size of the big-endian `u32` length prefix.
pub const FRAME_HEADER_LEN: usize = 4;

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

fn check_len(len: usize, max_frame_size: usize) -> Result<(), FramingError> {
	if len > max_frame_size || len > u32::MAX as usize {
		return Err(FramingError::FrameTooLarge {
			len,
			max: max_frame_size,
		});
	}
	Ok(())
}

/// Payload length announced by the header at the start of `src`, if the header is complete.
fn peek_payload_len(src: &[u8], max_frame_size: usize) -> Result<Option<usize>, FramingError> {
	let Some(header) = src.get(..FRAME_HEADER_LEN) else {
		return Ok(None);
	};
	let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
	check_len(len, max_frame_size)?;
	Ok(Some(len))
}

/// Encode `msg` as one length-prefixed frame.
pub fn encode_frame<M: Message>(msg: &M, max_frame_size: usize) -> Result<Vec<u8>, FramingError> {
	let mut buf = BytesMut::new();
	encode_frame_into(&mut buf, msg, max_frame_size)?;
	Ok(buf.to_vec())
}

pub fn encode_frame_default<M: Message>(msg: &M) -> Result<Vec<u8>, FramingError> {
	encode_frame(msg, DEFAULT_MAX_FRAME_SIZE)
}

/// Append one frame to `buf`. Useful when several pushes are coalesced into one write.
pub fn encode_frame_into<M: Message>(buf: &mut BytesMut, msg: &M, max_frame_size: usize) -> Result<(), FramingError> {
	let len = msg.encoded_len();
	check_len(len, max_frame_size)?;

	buf.reserve(FRAME_HEADER_LEN + len);
	buf.put_u32(len as u32);
	msg.encode(buf)?;
	Ok(())
}

/// Decode the first frame of `src`, returning the message and the bytes consumed.
pub fn decode_frame<M: Message + Default>(src: &[u8], max_frame_size: usize) -> Result<(M, usize), FramingError> {
	let len = peek_payload_len(src, max_frame_size)?.ok_or(FramingError::InsufficientData {
		need: FRAME_HEADER_LEN,
		have: src.len(),
	})?;

	let need = FRAME_HEADER_LEN + len;
	let payload = src
		.get(FRAME_HEADER_LEN..need)
		.ok_or(FramingError::InsufficientData { need, have: src.len() })?;

	Ok((M::decode(payload)?, need))
}

/// Pop one complete frame off the front of `buf`; `Ok(None)` until enough bytes arrived.
pub fn try_decode_frame_from_buffer<M: Message + Default>(
	buf: &mut BytesMut,
	max_frame_size: usize,
) -> Result<Option<M>, FramingError> {
	let Some(len) = peek_payload_len(&buf[..], max_frame_size)? else {
		return Ok(None);
	};
	if buf.len() < FRAME_HEADER_LEN + len {
		return Ok(None);
	}

	buf.advance(FRAME_HEADER_LEN);
	let payload = buf.split_to(len).freeze();
	Ok(Some(M::decode(payload)?))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::pb;

	fn sample() -> pb::SeqId {
		pb::SeqId { pts: 77 }
	}

	#[test]
	fn partial_header_then_payload() {
		let frame = encode_frame_default(&sample()).expect("encode");
		let mut buf = BytesMut::new();

		buf.extend_from_slice(&frame[..3]);
		assert!(
			try_decode_frame_from_buffer::<pb::SeqId>(&mut buf, DEFAULT_MAX_FRAME_SIZE)
				.expect("ok")
				.is_none()
		);

		buf.extend_from_slice(&frame[3..]);
		let got = try_decode_frame_from_buffer::<pb::SeqId>(&mut buf, DEFAULT_MAX_FRAME_SIZE)
			.expect("ok")
			.expect("frame");
		assert_eq!(got, sample());
		assert!(buf.is_empty());
	}

	#[test]
	fn two_frames_in_one_buffer_decode_in_order() {
		let mut buf = BytesMut::new();
		encode_frame_into(&mut buf, &pb::SeqId { pts: 1 }, DEFAULT_MAX_FRAME_SIZE).expect("encode");
		encode_frame_into(&mut buf, &pb::SeqId { pts: 2 }, DEFAULT_MAX_FRAME_SIZE).expect("encode");

		let a: pb::SeqId = try_decode_frame_from_buffer(&mut buf, DEFAULT_MAX_FRAME_SIZE)
			.expect("ok")
			.expect("first");
		let b: pb::SeqId = try_decode_frame_from_buffer(&mut buf, DEFAULT_MAX_FRAME_SIZE)
			.expect("ok")
			.expect("second");
		assert_eq!((a.pts, b.pts), (1, 2));
	}

	#[test]
	fn truncated_slice_reports_need() {
		let frame = encode_frame_default(&sample()).expect("encode");
		match decode_frame::<pb::SeqId>(&frame[..frame.len() - 1], DEFAULT_MAX_FRAME_SIZE) {
			Err(FramingError::InsufficientData { need, have }) => assert_eq!(need, have + 1),
			other => panic!("unexpected: {other:?}"),
		}
	}

	#[test]
	fn oversized_prefix_is_rejected_before_buffering() {
		let mut buf = BytesMut::new();
		buf.put_u32(1024);
		assert!(matches!(
			try_decode_frame_from_buffer::<pb::SeqId>(&mut buf, 16),
			Err(FramingError::FrameTooLarge { len: 1024, max: 16 })
		));
	}
}
