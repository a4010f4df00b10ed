use bytes::BytesMut;
use proptest::prelude::*;
use seqsync_protocol::pb::{self, rpc_request::Call};
use seqsync_protocol::{DEFAULT_MAX_FRAME_SIZE, PROTOCOL_VERSION, encode_frame_into, envelope, try_decode_frame_from_buffer};

fn request(call_id: u64, pts: u32) -> pb::RpcRequest {
	pb::RpcRequest {
		version: PROTOCOL_VERSION,
		call_id,
		call: Some(Call::GetUserGtPtsUpdatesData(pb::UserGtPtsUpdatesRequest {
			user_id: 1000,
			pts,
			limit: 0,
		})),
	}
}

#[test]
fn push_stream_frames_survive_reassembly() {
	let pushed = pb::PushedUpdates {
		updates: Some(envelope::wrap(
			vec![envelope::seal(
				&envelope::pts_change("new_message", b"payload".to_vec()),
				envelope::Issued::Pts { pts: 3, pts_count: 1 },
				1_700_000_000,
			)],
			1_700_000_000,
			1,
		)),
		lagged_dropped: 0,
	};

	let mut wire = BytesMut::new();
	encode_frame_into(&mut wire, &pushed, DEFAULT_MAX_FRAME_SIZE).expect("encode");
	encode_frame_into(&mut wire, &pb::PushedUpdates { updates: None, lagged_dropped: 4 }, DEFAULT_MAX_FRAME_SIZE)
		.expect("encode");

	let mut buf = BytesMut::new();
	let mut got = Vec::new();
	for byte in wire.iter() {
		buf.extend_from_slice(&[*byte]);
		while let Some(m) = try_decode_frame_from_buffer::<pb::PushedUpdates>(&mut buf, DEFAULT_MAX_FRAME_SIZE).expect("decode") {
			got.push(m);
		}
	}

	assert_eq!(got.len(), 2);
	assert_eq!(got[0], pushed);
	assert_eq!(got[1].lagged_dropped, 4);
}

proptest! {
	#[test]
	fn arbitrary_chunking_preserves_frame_order(
		pts in proptest::collection::vec(any::<u32>(), 1..16),
		cuts in proptest::collection::vec(1usize..64, 1..32),
	) {
		let mut wire = BytesMut::new();
		for (i, p) in pts.iter().enumerate() {
			encode_frame_into(&mut wire, &request(i as u64, *p), DEFAULT_MAX_FRAME_SIZE).expect("encode");
		}
		let wire = wire.freeze();

		let mut buf = BytesMut::new();
		let mut decoded = Vec::new();
		let mut at = 0usize;
		let mut cut = cuts.iter().cycle();
		while at < wire.len() {
			let step = (*cut.next().expect("cycle")).min(wire.len() - at);
			buf.extend_from_slice(&wire[at..at + step]);
			at += step;
			while let Some(m) = try_decode_frame_from_buffer::<pb::RpcRequest>(&mut buf, DEFAULT_MAX_FRAME_SIZE).expect("decode") {
				decoded.push(m);
			}
		}

		prop_assert!(buf.is_empty());
		prop_assert_eq!(decoded.len(), pts.len());
		for (i, (m, p)) in decoded.iter().zip(&pts).enumerate() {
			prop_assert_eq!(m, &request(i as u64, *p));
		}
	}
}
