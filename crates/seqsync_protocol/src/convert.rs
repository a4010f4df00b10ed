use seqsync_domain::{PushType, RpcCorrelation, UpdatesState};

use crate::pb;
use crate::pb::rpc_result_data::Outcome;

impl From<PushType> for pb::PushType {
	fn from(p: PushType) -> Self {
		match p {
			PushType::User => pb::PushType::User,
			PushType::UserMe => pb::PushType::UserMe,
			PushType::UserNotMe => pb::PushType::UserNotMe,
			PushType::RpcResult => pb::PushType::RpcResult,
		}
	}
}

/// `None` for `UNSPECIFIED` and unknown wire values.
pub fn push_type_from_wire(raw: i32) -> Option<PushType> {
	match pb::PushType::try_from(raw).ok()? {
		pb::PushType::Unspecified => None,
		pb::PushType::User => Some(PushType::User),
		pb::PushType::UserMe => Some(PushType::UserMe),
		pb::PushType::UserNotMe => Some(PushType::UserNotMe),
		pb::PushType::RpcResult => Some(PushType::RpcResult),
	}
}

/// `None` for correlation kinds this wire version cannot carry.
pub fn correlation_to_pb(c: &RpcCorrelation) -> Option<pb::RpcResultData> {
	let outcome = match *c {
		RpcCorrelation::AffectedMessages { pts, pts_count } => {
			Outcome::AffectedMessages(pb::AffectedMessages { pts, pts_count })
		}
		RpcCorrelation::AffectedHistory { pts, pts_count, offset } => {
			Outcome::AffectedHistory(pb::AffectedHistory { pts, pts_count, offset })
		}
		_ => return None,
	};
	Some(pb::RpcResultData { outcome: Some(outcome) })
}

pub fn correlation_from_pb(data: &pb::RpcResultData) -> Option<RpcCorrelation> {
	match data.outcome.as_ref()? {
		Outcome::AffectedMessages(m) => Some(RpcCorrelation::AffectedMessages {
			pts: m.pts,
			pts_count: m.pts_count,
		}),
		Outcome::AffectedHistory(h) => Some(RpcCorrelation::AffectedHistory {
			pts: h.pts,
			pts_count: h.pts_count,
			offset: h.offset,
		}),
	}
}

impl From<UpdatesState> for pb::UpdatesState {
	fn from(s: UpdatesState) -> Self {
		pb::UpdatesState {
			pts: s.pts,
			qts: s.qts,
			seq: s.seq,
			date: s.date,
		}
	}
}

impl From<pb::UpdatesState> for UpdatesState {
	fn from(s: pb::UpdatesState) -> Self {
		UpdatesState {
			pts: s.pts,
			qts: s.qts,
			seq: s.seq,
			date: s.date,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn push_type_wire_mapping() {
		for p in [PushType::User, PushType::UserMe, PushType::UserNotMe, PushType::RpcResult] {
			assert_eq!(push_type_from_wire(pb::PushType::from(p) as i32), Some(p));
		}
		assert_eq!(push_type_from_wire(0), None);
		assert_eq!(push_type_from_wire(99), None);
	}

	#[test]
	fn history_correlation_keeps_offset() {
		let c = RpcCorrelation::affected_history(40).filled(12, 2);
		let wire = correlation_to_pb(&c).expect("representable");
		assert!(matches!(wire.outcome, Some(Outcome::AffectedHistory(h)) if h.offset == 40));
		assert_eq!(correlation_from_pb(&wire), Some(c));
		assert_eq!(correlation_from_pb(&pb::RpcResultData::default()), None);
	}
}
