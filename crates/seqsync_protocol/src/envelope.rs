//! Update envelope building.
//!
//! Business-logic services describe a change with one of the constructors below; the
//! sync service stamps the issued counters with [`seal`] and picks the delivery shape
//! with [`wrap`]. None of this does I/O.

use seqsync_domain::ChannelId;

use crate::pb;
use crate::pb::updates::Shape;

/// Counter values issued for one update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Issued {
	Ephemeral,
	Pts { pts: u32, pts_count: u32 },
	Qts { qts: u32 },
	Channel { channel_id: ChannelId, pts: u32, pts_count: u32 },
}

impl Issued {
	pub fn consumes_counter(&self) -> bool {
		!matches!(self, Issued::Ephemeral)
	}
}

fn unsequenced(kind: impl Into<String>, payload: impl Into<Vec<u8>>, class: pb::SeqClass) -> pb::Update {
	pb::Update {
		kind: kind.into(),
		payload: payload.into(),
		seq_class: class as i32,
		..Default::default()
	}
}

/// A change on the user's ordinary pts stream consuming one pts.
pub fn pts_change(kind: impl Into<String>, payload: impl Into<Vec<u8>>) -> pb::Update {
	pts_change_counted(kind, payload, 1)
}

/// A change consuming `pts_count` consecutive pts values (e.g. deleting several messages).
pub fn pts_change_counted(kind: impl Into<String>, payload: impl Into<Vec<u8>>, pts_count: u32) -> pb::Update {
	pb::Update {
		pts_count,
		..unsequenced(kind, payload, pb::SeqClass::Pts)
	}
}

pub fn qts_change(kind: impl Into<String>, payload: impl Into<Vec<u8>>) -> pb::Update {
	unsequenced(kind, payload, pb::SeqClass::Qts)
}

pub fn channel_change(
	channel_id: ChannelId,
	kind: impl Into<String>,
	payload: impl Into<Vec<u8>>,
	pts_count: u32,
) -> pb::Update {
	pb::Update {
		channel_id: channel_id.get(),
		pts_count,
		..unsequenced(kind, payload, pb::SeqClass::Channel)
	}
}

/// Delivered live only; never numbered or retained (typing, presence).
pub fn ephemeral(kind: impl Into<String>, payload: impl Into<Vec<u8>>) -> pb::Update {
	unsequenced(kind, payload, pb::SeqClass::None)
}

/// pts values an update consumes; zero is read as one.
pub fn effective_pts_count(update: &pb::Update) -> u32 {
	update.pts_count.max(1)
}

/// Stamp issued counters and the publication date onto a change.
pub fn seal(change: &pb::Update, issued: Issued, date: i64) -> pb::Update {
	let mut out = pb::Update {
		kind: change.kind.clone(),
		payload: change.payload.clone(),
		seq_class: change.seq_class,
		date,
		..Default::default()
	};

	match issued {
		Issued::Ephemeral => {
			out.seq_class = pb::SeqClass::None as i32;
		}
		Issued::Pts { pts, pts_count } => {
			out.pts = pts;
			out.pts_count = pts_count;
		}
		Issued::Qts { qts } => {
			out.qts = qts;
		}
		Issued::Channel {
			channel_id,
			pts,
			pts_count,
		} => {
			out.channel_id = channel_id.get();
			out.pts = pts;
			out.pts_count = pts_count;
		}
	}

	out
}

/// Short shape for exactly one update, batch shape (carrying `seq`) otherwise.
pub fn wrap(mut updates: Vec<pb::Update>, date: i64, seq: u32) -> pb::Updates {
	let shape = if updates.len() == 1 {
		Shape::Short(pb::UpdateShort {
			update: updates.pop(),
			date,
		})
	} else {
		Shape::Batch(pb::UpdatesBatch { updates, date, seq })
	};

	pb::Updates { shape: Some(shape) }
}

/// The updates carried by either shape, in order.
pub fn as_slice(updates: &pb::Updates) -> &[pb::Update] {
	match &updates.shape {
		Some(Shape::Short(s)) => s.update.as_ref().map(std::slice::from_ref).unwrap_or_default(),
		Some(Shape::Batch(b)) => &b.updates,
		None => &[],
	}
}

pub fn into_vec(updates: pb::Updates) -> Vec<pb::Update> {
	match updates.shape {
		Some(Shape::Short(s)) => s.update.into_iter().collect(),
		Some(Shape::Batch(b)) => b.updates,
		None => Vec::new(),
	}
}

/// `seq` of a batch; the short shape carries none.
pub fn batch_seq(updates: &pb::Updates) -> Option<u32> {
	match &updates.shape {
		Some(Shape::Batch(b)) => Some(b.seq),
		_ => None,
	}
}
