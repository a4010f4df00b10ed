#![forbid(unsafe_code)]

//! Push routing policy.
//!
//! The acting session learns of a change through exactly one path: its RPC reply
//! or a push. Both decisions are made here and nowhere else.

use seqsync_domain::{PushType, SessionRef};

/// Target sessions for `push_type` among the user's `live` sessions.
pub fn route(push_type: PushType, actor: Option<SessionRef>, live: &[SessionRef]) -> Vec<SessionRef> {
	match push_type {
		PushType::User => live.to_vec(),
		PushType::UserMe => match actor {
			Some(actor) => live
				.iter()
				.filter(|s| s.auth_key_id == actor.auth_key_id)
				.copied()
				.collect(),
			None => Vec::new(),
		},
		PushType::UserNotMe => live.iter().filter(|s| Some(**s) != actor).copied().collect(),
		PushType::RpcResult => Vec::new(),
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryPlan {
	pub push_targets: Vec<SessionRef>,
	/// The acting session gets the change in its RPC reply and must not be pushed to.
	pub actor_via_reply: bool,
}

/// Full delivery decision for a call.
///
/// An RPC_RESULT call answers the actor in the reply and still fans the change out to
/// the user's other sessions, with the USER_NOTME policy.
pub fn plan_delivery(push_type: PushType, actor: Option<SessionRef>, live: &[SessionRef]) -> DeliveryPlan {
	let (push_targets, actor_via_reply) = match push_type {
		PushType::RpcResult => (route(PushType::UserNotMe, actor, live), true),
		PushType::UserNotMe => (route(push_type, actor, live), true),
		PushType::User | PushType::UserMe => (route(push_type, actor, live), false),
	};

	debug_assert!(
		!actor_via_reply || actor.is_none_or(|a| !push_targets.contains(&a)),
		"actor would be delivered twice"
	);

	DeliveryPlan {
		push_targets,
		actor_via_reply,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use seqsync_domain::{AuthKeyId, SessionId};

	fn s(auth: i64, session: i64) -> SessionRef {
		SessionRef::new(AuthKeyId(auth), SessionId(session))
	}

	fn live() -> Vec<SessionRef> {
		vec![s(1, 10), s(1, 11), s(2, 20)]
	}

	#[test]
	fn user_reaches_everyone() {
		assert_eq!(route(PushType::User, Some(s(1, 10)), &live()), live());
	}

	#[test]
	fn user_me_stays_on_the_auth_key() {
		assert_eq!(route(PushType::UserMe, Some(s(1, 10)), &live()), vec![s(1, 10), s(1, 11)]);
		assert!(route(PushType::UserMe, None, &live()).is_empty());
	}

	#[test]
	fn not_me_excludes_exactly_the_actor() {
		assert_eq!(route(PushType::UserNotMe, Some(s(1, 10)), &live()), vec![s(1, 11), s(2, 20)]);
	}

	#[test]
	fn rpc_result_routes_nowhere_but_plans_companions() {
		let actor = Some(s(2, 20));
		assert!(route(PushType::RpcResult, actor, &live()).is_empty());

		let plan = plan_delivery(PushType::RpcResult, actor, &live());
		assert!(plan.actor_via_reply);
		assert_eq!(plan.push_targets, vec![s(1, 10), s(1, 11)]);
	}

	#[test]
	fn actor_never_gets_two_paths() {
		let sessions = live();
		for push_type in [PushType::User, PushType::UserMe, PushType::UserNotMe, PushType::RpcResult] {
			for actor in &sessions {
				let plan = plan_delivery(push_type, Some(*actor), &sessions);
				let pushed = plan.push_targets.contains(actor);
				assert!(pushed != plan.actor_via_reply, "{push_type}: actor {actor}");
			}
		}
	}

	#[test]
	fn no_live_sessions_is_a_noop() {
		let plan = plan_delivery(PushType::User, None, &[]);
		assert!(plan.push_targets.is_empty());
	}
}
