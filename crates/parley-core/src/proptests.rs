use proptest::prelude::*;

use crate::policy::{ConversationEncryptionState, EncryptionPolicy, EncryptionStatus, PolicyError};
use crate::types::{ConversationId, UserId};

const USERS: [&str; 3] = ["alice", "bob", "carol"];

#[derive(Debug, Clone)]
enum Op {
    Enable(usize),
    Disable(usize),
    Tick(i64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..USERS.len()).prop_map(Op::Enable),
        (0..USERS.len()).prop_map(Op::Disable),
        (0i64..1_000).prop_map(Op::Tick),
    ]
}

fn remote_state() -> impl Strategy<Value = ConversationEncryptionState> {
    (any::<bool>(), 0..USERS.len(), 0i64..1_000_000).prop_map(|(enabled, who, ts)| {
        if enabled {
            ConversationEncryptionState::enabled(UserId::new(USERS[who]), ts)
        } else {
            ConversationEncryptionState::disabled(ts)
        }
    })
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]

    #[test]
    fn owner_alone_can_disable(ops in prop::collection::vec(op(), 1..40)) {
        let conv = ConversationId::new("c");
        let mut policy = EncryptionPolicy::new();
        let mut owner: Option<usize> = None;
        let mut now = 1_000i64;

        for op in ops {
            match op {
                Op::Tick(ms) => now += ms,
                Op::Enable(u) => {
                    let t = policy.enable(&conv, &UserId::new(USERS[u]), now);
                    prop_assert_eq!(t.changed, owner.is_none());
                    owner.get_or_insert(u);
                }
                Op::Disable(u) => {
                    let res = policy.disable(&conv, &UserId::new(USERS[u]), now);
                    match owner {
                        Some(o) if o != u => {
                            prop_assert_eq!(
                                res,
                                Err(PolicyError::Unauthorized { owner: UserId::new(USERS[o]) })
                            );
                        }
                        Some(_) => {
                            prop_assert!(res.map(|t| t.changed).unwrap_or(false));
                            owner = None;
                        }
                        None => prop_assert!(res.is_ok()),
                    }
                }
            }
            let expected = owner.map(|o| UserId::new(USERS[o]));
            prop_assert_eq!(policy.get_or_default(&conv).owner().cloned(), expected);
        }
    }

    #[test]
    fn local_timestamps_strictly_increase(ops in prop::collection::vec(op(), 1..40)) {
        let conv = ConversationId::new("c");
        let mut policy = EncryptionPolicy::new();
        // Clock may stand still or run behind the recorded state.
        let mut now = 0i64;
        let mut last = policy.get_or_default(&conv).timestamp;

        for op in ops {
            let changed = match op {
                Op::Tick(ms) => { now += ms; false }
                Op::Enable(u) => policy.enable(&conv, &UserId::new(USERS[u]), now).changed,
                Op::Disable(u) => policy
                    .disable(&conv, &UserId::new(USERS[u]), now)
                    .map(|t| t.changed)
                    .unwrap_or(false),
            };
            let ts = policy.get_or_default(&conv).timestamp;
            if changed {
                prop_assert!(ts > last);
            } else {
                prop_assert_eq!(ts, last);
            }
            last = ts;
        }
    }

    #[test]
    fn sync_is_last_write_wins(local in remote_state(), remote in remote_state()) {
        let conv = ConversationId::new("c");
        let mut policy = EncryptionPolicy::new();
        policy.sync(&conv, local.clone());
        let before = policy.get_or_default(&conv);

        let t = policy.sync(&conv, remote.clone());
        let after = policy.get_or_default(&conv);
        if remote.timestamp > before.timestamp {
            prop_assert_eq!(&after, &remote);
            prop_assert_eq!(t.changed, remote.status != before.status);
        } else {
            prop_assert_eq!(&after, &before);
            prop_assert!(!t.changed);
        }
    }

    #[test]
    fn sync_order_does_not_matter(states in prop::collection::vec(remote_state(), 1..10)) {
        let conv = ConversationId::new("c");
        let mut forward = EncryptionPolicy::new();
        let mut backward = EncryptionPolicy::new();
        for s in &states {
            forward.sync(&conv, s.clone());
        }
        for s in states.iter().rev() {
            backward.sync(&conv, s.clone());
        }
        // Equal timestamps keep whichever arrived first, so only the
        // timestamp and, when unique, the status must agree.
        let f = forward.get_or_default(&conv);
        let b = backward.get_or_default(&conv);
        prop_assert_eq!(f.timestamp, b.timestamp);
        let max_ts = f.timestamp;
        if states.iter().filter(|s| s.timestamp == max_ts).count() == 1 {
            prop_assert_eq!(f.status, b.status);
        }
    }

    #[test]
    fn disabled_never_carries_owner(remote in remote_state()) {
        let conv = ConversationId::new("c");
        let mut policy = EncryptionPolicy::new();
        policy.sync(&conv, remote);
        let state = policy.get_or_default(&conv);
        let json = serde_json::to_value(&state).unwrap();
        if !state.is_enabled() {
            prop_assert!(json["enabledBy"].is_null());
            prop_assert_eq!(state.status, EncryptionStatus::Disabled);
        } else {
            prop_assert!(json["enabledBy"].is_string());
        }
    }
}
