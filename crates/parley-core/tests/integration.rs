//! Integration tests for end-to-end encrypted conversations.
//!
//! These tests drive several `E2eeContext`s against one in-memory relay:
//! - Enabling, messaging and disabling a DM between two users
//! - Session key distribution to a three-member group
//! - Relay outages surfacing as blocking, retryable errors

use std::sync::Arc;
use std::time::Duration;

use parley_core::harness::{InMemoryRelay, ManualClock};
use parley_core::relay::RelayError;
use parley_core::{
    ConversationId, E2eeContext, E2eeError, Incoming, MemoryStore, Outgoing, PlaceholderReason, UserId,
};

struct Net {
    server: InMemoryRelay,
    clock: Arc<ManualClock>,
}

impl Net {
    fn new() -> Self {
        let clock = Arc::new(ManualClock::default());
        Self {
            server: InMemoryRelay::with_clock(clock.clone()),
            clock,
        }
    }

    async fn join(&self, user: &str) -> E2eeContext {
        let ctx = self
            .server
            .context(user, Arc::new(MemoryStore::new()), self.clock.clone())
            .unwrap();
        ctx.init().await.unwrap();
        ctx
    }

    async fn deliver_pushes(&self, to: &[&E2eeContext]) {
        for ev in self.server.drain_events() {
            for ctx in to {
                ctx.apply_remote_state(&ev).await;
            }
        }
    }
}

fn ids(names: &[&str]) -> Vec<UserId> {
    names.iter().map(|n| UserId::new(*n)).collect()
}

/// Test: Alice enables encryption on a DM, Bob messages her, only Alice may disable
#[tokio::test]
async fn integration_dm_scenario() {
    let net = Net::new();
    let alice = net.join("alice").await;
    let bob = net.join("bob").await;
    let dm = ConversationId::new("dm1");
    let members = ids(&["alice", "bob"]);

    let state = alice.enable_conversation(&dm, &members).await.unwrap();
    assert_eq!(state.owner(), Some(&UserId::new("alice")));
    net.deliver_pushes(&[&bob]).await;
    assert!(bob.is_encrypted(&dm).await);

    let sent = bob.send_message(&dm, "hi", &members).await.unwrap();
    assert!(matches!(sent, Outgoing::Encrypted(_)));

    let received = alice.fetch_messages(&dm).await.unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].sender_id, UserId::new("bob"));
    assert_eq!(received[0].content, Incoming::Plaintext("hi".into()));

    let err = bob.disable_conversation(&dm).await.unwrap_err();
    match err {
        E2eeError::Unauthorized { owner } => assert_eq!(owner, Some(UserId::new("alice"))),
        other => panic!("expected Unauthorized, got {other:?}"),
    }
    assert!(alice.is_encrypted(&dm).await);

    net.clock.advance(1_000);
    let state = alice.disable_conversation(&dm).await.unwrap();
    assert!(!state.is_enabled());
    assert_eq!(state.owner(), None);

    net.deliver_pushes(&[&bob]).await;
    assert!(!bob.is_encrypted(&dm).await);
    assert_eq!(
        bob.send_message(&dm, "plain again", &members).await.unwrap(),
        Outgoing::Plain("plain again".into())
    );
}

/// Test: Every member of a three-person group recovers the same key
#[tokio::test]
async fn integration_three_recipient_distribution() {
    let net = Net::new();
    let u1 = net.join("u1").await;
    let u2 = net.join("u2").await;
    let u3 = net.join("u3").await;
    let group = ConversationId::new("group1");
    let members = ids(&["u1", "u2", "u3"]);

    u1.enable_conversation(&group, &members).await.unwrap();
    assert_eq!(net.server.envelope_count(&group), 3);
    net.deliver_pushes(&[&u2, &u3]).await;

    u2.send_message(&group, "from u2", &members).await.unwrap();
    u3.send_message(&group, "from u3", &members).await.unwrap();
    assert_eq!(net.server.distribution_count(&group), 1);

    for ctx in [&u1, &u2, &u3] {
        let texts: Vec<_> = ctx
            .fetch_messages(&group)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(
            texts,
            vec![
                Incoming::Plaintext("from u2".into()),
                Incoming::Plaintext("from u3".into())
            ]
        );
    }
}

/// Test: A member without a registered key is left out but does not block others
#[tokio::test]
async fn integration_unregistered_member_gets_placeholder() {
    let net = Net::new();
    let alice = net.join("alice").await;
    let bob = net.join("bob").await;
    let group = ConversationId::new("group2");
    let members = ids(&["alice", "bob", "dave"]);

    alice.enable_conversation(&group, &members).await.unwrap();
    assert_eq!(net.server.envelope_count(&group), 2);
    net.deliver_pushes(&[&bob]).await;
    bob.send_message(&group, "dave can't read this", &members)
        .await
        .unwrap();

    // Dave registers after the key was distributed.
    let dave = net.join("dave").await;
    let history = dave.fetch_messages(&group).await.unwrap();
    assert_eq!(
        history[0].content,
        Incoming::Placeholder(PlaceholderReason::KeyUnavailable)
    );
}

/// Test: A relay outage blocks encrypted sends instead of leaking plaintext
#[tokio::test]
async fn integration_outage_blocks_encrypted_send() {
    let net = Net::new();
    let alice = net.join("alice").await;
    let _bob = net.join("bob").await;
    let dm = ConversationId::new("dm2");
    let members = ids(&["alice", "bob"]);
    alice.enable_conversation(&dm, &members).await.unwrap();

    net.server.set_offline(true);
    let err = alice.send_message(&dm, "queued", &members).await.unwrap_err();
    assert!(err.is_retryable());
    assert!(matches!(err, E2eeError::Network(RelayError::Network(_))));

    net.server.set_offline(false);
    alice.send_message(&dm, "queued", &members).await.unwrap();
    assert_eq!(net.server.message_count(&dm), 1);
}

/// Test: A hung relay surfaces as a timeout rather than blocking forever
#[tokio::test(start_paused = true)]
async fn integration_slow_relay_times_out() {
    let net = Net::new();
    let alice = net.join("alice").await;
    net.server.set_latency(Duration::from_secs(30));

    let start = tokio::time::Instant::now();
    let err = alice
        .enable_conversation(&ConversationId::new("dm3"), &ids(&["alice"]))
        .await
        .unwrap_err();
    assert!(matches!(err, E2eeError::Network(RelayError::Timeout)));
    assert!(start.elapsed() < Duration::from_secs(30));
}
