//! End-to-end coordinator behavior over channel-backed connections and an
//! in-memory database.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use tokio::sync::mpsc;
use uuid::Uuid;

use parley_db::Database;
use parley_gateway::translate::{TranslationFailure, Translator};
use parley_gateway::{ConnCtx, Coordinator};
use parley_types::events::ServerEvent;
use parley_types::models::{CallMode, RoomKey};

struct CountingTranslator {
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl Translator for CountingTranslator {
    async fn transcribe_and_translate(
        &self,
        _audio: Vec<u8>,
        _source_language: Option<String>,
        target_language: String,
    ) -> Result<String, TranslationFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("caption in {target_language}"))
    }
}

struct FailingTranslator;

#[async_trait::async_trait]
impl Translator for FailingTranslator {
    async fn transcribe_and_translate(
        &self,
        _audio: Vec<u8>,
        _source_language: Option<String>,
        _target_language: String,
    ) -> Result<String, TranslationFailure> {
        Err(TranslationFailure(
            "Translation service is unavailable.".into(),
        ))
    }
}

fn new_coordinator() -> (Coordinator, Arc<Database>, Arc<CountingTranslator>) {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let translator = Arc::new(CountingTranslator {
        calls: AtomicUsize::new(0),
    });
    let coordinator = Coordinator::new(db.clone(), translator.clone());
    (coordinator, db, translator)
}

fn seed_user(db: &Database, name: &str) -> Uuid {
    let id = Uuid::new_v4();
    db.create_user(&id.to_string(), name, "hash").unwrap();
    id
}

struct TestConn {
    ctx: ConnCtx,
    rx: mpsc::Receiver<ServerEvent>,
}

async fn connect(coordinator: &Coordinator, user_id: Uuid, username: &str) -> TestConn {
    let handle = coordinator.connect(user_id, username).await.unwrap();
    TestConn {
        ctx: ConnCtx {
            conn_id: handle.conn_id,
            user_id,
            username: username.to_string(),
        },
        rx: handle.outbound,
    }
}

fn drain(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn count_messages(events: &[ServerEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, ServerEvent::ReceiveMessage { .. }))
        .count()
}

// -- Message routing --

#[tokio::test]
async fn direct_message_is_persisted_and_delivered_once_per_connection() {
    let (coordinator, db, _) = new_coordinator();
    let alice = seed_user(&db, "alice");
    let bob = seed_user(&db, "bob");

    let alice_conn = connect(&coordinator, alice, "alice").await;
    let mut bob_tab1 = connect(&coordinator, bob, "bob").await;
    let mut bob_tab2 = connect(&coordinator, bob, "bob").await;

    let event = coordinator
        .send_direct(&alice_conn.ctx, bob, Some("hello bob".into()), None, None)
        .await
        .unwrap();

    // The returned event carries the server-assigned id and timestamp
    let ServerEvent::ReceiveMessage { id, body, .. } = &event else {
        panic!("unexpected return: {event:?}");
    };
    assert_eq!(body.as_deref(), Some("hello bob"));

    // Exactly one delivery per live connection of the recipient
    assert_eq!(count_messages(&drain(&mut bob_tab1.rx)), 1);
    assert_eq!(count_messages(&drain(&mut bob_tab2.rx)), 1);

    // And the persisted log has the message before anyone saw it
    let key = RoomKey::direct(alice, bob).storage_key();
    let rows = db.get_room_messages(&key, 10, None).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, id.to_string());
}

#[tokio::test]
async fn senders_other_tabs_see_the_message_but_the_origin_does_not() {
    let (coordinator, db, _) = new_coordinator();
    let alice = seed_user(&db, "alice");
    let bob = seed_user(&db, "bob");

    let mut origin = connect(&coordinator, alice, "alice").await;
    let mut other_tab = connect(&coordinator, alice, "alice").await;
    let _bob_conn = connect(&coordinator, bob, "bob").await;

    coordinator
        .send_direct(&origin.ctx, bob, Some("hi".into()), None, None)
        .await
        .unwrap();

    assert_eq!(count_messages(&drain(&mut other_tab.rx)), 1);
    assert_eq!(count_messages(&drain(&mut origin.rx)), 0);
}

#[tokio::test]
async fn per_sender_order_is_preserved_in_delivery_and_log() {
    let (coordinator, db, _) = new_coordinator();
    let alice = seed_user(&db, "alice");
    let bob = seed_user(&db, "bob");

    let alice_conn = connect(&coordinator, alice, "alice").await;
    let mut bob_conn = connect(&coordinator, bob, "bob").await;

    for text in ["first", "second", "third"] {
        coordinator
            .send_direct(&alice_conn.ctx, bob, Some(text.into()), None, None)
            .await
            .unwrap();
    }

    let bodies: Vec<String> = drain(&mut bob_conn.rx)
        .into_iter()
        .filter_map(|e| match e {
            ServerEvent::ReceiveMessage { body, .. } => body,
            _ => None,
        })
        .collect();
    assert_eq!(bodies, vec!["first", "second", "third"]);

    // Newest-first history reads back in reverse
    let key = RoomKey::direct(alice, bob).storage_key();
    let logged: Vec<Option<String>> = db
        .get_room_messages(&key, 10, None)
        .unwrap()
        .into_iter()
        .map(|r| r.body)
        .collect();
    assert_eq!(
        logged,
        vec![
            Some("third".into()),
            Some("second".into()),
            Some("first".into())
        ]
    );
}

#[tokio::test]
async fn persistence_failure_suppresses_fanout() {
    let (coordinator, db, _) = new_coordinator();
    let alice = seed_user(&db, "alice");
    let bob = seed_user(&db, "bob");

    let alice_conn = connect(&coordinator, alice, "alice").await;
    let mut bob_conn = connect(&coordinator, bob, "bob").await;

    // Break the durable log out from under the router
    db.with_conn(|conn| {
        conn.execute_batch("DROP TABLE messages")?;
        Ok(())
    })
    .unwrap();

    let err = coordinator
        .send_direct(&alice_conn.ctx, bob, Some("doomed".into()), None, None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("try again"));

    // No delivery without durability
    assert_eq!(count_messages(&drain(&mut bob_conn.rx)), 0);
}

#[tokio::test]
async fn group_message_reaches_online_members_and_history_serves_offline_ones() {
    let (coordinator, db, _) = new_coordinator();
    let alice = seed_user(&db, "alice");
    let bob = seed_user(&db, "bob");
    let carol = seed_user(&db, "carol");

    let group = Uuid::new_v4();
    db.create_group(&group.to_string(), "trio", &alice.to_string())
        .unwrap();
    db.add_group_member(&group.to_string(), &bob.to_string())
        .unwrap();
    db.add_group_member(&group.to_string(), &carol.to_string())
        .unwrap();

    // carol stays offline; membership hydrates for alice and bob at connect
    let alice_conn = connect(&coordinator, alice, "alice").await;
    let mut bob_conn = connect(&coordinator, bob, "bob").await;

    coordinator
        .send_group(&alice_conn.ctx, group, Some("hi".into()), None, None)
        .await
        .unwrap();

    let bob_events = drain(&mut bob_conn.rx);
    assert_eq!(
        bob_events
            .iter()
            .filter(|e| matches!(e, ServerEvent::ReceiveGroupMessage { .. }))
            .count(),
        1
    );

    // carol can fetch it later
    let rows = db
        .get_room_messages(&RoomKey::group(group).storage_key(), 10, None)
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].body.as_deref(), Some("hi"));
}

#[tokio::test]
async fn group_send_without_membership_is_rejected() {
    let (coordinator, db, _) = new_coordinator();
    let alice = seed_user(&db, "alice");
    let mallory = seed_user(&db, "mallory");

    let group = Uuid::new_v4();
    db.create_group(&group.to_string(), "private", &alice.to_string())
        .unwrap();

    let _alice_conn = connect(&coordinator, alice, "alice").await;
    let mallory_conn = connect(&coordinator, mallory, "mallory").await;

    let err = coordinator
        .send_group(&mallory_conn.ctx, group, Some("let me in".into()), None, None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not a member"));
}

// -- Call signaling --

async fn ring(coordinator: &Coordinator, caller: &TestConn, callee: Uuid) {
    coordinator
        .call_request(
            &caller.ctx,
            callee,
            serde_json::json!({"sdp": "offer"}),
            CallMode::Video,
        )
        .await
        .unwrap();
}

fn session_of(events: &[ServerEvent]) -> Option<Uuid> {
    events.iter().find_map(|e| match e {
        ServerEvent::CallIncoming { session_id, .. }
        | ServerEvent::CallOutgoing { session_id, .. }
        | ServerEvent::CallAnswered { session_id, .. } => Some(*session_id),
        _ => None,
    })
}

#[tokio::test]
async fn call_flow_ring_answer_hangup() {
    let (coordinator, db, _) = new_coordinator();
    let alice = seed_user(&db, "alice");
    let bob = seed_user(&db, "bob");

    let mut alice_conn = connect(&coordinator, alice, "alice").await;
    let mut bob_conn = connect(&coordinator, bob, "bob").await;

    ring(&coordinator, &alice_conn, bob).await;

    let bob_events = drain(&mut bob_conn.rx);
    let session_id = session_of(&bob_events).expect("callee was rung");
    let incoming = bob_events
        .iter()
        .find(|e| matches!(e, ServerEvent::CallIncoming { .. }))
        .unwrap();
    let ServerEvent::CallIncoming { caller, mode, .. } = incoming else {
        unreachable!()
    };
    assert_eq!(caller, "alice");
    assert_eq!(*mode, CallMode::Video);

    let alice_events = drain(&mut alice_conn.rx);
    assert_eq!(session_of(&alice_events), Some(session_id));

    // Bob answers: Ringing -> Active, answer relayed to the caller
    coordinator
        .call_answer(
            &bob_conn.ctx,
            session_id,
            true,
            Some(serde_json::json!({"sdp": "answer"})),
        )
        .await
        .unwrap();
    let alice_events = drain(&mut alice_conn.rx);
    assert!(
        alice_events
            .iter()
            .any(|e| matches!(e, ServerEvent::CallAnswered { .. }))
    );

    // ICE flows both ways while Active
    coordinator
        .relay_ice_candidate(&alice_conn.ctx, session_id, serde_json::json!({"c": 1}))
        .await;
    assert!(
        drain(&mut bob_conn.rx)
            .iter()
            .any(|e| matches!(e, ServerEvent::IceCandidate { .. }))
    );

    // Alice hangs up: Bob learns who ended it, exactly once
    coordinator.call_hangup(&alice_conn.ctx, session_id).await;
    let ended: Vec<_> = drain(&mut bob_conn.rx)
        .into_iter()
        .filter_map(|e| match e {
            ServerEvent::CallEnded { ended_by, .. } => Some(ended_by),
            _ => None,
        })
        .collect();
    assert_eq!(ended, vec!["alice".to_string()]);

    // The pair can call again afterwards
    assert!(
        coordinator
            .call_request(
                &alice_conn.ctx,
                bob,
                serde_json::json!({"sdp": "offer2"}),
                CallMode::Audio,
            )
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn call_to_offline_user_fails_without_a_lingering_session() {
    let (coordinator, db, _) = new_coordinator();
    let alice = seed_user(&db, "alice");
    let bob = seed_user(&db, "bob");

    let mut alice_conn = connect(&coordinator, alice, "alice").await;

    let err = coordinator
        .call_request(
            &alice_conn.ctx,
            bob,
            serde_json::json!({"sdp": "offer"}),
            CallMode::Audio,
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not online"));
    assert!(drain(&mut alice_conn.rx).is_empty());

    // No session lingers: once bob is online the same pair rings fine
    let mut bob_conn = connect(&coordinator, bob, "bob").await;
    drain(&mut alice_conn.rx); // discard bob's presence announcement
    ring(&coordinator, &alice_conn, bob).await;
    assert!(session_of(&drain(&mut bob_conn.rx)).is_some());
}

#[tokio::test]
async fn second_request_while_ringing_is_rejected_and_first_unaffected() {
    let (coordinator, db, _) = new_coordinator();
    let alice = seed_user(&db, "alice");
    let bob = seed_user(&db, "bob");

    let mut alice_conn = connect(&coordinator, alice, "alice").await;
    let mut bob_conn = connect(&coordinator, bob, "bob").await;

    ring(&coordinator, &alice_conn, bob).await;
    let session_id = session_of(&drain(&mut bob_conn.rx)).unwrap();

    let err = coordinator
        .call_request(
            &alice_conn.ctx,
            bob,
            serde_json::json!({"sdp": "again"}),
            CallMode::Audio,
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("active call"));

    // First session still answers normally
    drain(&mut alice_conn.rx);
    coordinator
        .call_answer(
            &bob_conn.ctx,
            session_id,
            true,
            Some(serde_json::json!({"sdp": "answer"})),
        )
        .await
        .unwrap();
    assert!(
        drain(&mut alice_conn.rx)
            .iter()
            .any(|e| matches!(e, ServerEvent::CallAnswered { .. }))
    );
}

#[tokio::test]
async fn declining_frees_the_session_and_notifies_the_caller() {
    let (coordinator, db, _) = new_coordinator();
    let alice = seed_user(&db, "alice");
    let bob = seed_user(&db, "bob");

    let mut alice_conn = connect(&coordinator, alice, "alice").await;
    let mut bob_conn = connect(&coordinator, bob, "bob").await;

    ring(&coordinator, &alice_conn, bob).await;
    let session_id = session_of(&drain(&mut bob_conn.rx)).unwrap();
    drain(&mut alice_conn.rx);

    coordinator
        .call_answer(&bob_conn.ctx, session_id, false, None)
        .await
        .unwrap();
    assert!(
        drain(&mut alice_conn.rx)
            .iter()
            .any(|e| matches!(e, ServerEvent::CallDeclined { .. }))
    );

    // Answering the declined session is now a state error
    let err = coordinator
        .call_answer(
            &bob_conn.ctx,
            session_id,
            true,
            Some(serde_json::json!({"sdp": "late"})),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Call not found"));
}

#[tokio::test]
async fn disconnect_of_last_connection_ends_the_call_exactly_once() {
    let (coordinator, db, _) = new_coordinator();
    let alice = seed_user(&db, "alice");
    let bob = seed_user(&db, "bob");

    let mut alice_conn = connect(&coordinator, alice, "alice").await;
    let bob_tab1 = connect(&coordinator, bob, "bob").await;
    let mut bob_tab2 = connect(&coordinator, bob, "bob").await;

    ring(&coordinator, &alice_conn, bob).await;
    let session_id = session_of(&drain(&mut bob_tab2.rx)).unwrap();
    coordinator
        .call_answer(
            &bob_tab2.ctx,
            session_id,
            true,
            Some(serde_json::json!({"sdp": "answer"})),
        )
        .await
        .unwrap();
    drain(&mut alice_conn.rx);

    // First tab closing does not end the call
    coordinator.disconnect(bob_tab1.ctx.conn_id).await;
    assert!(
        !drain(&mut alice_conn.rx)
            .iter()
            .any(|e| matches!(e, ServerEvent::CallEnded { .. }))
    );

    // Last tab closing does, with exactly one notification
    coordinator.disconnect(bob_tab2.ctx.conn_id).await;
    let ended: Vec<_> = drain(&mut alice_conn.rx)
        .into_iter()
        .filter(|e| matches!(e, ServerEvent::CallEnded { .. }))
        .collect();
    assert_eq!(ended.len(), 1);

    // No session lingers for the pair; a new request fails only because
    // bob is now fully offline
    let err = coordinator
        .call_request(
            &alice_conn.ctx,
            bob,
            serde_json::json!({"sdp": "offer"}),
            CallMode::Audio,
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not online"));
}

#[tokio::test]
async fn stray_ice_candidates_are_dropped_silently() {
    let (coordinator, db, _) = new_coordinator();
    let alice = seed_user(&db, "alice");

    let mut alice_conn = connect(&coordinator, alice, "alice").await;
    coordinator
        .relay_ice_candidate(&alice_conn.ctx, Uuid::new_v4(), serde_json::json!({"c": 1}))
        .await;
    assert!(drain(&mut alice_conn.rx).is_empty());
}

// -- Translation relay --

async fn active_call(
    coordinator: &Coordinator,
    alice_conn: &mut TestConn,
    bob_conn: &mut TestConn,
) -> Uuid {
    ring(coordinator, alice_conn, bob_conn.ctx.user_id).await;
    let session_id = session_of(&drain(&mut bob_conn.rx)).unwrap();
    coordinator
        .call_answer(
            &bob_conn.ctx,
            session_id,
            true,
            Some(serde_json::json!({"sdp": "answer"})),
        )
        .await
        .unwrap();
    drain(&mut alice_conn.rx);
    session_id
}

#[tokio::test]
async fn captions_are_translated_once_per_language_and_fanned_out() {
    let (coordinator, db, translator) = new_coordinator();
    let alice = seed_user(&db, "alice");
    let bob = seed_user(&db, "bob");

    let mut alice_conn = connect(&coordinator, alice, "alice").await;
    let mut bob_conn = connect(&coordinator, bob, "bob").await;
    let session_id = active_call(&coordinator, &mut alice_conn, &mut bob_conn).await;

    // Both participants want Spanish captions: one collaborator call total
    for conn in [&alice_conn, &bob_conn] {
        coordinator
            .set_translation_preferences(&conn.ctx, session_id, true, "es".into(), None)
            .await
            .unwrap();
    }

    let chunk = B64.encode(b"pcm-audio");
    coordinator
        .relay_transcription_chunk(&alice_conn.ctx, session_id, chunk.clone(), Some("en".into()))
        .await
        .unwrap();
    assert_eq!(translator.calls.load(Ordering::SeqCst), 1);

    for (who, rx) in [("alice", &mut alice_conn.rx), ("bob", &mut bob_conn.rx)] {
        let captions: Vec<_> = drain(rx)
            .into_iter()
            .filter_map(|e| match e {
                ServerEvent::TranslatedCaption {
                    language, caption, ..
                } => Some((language, caption)),
                _ => None,
            })
            .collect();
        assert_eq!(captions, vec![("es".into(), "caption in es".into())], "{who}");
    }

    // Diverging preferences cost one call per distinct language
    coordinator
        .set_translation_preferences(&bob_conn.ctx, session_id, true, "fr".into(), None)
        .await
        .unwrap();
    coordinator
        .relay_transcription_chunk(&bob_conn.ctx, session_id, chunk, None)
        .await
        .unwrap();
    assert_eq!(translator.calls.load(Ordering::SeqCst), 3);

    let bob_langs: Vec<_> = drain(&mut bob_conn.rx)
        .into_iter()
        .filter_map(|e| match e {
            ServerEvent::TranslatedCaption { language, .. } => Some(language),
            _ => None,
        })
        .collect();
    assert_eq!(bob_langs, vec!["fr".to_string()]);
}

#[tokio::test]
async fn translator_failure_is_session_scoped_and_does_not_end_the_call() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let coordinator = Coordinator::new(db.clone(), Arc::new(FailingTranslator));
    let alice = seed_user(&db, "alice");
    let bob = seed_user(&db, "bob");

    let mut alice_conn = connect(&coordinator, alice, "alice").await;
    let mut bob_conn = connect(&coordinator, bob, "bob").await;
    let session_id = active_call(&coordinator, &mut alice_conn, &mut bob_conn).await;

    coordinator
        .set_translation_preferences(&bob_conn.ctx, session_id, true, "es".into(), None)
        .await
        .unwrap();

    coordinator
        .relay_transcription_chunk(
            &alice_conn.ctx,
            session_id,
            B64.encode(b"pcm-audio"),
            None,
        )
        .await
        .unwrap();

    for rx in [&mut alice_conn.rx, &mut bob_conn.rx] {
        assert!(
            drain(rx)
                .iter()
                .any(|e| matches!(e, ServerEvent::TranslationError { .. }))
        );
    }

    // The call is still alive: signaling keeps flowing
    coordinator
        .relay_ice_candidate(&alice_conn.ctx, session_id, serde_json::json!({"c": 2}))
        .await;
    assert!(
        drain(&mut bob_conn.rx)
            .iter()
            .any(|e| matches!(e, ServerEvent::IceCandidate { .. }))
    );
}

#[tokio::test]
async fn chunks_for_unknown_sessions_are_dropped_and_prefs_die_with_the_session() {
    let (coordinator, db, translator) = new_coordinator();
    let alice = seed_user(&db, "alice");
    let bob = seed_user(&db, "bob");

    let mut alice_conn = connect(&coordinator, alice, "alice").await;
    let mut bob_conn = connect(&coordinator, bob, "bob").await;
    let session_id = active_call(&coordinator, &mut alice_conn, &mut bob_conn).await;

    coordinator
        .set_translation_preferences(&bob_conn.ctx, session_id, true, "es".into(), None)
        .await
        .unwrap();

    coordinator.call_hangup(&alice_conn.ctx, session_id).await;

    // Straggler chunk after hangup: silently dropped, no collaborator call
    coordinator
        .relay_transcription_chunk(
            &alice_conn.ctx,
            session_id,
            B64.encode(b"pcm-audio"),
            None,
        )
        .await
        .unwrap();
    assert_eq!(translator.calls.load(Ordering::SeqCst), 0);

    // Preferences were destroyed with the session
    let err = coordinator
        .set_translation_preferences(&bob_conn.ctx, session_id, true, "fr".into(), None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Call not found"));
}

// -- Presence --

#[tokio::test]
async fn presence_announces_first_connection_and_last_disconnect_only() {
    let (coordinator, db, _) = new_coordinator();
    let alice = seed_user(&db, "alice");
    let bob = seed_user(&db, "bob");

    let mut alice_conn = connect(&coordinator, alice, "alice").await;

    let bob_tab1 = connect(&coordinator, bob, "bob").await;
    let _bob_tab2 = connect(&coordinator, bob, "bob").await;

    // Only the first connection announced bob
    let online: Vec<_> = drain(&mut alice_conn.rx)
        .into_iter()
        .filter(|e| matches!(e, ServerEvent::PresenceUpdate { online: true, .. }))
        .collect();
    assert_eq!(online.len(), 1);

    // Closing one of two tabs announces nothing
    coordinator.disconnect(bob_tab1.ctx.conn_id).await;
    assert!(drain(&mut alice_conn.rx).is_empty());
    assert!(coordinator.presence().is_online(bob).await);
}
