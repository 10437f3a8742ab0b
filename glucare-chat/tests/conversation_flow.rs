//! End-to-end behaviour of conversation views over the in-memory store.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chat::assistant::{Assistant, AssistantError, AssistantReply, AssistantRequest};
use chat::store::{ChangeEvent, StoreError};
use chat::{
    ChannelIds, ChannelOptions, ChannelState, ChatError, ConversationView, LiveChannel,
    MemoryChatStore, MessageSequence, MessageStore, message_handler,
};
use chrono::{TimeZone, Utc};
use shared::models::{Identity, Message, ParticipantPair, ParticipantRole, SenderRole, Timestamp};
use tokio::sync::Mutex;
use tokio::time::timeout;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(2);

struct Clinic {
    store: Arc<MemoryChatStore>,
    doctor: Identity,
    patient: Identity,
    pair: ParticipantPair,
}

async fn clinic() -> Clinic {
    let store = Arc::new(MemoryChatStore::new());
    let doctor = store
        .add_participant(ParticipantRole::Doctor, "Dr. Osei")
        .await;
    let patient = store
        .add_participant(ParticipantRole::Patient, "Amara")
        .await;
    Clinic {
        store,
        doctor: Identity::doctor(doctor.id),
        patient: Identity::patient(patient.id),
        pair: ParticipantPair::new(doctor.id, patient.id),
    }
}

async fn open(clinic: &Clinic, identity: Identity) -> ConversationView<MemoryChatStore> {
    ConversationView::open(
        Arc::clone(&clinic.store),
        identity,
        clinic.pair,
        ChannelOptions::default(),
    )
    .await
    .unwrap()
}

async fn wait_for_len(view: &ConversationView<MemoryChatStore>, expected: usize) {
    timeout(WAIT, async {
        while view.len().await < expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

fn assert_unique(messages: &[Message]) {
    let ids: HashSet<_> = messages.iter().map(|m| m.id).collect();
    assert_eq!(ids.len(), messages.len(), "sequence holds a duplicate id");
}

fn at(second: u32) -> Timestamp {
    Timestamp(Utc.with_ymd_and_hms(2025, 3, 8, 9, 0, second).unwrap())
}

#[tokio::test]
async fn first_send_creates_conversation_and_echo_is_dropped() {
    let clinic = clinic().await;
    let view = open(&clinic, clinic.patient).await;
    assert!(view.is_empty().await);

    let m1 = view.send("hello").await.unwrap();
    assert_eq!(m1.sender_role, SenderRole::Patient);

    let history = clinic.store.fetch_history(view.conversation_id()).await.unwrap();
    assert_eq!(history, vec![m1.clone()]);

    // Live echo of the own send, plus a redelivery of the same insert.
    clinic
        .store
        .publish_raw(ChangeEvent::message_insert(&m1).unwrap())
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(view.messages().await, vec![m1]);
    view.close().await;
}

#[tokio::test]
async fn append_lands_once_at_the_tail_of_history() {
    let clinic = clinic().await;
    let view = open(&clinic, clinic.doctor).await;

    for body in ["How are you feeling?", "Any lows overnight?", "Send me your readings"] {
        let sent = view.send(body).await.unwrap();
        let history = clinic.store.fetch_history(view.conversation_id()).await.unwrap();

        assert_eq!(history.last(), Some(&sent));
        assert_eq!(history.iter().filter(|m| m.id == sent.id).count(), 1);
    }
    view.close().await;
}

#[tokio::test]
async fn blank_bodies_never_reach_the_store() {
    let clinic = clinic().await;
    let view = open(&clinic, clinic.patient).await;
    let before = clinic.store.calls();

    for body in ["", " ", "\n\t  "] {
        let err = view.send(body).await.unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
        assert!(!err.is_retryable());
    }

    assert_eq!(clinic.store.calls(), before);
    assert!(view.is_empty().await);
    view.close().await;
}

#[tokio::test]
async fn peer_messages_arrive_live() {
    let clinic = clinic().await;
    let doctor_view = open(&clinic, clinic.doctor).await;
    let patient_view = open(&clinic, clinic.patient).await;
    assert_eq!(doctor_view.conversation_id(), patient_view.conversation_id());

    let mut updates = doctor_view.updates();
    let sent = patient_view.send("Glucose 210 after dinner").await.unwrap();

    timeout(WAIT, updates.changed()).await.unwrap().unwrap();
    let received = doctor_view.messages().await;
    assert_eq!(received, vec![sent.clone()]);
    assert_eq!(doctor_view.display_name(&received[0]), "Amara");

    doctor_view.close().await;
    patient_view.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn interleaved_sends_and_deliveries_never_duplicate() {
    let clinic = clinic().await;
    let doctor_view = Arc::new(open(&clinic, clinic.doctor).await);
    let patient_view = Arc::new(open(&clinic, clinic.patient).await);

    let mut tasks = Vec::new();
    for i in 0..20 {
        let doctor_view = Arc::clone(&doctor_view);
        let patient_view = Arc::clone(&patient_view);
        tasks.push(tokio::spawn(async move {
            doctor_view.send(&format!("doctor {i}")).await.unwrap();
            patient_view.send(&format!("patient {i}")).await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    wait_for_len(&doctor_view, 40).await;
    wait_for_len(&patient_view, 40).await;

    let doctor_messages = doctor_view.messages().await;
    let patient_messages = patient_view.messages().await;
    assert_unique(&doctor_messages);
    assert_eq!(doctor_messages.len(), 40);
    assert_eq!(doctor_messages, patient_messages);

    let history = clinic
        .store
        .fetch_history(doctor_view.conversation_id())
        .await
        .unwrap();
    assert_eq!(doctor_messages, history);
}

#[tokio::test]
async fn equal_timestamps_order_by_id_regardless_of_arrival() {
    let clinic = clinic().await;
    let view = open(&clinic, clinic.doctor).await;
    let conversation_id = view.conversation_id();

    let message = |n: u128, created_at: Timestamp| Message {
        id: Uuid::from_u128(n),
        conversation_id,
        sender_id: clinic.patient.user_id,
        sender_role: SenderRole::Patient,
        body: format!("reading {n}"),
        created_at,
    };

    clinic.store.insert_message(message(1, at(10))).await.unwrap();
    // m3 arrives before m2; both share a timestamp.
    clinic.store.insert_message(message(3, at(20))).await.unwrap();
    clinic.store.insert_message(message(2, at(20))).await.unwrap();
    wait_for_len(&view, 3).await;

    let ids: Vec<_> = view.messages().await.iter().map(|m| m.id).collect();
    assert_eq!(
        ids,
        vec![Uuid::from_u128(1), Uuid::from_u128(2), Uuid::from_u128(3)]
    );
    view.close().await;
}

#[tokio::test]
async fn closing_mid_delivery_freezes_the_sequence() {
    let clinic = clinic().await;
    let view = open(&clinic, clinic.patient).await;
    let conversation_id = view.conversation_id();
    view.close().await;

    let sequence = Arc::new(Mutex::new(MessageSequence::new()));
    let applied = Arc::new(AtomicUsize::new(0));
    let handler = {
        let sequence = Arc::clone(&sequence);
        let applied = Arc::clone(&applied);
        message_handler(move |message| {
            let sequence = Arc::clone(&sequence);
            let applied = Arc::clone(&applied);
            async move {
                tokio::time::sleep(Duration::from_millis(2)).await;
                sequence.lock().await.merge(message);
                applied.fetch_add(1, Ordering::SeqCst);
            }
        })
    };
    let mut channel = LiveChannel::open(
        ChannelIds::default().next_id(),
        Arc::clone(&clinic.store),
        conversation_id,
        handler,
        ChannelOptions::default(),
    )
    .await
    .unwrap();

    let store = Arc::clone(&clinic.store);
    let sender = clinic.patient.user_id;
    let writer = tokio::spawn(async move {
        for i in 0..50 {
            store
                .append(shared::models::NewMessage::new(
                    conversation_id,
                    sender,
                    SenderRole::Patient,
                    format!("burst {i}"),
                ))
                .await
                .unwrap();
        }
    });

    timeout(WAIT, async {
        while applied.load(Ordering::SeqCst) < 5 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();

    channel.close().await;
    let frozen = sequence.lock().await.len();
    assert_eq!(channel.state(), ChannelState::Closed);

    writer.await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(sequence.lock().await.len(), frozen);
    assert_eq!(applied.load(Ordering::SeqCst), frozen);
}

#[tokio::test]
async fn rejected_send_leaves_sequence_untouched() {
    let clinic = clinic().await;
    let view = open(&clinic, clinic.patient).await;
    clinic.store.set_deny_writes(true);

    let err = view.send("Can I skip my evening dose?").await.unwrap_err();

    assert!(matches!(
        err,
        ChatError::Persistence(StoreError::Unauthorized(_))
    ));
    assert!(err.is_retryable());
    assert_eq!(err.to_response().code, "persistence_failed");
    assert!(view.is_empty().await);
    assert_eq!(clinic.store.calls().appends, 1);

    clinic.store.set_deny_writes(false);
    view.send("Can I skip my evening dose?").await.unwrap();
    assert_eq!(view.len().await, 1);
    view.close().await;
}

#[tokio::test]
async fn open_retries_a_rejected_subscription_once() {
    let clinic = clinic().await;

    clinic.store.fail_next_subscriptions(1);
    let view = open(&clinic, clinic.patient).await;
    assert_eq!(view.channel_state(), ChannelState::Active);
    assert_eq!(view.channel_id().map(|id| id.get()), Some(2));
    assert_eq!(clinic.store.calls().subscribes, 2);
    view.close().await;

    clinic.store.fail_next_subscriptions(2);
    let err = ConversationView::open(
        Arc::clone(&clinic.store),
        clinic.patient,
        clinic.pair,
        ChannelOptions::default(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ChatError::Channel(_)));
    assert_eq!(clinic.store.calls().subscribes, 4);
}

#[tokio::test]
async fn reconnect_replaces_channel_and_catches_up() {
    let clinic = clinic().await;
    let mut view = ConversationView::open(
        Arc::clone(&clinic.store),
        clinic.doctor,
        clinic.pair,
        ChannelOptions {
            subscribe_timeout: Duration::from_secs(1),
            auto_resubscribe: false,
        },
    )
    .await
    .unwrap();
    let first_channel = view.channel_id().unwrap();

    clinic.store.disconnect_subscribers().await;
    timeout(WAIT, async {
        while view.channel_state() != ChannelState::Error {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    // Written by the patient's device while the doctor's channel is down.
    let missed = clinic
        .store
        .append(shared::models::NewMessage::new(
            view.conversation_id(),
            clinic.patient.user_id,
            SenderRole::Patient,
            "Are you there?",
        ))
        .await
        .unwrap();
    assert!(view.is_empty().await);

    assert_eq!(view.reconnect().await.unwrap(), 1);
    assert!(view.channel_id().unwrap() > first_channel);
    assert_eq!(view.channel_state(), ChannelState::Active);
    assert_eq!(view.messages().await, vec![missed]);
    assert_eq!(clinic.store.active_subscriptions().await, 1);

    let reply = view.send("Yes, go ahead.").await.unwrap();
    assert_eq!(view.messages().await.last(), Some(&reply));
    view.close().await;
    assert_eq!(clinic.store.active_subscriptions().await, 0);
}

#[tokio::test]
async fn inserts_made_while_subscribing_reach_the_opening_view() {
    let clinic = clinic().await;
    let patient_view = open(&clinic, clinic.patient).await;
    clinic.store.set_subscribe_delay(Duration::from_millis(100));

    // History is read before the slow subscription is confirmed.
    let (opened, sent) = tokio::join!(
        ConversationView::open(
            Arc::clone(&clinic.store),
            clinic.doctor,
            clinic.pair,
            ChannelOptions {
                subscribe_timeout: Duration::from_secs(1),
                auto_resubscribe: false,
            },
        ),
        async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            patient_view.send("Reading 64, feeling shaky").await.unwrap()
        }
    );
    let doctor_view = opened.unwrap();

    assert_eq!(doctor_view.messages().await, vec![sent]);
    doctor_view.close().await;
    patient_view.close().await;
}

#[tokio::test]
async fn inserts_made_during_automatic_resubscribe_are_caught_up() {
    let clinic = clinic().await;
    let doctor_view = open(&clinic, clinic.doctor).await;
    let patient_view = open(&clinic, clinic.patient).await;
    let first_channel = doctor_view.channel_id();

    clinic.store.set_subscribe_delay(Duration::from_millis(100));
    clinic.store.disconnect_subscribers().await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    // No subscription exists while this is written.
    let missed = patient_view.send("Are you still there?").await.unwrap();

    wait_for_len(&doctor_view, 1).await;
    assert_eq!(doctor_view.messages().await, vec![missed]);
    assert_eq!(doctor_view.channel_id(), first_channel);
    assert_eq!(doctor_view.channel_state(), ChannelState::Active);

    doctor_view.close().await;
    patient_view.close().await;
}

#[tokio::test]
async fn dropping_a_view_releases_its_subscription() {
    let clinic = clinic().await;
    let view = open(&clinic, clinic.patient).await;
    assert_eq!(clinic.store.active_subscriptions().await, 1);

    drop(view);

    timeout(WAIT, async {
        while clinic.store.active_subscriptions().await != 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_contact_shares_one_conversation() {
    let clinic = clinic().await;

    let (doctor_view, patient_view) = tokio::join!(
        open(&clinic, clinic.doctor),
        open(&clinic, clinic.patient)
    );

    assert_eq!(doctor_view.conversation_id(), patient_view.conversation_id());
    assert_eq!(clinic.store.conversation_count().await, 1);
    doctor_view.close().await;
    patient_view.close().await;
}

struct ScriptedAssistant {
    questions: std::sync::Mutex<Vec<AssistantRequest>>,
}

#[async_trait]
impl Assistant for ScriptedAssistant {
    async fn reply(&self, request: &AssistantRequest) -> Result<AssistantReply, AssistantError> {
        self.questions.lock().unwrap().push(request.clone());
        Ok(AssistantReply {
            response: "A reading of 250 is high; drink water and recheck in an hour.".into(),
            confidence: Some(0.8),
            category: Some("glucose".into()),
            suggestions: Vec::new(),
        })
    }
}

struct UnavailableAssistant;

#[async_trait]
impl Assistant for UnavailableAssistant {
    async fn reply(&self, _request: &AssistantRequest) -> Result<AssistantReply, AssistantError> {
        Err(AssistantError::Status(503))
    }
}

#[tokio::test]
async fn assistant_replies_are_stored_as_assistant_messages() {
    let clinic = clinic().await;
    let view = open(&clinic, clinic.patient).await;
    let assistant = ScriptedAssistant {
        questions: std::sync::Mutex::new(Vec::new()),
    };

    let reply = view
        .ask_assistant(&assistant, " My reading is 250 ")
        .await
        .unwrap();

    assert_eq!(reply.sender_role, SenderRole::Assistant);
    assert_eq!(reply.sender_id, chat::ASSISTANT_SENDER_ID);
    assert_eq!(view.display_name(&reply), "Assistant");

    let messages = view.messages().await;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].body, "My reading is 250");
    assert_eq!(messages[1], reply);

    let questions = assistant.questions.lock().unwrap();
    assert_eq!(questions[0].message, "My reading is 250");
    assert_eq!(
        questions[0].user_id.as_deref(),
        Some(clinic.patient.user_id.to_string().as_str())
    );
    let context = questions[0].context.as_ref().unwrap();
    assert_eq!(context["role"], "patient");
    assert_eq!(context["recent_messages"][0]["body"], "My reading is 250");
    drop(questions);

    view.close().await;
}

#[tokio::test]
async fn assistant_failure_keeps_the_question() {
    let clinic = clinic().await;
    let view = open(&clinic, clinic.patient).await;

    let err = view
        .ask_assistant(&UnavailableAssistant, "Is 60 too low?")
        .await
        .unwrap_err();

    assert!(matches!(err, ChatError::Assistant(AssistantError::Status(503))));
    assert_eq!(err.to_response().code, "assistant_failed");
    let messages = view.messages().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].body, "Is 60 too low?");
    view.close().await;
}
