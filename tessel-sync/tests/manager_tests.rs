use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tessel_store::{Datastore, FieldValue, Schema};
use tessel_sync::protocol::{Checkpoint, Message, MessageBody, Permissions};
use tessel_sync::transport::mock::{MockConnector, MockPeer, MockServer};
use tessel_sync::{ManagerEvent, SyncConfig, SyncError, SyncManager, SyncResult};
use tessel_types::{
    FieldId, FieldPatch, FieldUpdate, RecordId, SchemaId, SerialTransaction, StoreId, Transaction,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

fn schemas() -> Vec<Schema> {
    vec![Schema::new("cells").text("source").register("kind")]
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config() -> SyncConfig {
    init_tracing();
    SyncConfig {
        service_url: "ws://server/api/datastore".into(),
        collaboration_id: Some("nb".into()),
        token: Some("t".into()),
        request_timeout_ms: 0,
        reconnect_delay_ms: 10,
        schemas: schemas(),
        ..Default::default()
    }
}

fn kind_patch(record: &str, value: serde_json::Value) -> FieldPatch {
    FieldPatch {
        schema: SchemaId::new("cells"),
        record: RecordId::new(record),
        field: FieldId::new("kind"),
        update: FieldUpdate::register(value),
    }
}

fn remote_tx(serial: u64, record: &str, value: serde_json::Value) -> SerialTransaction {
    SerialTransaction::new(
        Transaction::new(StoreId::new(99), vec![kind_patch(record, value)]),
        serial,
    )
}

fn write_kind(store: &Datastore, record: &str, value: serde_json::Value) -> Transaction {
    let (schema, record, field) = (
        SchemaId::new("cells"),
        RecordId::new(record),
        FieldId::new("kind"),
    );
    store.begin_transaction();
    store
        .update_field(&schema, &record, &field, FieldUpdate::register(value))
        .unwrap();
    store.end_transaction().unwrap().unwrap()
}

fn read_kind(store: &Datastore, record: &str) -> serde_json::Value {
    match store
        .get_field(
            &SchemaId::new("cells"),
            &RecordId::new(record),
            &FieldId::new("kind"),
        )
        .unwrap()
    {
        FieldValue::Register(value) => value,
        other => panic!("unexpected value {other:?}"),
    }
}

fn read_source(store: &Datastore, record: &str) -> String {
    match store
        .get_field(
            &SchemaId::new("cells"),
            &RecordId::new(record),
            &FieldId::new("source"),
        )
        .unwrap()
    {
        FieldValue::Text(text) => text,
        other => panic!("unexpected value {other:?}"),
    }
}

struct Starting {
    connecting: JoinHandle<SyncResult<SyncManager>>,
    connector: MockConnector,
    server: MockServer,
    peer: MockPeer,
    history_request: Message,
}

/// Starts a manager and answers the store id request; the caller answers
/// the history request.
async fn start(store_id: u32) -> Starting {
    let (connector, mut server) = MockConnector::new();
    let connecting = tokio::spawn(SyncManager::connect(config(), Arc::new(connector.clone())));
    let mut peer = server.accept().await.unwrap();

    let request = peer.recv().await.unwrap();
    assert_eq!(request.msg_type(), "storeid-request");
    peer.reply(&request, MessageBody::StoreIdReply { store_id: StoreId::new(store_id) })
        .unwrap();

    let history_request = peer.recv().await.unwrap();
    assert_eq!(history_request.msg_type(), "history-request");
    Starting {
        connecting,
        connector,
        server,
        peer,
        history_request,
    }
}

struct Running {
    manager: SyncManager,
    connector: MockConnector,
    server: MockServer,
    peer: MockPeer,
}

async fn bring_up(
    store_id: u32,
    checkpoint: Option<Checkpoint>,
    transactions: Vec<SerialTransaction>,
) -> Running {
    let Starting {
        connecting,
        connector,
        server,
        peer,
        history_request,
    } = start(store_id).await;
    peer.reply(
        &history_request,
        MessageBody::HistoryReply {
            checkpoint,
            transactions,
        },
    )
    .unwrap();
    let manager = connecting.await.unwrap().unwrap();
    Running {
        manager,
        connector,
        server,
        peer,
    }
}

fn checkpoint_at(serial: u64) -> Checkpoint {
    Checkpoint {
        id: format!("cp-{serial}"),
        serial,
        state: json!({}),
    }
}

async fn next_event(
    events: &mut broadcast::Receiver<ManagerEvent>,
    matches: impl Fn(&ManagerEvent) -> bool,
) -> ManagerEvent {
    loop {
        let event = events.recv().await.unwrap();
        if matches(&event) {
            return event;
        }
    }
}

async fn expect_broadcast(peer: &mut MockPeer) -> (Message, Vec<SerialTransaction>) {
    let message = peer.recv().await.unwrap();
    match &message.body {
        MessageBody::TransactionBroadcast { transactions } => {
            let transactions = transactions.clone();
            (message, transactions)
        }
        other => panic!("expected broadcast, got {}", other.msg_type()),
    }
}

fn ack(peer: &MockPeer, broadcast: &Message, transactions: &[SerialTransaction], serials: Vec<u64>) {
    peer.reply(
        broadcast,
        MessageBody::TransactionAck {
            transaction_ids: transactions.iter().map(SerialTransaction::id).collect(),
            serials,
        },
    )
    .unwrap();
}

// ── Bring-up ─────────────────────────────────────────────────────

#[tokio::test]
async fn bring_up_acquires_store_id_and_replays_history() {
    let history = vec![remote_tx(1, "c1", json!("code")), remote_tx(2, "c2", json!("md"))];
    let Running {
        manager,
        connector,
        peer: _peer,
        server: _server,
    } = bring_up(7, None, history).await;

    assert_eq!(manager.store_id(), StoreId::new(7));
    assert_eq!(manager.store().store_id(), StoreId::new(7));
    assert_eq!(manager.server_serial(), 2);
    assert_eq!(manager.our_serial(), 0);
    assert_eq!(read_kind(manager.store(), "c1"), json!("code"));
    assert_eq!(read_kind(manager.store(), "c2"), json!("md"));
    assert_eq!(connector.urls(), vec!["ws://server/api/datastore/nb?token=t".to_string()]);
    assert!(manager.session().url().ends_with("storeId=7"));
}

#[tokio::test]
async fn store_id_is_requested_once() {
    let Running {
        manager,
        mut peer,
        server: _server,
        ..
    } = bring_up(3, None, vec![]).await;
    assert_eq!(manager.acquire_store_id().await.unwrap(), StoreId::new(3));
    assert_eq!(manager.acquire_store_id().await.unwrap(), StoreId::new(3));
    assert!(peer.try_recv().is_none());
}

#[tokio::test]
async fn permissions_are_requested_on_every_call() {
    let Running {
        manager,
        mut peer,
        server: _server,
        ..
    } = bring_up(3, None, vec![]).await;
    for write in [true, false] {
        let asking = tokio::spawn({
            let manager = manager.clone();
            async move { manager.permissions().await }
        });
        let request = peer.recv().await.unwrap();
        assert_eq!(request.msg_type(), "permissions-request");
        peer.reply(&request, MessageBody::PermissionsReply(Permissions { read: true, write }))
            .unwrap();
        assert_eq!(asking.await.unwrap().unwrap(), Permissions { read: true, write });
    }
}

#[tokio::test]
async fn bring_up_fails_on_error_reply() {
    let (connector, mut server) = MockConnector::new();
    let connecting = tokio::spawn(SyncManager::connect(config(), Arc::new(connector)));
    let mut peer = server.accept().await.unwrap();
    let request = peer.recv().await.unwrap();
    peer.reply(&request, MessageBody::ErrorReply { reason: "forbidden".into() })
        .unwrap();
    let err = connecting.await.unwrap().unwrap_err();
    assert!(matches!(err, SyncError::Remote(_)));
}

#[tokio::test]
async fn history_replay_converges_across_fresh_stores() {
    let history = vec![
        remote_tx(11, "c1", json!("code")),
        remote_tx(12, "c1", json!("raw")),
        remote_tx(13, "c2", json!({"lang": "py"})),
    ];
    let checkpoint = Checkpoint {
        id: "cp".into(),
        serial: 10,
        state: json!({"cells": {"c0": {"source": "print(1)", "kind": "code"}}}),
    };
    let a = bring_up(1, Some(checkpoint.clone()), history.clone()).await;
    let b = bring_up(2, Some(checkpoint), history).await;

    assert_eq!(a.manager.server_serial(), 13);
    assert_eq!(b.manager.server_serial(), 13);
    assert_eq!(a.manager.store().snapshot(), b.manager.store().snapshot());
    assert_eq!(read_kind(a.manager.store(), "c1"), json!("raw"));
    assert_eq!(read_kind(a.manager.store(), "c0"), json!("code"));
}

#[tokio::test]
async fn replay_skips_serials_already_applied() {
    let Running {
        manager,
        mut peer,
        server: _server,
        ..
    } = bring_up(1, None, vec![remote_tx(1, "c1", json!("a"))]).await;

    let replaying = tokio::spawn({
        let manager = manager.clone();
        async move { manager.replay_history(None).await }
    });
    let request = peer.recv().await.unwrap();
    peer.reply(
        &request,
        MessageBody::HistoryReply {
            checkpoint: None,
            transactions: vec![remote_tx(1, "c1", json!("a")), remote_tx(2, "c1", json!("b"))],
        },
    )
    .unwrap();
    assert_eq!(replaying.await.unwrap().unwrap(), 2);
    assert_eq!(read_kind(manager.store(), "c1"), json!("b"));
    assert!(manager.fatal_error().is_none());
}

#[tokio::test]
async fn notices_during_replay_are_buffered() {
    let Starting {
        connecting,
        peer,
        history_request,
        ..
    } = start(4).await;

    // A live broadcast overtakes the history reply.
    peer.send(&Message::transaction_broadcast(vec![remote_tx(3, "c3", json!("late"))]))
        .unwrap();
    peer.reply(
        &history_request,
        MessageBody::HistoryReply {
            checkpoint: None,
            transactions: vec![remote_tx(1, "c1", json!("a")), remote_tx(2, "c2", json!("b"))],
        },
    )
    .unwrap();

    let manager = connecting.await.unwrap().unwrap();
    assert_eq!(manager.server_serial(), 3);
    assert_eq!(read_kind(manager.store(), "c3"), json!("late"));
    assert!(manager.fatal_error().is_none());
}

#[tokio::test]
async fn notices_before_the_store_exists_wait_for_history() {
    let (connector, mut server) = MockConnector::new();
    let connecting = tokio::spawn(SyncManager::connect(config(), Arc::new(connector)));
    let mut peer = server.accept().await.unwrap();
    let request = peer.recv().await.unwrap();
    assert_eq!(request.msg_type(), "storeid-request");

    peer.send(&Message::transaction_broadcast(vec![remote_tx(1, "c1", json!("early"))]))
        .unwrap();
    peer.send(&Message::state_stable(1)).unwrap();
    peer.reply(&request, MessageBody::StoreIdReply { store_id: StoreId::new(4) })
        .unwrap();

    let history_request = peer.recv().await.unwrap();
    assert_eq!(history_request.msg_type(), "history-request");
    peer.reply(
        &history_request,
        MessageBody::HistoryReply {
            checkpoint: None,
            transactions: vec![remote_tx(1, "c1", json!("early"))],
        },
    )
    .unwrap();

    let manager = connecting.await.unwrap().unwrap();
    assert!(manager.fatal_error().is_none());
    assert_eq!(manager.server_serial(), 1);
    assert_eq!(read_kind(manager.store(), "c1"), json!("early"));
}

// ── Broadcasting & acknowledgment ────────────────────────────────

#[tokio::test]
async fn local_writes_are_broadcast_and_acknowledged() {
    let Running {
        manager,
        mut peer,
        server: _server,
        ..
    } = bring_up(5, None, vec![]).await;
    let a = write_kind(manager.store(), "c1", json!("code"));
    let b = write_kind(manager.store(), "c2", json!("md"));

    let (broadcast, transactions) = expect_broadcast(&mut peer).await;
    let ids: Vec<_> = transactions.iter().map(SerialTransaction::id).collect();
    assert_eq!(ids, vec![a.id, b.id]);
    assert_eq!(
        transactions.iter().map(|t| t.serial).collect::<Vec<_>>(),
        vec![1, 2]
    );
    assert_eq!(transactions[0].transaction.store_id, StoreId::new(5));
    assert_eq!(manager.pending_count(), 2);

    ack(&peer, &broadcast, &transactions, vec![1, 2]);
    manager.flush().await.unwrap();
    assert_eq!(manager.pending_count(), 0);
    assert_eq!(manager.server_serial(), 2);
    assert_eq!(manager.our_serial(), 2);
}

#[tokio::test]
async fn explicit_broadcast_waits_for_ack() {
    let Running {
        manager,
        mut peer,
        server: _server,
        ..
    } = bring_up(5, None, vec![]).await;
    let tx = Transaction::new(StoreId::new(5), vec![kind_patch("c9", json!(1))]);
    let sending = tokio::spawn({
        let manager = manager.clone();
        async move { manager.broadcast_transactions(vec![tx]).await }
    });
    let (broadcast, transactions) = expect_broadcast(&mut peer).await;
    assert_eq!(manager.pending_ids(), vec![transactions[0].id()]);
    ack(&peer, &broadcast, &transactions, vec![1]);
    sending.await.unwrap().unwrap();
    assert_eq!(manager.pending_count(), 0);
}

#[tokio::test]
async fn ordering_scenario_gap_after_acks_is_fatal() {
    let Running {
        manager,
        mut peer,
        server: _server,
        ..
    } = bring_up(6, Some(checkpoint_at(5)), vec![]).await;
    assert_eq!(manager.server_serial(), 5);
    let mut events = manager.subscribe();

    write_kind(manager.store(), "c1", json!("a"));
    write_kind(manager.store(), "c2", json!("b"));
    let (broadcast, transactions) = expect_broadcast(&mut peer).await;
    ack(&peer, &broadcast, &transactions, vec![6, 7]);
    manager.flush().await.unwrap();
    assert_eq!(manager.server_serial(), 7);

    peer.send(&Message::transaction_broadcast(vec![remote_tx(8, "c3", json!("ok"))]))
        .unwrap();
    let applied = next_event(&mut events, |e| matches!(e, ManagerEvent::RemoteApplied { .. })).await;
    assert_eq!(applied, ManagerEvent::RemoteApplied { serial: 8 });
    assert_eq!(read_kind(manager.store(), "c3"), json!("ok"));

    peer.send(&Message::transaction_broadcast(vec![remote_tx(10, "c4", json!("gap"))]))
        .unwrap();
    let fatal = next_event(&mut events, |e| matches!(e, ManagerEvent::Fatal { .. })).await;
    let ManagerEvent::Fatal { reason } = fatal else {
        unreachable!()
    };
    assert!(reason.contains("expected 9"), "{reason}");
    assert_eq!(manager.server_serial(), 8);
    assert_eq!(read_kind(manager.store(), "c4"), serde_json::Value::Null);

    let err = manager.broadcast_transactions(vec![]).await.unwrap_err();
    assert!(matches!(err, SyncError::Fatal(_)));
}

#[tokio::test]
async fn ack_out_of_order_is_fatal() {
    let Running {
        manager,
        mut peer,
        server: _server,
        ..
    } = bring_up(6, None, vec![]).await;
    write_kind(manager.store(), "c1", json!("a"));
    let (broadcast, transactions) = expect_broadcast(&mut peer).await;
    ack(&peer, &broadcast, &transactions, vec![2]);

    let err = manager.flush().await.unwrap_err();
    assert!(matches!(err, SyncError::Fatal(_)));
    assert!(manager.fatal_error().unwrap().contains("serial gap"));
    assert_eq!(manager.pending_count(), 1);
}

#[tokio::test]
async fn ack_for_unknown_transaction_still_advances() {
    let Running {
        manager,
        peer,
        server: _server,
        ..
    } = bring_up(6, None, vec![]).await;
    let stray = Message::transaction_broadcast(vec![]);
    peer.reply(
        &stray,
        MessageBody::TransactionAck {
            transaction_ids: vec![tessel_types::TransactionId::new()],
            serials: vec![1],
        },
    )
    .unwrap();
    let mut events = manager.subscribe();
    peer.send(&Message::transaction_broadcast(vec![remote_tx(2, "c1", json!(2))]))
        .unwrap();
    next_event(&mut events, |e| matches!(e, ManagerEvent::RemoteApplied { serial: 2 })).await;
    assert_eq!(manager.server_serial(), 2);
}

// ── Remote transactions ──────────────────────────────────────────

#[tokio::test]
async fn apply_remote_enforces_order() {
    let Running {
        manager,
        peer: _peer,
        server: _server,
        ..
    } = bring_up(2, None, vec![]).await;
    manager.apply_remote(remote_tx(1, "c1", json!("x"))).unwrap();
    assert_eq!(read_kind(manager.store(), "c1"), json!("x"));

    let err = manager.apply_remote(remote_tx(1, "c1", json!("y"))).unwrap_err();
    assert!(matches!(err, SyncError::SerialGap { expected: 2, actual: 1 }));
    assert!(manager.fatal_error().is_some());
    assert!(matches!(
        manager.apply_remote(remote_tx(2, "c1", json!("z"))),
        Err(SyncError::Fatal(_))
    ));
}

#[tokio::test]
async fn deferred_remote_transactions_settle_when_the_scope_closes() {
    let Running {
        manager,
        peer,
        server: _server,
        ..
    } = bring_up(3, None, vec![]).await;
    let mut events = manager.subscribe();
    let store = manager.store();
    let bad = SerialTransaction::new(
        Transaction::new(
            StoreId::new(99),
            vec![FieldPatch {
                schema: SchemaId::new("cells"),
                record: RecordId::new("c1"),
                field: FieldId::new("source"),
                update: FieldUpdate::text(0, "missing", ""),
            }],
        ),
        2,
    );

    store.begin_transaction();
    peer.send(&Message::transaction_broadcast(vec![remote_tx(1, "c1", json!("md")), bad]))
        .unwrap();
    while manager.server_serial() < 2 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(events.try_recv().is_err(), "nothing applied while the scope is open");
    assert_eq!(read_kind(store, "c1"), serde_json::Value::Null);

    store
        .update_field(
            &SchemaId::new("cells"),
            &RecordId::new("c2"),
            &FieldId::new("kind"),
            FieldUpdate::register(json!("code")),
        )
        .unwrap();
    assert!(store.end_transaction().unwrap().is_some());

    let applied = next_event(&mut events, |e| matches!(e, ManagerEvent::RemoteApplied { .. })).await;
    assert_eq!(applied, ManagerEvent::RemoteApplied { serial: 1 });
    let fatal = next_event(&mut events, |e| matches!(e, ManagerEvent::Fatal { .. })).await;
    let ManagerEvent::Fatal { reason } = fatal else {
        unreachable!()
    };
    assert!(reason.contains("serial 2"), "{reason}");
    assert_eq!(read_kind(store, "c1"), json!("md"));
    assert_eq!(read_kind(store, "c2"), json!("code"));
    assert!(manager.fatal_error().is_some());
}

#[tokio::test]
async fn state_stable_only_at_current_serial() {
    let Running {
        manager,
        peer,
        server: _server,
        ..
    } = bring_up(2, None, vec![remote_tx(1, "c1", json!(1))]).await;
    let stable = Arc::new(Mutex::new(Vec::new()));
    let s = stable.clone();
    let _sub = manager
        .store()
        .on_stable(move |serial| s.lock().unwrap().push(*serial));
    let mut events = manager.subscribe();

    peer.send(&Message::state_stable(0)).unwrap();
    peer.send(&Message::state_stable(1)).unwrap();
    let event = next_event(&mut events, |e| matches!(e, ManagerEvent::Stable { .. })).await;
    assert_eq!(event, ManagerEvent::Stable { serial: 1 });
    assert_eq!(*stable.lock().unwrap(), vec![1]);
}

#[tokio::test]
async fn fetch_round_trips() {
    let Running {
        manager,
        mut peer,
        server: _server,
        ..
    } = bring_up(2, None, vec![]).await;
    let wanted = remote_tx(4, "c1", json!("x"));

    let fetching = tokio::spawn({
        let manager = manager.clone();
        let id = wanted.id();
        async move { manager.fetch_transactions(vec![id]).await }
    });
    let request = peer.recv().await.unwrap();
    assert_eq!(
        request.body,
        MessageBody::TransactionRequest {
            transaction_ids: vec![wanted.id()]
        }
    );
    peer.reply(&request, MessageBody::TransactionReply { transactions: vec![wanted.clone()] })
        .unwrap();
    assert_eq!(fetching.await.unwrap().unwrap(), vec![wanted.clone()]);

    let fetching = tokio::spawn({
        let manager = manager.clone();
        async move { manager.fetch_serials(vec![4]).await }
    });
    let request = peer.recv().await.unwrap();
    assert_eq!(request.body, MessageBody::SerialRequest { serials: vec![4] });
    peer.reply(&request, MessageBody::SerialReply { transactions: vec![wanted.clone()] })
        .unwrap();
    assert_eq!(fetching.await.unwrap().unwrap(), vec![wanted]);
    // Fetching never applies.
    assert_eq!(manager.server_serial(), 0);
}

// ── Heartbeat ────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn idle_client_reports_its_serial() {
    let Running {
        manager,
        mut peer,
        server: _server,
        ..
    } = bring_up(2, None, vec![]).await;
    let mut events = manager.subscribe();
    peer.send(&Message::transaction_broadcast(vec![remote_tx(1, "c1", json!(1))]))
        .unwrap();
    next_event(&mut events, |e| matches!(e, ManagerEvent::RemoteApplied { .. })).await;

    tokio::time::sleep(Duration::from_millis(3_100)).await;
    let update = peer.recv().await.unwrap();
    assert_eq!(update.body, MessageBody::SerialUpdate { serial: 1 });

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(peer.try_recv().is_none());
}

// ── Reconnect ────────────────────────────────────────────────────

#[tokio::test]
async fn pending_transactions_are_resent_after_reconnect() {
    let Running {
        manager,
        connector,
        mut server,
        mut peer,
    } = bring_up(7, None, vec![]).await;
    let mut events = manager.subscribe();
    let a = write_kind(manager.store(), "c1", json!("a"));
    let (_lost, transactions) = expect_broadcast(&mut peer).await;
    assert_eq!(transactions[0].serial, 1);

    peer.disconnect();
    next_event(&mut events, |e| matches!(e, ManagerEvent::Disconnected)).await;

    let mut peer = server.accept().await.unwrap();
    assert!(peer.url().contains("storeId=7"));
    assert_eq!(connector.urls().len(), 2);

    let history = peer.recv().await.unwrap();
    assert_eq!(history.msg_type(), "history-request");
    peer.reply(
        &history,
        MessageBody::HistoryReply {
            checkpoint: None,
            transactions: vec![],
        },
    )
    .unwrap();

    let (resent, transactions) = expect_broadcast(&mut peer).await;
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0].id(), a.id);
    assert_eq!(transactions[0].serial, 1);
    ack(&peer, &resent, &transactions, vec![1]);

    next_event(&mut events, |e| matches!(e, ManagerEvent::Ready)).await;
    manager.flush().await.unwrap();
    assert_eq!(manager.server_serial(), 1);
}

#[tokio::test]
async fn history_after_reconnect_confirms_pending() {
    let Running {
        manager,
        mut server,
        mut peer,
        ..
    } = bring_up(7, None, vec![]).await;
    let mut events = manager.subscribe();
    write_kind(manager.store(), "c1", json!("a"));
    let (_lost, transactions) = expect_broadcast(&mut peer).await;
    peer.disconnect();

    let mut peer = server.accept().await.unwrap();
    let history = peer.recv().await.unwrap();
    let mut committed = transactions[0].clone();
    committed.serial = 1;
    peer.reply(
        &history,
        MessageBody::HistoryReply {
            checkpoint: None,
            transactions: vec![committed],
        },
    )
    .unwrap();

    next_event(&mut events, |e| matches!(e, ManagerEvent::Ready)).await;
    manager.flush().await.unwrap();
    assert_eq!(manager.pending_count(), 0);
    assert_eq!(manager.server_serial(), 1);
    assert!(peer.try_recv().is_none());
}

#[tokio::test]
async fn own_transaction_is_not_reapplied_after_a_stable_point() {
    let Running {
        manager,
        mut server,
        mut peer,
        ..
    } = bring_up(7, None, vec![]).await;
    let mut events = manager.subscribe();
    let store = manager.store();
    store
        .transact(|| {
            store.update_field(
                &SchemaId::new("cells"),
                &RecordId::new("c1"),
                &FieldId::new("source"),
                FieldUpdate::text(0, "", "x"),
            )
        })
        .unwrap();
    let (_unacked, transactions) = expect_broadcast(&mut peer).await;

    // The server reports a stable point before sequencing our write.
    peer.send(&Message::state_stable(0)).unwrap();
    next_event(&mut events, |e| matches!(e, ManagerEvent::Stable { serial: 0 })).await;
    peer.disconnect();

    let mut peer = server.accept().await.unwrap();
    let history = peer.recv().await.unwrap();
    let mut committed = transactions[0].clone();
    committed.serial = 1;
    peer.reply(
        &history,
        MessageBody::HistoryReply {
            checkpoint: None,
            transactions: vec![committed],
        },
    )
    .unwrap();

    next_event(&mut events, |e| matches!(e, ManagerEvent::Ready)).await;
    manager.flush().await.unwrap();
    assert_eq!(read_source(store, "c1"), "x");
    assert_eq!(manager.pending_count(), 0);
    assert_eq!(manager.server_serial(), 1);
}

#[tokio::test]
async fn close_stops_reconnecting() {
    let Running {
        manager,
        connector,
        mut peer,
        server: _server,
    } = bring_up(7, None, vec![]).await;
    manager.close();
    assert!(peer.recv().await.is_none());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(connector.urls().len(), 1);
}
