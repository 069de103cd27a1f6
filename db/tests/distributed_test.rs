mod common;

use std::collections::HashMap;
use std::sync::Arc;

use basalt_db::error::ErrorKind;
use basalt_db::replication::{ReplicationAckPacket, PHASE_COMMIT, PHASE_PREPARE};
use basalt_db::session::{SessionStatus, User};
use basalt_engine::{LogRecord, Value};

use common::{open_database, open_database_with_peers, open_database_with_transport};

#[tokio::test(flavor = "multi_thread")]
async fn distributed_commit_commits_on_all_participants() {
    let (peer_db, _) = open_database("node_b");
    let peer_admin = peer_db.create_session(User::new("sa")).unwrap();
    peer_admin
        .execute_update_async("CREATE TABLE t(f1 INT, f2 BIGINT)")
        .await
        .unwrap();

    let mut nodes = HashMap::new();
    nodes.insert("nodeb:9210".to_string(), peer_db.clone());
    let (root_db, _) = open_database_with_peers("node_a", nodes);

    let root = root_db.create_session(User::new("sa")).unwrap();
    root.execute_update_async("CREATE TABLE t(f1 INT, f2 BIGINT)")
        .await
        .unwrap();

    root.begin();
    root.execute_update_async("INSERT INTO t(f1,f2) VALUES(1,1)")
        .await
        .unwrap();

    let remote = root.join_nested_session("nodeb:9210").await.unwrap();
    let count = remote
        .execute_update("INSERT INTO t(f1,f2) VALUES(2,2)")
        .await
        .unwrap();
    assert_eq!(count, 1);

    // Joining the same peer again reuses the session and keeps exactly one
    // participant entry.
    let again = root.join_nested_session("nodeb:9210").await.unwrap();
    assert_eq!(remote.url(), again.url());
    assert_eq!(root.nested_session_count(), 1);
    assert_eq!(
        root.with_transaction(|tx| tx.participant_urls()),
        vec!["nodeb:9210".to_string()]
    );

    root.commit().await.unwrap();
    assert_eq!(root.status(), SessionStatus::TransactionNotStart);

    let rows = root.execute_query_async("SELECT f1,f2 FROM t").await.unwrap();
    assert_eq!(rows, vec![vec![Value::Int(1), Value::Int(1)]]);
    let rows = peer_admin
        .execute_query_async("SELECT f1,f2 FROM t")
        .await
        .unwrap();
    assert_eq!(rows, vec![vec![Value::Int(2), Value::Int(2)]]);

    // Both redo logs carry the same global name: ready then decision.
    let root_log = root_db.engine().log_records();
    assert!(root_log.iter().any(|r| matches!(
        r,
        LogRecord::CommitReady { global: g, .. } if g.starts_with("node_a:") && g.contains("nodeb:9210")
    )));
    assert!(root_log
        .iter()
        .any(|r| matches!(r, LogRecord::CommitDecision { .. })));
    let peer_log = peer_db.engine().log_records();
    assert!(peer_log
        .iter()
        .any(|r| matches!(r, LogRecord::CommitReady { global: g, .. } if g.contains("nodeb:9210"))));
    assert!(peer_log
        .iter()
        .any(|r| matches!(r, LogRecord::CommitDecision { .. })));

    // Post-commit, the nested session went back to the pool.
    assert_eq!(root.nested_session_count(), 0);
    assert_eq!(root_db.session_pool().idle_count("nodeb:9210"), 1);

    root.close().await;
    root_db.close().await;
    peer_admin.close().await;
    peer_db.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_prepare_rolls_back_everyone() {
    let (db, _) = open_database_with_transport(
        "node_a",
        Arc::new(common::FailingPrepareTransport),
    );
    let root = db.create_session(User::new("sa")).unwrap();
    root.execute_update_async("CREATE TABLE t(f1 INT)")
        .await
        .unwrap();

    root.begin();
    root.execute_update_async("INSERT INTO t(f1) VALUES(1)")
        .await
        .unwrap();
    root.join_nested_session("nodeb:9210").await.unwrap();

    let err = root.commit().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::General);
    assert_eq!(root.status(), SessionStatus::TransactionNotStart);

    // Nothing stuck locally: the local part rolled back with the peers.
    let rows = root.execute_query_async("SELECT f1 FROM t").await.unwrap();
    assert!(rows.is_empty(), "local insert must not survive");
    assert!(db
        .engine()
        .log_records()
        .iter()
        .any(|r| matches!(r, LogRecord::Rollback { .. })));

    root.close().await;
    db.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn participant_phases_emit_prepared_acks() {
    let (db, _) = open_database("node_b_acks");
    let admin = db.create_session(User::new("sa")).unwrap();
    admin
        .execute_update_async("CREATE TABLE t(f1 INT)")
        .await
        .unwrap();

    let participant = db.create_session(User::new("sa")).unwrap();
    participant.set_root(false);
    participant.set_auto_commit(false);
    participant
        .execute_update_async("INSERT INTO t(f1) VALUES(1)")
        .await
        .unwrap();

    let ready = participant
        .prepare_commit("node_a:7,nodeb:9210")
        .await
        .unwrap();
    assert!(matches!(
        ready,
        ReplicationAckPacket::DtPreparedUpdate {
            phase: PHASE_PREPARE,
            ..
        }
    ));
    assert!(!ready.ack().final_result);
    assert_eq!(participant.status(), SessionStatus::TransactionCommitting);

    let done = participant
        .commit_participant("node_a:7,nodeb:9210")
        .await
        .unwrap();
    assert!(matches!(
        done,
        ReplicationAckPacket::DtPreparedUpdate {
            phase: PHASE_COMMIT,
            ..
        }
    ));
    assert!(done.ack().final_result);
    assert_eq!(participant.status(), SessionStatus::TransactionNotStart);

    let rows = admin.execute_query_async("SELECT f1 FROM t").await.unwrap();
    assert_eq!(rows, vec![vec![Value::Int(1)]]);

    participant.close().await;
    admin.close().await;
    db.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn non_root_sessions_cannot_open_nested_sessions() {
    let (db, _) = open_database("node_a");
    let session = db.create_session(User::new("sa")).unwrap();
    session.set_root(false);

    let err = session.join_nested_session("nodeb:9210").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::General);

    session.close().await;
    db.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn closing_the_root_returns_nested_sessions_to_the_pool() {
    let (peer_db, _) = open_database("node_b");
    let mut nodes = HashMap::new();
    nodes.insert("nodeb:9210".to_string(), peer_db.clone());
    let (root_db, _) = open_database_with_peers("node_a", nodes);

    let root = root_db.create_session(User::new("sa")).unwrap();
    let remote = root.join_nested_session("nodeb:9210").await.unwrap();
    assert!(remote.parent().is_some());

    root.close().await;
    assert!(remote.parent().is_none(), "parent link severed on close");
    assert_eq!(root_db.session_pool().idle_count("nodeb:9210"), 1);

    root_db.close().await;
    peer_db.close().await;
}
