use docbus::reply::Status;
use serde_json::json;
use std::time::Duration;

#[path = "common/server.rs"]
mod server;
use server::TestServer;

async fn seed(client: &mut docbus::client::BusClient, n: i64) {
    for i in 1..=n {
        let r = client
            .send(&json!({"action": "save", "collection": "c", "document": {"_id": i, "name": format!("d{}", i)}}))
            .await
            .unwrap();
        assert_eq!(r.status(), Some(Status::Ok));
    }
}

#[tokio::test]
async fn e2e_find_streams_one_document_per_batch() {
    let srv = TestServer::start().await;
    let mut client = srv.client().await;
    seed(&mut client, 3).await;

    let first = client
        .send(&json!({"action": "find", "collection": "c", "matcher": {}, "batch_size": 1}))
        .await
        .unwrap();
    assert_eq!(first.body, json!({"status": "more-exist", "results": [{"_id": 1, "name": "d1"}], "number": 1}));

    let second = client.continue_stream(&first).await.unwrap();
    assert_eq!(second.body, json!({"status": "more-exist", "results": [{"_id": 2, "name": "d2"}], "number": 1}));

    let third = client.continue_stream(&second).await.unwrap();
    assert_eq!(third.body, json!({"status": "ok", "results": [{"_id": 3, "name": "d3"}], "number": 1}));
    assert_eq!(srv.backend.open_cursors(), 0);

    srv.stop().await;
}

#[tokio::test]
async fn e2e_find_all_follows_continuations() {
    let srv = TestServer::start().await;
    let mut client = srv.client().await;
    seed(&mut client, 25).await;

    let docs = client
        .find_all(&json!({"action": "find", "collection": "c", "batch_size": 4, "sort": {"_id": -1}, "skip": 2, "limit": 20}))
        .await
        .unwrap();
    let ids: Vec<i64> = docs.iter().map(|d| d["_id"].as_i64().unwrap()).collect();
    assert_eq!(ids, (4..=23).rev().collect::<Vec<_>>());
    assert_eq!(srv.backend.open_cursors(), 0);

    srv.stop().await;
}

#[tokio::test]
async fn e2e_timed_out_session_ignores_late_continuation() {
    let srv = TestServer::start().await;
    let mut client = srv.client().await;
    seed(&mut client, 3).await;

    let first = client
        .send(&json!({"action": "find", "collection": "c", "batch_size": 1, "timeout": 100}))
        .await
        .unwrap();
    assert_eq!(first.status(), Some(Status::MoreExist));
    assert_eq!(srv.backend.open_cursors(), 1);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(srv.backend.open_cursors(), 0);

    let late = tokio::time::timeout(Duration::from_millis(300), client.continue_stream(&first)).await;
    assert!(late.is_err(), "a reclaimed session must not answer");

    let mut fresh = srv.client().await;
    let count = fresh.send(&json!({"action": "count", "collection": "c"})).await.unwrap();
    assert_eq!(count.get("count"), Some(&json!(3)));

    srv.stop().await;
}

#[tokio::test]
async fn e2e_sessions_on_one_connection_are_independent() {
    let srv = TestServer::start().await;
    let mut client = srv.client().await;
    seed(&mut client, 4).await;

    let a = client.send(&json!({"action": "find", "collection": "c", "batch_size": 2, "sort": {"_id": 1}})).await.unwrap();
    let b = client.send(&json!({"action": "find", "collection": "c", "batch_size": 3, "sort": {"_id": -1}})).await.unwrap();
    assert_eq!(srv.backend.open_cursors(), 2);

    // Unrelated traffic interleaves with parked sessions.
    let n = client.send(&json!({"action": "count", "collection": "c"})).await.unwrap();
    assert_eq!(n.get("count"), Some(&json!(4)));

    let b2 = client.continue_stream(&b).await.unwrap();
    assert_eq!(b2.body["results"], json!([{"_id": 1, "name": "d1"}]));
    let a2 = client.continue_stream(&a).await.unwrap();
    assert_eq!(a2.body["results"], json!([{"_id": 3, "name": "d3"}, {"_id": 4, "name": "d4"}]));
    assert_eq!(srv.backend.open_cursors(), 0);

    srv.stop().await;
}

#[tokio::test]
async fn e2e_shutdown_reclaims_open_sessions() {
    let srv = TestServer::start().await;
    let mut client = srv.client().await;
    seed(&mut client, 3).await;

    let first = client.send(&json!({"action": "find", "collection": "c", "batch_size": 1})).await.unwrap();
    assert_eq!(first.status(), Some(Status::MoreExist));
    let backend = srv.backend.clone();
    srv.stop().await;
    assert_eq!(backend.open_cursors(), 0);
}
