use async_trait::async_trait;
use bson::{Document, doc};
use docbus::backend::memory::MemoryBackend;
use docbus::backend::{Backend, Cursor, FindAndModifySpec, FindSpec, WriteOutcome};
use docbus::error::{Error, Result};
use docbus::protocol::{HEADER_LEN, MessageHeader, OP_REPLY, encode_send, read_frame};
use docbus::reply::Status;
use docbus::router::Persistor;
use docbus::server::serve_connection;
use docbus::stream::Outcome;
use docbus::write_concern::{WriteConcern, WriteConcernResolver};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::JoinHandle;

const ADDRESS: &str = "docbus.persistor";
const MAX: usize = 1 << 20;

async fn seeded(n: i32) -> Arc<MemoryBackend> {
    let mem = Arc::new(MemoryBackend::new("test"));
    for i in 0..n {
        mem.save("c", doc! { "_id": i, "v": i * 10 }, WriteConcern::Acknowledged).await.unwrap();
    }
    mem
}

fn persistor(mem: &Arc<MemoryBackend>) -> Arc<Persistor> {
    Arc::new(Persistor::new(mem.clone(), ADDRESS, WriteConcernResolver::default()))
}

#[tokio::test]
async fn every_batch_size_yields_each_document_exactly_once() {
    let n = 10;
    for batch in [1usize, 2, 3, 4, 9, 10, 11, 100] {
        let mem = seeded(n).await;
        let p = persistor(&mem);
        let mut outcome = p
            .handle(&json!({"action": "find", "collection": "c", "sort": {"_id": 1}, "batch_size": batch}))
            .await;
        let mut seen = Vec::new();
        let mut replies = 0;
        loop {
            replies += 1;
            let results = outcome.reply().get("results").and_then(Value::as_array).unwrap().clone();
            assert!(results.len() <= batch);
            assert_eq!(outcome.reply().get("number"), Some(&json!(results.len())));
            seen.extend(results.into_iter().map(|d| d["_id"].as_i64().unwrap()));
            match outcome {
                Outcome::MoreExist(reply, session) => {
                    assert_eq!(reply.status(), Some(Status::MoreExist));
                    outcome = p.resume(session).await;
                }
                Outcome::Done(reply) => {
                    assert_eq!(reply.status(), Some(Status::Ok));
                    break;
                }
            }
        }
        assert_eq!(seen, (0..n as i64).collect::<Vec<_>>(), "batch size {}", batch);
        assert_eq!(replies, (n as usize).div_ceil(batch), "batch size {}", batch);
        assert_eq!(mem.open_cursors(), 0);
    }
}

struct Conn {
    rd: ReadHalf<DuplexStream>,
    wr: WriteHalf<DuplexStream>,
    next_id: i32,
}

impl Conn {
    fn open(p: Arc<Persistor>) -> (Self, watch::Sender<bool>, JoinHandle<Result<()>>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(serve_connection(p, server, MAX, rx));
        let (rd, wr) = tokio::io::split(client);
        (Self { rd, wr, next_id: 1 }, tx, task)
    }

    async fn send(&mut self, payload: Value, response_to: i32) -> i32 {
        let id = self.next_id;
        self.next_id += 1;
        let bytes = encode_send(ADDRESS, &payload, id, response_to).unwrap();
        self.wr.write_all(&bytes).await.unwrap();
        id
    }

    async fn reply(&mut self) -> (MessageHeader, Value) {
        let frame = read_frame(&mut self.rd, MAX).await.unwrap().expect("reply");
        assert_eq!(frame.header.op_code, OP_REPLY);
        (frame.header, serde_json::from_slice(&frame.body).unwrap())
    }
}

#[tokio::test(start_paused = true)]
async fn continuation_within_the_window_resumes_the_cursor() {
    let mem = seeded(3).await;
    let (mut conn, _tx, _task) = Conn::open(persistor(&mem));

    let id = conn.send(json!({"action": "find", "collection": "c", "batch_size": 2, "timeout": 5000}), 0).await;
    let (hdr, body) = conn.reply().await;
    assert_eq!(hdr.response_to, id);
    assert_eq!(body["status"], "more-exist");

    tokio::time::sleep(Duration::from_millis(4000)).await;
    let cont = conn.send(json!({}), hdr.request_id).await;
    let (hdr2, body) = conn.reply().await;
    assert_eq!(hdr2.response_to, cont);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["number"], 1);
    assert_eq!(mem.open_cursors(), 0);
}

#[tokio::test(start_paused = true)]
async fn unanswered_session_is_reclaimed_after_its_timeout() {
    let mem = seeded(5).await;
    let (mut conn, _tx, _task) = Conn::open(persistor(&mem));

    conn.send(json!({"action": "find", "collection": "c", "batch_size": 2, "timeout": 5000}), 0).await;
    let (hdr, body) = conn.reply().await;
    assert_eq!(body["status"], "more-exist");
    assert_eq!(mem.open_cursors(), 1);

    tokio::time::sleep(Duration::from_millis(4000)).await;
    assert_eq!(mem.open_cursors(), 1);
    tokio::time::sleep(Duration::from_millis(2000)).await;
    assert_eq!(mem.open_cursors(), 0);

    // A late continuation has no effect and gets no reply.
    conn.send(json!({}), hdr.request_id).await;
    let late = tokio::time::timeout(Duration::from_secs(1), read_frame(&mut conn.rd, MAX)).await;
    assert!(late.is_err());

    // The connection still serves new requests.
    conn.send(json!({"action": "count", "collection": "c"}), 0).await;
    let (_, body) = conn.reply().await;
    assert_eq!(body, json!({"status": "ok", "count": 5}));
}

#[tokio::test(start_paused = true)]
async fn timeout_defaults_to_ten_seconds() {
    let mem = seeded(3).await;
    let (mut conn, _tx, _task) = Conn::open(persistor(&mem));

    conn.send(json!({"action": "find", "collection": "c", "batch_size": 1}), 0).await;
    conn.reply().await;
    tokio::time::sleep(Duration::from_millis(9500)).await;
    assert_eq!(mem.open_cursors(), 1);
    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(mem.open_cursors(), 0);
}

#[tokio::test]
async fn closing_the_connection_reclaims_its_sessions() {
    let mem = seeded(5).await;
    let (mut conn, _tx, task) = Conn::open(persistor(&mem));

    conn.send(json!({"action": "find", "collection": "c", "batch_size": 1}), 0).await;
    conn.reply().await;
    conn.send(json!({"action": "find", "collection": "c", "batch_size": 2}), 0).await;
    conn.reply().await;
    assert_eq!(mem.open_cursors(), 2);

    drop(conn);
    task.await.unwrap().unwrap();
    assert_eq!(mem.open_cursors(), 0);
}

#[tokio::test]
async fn shutdown_reclaims_sessions() {
    let mem = seeded(5).await;
    let (mut conn, tx, task) = Conn::open(persistor(&mem));

    conn.send(json!({"action": "find", "collection": "c", "batch_size": 1}), 0).await;
    conn.reply().await;
    assert_eq!(mem.open_cursors(), 1);

    tx.send(true).unwrap();
    task.await.unwrap().unwrap();
    assert_eq!(mem.open_cursors(), 0);
}

#[tokio::test]
async fn oversized_frames_close_the_connection() {
    let mem = seeded(0).await;
    let (mut conn, _tx, task) = Conn::open(persistor(&mem));

    let mut header = Vec::with_capacity(HEADER_LEN);
    for field in [(MAX as i32) + 1, 1, 0, docbus::protocol::OP_SEND] {
        header.extend_from_slice(&field.to_le_bytes());
    }
    conn.wr.write_all(&header).await.unwrap();
    assert!(task.await.unwrap().is_err());
}

/// Memory engine whose open cursors each hold one of a fixed number of
/// connection slots, the way pooled database cursors do. `count` needs a
/// slot too and takes `count_delay` once it has one.
struct SlotBackend {
    inner: MemoryBackend,
    slots: Arc<Semaphore>,
    count_delay: Duration,
}

impl SlotBackend {
    async fn new(slots: usize, count_delay: Duration, docs: i32) -> Arc<Self> {
        let inner = MemoryBackend::new("test");
        for i in 0..docs {
            inner.save("c", doc! { "_id": i }, WriteConcern::Acknowledged).await.unwrap();
        }
        Arc::new(Self { inner, slots: Arc::new(Semaphore::new(slots)), count_delay })
    }

    async fn slot(&self) -> Result<OwnedSemaphorePermit> {
        self.slots.clone().acquire_owned().await.map_err(|e| Error::Backend(e.to_string()))
    }
}

struct SlotCursor {
    inner: Box<dyn Cursor>,
    _slot: Option<OwnedSemaphorePermit>,
}

#[async_trait]
impl Cursor for SlotCursor {
    async fn has_next(&mut self) -> Result<bool> {
        self.inner.has_next().await
    }

    async fn next(&mut self) -> Result<Option<Document>> {
        self.inner.next().await
    }

    async fn close(&mut self) -> Result<()> {
        self._slot = None;
        self.inner.close().await
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

#[async_trait]
impl Backend for SlotBackend {
    async fn save(&self, coll: &str, doc: Document, wc: WriteConcern) -> Result<WriteOutcome> {
        self.inner.save(coll, doc, wc).await
    }

    async fn update(&self, coll: &str, criteria: &Document, obj_new: &Document, upsert: bool, multi: bool, wc: WriteConcern) -> Result<WriteOutcome> {
        self.inner.update(coll, criteria, obj_new, upsert, multi, wc).await
    }

    async fn delete(&self, coll: &str, matcher: &Document, wc: WriteConcern) -> Result<WriteOutcome> {
        self.inner.delete(coll, matcher, wc).await
    }

    async fn find(&self, coll: &str, spec: &FindSpec) -> Result<Box<dyn Cursor>> {
        let slot = self.slot().await?;
        let inner = self.inner.find(coll, spec).await?;
        Ok(Box::new(SlotCursor { inner, _slot: Some(slot) }))
    }

    async fn find_one(&self, coll: &str, matcher: Option<&Document>, keys: Option<&Document>) -> Result<Option<Document>> {
        self.inner.find_one(coll, matcher, keys).await
    }

    async fn find_and_modify(&self, coll: &str, spec: &FindAndModifySpec) -> Result<Option<Document>> {
        self.inner.find_and_modify(coll, spec).await
    }

    async fn count(&self, coll: &str, matcher: Option<&Document>) -> Result<u64> {
        let _slot = self.slot().await?;
        tokio::time::sleep(self.count_delay).await;
        self.inner.count(coll, matcher).await
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        self.inner.list_collections().await
    }

    async fn drop_collection(&self, coll: &str) -> Result<()> {
        self.inner.drop_collection(coll).await
    }

    async fn collection_stats(&self, coll: &str) -> Result<Document> {
        self.inner.collection_stats(coll).await
    }

    fn default_write_concern(&self) -> WriteConcern {
        self.inner.default_write_concern()
    }

    fn db_name(&self) -> &str {
        self.inner.db_name()
    }

    async fn close(&self) {
        self.inner.close().await
    }
}

fn slot_persistor(b: &Arc<SlotBackend>) -> Arc<Persistor> {
    Arc::new(Persistor::new(b.clone(), ADDRESS, WriteConcernResolver::default()))
}

#[tokio::test(start_paused = true)]
async fn request_waiting_on_a_parked_cursor_still_lets_it_expire() {
    let backend = SlotBackend::new(1, Duration::ZERO, 3).await;
    let (mut conn, _tx, _task) = Conn::open(slot_persistor(&backend));

    conn.send(json!({"action": "find", "collection": "c", "batch_size": 1, "timeout": 100}), 0).await;
    let (first, body) = conn.reply().await;
    assert_eq!(body["status"], "more-exist");
    assert_eq!(backend.slots.available_permits(), 0);

    // count needs the slot the parked cursor holds; expiry must free it.
    conn.send(json!({"action": "count", "collection": "c"}), 0).await;
    let reply = tokio::time::timeout(Duration::from_secs(60), conn.reply()).await;
    let (_, body) = reply.expect("count answered once the session expired");
    assert_eq!(body, json!({"status": "ok", "count": 3}));
    assert_eq!(backend.slots.available_permits(), 1);
    assert_eq!(backend.inner.open_cursors(), 0);

    conn.send(json!({}), first.request_id).await;
    let late = tokio::time::timeout(Duration::from_secs(1), read_frame(&mut conn.rd, MAX)).await;
    assert!(late.is_err());
}

#[tokio::test(start_paused = true)]
async fn continuation_queued_behind_a_slow_request_after_expiry_is_ignored() {
    let backend = SlotBackend::new(4, Duration::from_secs(5), 3).await;
    let (mut conn, _tx, _task) = Conn::open(slot_persistor(&backend));

    conn.send(json!({"action": "find", "collection": "c", "batch_size": 1, "timeout": 1000}), 0).await;
    let (first, body) = conn.reply().await;
    assert_eq!(body["status"], "more-exist");

    conn.send(json!({"action": "count", "collection": "c"}), 0).await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    // Sent after the timeout, while the connection is still busy with count.
    conn.send(json!({}), first.request_id).await;

    let (_, body) = conn.reply().await;
    assert_eq!(body, json!({"status": "ok", "count": 3}));
    let late = tokio::time::timeout(Duration::from_secs(2), read_frame(&mut conn.rd, MAX)).await;
    assert!(late.is_err(), "expired session answered a continuation");
    assert_eq!(backend.inner.open_cursors(), 0);
}
