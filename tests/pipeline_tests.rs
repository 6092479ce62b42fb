//! Integration tests for the store-and-forward pipeline.
//!
//! Values travel from the write buffer through the history syncer into an
//! on-disk database and are delivered by the proxy data sender to a scripted
//! server. The database is reopened between runs to check that delivery
//! resumes from the persisted checkpoint.

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use herakles_proxy::comms::{Connector, ServerComms};
use herakles_proxy::configcache::ConfigCache;
use herakles_proxy::control::RunFlag;
use herakles_proxy::history::{HistoryValue, Timespec, Value};
use herakles_proxy::protocol::{self, MAX_MESSAGE_SIZE};
use herakles_proxy::sender::{ProxyDataSender, SenderSettings};
use herakles_proxy::stats::PipelineStats;
use herakles_proxy::store::{Store, Stream};
use herakles_proxy::syncer::HistorySyncer;
use herakles_proxy::valuecache::ValueCache;
use herakles_proxy::writebuffer::WriteBuffer;
use tokio::io::DuplexStream;

const OK: Option<&str> = Some(r#"{"response":"success","version":"4.2.0"}"#);

/// Answers one connection per scripted reply; `None` refuses the connection.
struct ScriptedServer {
    script: Mutex<VecDeque<Option<String>>>,
    received: Arc<Mutex<Vec<serde_json::Value>>>,
}

impl ScriptedServer {
    fn new(replies: &[Option<&str>]) -> Self {
        Self {
            script: Mutex::new(replies.iter().map(|r| r.map(str::to_string)).collect()),
            received: Arc::default(),
        }
    }
}

impl Connector for ScriptedServer {
    type Stream = DuplexStream;

    fn connect(&self, _timeout: Duration) -> impl Future<Output = io::Result<DuplexStream>> + Send {
        let reply = self.script.lock().unwrap().pop_front().flatten();
        let received = self.received.clone();
        async move {
            let Some(reply) = reply else {
                return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
            };
            let (client, mut server) = tokio::io::duplex(1 << 20);
            tokio::spawn(async move {
                if let Ok(frame) = protocol::read_frame(&mut server, MAX_MESSAGE_SIZE).await {
                    if let Ok(doc) = serde_json::from_slice(&frame) {
                        received.lock().unwrap().push(doc);
                    }
                    let _ = protocol::write_frame(&mut server, reply.as_bytes()).await;
                }
            });
            Ok(client)
        }
    }

    fn peer(&self) -> String {
        "scripted".to_string()
    }
}

fn sender(store: Arc<Store>, server: ScriptedServer, max_records: usize) -> ProxyDataSender<ScriptedServer> {
    let comms = Arc::new(ServerComms::new(server, Duration::from_secs(5), RunFlag::new()));
    ProxyDataSender::new(
        store,
        comms,
        Arc::new(PipelineStats::default()),
        SenderSettings {
            host: "proxy-1".into(),
            max_records,
            max_bytes: 1 << 20,
            frequency: Duration::from_secs(1),
            task_frequency: Duration::from_secs(3600),
            retry_interval: Duration::ZERO,
        },
    )
}

fn history_ids(docs: &[serde_json::Value]) -> Vec<i64> {
    docs.iter()
        .filter_map(|d| d["history data"].as_array())
        .flatten()
        .filter_map(|r| r["id"].as_i64())
        .collect()
}

/// Syncs `values` into the database behind `store`.
fn sync_values(store: &Arc<Store>, values: Vec<HistoryValue>) -> ValueCache {
    let buffer = WriteBuffer::create(1 << 20);
    for value in values {
        buffer.add(value).unwrap();
    }
    let cache = ValueCache::create(1 << 20, 1 << 20, 100, store.clone());
    let mut syncer = HistorySyncer::new(
        buffer.clone(),
        store.clone(),
        cache.clone(),
        Arc::new(ConfigCache::new()),
        Arc::new(PipelineStats::default()),
        100,
    );
    let outcome = syncer.sync_pass(5000).unwrap();
    assert!(!outcome.more_pending);
    assert!(buffer.is_empty());
    cache
}

fn values(itemid: u64, clocks: std::ops::Range<i64>) -> Vec<HistoryValue> {
    clocks
        .map(|c| HistoryValue::new(itemid, Timespec::new(c, 0), Value::Uint(c as u64)))
        .collect()
}

#[tokio::test]
async fn test_delivery_resumes_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("proxy.db");

    let first_session = {
        let store = Arc::new(Store::open(&path).unwrap());
        let cache = sync_values(&store, values(1, 1000..1005));
        assert!(cache.contains(1));

        let server = ScriptedServer::new(&[OK]);
        let received = server.received.clone();
        let mut sender = sender(store.clone(), server, 3);
        let outcome = sender.cycle(5000).await.unwrap();
        assert!(outcome.more);
        assert_eq!(store.checkpoint(Stream::History).unwrap(), 3);
        assert_eq!(history_ids(&received.lock().unwrap()), vec![1, 2, 3]);
        sender.session().to_string()
    };

    // Second process lifetime: the checkpoint survives, the session does not.
    let store = Arc::new(Store::open(&path).unwrap());
    assert_eq!(store.checkpoint(Stream::History).unwrap(), 3);
    assert_eq!(store.row_count(Stream::History).unwrap(), 5);

    let server = ScriptedServer::new(&[None, OK]);
    let received = server.received.clone();
    let mut sender = sender(store.clone(), server, 3);
    assert_ne!(sender.session(), first_session);

    assert!(sender.cycle(5000).await.is_err());
    assert_eq!(store.checkpoint(Stream::History).unwrap(), 3);

    let outcome = sender.cycle(5000).await.unwrap();
    assert!(!outcome.more);
    assert_eq!(outcome.records, 2);
    assert_eq!(store.checkpoint(Stream::History).unwrap(), 5);
    assert_eq!(history_ids(&received.lock().unwrap()), vec![4, 5]);
}

#[tokio::test]
async fn test_unacknowledged_rows_are_sent_again() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("proxy.db");

    {
        let store = Arc::new(Store::open(&path).unwrap());
        sync_values(&store, values(7, 2000..2004));
        let nak = Some(r#"{"response":"failed","info":"busy"}"#);
        let mut sender = sender(store.clone(), ScriptedServer::new(&[nak]), 100);
        assert!(sender.cycle(5000).await.is_err());
        assert!(sender.upload_failed());
        assert_eq!(store.checkpoint(Stream::History).unwrap(), 0);
    }

    let store = Arc::new(Store::open(&path).unwrap());
    let server = ScriptedServer::new(&[OK]);
    let received = server.received.clone();
    let mut sender = sender(store.clone(), server, 100);
    sender.cycle(5000).await.unwrap();

    let docs = received.lock().unwrap();
    assert_eq!(history_ids(&docs), vec![1, 2, 3, 4]);
    assert_eq!(docs[0]["history data"][0]["itemid"], 7);
    assert_eq!(docs[0]["history data"][0]["clock"], 2000);
    assert_eq!(store.checkpoint(Stream::History).unwrap(), 4);
}

#[tokio::test]
async fn test_checkpoint_never_passes_stored_rows() {
    let store = Arc::new(Store::open_in_memory().unwrap());
    sync_values(&store, values(1, 1000..1010));
    let server = ScriptedServer::new(&[OK, OK, OK, OK]);
    let mut sender = sender(store.clone(), server, 4);

    let mut previous = 0;
    loop {
        let outcome = sender.cycle(5000).await.unwrap();
        let lastid = store.checkpoint(Stream::History).unwrap();
        assert!(lastid >= previous);
        assert!(lastid <= store.max_id(Stream::History).unwrap());
        previous = lastid;
        if !outcome.more {
            break;
        }
    }
    assert_eq!(previous, 10);

    // Nothing new: the next cycle sends nothing and keeps the checkpoint.
    let idle = sender.cycle(5000).await.unwrap();
    assert!(!idle.sent);
    assert_eq!(store.checkpoint(Stream::History).unwrap(), 10);
}

#[tokio::test]
async fn test_acknowledged_but_uncommitted_rows_are_sent_twice() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("proxy.db");

    // The server accepts the envelope but the process stops before the
    // checkpoint is written.
    let delivered = {
        let store = Arc::new(Store::open(&path).unwrap());
        sync_values(&store, values(3, 3000..3003));
        let delta = sender(store.clone(), ScriptedServer::new(&[]), 100)
            .collect_delta()
            .unwrap();
        let server = ScriptedServer::new(&[OK]);
        let received = server.received.clone();
        let comms = ServerComms::new(server, Duration::from_secs(5), RunFlag::new());
        comms
            .exchange(&delta.envelope.to_json().unwrap(), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(store.checkpoint(Stream::History).unwrap(), 0);
        let ids = history_ids(&received.lock().unwrap());
        ids
    };
    assert_eq!(delivered, vec![1, 2, 3]);

    let store = Arc::new(Store::open(&path).unwrap());
    let server = ScriptedServer::new(&[OK]);
    let received = server.received.clone();
    let mut sender = sender(store.clone(), server, 100);
    sender.cycle(5000).await.unwrap();

    assert_eq!(history_ids(&received.lock().unwrap()), delivered);
    assert_eq!(store.checkpoint(Stream::History).unwrap(), 3);
}
