//! Proxy data sender and heartbeat.
//!
//! One cycle collects a bounded delta of every stream past its checkpoint,
//! sends it as a single envelope and, only after the server acknowledged it,
//! advances the checkpoints in one transaction.

use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::comms::{Connector, ServerComms};
use crate::control::RunFlag;
use crate::error::Result;
use crate::history::Timespec;
use crate::protocol::{HeartbeatRequest, ProxyDataEnvelope, TaskRecord};
use crate::stats::PipelineStats;
use crate::store::{Store, Stream};

/// Pause after a failed cycle before trying again.
const FAILED_CYCLE_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderState {
    Idle,
    Collecting,
    Sending,
    Acked,
    CheckpointAdvance,
}

#[derive(Debug, Clone)]
pub struct SenderSettings {
    pub host: String,
    pub max_records: usize,
    pub max_bytes: usize,
    pub frequency: Duration,
    pub task_frequency: Duration,
    pub retry_interval: Duration,
}

/// An envelope together with what acknowledging it commits.
#[derive(Debug, Clone)]
pub struct CollectedDelta {
    pub envelope: ProxyDataEnvelope,
    /// Highest id included per stream; streams without rows are absent.
    pub checkpoints: Vec<(Stream, i64)>,
    pub taskids: Vec<i64>,
    /// Host the next envelope's availability starts after; 0 restarts.
    pub availability_next: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleOutcome {
    pub sent: bool,
    pub records: usize,
    pub more: bool,
}

/// Shared byte budget of one envelope.
struct Budget {
    remaining: usize,
    records: usize,
}

impl Budget {
    /// Takes records in order while they fit. The first record of an
    /// envelope is always taken so an oversized row cannot stall a stream.
    /// Returns the taken records and whether any were left behind.
    fn fill<T: Serialize>(&mut self, rows: Vec<T>, max_records: usize) -> (Vec<T>, bool) {
        let mut more = rows.len() > max_records;
        let mut taken = Vec::with_capacity(rows.len().min(max_records));
        for row in rows.into_iter().take(max_records) {
            let size = serde_json::to_vec(&row).map(|v| v.len() + 1).unwrap_or(0);
            if size > self.remaining && self.records > 0 {
                more = true;
                break;
            }
            self.remaining = self.remaining.saturating_sub(size);
            self.records += 1;
            taken.push(row);
        }
        (taken, more)
    }
}

/// Random 32 character lowercase hex token.
pub fn new_session_token() -> String {
    let mut rng = rand::thread_rng();
    (0..16).map(|_| format!("{:02x}", rng.gen::<u8>())).collect()
}

pub struct ProxyDataSender<C: Connector> {
    store: Arc<Store>,
    comms: Arc<ServerComms<C>>,
    stats: Arc<PipelineStats>,
    settings: SenderSettings,
    session: String,
    state: SenderState,
    upload_failed: bool,
    last_task_collect: Option<Instant>,
    availability_next: u64,
}

impl<C: Connector> ProxyDataSender<C> {
    pub fn new(
        store: Arc<Store>,
        comms: Arc<ServerComms<C>>,
        stats: Arc<PipelineStats>,
        settings: SenderSettings,
    ) -> Self {
        Self {
            store,
            comms,
            stats,
            settings,
            session: new_session_token(),
            state: SenderState::Idle,
            upload_failed: false,
            last_task_collect: None,
            availability_next: 0,
        }
    }

    pub fn state(&self) -> SenderState {
        self.state
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn upload_failed(&self) -> bool {
        self.upload_failed
    }

    /// Reads every stream past its checkpoint into one envelope.
    ///
    /// Availability carries no checkpoint and is always included. It may
    /// use at most half of the byte cap; hosts that do not fit go out in the
    /// following envelopes, continuing after the last host sent.
    pub fn collect_delta(&self) -> Result<CollectedDelta> {
        let max = self.settings.max_records.max(1);
        let mut envelope = ProxyDataEnvelope::new(&self.settings.host, &self.session);
        let mut checkpoints = Vec::new();
        let mut more = false;

        let share = self.settings.max_bytes / 2;
        let mut budget = Budget {
            remaining: share,
            records: 0,
        };
        let pending: Vec<_> = self
            .store
            .availability()?
            .into_iter()
            .filter(|rec| rec.hostid > self.availability_next)
            .collect();
        let (availability, cut) = budget.fill(pending, max);
        let availability_next = match availability.last() {
            Some(last) if cut => last.hostid,
            _ => 0,
        };
        envelope.availability = availability;
        more |= cut;

        // Checkpointed streams get the rest and always at least one row.
        let mut budget = Budget {
            remaining: self.settings.max_bytes - (share - budget.remaining),
            records: 0,
        };

        let from = self.store.checkpoint(Stream::History)?;
        let (rows, cut) = budget.fill(self.store.history_records(from, max + 1)?, max);
        if let Some(last) = rows.last() {
            checkpoints.push((Stream::History, last.id));
        }
        envelope.history = rows;
        more |= cut;

        let from = self.store.checkpoint(Stream::Discovery)?;
        let (rows, cut) = budget.fill(self.store.discovery_records(from, max + 1)?, max);
        if let Some(last) = rows.last() {
            checkpoints.push((Stream::Discovery, last.id));
        }
        envelope.discovery = rows;
        more |= cut;

        let from = self.store.checkpoint(Stream::AutoRegistration)?;
        let (rows, cut) = budget.fill(self.store.autoregistration_records(from, max + 1)?, max);
        if let Some(last) = rows.last() {
            checkpoints.push((Stream::AutoRegistration, last.id));
        }
        envelope.autoregistration = rows;
        more |= cut;

        envelope.set_more(more);
        Ok(CollectedDelta {
            envelope,
            checkpoints,
            taskids: Vec::new(),
            availability_next,
        })
    }

    /// Outstanding tasks, on the task cadence. `force` skips the cadence.
    pub fn collect_tasks(&mut self, now: i64, force: bool) -> Result<Option<Vec<TaskRecord>>> {
        let due = force
            || self
                .last_task_collect
                .map_or(true, |t| t.elapsed() >= self.settings.task_frequency);
        if !due {
            return Ok(None);
        }
        self.last_task_collect = Some(Instant::now());
        Ok(Some(self.store.pending_tasks(now, self.settings.max_records.max(1))?))
    }

    /// Collects, sends and, on acknowledgement, commits one envelope.
    #[instrument(level = "debug", skip(self), fields(session = %self.session))]
    pub async fn cycle(&mut self, now: i64) -> Result<CycleOutcome> {
        self.state = SenderState::Collecting;
        let force_tasks = self.upload_failed;
        let collected = self.collect_delta().and_then(|mut delta| {
            let tasks = self.collect_tasks(now, force_tasks)?;
            let tasks_due = tasks.is_some();
            if let Some(tasks) = tasks {
                delta.taskids = tasks.iter().map(|t| t.taskid).collect();
                delta.envelope.tasks = tasks;
            }
            Ok((delta, tasks_due))
        });
        let (delta, tasks_due) = match collected {
            Ok(c) => c,
            Err(e) => {
                self.state = SenderState::Idle;
                return Err(e);
            }
        };

        // An empty envelope still goes out when tasks are due so the server
        // can hand down new ones.
        if delta.envelope.is_empty() && !tasks_due {
            self.state = SenderState::Idle;
            return Ok(CycleOutcome::default());
        }

        self.state = SenderState::Sending;
        let started = std::time::Instant::now();
        let result = match delta.envelope.to_json() {
            Ok(payload) => {
                self.comms
                    .exchange(&payload, self.settings.retry_interval)
                    .await
            }
            Err(e) => Err(e),
        };

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                self.upload_failed = true;
                self.state = SenderState::Idle;
                PipelineStats::add(&self.stats.envelopes_failed, 1);
                warn!("Sending proxy data failed: {}", e);
                return Err(e);
            }
        };

        self.state = SenderState::Acked;
        debug!("Proxy data acknowledged");

        self.state = SenderState::CheckpointAdvance;
        let committed = self
            .store
            .commit_delivery(&delta.checkpoints, &delta.taskids)
            .and_then(|_| self.store.accept_server_tasks(&response.tasks));
        self.state = SenderState::Idle;
        let accepted = match committed {
            Ok(n) => n,
            Err(e) => {
                // Acknowledged but not recorded: the rows go out again.
                self.upload_failed = true;
                warn!("Cannot record delivered proxy data: {}", e);
                return Err(e);
            }
        };
        if accepted > 0 {
            info!("Received {} tasks from the server", accepted);
        }
        self.upload_failed = false;
        self.availability_next = delta.availability_next;

        let env = &delta.envelope;
        let stats = &self.stats;
        PipelineStats::add(&stats.envelopes_sent, 1);
        PipelineStats::add(&stats.availability_sent, env.availability.len() as u64);
        PipelineStats::add(&stats.history_sent, env.history.len() as u64);
        PipelineStats::add(&stats.discovery_sent, env.discovery.len() as u64);
        PipelineStats::add(&stats.autoregistration_sent, env.autoregistration.len() as u64);
        PipelineStats::add(&stats.tasks_sent, env.tasks.len() as u64);
        stats
            .send_duration_seconds
            .add_sample(started.elapsed().as_secs_f64());

        let records = env.history.len() + env.discovery.len() + env.autoregistration.len();
        debug!(
            "Sent {} records, {} tasks{}",
            records,
            env.tasks.len(),
            if env.has_more() { ", more pending" } else { "" }
        );
        Ok(CycleOutcome {
            sent: true,
            records,
            more: env.has_more(),
        })
    }

    /// Sends on the data cadence, counted from the last successful cycle.
    /// Failed or truncated cycles are followed up right away.
    pub async fn run(mut self, run: RunFlag) {
        info!("Proxy data sender started, session {}", self.session);
        let mut last_success: Option<Instant> = None;
        let mut follow_up = false;
        while run.is_running() {
            let wait = if follow_up {
                Duration::ZERO
            } else if self.upload_failed {
                FAILED_CYCLE_PAUSE
            } else {
                last_success.map_or(Duration::ZERO, |t| {
                    self.settings.frequency.saturating_sub(t.elapsed())
                })
            };
            if !wait.is_zero() && !run.sleep(wait).await {
                break;
            }

            match self.cycle(Timespec::now().sec).await {
                Ok(outcome) => {
                    last_success = Some(Instant::now());
                    follow_up = outcome.more;
                }
                Err(_) => follow_up = false,
            }
        }
        info!("Proxy data sender stopped");
    }
}

pub struct HeartbeatSender<C: Connector> {
    comms: Arc<ServerComms<C>>,
    stats: Arc<PipelineStats>,
    host: String,
}

impl<C: Connector> HeartbeatSender<C> {
    pub fn new(comms: Arc<ServerComms<C>>, stats: Arc<PipelineStats>, host: &str) -> Self {
        Self {
            comms,
            stats,
            host: host.to_string(),
        }
    }

    /// One heartbeat with a single connection attempt.
    pub async fn beat(&self) -> Result<()> {
        let payload = serde_json::to_vec(&HeartbeatRequest::new(&self.host))?;
        match self.comms.exchange(&payload, Duration::ZERO).await {
            Ok(_) => {
                PipelineStats::add(&self.stats.heartbeats_sent, 1);
                Ok(())
            }
            Err(e) => {
                PipelineStats::add(&self.stats.heartbeats_failed, 1);
                debug!("Heartbeat failed: {}", e);
                Err(e)
            }
        }
    }

    pub async fn run(self, run: RunFlag, frequency: Duration) {
        if frequency.is_zero() {
            info!("Heartbeat disabled");
            return;
        }
        info!("Heartbeat sender started, every {}s", frequency.as_secs());
        while run.is_running() {
            let _ = self.beat().await;
            if !run.sleep(frequency).await {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProxyError;
    use crate::history::{HistoryValue, Value};
    use crate::protocol::{self, AvailabilityRecord, DiscoveryRecord, TaskType, MAX_MESSAGE_SIZE};
    use crate::store::TaskStatus;
    use std::collections::VecDeque;
    use std::future::Future;
    use std::io;
    use std::sync::Mutex;
    use tokio::io::DuplexStream;

    /// Replays one scripted answer per connection and records requests.
    #[derive(Default)]
    struct MockServer {
        script: Mutex<VecDeque<Option<String>>>,
        received: Arc<Mutex<Vec<serde_json::Value>>>,
    }

    impl MockServer {
        fn answering(replies: &[Option<&str>]) -> Self {
            Self {
                script: Mutex::new(replies.iter().map(|r| r.map(str::to_string)).collect()),
                received: Arc::default(),
            }
        }
    }

    impl Connector for MockServer {
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
            "mock".to_string()
        }
    }

    const OK: Option<&str> = Some(r#"{"response":"success","version":"4.2.0"}"#);
    const NAK: Option<&str> = Some(r#"{"response":"failed","info":"host is not a proxy"}"#);

    fn sender(
        store: Arc<Store>,
        server: MockServer,
        max_records: usize,
        max_bytes: usize,
    ) -> ProxyDataSender<MockServer> {
        let comms = Arc::new(ServerComms::new(server, Duration::from_secs(5), RunFlag::new()));
        ProxyDataSender::new(
            store,
            comms,
            Arc::new(PipelineStats::default()),
            SenderSettings {
                host: "proxy-1".into(),
                max_records,
                max_bytes,
                frequency: Duration::from_secs(1),
                task_frequency: Duration::from_secs(3600),
                retry_interval: Duration::ZERO,
            },
        )
    }

    fn seed_history(store: &Store, n: i64) {
        let values: Vec<HistoryValue> = (0..n)
            .map(|i| HistoryValue::new(1, Timespec::new(1000 + i, 0), Value::Uint(i as u64)))
            .collect();
        store.insert_history(&values).unwrap();
    }

    fn ids(doc: &serde_json::Value, tag: &str) -> Vec<i64> {
        doc[tag]
            .as_array()
            .map(|a| a.iter().filter_map(|r| r["id"].as_i64()).collect())
            .unwrap_or_default()
    }

    #[test]
    fn test_session_token_shape() {
        let token = new_session_token();
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(token, new_session_token());
    }

    #[tokio::test]
    async fn test_ack_advances_contiguous_checkpoints() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        seed_history(&store, 5);
        let server = MockServer::answering(&[OK, OK, OK]);
        let received = server.received.clone();
        let mut sender = sender(store.clone(), server, 2, 1 << 20);

        let first = sender.cycle(2000).await.unwrap();
        assert!(first.sent);
        assert!(first.more);
        assert_eq!(store.checkpoint(Stream::History).unwrap(), 2);

        sender.cycle(2000).await.unwrap();
        assert_eq!(store.checkpoint(Stream::History).unwrap(), 4);

        let last = sender.cycle(2000).await.unwrap();
        assert!(!last.more);
        assert_eq!(store.checkpoint(Stream::History).unwrap(), 5);

        let docs = received.lock().unwrap();
        let sent: Vec<i64> = docs.iter().flat_map(|d| ids(d, "history data")).collect();
        assert_eq!(sent, vec![1, 2, 3, 4, 5]);
        assert_eq!(docs[0]["more"], 1);
        assert!(docs[2].get("more").is_none());
        assert_eq!(docs[0]["session"], docs[2]["session"]);
        assert_eq!(sender.state(), SenderState::Idle);
    }

    #[tokio::test]
    async fn test_failures_keep_checkpoint_and_resend() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        seed_history(&store, 3);
        let server = MockServer::answering(&[None, NAK, OK]);
        let received = server.received.clone();
        let mut sender = sender(store.clone(), server, 10, 1 << 20);

        let refused = sender.cycle(2000).await.unwrap_err();
        assert!(matches!(refused, ProxyError::Network { .. }));
        assert!(sender.upload_failed());
        assert_eq!(store.checkpoint(Stream::History).unwrap(), 0);

        let nak = sender.cycle(2000).await.unwrap_err();
        assert!(matches!(nak, ProxyError::NegativeAck { .. }));
        assert_eq!(store.checkpoint(Stream::History).unwrap(), 0);

        sender.cycle(2000).await.unwrap();
        assert!(!sender.upload_failed());
        assert_eq!(store.checkpoint(Stream::History).unwrap(), 3);

        let docs = received.lock().unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(ids(&docs[0], "history data"), ids(&docs[1], "history data"));
    }

    #[tokio::test]
    async fn test_byte_cap_takes_at_least_one_record() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        seed_history(&store, 3);
        let mut sender = sender(store.clone(), MockServer::answering(&[OK]), 100, 1);

        let delta = sender.collect_delta().unwrap();
        assert_eq!(delta.envelope.history.len(), 1);
        assert!(delta.envelope.has_more());
        assert_eq!(delta.checkpoints, vec![(Stream::History, 1)]);

        let outcome = sender.cycle(2000).await.unwrap();
        assert_eq!(outcome.records, 1);
        assert_eq!(store.checkpoint(Stream::History).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_streams_and_availability() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store
            .upsert_availability(
                &AvailabilityRecord {
                    hostid: 7,
                    available: 1,
                    error: String::new(),
                },
                1000,
            )
            .unwrap();
        store
            .insert_discovery(&DiscoveryRecord {
                id: 0,
                clock: 1000,
                druleid: 1,
                dcheckid: 2,
                ip: "10.0.0.1".into(),
                dns: String::new(),
                port: 22,
                value: String::new(),
                status: 0,
            })
            .unwrap();
        let server = MockServer::answering(&[OK, OK]);
        let received = server.received.clone();
        let mut sender = sender(store.clone(), server, 10, 1 << 20);

        sender.cycle(2000).await.unwrap();
        assert_eq!(store.checkpoint(Stream::Discovery).unwrap(), 1);
        assert_eq!(store.checkpoint(Stream::History).unwrap(), 0);

        // Availability travels again, discovery does not.
        sender.cycle(2000).await.unwrap();
        let docs = received.lock().unwrap();
        assert_eq!(docs[1]["host availability"][0]["hostid"], 7);
        assert!(docs[1].get("discovery data").is_none());
    }

    #[tokio::test]
    async fn test_availability_over_byte_cap_rotates_through_hosts() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        for hostid in 1..=50 {
            let rec = AvailabilityRecord {
                hostid,
                available: 2,
                error: "x".repeat(50),
            };
            store.upsert_availability(&rec, 1000).unwrap();
        }
        seed_history(&store, 3);
        let server = MockServer::answering(&[OK; 20]);
        let received = server.received.clone();
        let mut sender = sender(store.clone(), server, 100, 1024);

        let first = sender.collect_delta().unwrap();
        assert!(first.envelope.has_more());
        assert!(first.envelope.availability.len() < 50);
        assert_eq!(first.envelope.history.len(), 3);

        let mut cycles = 0;
        loop {
            cycles += 1;
            if !sender.cycle(2000).await.unwrap().more {
                break;
            }
        }
        assert!(cycles > 1 && cycles < 20);
        assert_eq!(store.checkpoint(Stream::History).unwrap(), 3);

        let docs = received.lock().unwrap();
        let mut hosts: Vec<u64> = docs
            .iter()
            .flat_map(|d| d["host availability"].as_array().cloned().unwrap_or_default())
            .filter_map(|r| r["hostid"].as_u64())
            .collect();
        hosts.sort_unstable();
        assert_eq!(hosts, (1..=50).collect::<Vec<_>>());

        // The rotation starts over once every host went out.
        let again = sender.collect_delta().unwrap();
        assert_eq!(again.envelope.availability[0].hostid, 1);
    }

    #[tokio::test]
    async fn test_tasks_marked_sent_and_server_tasks_accepted() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let taskid = store
            .insert_task(TaskType::CheckNow, None, 1990, 3600, "")
            .unwrap();
        let reply = Some(
            r#"{"response":"success","tasks":[{"taskid":500,"type":2,"clock":1995,"ttl":600,"payload":"uptime"}]}"#,
        );
        let server = MockServer::answering(&[reply]);
        let received = server.received.clone();
        let mut sender = sender(store.clone(), server, 10, 1 << 20);

        sender.cycle(2000).await.unwrap();
        assert_eq!(store.task_status(taskid).unwrap(), Some(TaskStatus::Sent));
        assert_eq!(store.task_status(500).unwrap(), Some(TaskStatus::Sent));
        assert_eq!(received.lock().unwrap()[0]["tasks"][0]["taskid"], taskid);

        // Task cadence not elapsed and nothing else to send.
        let idle = sender.cycle(2001).await.unwrap();
        assert!(!idle.sent);
    }

    #[tokio::test]
    async fn test_heartbeat_single_attempt() {
        let server = MockServer::answering(&[None, OK]);
        let received = server.received.clone();
        let comms = Arc::new(ServerComms::new(server, Duration::from_secs(5), RunFlag::new()));
        let stats = Arc::new(PipelineStats::default());
        let heartbeat = HeartbeatSender::new(comms, stats.clone(), "proxy-1");

        assert!(heartbeat.beat().await.is_err());
        assert!(heartbeat.beat().await.is_ok());
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.heartbeats_failed, 1);
        assert_eq!(snapshot.heartbeats_sent, 1);
        assert_eq!(received.lock().unwrap()[0]["request"], "proxy heartbeat");
    }
}
