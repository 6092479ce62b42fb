//! Connection and retry wrapper shared by the data sender and heartbeat.

use std::future::Future;
use std::io;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::control::RunFlag;
use crate::error::{NetworkErrorKind, ProxyError, Result};
use crate::protocol::{self, ServerResponse, MAX_MESSAGE_SIZE};

/// Minimum spacing between repeated "still unreachable" warnings.
pub const LOG_FREQUENCY: Duration = Duration::from_secs(60);

/// Opens transport streams to the server.
pub trait Connector: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send;

    fn connect(&self, timeout: Duration) -> impl Future<Output = io::Result<Self::Stream>> + Send;

    /// Peer description for log messages.
    fn peer(&self) -> String;
}

/// Plain TCP connector.
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            addr: format!("{}:{}", host, port),
        }
    }
}

impl Connector for TcpConnector {
    type Stream = TcpStream;

    fn connect(&self, timeout: Duration) -> impl Future<Output = io::Result<TcpStream>> + Send {
        let addr = self.addr.clone();
        async move {
            match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {} timed out", addr),
                )),
            }
        }
    }

    fn peer(&self) -> String {
        self.addr.clone()
    }
}

/// Connectivity bookkeeping used to rate-limit log output.
#[derive(Debug, Clone, Default)]
pub struct LinkStats {
    pub failures: u64,
    pub restorations: u64,
    pub warnings_logged: u64,
    pub down: bool,
}

#[derive(Default)]
struct LinkState {
    stats: LinkStats,
    failing_since: Option<Instant>,
    last_logged: Option<Instant>,
}

pub struct ServerComms<C: Connector> {
    connector: C,
    timeout: Duration,
    run: RunFlag,
    link: Mutex<LinkState>,
}

impl<C: Connector> ServerComms<C> {
    pub fn new(connector: C, timeout: Duration, run: RunFlag) -> Self {
        Self {
            connector,
            timeout,
            run,
            link: Mutex::new(LinkState::default()),
        }
    }

    pub fn link_stats(&self) -> LinkStats {
        self.link_state().stats.clone()
    }

    fn link_state(&self) -> std::sync::MutexGuard<'_, LinkState> {
        self.link.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Connects to the server.
    ///
    /// With a zero `retry_interval` a single attempt is made. Otherwise the
    /// attempt repeats every `retry_interval` until it succeeds or shutdown
    /// is requested.
    pub async fn connect(&self, retry_interval: Duration) -> Result<C::Stream> {
        loop {
            match self.connector.connect(self.timeout).await {
                Ok(stream) => {
                    self.note_success();
                    return Ok(stream);
                }
                Err(e) => {
                    let err = ProxyError::from(e);
                    self.note_failure(&err, retry_interval);
                    if retry_interval.is_zero() || !self.run.sleep(retry_interval).await {
                        return Err(err);
                    }
                }
            }
        }
    }

    fn note_failure(&self, err: &ProxyError, retry_interval: Duration) {
        let now = Instant::now();
        let mut link = self.link_state();
        link.stats.failures += 1;

        let first = link.failing_since.is_none();
        if first {
            link.failing_since = Some(now);
            link.stats.down = true;
        }

        let due = match link.last_logged {
            None => true,
            Some(at) => now.duration_since(at) >= LOG_FREQUENCY,
        };

        if due {
            link.last_logged = Some(now);
            link.stats.warnings_logged += 1;
            if first {
                warn!(
                    "Unable to connect to the server [{}]: {}",
                    self.connector.peer(),
                    err
                );
            } else {
                let down_for = link
                    .failing_since
                    .map(|since| now.duration_since(since).as_secs())
                    .unwrap_or(0);
                warn!(
                    "Still unable to connect to the server [{}] after {}s: {}",
                    self.connector.peer(),
                    down_for,
                    err
                );
            }
            if !retry_interval.is_zero() {
                warn!("Will retry every {}s", retry_interval.as_secs());
            }
        } else {
            debug!("Connect attempt to [{}] failed: {}", self.connector.peer(), err);
        }
    }

    fn note_success(&self) {
        let mut link = self.link_state();
        if let Some(since) = link.failing_since.take() {
            link.stats.restorations += 1;
            link.stats.down = false;
            link.last_logged = None;
            info!(
                "Connection to the server [{}] restored after {}s",
                self.connector.peer(),
                Instant::now().duration_since(since).as_secs()
            );
        }
    }

    /// Sends one framed payload and waits for the server's structured reply.
    ///
    /// A missing reply within the timeout is a network timeout; an explicit
    /// `"failed"` reply is a negative acknowledgement.
    pub async fn send_and_ack(&self, stream: &mut C::Stream, payload: &[u8]) -> Result<ServerResponse> {
        tokio::time::timeout(self.timeout, protocol::write_frame(stream, payload))
            .await
            .map_err(|_| ProxyError::network(NetworkErrorKind::Timeout, "send timed out"))??;

        let reply = tokio::time::timeout(self.timeout, protocol::read_frame(stream, MAX_MESSAGE_SIZE))
            .await
            .map_err(|_| {
                ProxyError::network(
                    NetworkErrorKind::Timeout,
                    format!("no response within {}s", self.timeout.as_secs()),
                )
            })??;

        protocol::parse_response(&reply)
    }

    /// Connects and performs one request/response exchange.
    pub async fn exchange(&self, payload: &[u8], retry_interval: Duration) -> Result<ServerResponse> {
        let mut stream = self.connect(retry_interval).await?;
        self.send_and_ack(&mut stream, payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::DuplexStream;

    /// Refuses the first `refusals` attempts, then answers with `reply`.
    struct ScriptedConnector {
        refusals: usize,
        attempts: AtomicUsize,
        reply: Option<&'static [u8]>,
    }

    impl Connector for ScriptedConnector {
        type Stream = DuplexStream;

        fn connect(&self, _timeout: Duration) -> impl Future<Output = io::Result<DuplexStream>> + Send {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            let refuse = attempt < self.refusals;
            let reply = self.reply;
            async move {
                if refuse {
                    return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
                }
                let (client, mut server) = tokio::io::duplex(4096);
                tokio::spawn(async move {
                    if protocol::read_frame(&mut server, MAX_MESSAGE_SIZE).await.is_ok() {
                        if let Some(reply) = reply {
                            let _ = protocol::write_frame(&mut server, reply).await;
                        }
                        // keep the stream open so silence is observable
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                    }
                });
                Ok(client)
            }
        }

        fn peer(&self) -> String {
            "scripted".to_string()
        }
    }

    fn comms(refusals: usize, reply: Option<&'static [u8]>) -> ServerComms<ScriptedConnector> {
        ServerComms::new(
            ScriptedConnector {
                refusals,
                attempts: AtomicUsize::new(0),
                reply,
            },
            Duration::from_secs(3),
            RunFlag::new(),
        )
    }

    #[tokio::test]
    async fn test_single_attempt_fails_fast() {
        let comms = comms(1, None);
        let err = comms.connect(Duration::ZERO).await.unwrap_err();
        assert!(matches!(
            err,
            ProxyError::Network {
                kind: NetworkErrorKind::Refused,
                ..
            }
        ));
        assert_eq!(comms.link_stats().failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_restored() {
        let comms = comms(3, Some(br#"{"response":"success"}"#));
        let started = Instant::now();
        comms.connect(Duration::from_secs(5)).await.unwrap();

        assert_eq!(started.elapsed(), Duration::from_secs(15));
        let stats = comms.link_stats();
        assert_eq!(stats.failures, 3);
        assert_eq!(stats.warnings_logged, 1);
        assert_eq!(stats.restorations, 1);
        assert!(!stats.down);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_on_shutdown() {
        let comms = comms(usize::MAX, None);
        let run = comms.run.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(12)).await;
            run.shutdown();
        });
        assert!(comms.connect(Duration::from_secs(5)).await.is_err());
        assert_eq!(comms.link_stats().failures, 3);
    }

    #[tokio::test]
    async fn test_exchange_success() {
        let comms = comms(0, Some(br#"{"response":"success","info":"ok"}"#));
        let resp = comms.exchange(b"{}", Duration::ZERO).await.unwrap();
        assert_eq!(resp.info.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn test_negative_ack_is_distinct_from_timeout() {
        let comms_failed = comms(0, Some(br#"{"response":"failed","info":"denied"}"#));
        assert!(matches!(
            comms_failed.exchange(b"{}", Duration::ZERO).await,
            Err(ProxyError::NegativeAck { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_server_times_out() {
        let comms = comms(0, None);
        assert!(matches!(
            comms.exchange(b"{}", Duration::ZERO).await,
            Err(ProxyError::Network {
                kind: NetworkErrorKind::Timeout,
                ..
            })
        ));
    }
}
