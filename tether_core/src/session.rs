use crate::attribute::{AttributeTable, TableError};
use crate::frame::{FrameError, FrameReader, FrameWriter};
use crate::host::{Advertisement, HostError, HostStack};
use crate::signal::CompletionSignal;
use crate::transaction::TransactionExecutor;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, info, warn};

/// Prompt asking the fuzzer for the number of transaction rounds.
pub const PROMPT_COUNT: &str = "count?";
/// Prompt asking the fuzzer for the target attribute handle.
pub const PROMPT_ATTRIBUTE: &str = "attribute?";
/// Terminal token: every round completed.
pub const TOKEN_OK: &str = "ok";
/// Terminal token: session ended early (timeout or failure).
pub const TOKEN_END: &str = "end";

/// Session parameters negotiated with the fuzzer. Both values are received,
/// never chosen, by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionParams {
    /// Number of fuzzer-driven round trips to perform.
    pub transaction_count: u16,
    /// The single attribute handle every transaction addresses.
    pub target_handle: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    WaitAdvertisement,
    Connecting,
    Discovering,
    Negotiating,
    Executing,
    Done,
    TerminatedEarly,
    Failed,
    Closed,
}

/// How the session ended, as reported through the completion signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionVerdict {
    /// Every round finished with `Success` or `PeerRejected`.
    Completed,
    /// A transaction timed out; the target is presumed wedged.
    TerminatedEarly,
    /// The session could not reach or finish the executing phase.
    Failed,
}

impl SessionVerdict {
    pub fn is_success(self) -> bool {
        matches!(self, SessionVerdict::Completed)
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    /// The inter-process pipe contract was violated. Unrecoverable; there
    /// is nobody left to notify.
    #[error(transparent)]
    Channel(#[from] FrameError),

    #[error("host stack failure: {0}")]
    Host(#[from] HostError),

    /// The negotiated target handle does not exist on the peer.
    #[error(transparent)]
    UnknownHandle(#[from] TableError),

    /// The fuzzer sent a negotiation frame of the wrong size.
    #[error("malformed negotiation frame: expected {expected} bytes, got {got}")]
    Negotiation { expected: usize, got: usize },

    /// Scanning ended before any advertisement arrived.
    #[error("scan ended before an advertisement was seen")]
    ScanEnded,
}

/// Orchestrates one full session: advertisement wait, connection, discovery,
/// negotiation, the transaction loop, and the terminal token.
///
/// The driver is one sequential flow of suspension points. The strict
/// prompt/receive/execute/report alternation in the executing phase is what
/// gives the two independently scheduled processes a total order.
pub struct SessionDriver<H, R, W> {
    host: H,
    inbound: FrameReader<R>,
    outbound: FrameWriter<W>,
    executor: TransactionExecutor,
    poll_interval: Duration,
    state: SessionState,
}

impl<H, R, W> SessionDriver<H, R, W>
where
    H: HostStack,
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(
        host: H,
        inbound: FrameReader<R>,
        outbound: FrameWriter<W>,
        executor: TransactionExecutor,
        poll_interval: Duration,
    ) -> Self {
        Self {
            host,
            inbound,
            outbound,
            executor,
            poll_interval,
            state: SessionState::Idle,
        }
    }

    /// Current phase of the session, for callers that log progress.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run the session to its terminal state.
    ///
    /// All fatal-to-session errors are converted here into the terminal
    /// `"end"` frame so the fuzzer's receive loop never blocks forever.
    /// Scan, connection and transport failures are still returned as errors
    /// after that frame goes out, so the process exits non-zero when there
    /// was no usable peer; a violated channel contract propagates without
    /// the frame. The completion signal is released exactly once on every
    /// path.
    pub async fn run(
        mut self,
        done: CompletionSignal<SessionVerdict>,
    ) -> Result<SessionVerdict, SessionError> {
        let sealed = match self.drive().await {
            Ok(verdict) => self
                .outbound
                .shutdown()
                .await
                .map(|()| verdict)
                .map_err(SessionError::Channel),
            Err(err @ SessionError::Channel(_)) => Err(err),
            Err(err) => {
                warn!(error = %err, "session failed; notifying fuzzer before closing");
                self.transition(SessionState::Failed);
                match self.seal_failure().await {
                    // Without a usable peer the process must exit non-zero;
                    // surface the error after the fuzzer has been notified.
                    Ok(()) => match err {
                        err @ (SessionError::Host(_) | SessionError::ScanEnded) => Err(err),
                        _ => Ok(SessionVerdict::Failed),
                    },
                    Err(channel_err) => Err(channel_err),
                }
            }
        };

        self.transition(SessionState::Closed);
        match sealed {
            Ok(verdict) => {
                info!(?verdict, "session closed");
                done.complete(verdict);
                Ok(verdict)
            }
            Err(err) => {
                warn!(error = %err, "session aborted");
                done.complete(SessionVerdict::Failed);
                Err(err)
            }
        }
    }

    async fn drive(&mut self) -> Result<SessionVerdict, SessionError> {
        self.transition(SessionState::WaitAdvertisement);
        let mut events = self.host.start_scan().await?;
        info!("waiting for an advertisement from the target");
        let advertisement = self.wait_advertisement(&mut events).await?;
        self.host.stop_scan().await?;
        info!(address = %advertisement.address, "got advertisement");

        self.transition(SessionState::Connecting);
        let mut conn = self.host.connect(&advertisement.address).await?;
        info!("connected");

        self.transition(SessionState::Discovering);
        let table = AttributeTable::discover(&mut conn).await?;
        info!(attributes = table.len(), "attribute table built");

        self.transition(SessionState::Negotiating);
        let params = self.negotiate().await?;
        // Resolve before any transaction executes; an absent handle fails
        // the whole session.
        let target = table.lookup(params.target_handle)?.handle;
        debug!(
            count = params.transaction_count,
            handle = target,
            "session parameters agreed"
        );

        self.transition(SessionState::Executing);
        for round in 1..=params.transaction_count {
            self.outbound.send(format!("#{round}?").as_bytes()).await?;
            // A zero-length frame here is an explicit empty body, not "no
            // data".
            let body = self.inbound.receive().await?;
            let outcome = self.executor.run(&mut conn, target, &body).await?;
            debug!(round, ?outcome, "transaction finished");

            if outcome.is_timeout() {
                warn!(round, ?outcome, "target stopped responding; ending early");
                self.transition(SessionState::TerminatedEarly);
                self.outbound.send(TOKEN_END.as_bytes()).await?;
                return Ok(SessionVerdict::TerminatedEarly);
            }
        }

        self.transition(SessionState::Done);
        self.outbound.send(TOKEN_OK.as_bytes()).await?;
        Ok(SessionVerdict::Completed)
    }

    /// Poll for the first advertisement while the stack delivers events.
    async fn wait_advertisement(
        &self,
        events: &mut mpsc::Receiver<Advertisement>,
    ) -> Result<Advertisement, SessionError> {
        loop {
            match events.try_recv() {
                Ok(advertisement) => return Ok(advertisement),
                Err(TryRecvError::Empty) => tokio::time::sleep(self.poll_interval).await,
                Err(TryRecvError::Disconnected) => return Err(SessionError::ScanEnded),
            }
        }
    }

    /// Fixed two-field handshake: count first, then handle. The order is the
    /// protocol; a wrong-sized frame is a typed error, not undefined
    /// parsing.
    async fn negotiate(&mut self) -> Result<SessionParams, SessionError> {
        self.outbound.send(PROMPT_COUNT.as_bytes()).await?;
        let transaction_count = self.receive_u16().await?;

        self.outbound.send(PROMPT_ATTRIBUTE.as_bytes()).await?;
        let target_handle = self.receive_u16().await?;

        Ok(SessionParams {
            transaction_count,
            target_handle,
        })
    }

    async fn receive_u16(&mut self) -> Result<u16, SessionError> {
        let frame = self.inbound.receive().await?;
        let bytes: [u8; 2] =
            frame
                .as_slice()
                .try_into()
                .map_err(|_| SessionError::Negotiation {
                    expected: 2,
                    got: frame.len(),
                })?;
        Ok(u16::from_le_bytes(bytes))
    }

    async fn seal_failure(&mut self) -> Result<(), SessionError> {
        self.outbound.send(TOKEN_END.as_bytes()).await?;
        self.outbound.shutdown().await?;
        Ok(())
    }

    fn transition(&mut self, next: SessionState) {
        debug!(from = ?self.state, to = ?next, "session state");
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameError;
    use crate::host::PeerConnection;
    use crate::signal::{CompletionWait, completion};
    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::io::{DuplexStream, duplex};
    use tokio::task::JoinHandle;

    #[derive(Debug, Clone, Copy)]
    enum Behavior {
        Ok,
        Reject,
        Hang,
    }

    /// Peer with a scripted attribute tree and per-call write behaviors.
    /// Reads always succeed with a one-byte value.
    struct MockConn {
        services: Vec<u16>,
        characteristics: HashMap<u16, Vec<u16>>,
        descriptors: HashMap<u16, Vec<u16>>,
        write_script: VecDeque<Behavior>,
        write_log: Arc<Mutex<Vec<(u16, Vec<u8>)>>>,
    }

    impl MockConn {
        /// One service (handle 9) holding one characteristic (handle 10).
        fn single_characteristic() -> Self {
            Self {
                services: vec![9],
                characteristics: HashMap::from([(9, vec![10])]),
                descriptors: HashMap::from([(10, vec![])]),
                write_script: VecDeque::new(),
                write_log: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn with_writes(mut self, script: &[Behavior]) -> Self {
            self.write_script = script.iter().copied().collect();
            self
        }
    }

    #[async_trait]
    impl PeerConnection for MockConn {
        async fn discover_services(&mut self) -> Result<Vec<u16>, HostError> {
            Ok(self.services.clone())
        }

        async fn discover_characteristics(&mut self, service: u16) -> Result<Vec<u16>, HostError> {
            Ok(self.characteristics.get(&service).cloned().unwrap_or_default())
        }

        async fn discover_descriptors(
            &mut self,
            characteristic: u16,
        ) -> Result<Vec<u16>, HostError> {
            Ok(self.descriptors.get(&characteristic).cloned().unwrap_or_default())
        }

        async fn write(&mut self, handle: u16, payload: &[u8], _: bool) -> Result<(), HostError> {
            self.write_log.lock().unwrap().push((handle, payload.to_vec()));
            match self.write_script.pop_front().unwrap_or(Behavior::Ok) {
                Behavior::Ok => Ok(()),
                Behavior::Reject => Err(HostError::Protocol("invalid attribute value".into())),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    unreachable!("hung write should have been timed out")
                }
            }
        }

        async fn read(&mut self, _: u16) -> Result<Vec<u8>, HostError> {
            Ok(vec![0x42])
        }
    }

    struct MockHost {
        conn: Option<MockConn>,
        advertise: bool,
        refuse_connection: bool,
        stopped: Arc<AtomicBool>,
    }

    impl MockHost {
        fn new(conn: MockConn) -> Self {
            Self {
                conn: Some(conn),
                advertise: true,
                refuse_connection: false,
                stopped: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    #[async_trait]
    impl HostStack for MockHost {
        type Conn = MockConn;

        async fn start_scan(&mut self) -> Result<mpsc::Receiver<Advertisement>, HostError> {
            let (tx, rx) = mpsc::channel(1);
            if self.advertise {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    let _ = tx
                        .send(Advertisement {
                            address: "f0:0d:00:00:00:01".into(),
                        })
                        .await;
                });
            }
            Ok(rx)
        }

        async fn stop_scan(&mut self) -> Result<(), HostError> {
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn connect(&mut self, _: &str) -> Result<Self::Conn, HostError> {
            if self.refuse_connection {
                return Err(HostError::Connect("peer unreachable".into()));
            }
            Ok(self.conn.take().expect("only one connection attempt"))
        }
    }

    struct Fuzzer {
        inbound: FrameReader<DuplexStream>,
        outbound: FrameWriter<DuplexStream>,
        wait: CompletionWait<SessionVerdict>,
        session: JoinHandle<Result<SessionVerdict, SessionError>>,
    }

    impl Fuzzer {
        async fn expect_text(&mut self, expected: &str) {
            let frame = self.inbound.receive().await.unwrap();
            assert_eq!(frame, expected.as_bytes());
        }

        async fn send_u16(&mut self, value: u16) {
            self.outbound.send(&value.to_le_bytes()).await.unwrap();
        }
    }

    /// Spawn a session against `host`, returning the fuzzer's side of the
    /// framed channel pair.
    fn spawn_session(host: MockHost) -> Fuzzer {
        let (fuzzer_tx, driver_rx) = duplex(4096);
        let (driver_tx, fuzzer_rx) = duplex(4096);

        let executor = TransactionExecutor::new(Duration::from_millis(100), true, true);
        let driver = SessionDriver::new(
            host,
            FrameReader::new(driver_rx),
            FrameWriter::new(driver_tx),
            executor,
            Duration::from_millis(10),
        );
        let (signal, wait) = completion();
        let session = tokio::spawn(driver.run(signal));

        Fuzzer {
            inbound: FrameReader::new(fuzzer_rx),
            outbound: FrameWriter::new(fuzzer_tx),
            wait,
            session,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn full_success_scenario_ends_with_ok() {
        let conn = MockConn::single_characteristic();
        let write_log = conn.write_log.clone();
        let host = MockHost::new(conn);
        let stopped = host.stopped.clone();
        let mut fuzzer = spawn_session(host);

        fuzzer.expect_text(PROMPT_COUNT).await;
        fuzzer.send_u16(2).await;
        fuzzer.expect_text(PROMPT_ATTRIBUTE).await;
        fuzzer.send_u16(10).await;

        fuzzer.expect_text("#1?").await;
        fuzzer.outbound.send(&[0x01]).await.unwrap();
        fuzzer.expect_text("#2?").await;
        fuzzer.outbound.send(&[]).await.unwrap();

        fuzzer.expect_text(TOKEN_OK).await;
        assert_eq!(fuzzer.wait.wait().await, Ok(SessionVerdict::Completed));
        assert!(fuzzer.session.await.unwrap().unwrap().is_success());

        assert!(stopped.load(Ordering::SeqCst), "scan must stop on first advertisement");
        let writes = write_log.lock().unwrap();
        assert_eq!(*writes, vec![(10, vec![0x01]), (10, vec![])]);
    }

    #[tokio::test(start_paused = true)]
    async fn count_is_requested_before_attribute() {
        let host = MockHost::new(MockConn::single_characteristic());
        let mut fuzzer = spawn_session(host);

        // Nothing has been sent yet; the very first outbound frame must be
        // the count prompt.
        fuzzer.expect_text(PROMPT_COUNT).await;
        fuzzer.send_u16(0).await;
        fuzzer.expect_text(PROMPT_ATTRIBUTE).await;
        fuzzer.send_u16(10).await;

        // Zero rounds is a complete session.
        fuzzer.expect_text(TOKEN_OK).await;
        assert_eq!(fuzzer.wait.wait().await, Ok(SessionVerdict::Completed));
        fuzzer.session.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn peer_rejection_does_not_abort_the_session() {
        let conn = MockConn::single_characteristic().with_writes(&[Behavior::Reject]);
        let host = MockHost::new(conn);
        let mut fuzzer = spawn_session(host);

        fuzzer.expect_text(PROMPT_COUNT).await;
        fuzzer.send_u16(1).await;
        fuzzer.expect_text(PROMPT_ATTRIBUTE).await;
        fuzzer.send_u16(10).await;

        fuzzer.expect_text("#1?").await;
        fuzzer.outbound.send(&[0xFF; 32]).await.unwrap();

        fuzzer.expect_text(TOKEN_OK).await;
        assert_eq!(fuzzer.wait.wait().await, Ok(SessionVerdict::Completed));
        fuzzer.session.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_sends_end_and_no_further_prompts() {
        let conn = MockConn::single_characteristic().with_writes(&[Behavior::Hang]);
        let host = MockHost::new(conn);
        let mut fuzzer = spawn_session(host);

        fuzzer.expect_text(PROMPT_COUNT).await;
        fuzzer.send_u16(2).await;
        fuzzer.expect_text(PROMPT_ATTRIBUTE).await;
        fuzzer.send_u16(10).await;

        fuzzer.expect_text("#1?").await;
        fuzzer.outbound.send(&[0x01]).await.unwrap();

        // The very next outbound frame is the terminal token, then the
        // channel closes without a "#2?" prompt.
        fuzzer.expect_text(TOKEN_END).await;
        assert!(matches!(
            fuzzer.inbound.receive().await,
            Err(FrameError::Closed)
        ));
        assert_eq!(fuzzer.wait.wait().await, Ok(SessionVerdict::TerminatedEarly));
        fuzzer.session.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_handle_fails_before_any_transaction() {
        let conn = MockConn::single_characteristic();
        let write_log = conn.write_log.clone();
        let host = MockHost::new(conn);
        let mut fuzzer = spawn_session(host);

        fuzzer.expect_text(PROMPT_COUNT).await;
        fuzzer.send_u16(3).await;
        fuzzer.expect_text(PROMPT_ATTRIBUTE).await;
        fuzzer.send_u16(999).await;

        fuzzer.expect_text(TOKEN_END).await;
        assert_eq!(fuzzer.wait.wait().await, Ok(SessionVerdict::Failed));
        fuzzer.session.await.unwrap().unwrap();

        assert!(write_log.lock().unwrap().is_empty(), "no transaction may execute");
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_negotiation_frame_fails_the_session() {
        let host = MockHost::new(MockConn::single_characteristic());
        let mut fuzzer = spawn_session(host);

        fuzzer.expect_text(PROMPT_COUNT).await;
        // One byte where two are required.
        fuzzer.outbound.send(&[0x02]).await.unwrap();

        fuzzer.expect_text(TOKEN_END).await;
        assert_eq!(fuzzer.wait.wait().await, Ok(SessionVerdict::Failed));
        fuzzer.session.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn scan_ending_without_advertisement_fails_the_session() {
        let mut host = MockHost::new(MockConn::single_characteristic());
        host.advertise = false;
        let mut fuzzer = spawn_session(host);

        fuzzer.expect_text(TOKEN_END).await;
        assert_eq!(fuzzer.wait.wait().await, Ok(SessionVerdict::Failed));
        // No usable peer: the error surfaces so the process exits non-zero.
        let result = fuzzer.session.await.unwrap();
        assert!(matches!(result, Err(SessionError::ScanEnded)));
    }

    #[tokio::test(start_paused = true)]
    async fn connection_failure_notifies_fuzzer_and_surfaces_the_error() {
        let mut host = MockHost::new(MockConn::single_characteristic());
        host.refuse_connection = true;
        let mut fuzzer = spawn_session(host);

        // The fuzzer is still released with the terminal token, but the
        // session result carries the connection error for a non-zero exit.
        fuzzer.expect_text(TOKEN_END).await;
        assert_eq!(fuzzer.wait.wait().await, Ok(SessionVerdict::Failed));
        let result = fuzzer.session.await.unwrap();
        assert!(matches!(
            result,
            Err(SessionError::Host(HostError::Connect(_)))
        ));
    }

    #[tokio::test]
    async fn new_driver_starts_idle() {
        let (_fuzzer_tx, driver_rx) = duplex(64);
        let (driver_tx, _fuzzer_rx) = duplex(64);
        let driver = SessionDriver::new(
            MockHost::new(MockConn::single_characteristic()),
            FrameReader::new(driver_rx),
            FrameWriter::new(driver_tx),
            TransactionExecutor::new(Duration::from_millis(100), true, true),
            Duration::from_millis(10),
        );
        assert_eq!(driver.state(), SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn fuzzer_hangup_mid_negotiation_aborts_without_end_token() {
        let host = MockHost::new(MockConn::single_characteristic());
        let mut fuzzer = spawn_session(host);

        fuzzer.expect_text(PROMPT_COUNT).await;
        drop(fuzzer.outbound);

        // The pipe contract itself was violated; the driver propagates the
        // channel error but still releases the completion signal.
        assert_eq!(fuzzer.wait.wait().await, Ok(SessionVerdict::Failed));
        let result = fuzzer.session.await.unwrap();
        assert!(matches!(
            result,
            Err(SessionError::Channel(FrameError::Closed))
        ));
    }
}
