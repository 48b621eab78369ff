use crate::config::{DaemonConfig, HeartbeatConfig, NetworkPrinterConfig};
use crate::errors::{PrinterError, Result};
use crate::events::{ConnectionEvent, TransportKind, EVENT_CHANNEL_CAPACITY};
use crate::heartbeat::Heartbeat;
use crate::status::{ConnectionState, ReportedPrinterStatus, STATUS_POLL_COMMAND};
use async_trait::async_trait;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Print payloads are written to the socket in slices of this size.
pub const PRINT_CHUNK_SIZE: usize = 1024;

/// How long an explicit disconnect waits for queued writes to drain.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub trait PrinterStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> PrinterStream for T {}

pub type BoxedStream = Box<dyn PrinterStream>;

/// Opens the byte stream to a network printer.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, host: &str, port: u16) -> io::Result<BoxedStream>;
}

/// Raw TCP (port 9100 style) dialer with connect timeout and keepalive.
pub struct TcpDialer {
    connect_timeout: Duration,
    keepalive: Duration,
}

impl TcpDialer {
    pub fn new(connect_timeout: Duration, keepalive: Duration) -> Self {
        Self {
            connect_timeout,
            keepalive,
        }
    }

    pub fn from_config(config: &NetworkPrinterConfig) -> Self {
        Self::new(config.connect_timeout(), config.keepalive())
    }

    /// Configure TCP keepalive so the OS also notices a dead peer.
    fn set_tcp_keepalive(&self, stream: &TcpStream) {
        let keepalive = socket2::TcpKeepalive::new()
            .with_time(self.keepalive)
            .with_interval(Duration::from_secs(10));

        if let Err(e) = socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive) {
            debug!("Failed to set TCP keepalive: {} (non-fatal)", e);
        }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, host: &str, port: u16) -> io::Result<BoxedStream> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {}:{} timed out", host, port),
                )
            })??;

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {} (non-fatal)", e);
        }
        self.set_tcp_keepalive(&stream);

        Ok(Box::new(stream))
    }
}

/// Split a payload into socket-sized slices, preserving byte order.
pub fn chunk_payload(payload: &[u8]) -> std::slice::Chunks<'_, u8> {
    payload.chunks(PRINT_CHUNK_SIZE)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One live socket: the writer queue plus the tasks pumping each half.
struct Session {
    epoch: u64,
    frames: mpsc::UnboundedSender<Vec<u8>>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl Session {
    fn abort(self) {
        self.reader_task.abort();
        self.writer_task.abort();
    }

    /// Let queued frames reach the socket, then close it.
    async fn close_gracefully(self) {
        let Session {
            frames,
            reader_task,
            writer_task,
            ..
        } = self;
        drop(frames);
        let abort = writer_task.abort_handle();
        if tokio::time::timeout(DRAIN_TIMEOUT, writer_task).await.is_err() {
            warn!("Network printer did not accept queued data in time, dropping it");
            abort.abort();
        }
        reader_task.abort();
    }
}

/// Owns one TCP session to a network receipt printer.
///
/// Cheap to clone; all clones drive the same connection. Liveness is tracked
/// with a DLE EOT status poll on every heartbeat tick: inbound bytes of any
/// kind count as activity, silence past the heartbeat timeout or a failed
/// write forces a disconnect followed by a retry.
#[derive(Clone)]
pub struct NetworkPrinterConnection {
    inner: Arc<Inner>,
}

struct Inner {
    config: NetworkPrinterConfig,
    address: String,
    retry_delay: Duration,
    dialer: Arc<dyn Dialer>,
    state: watch::Sender<ConnectionState>,
    /// Identifies the current connection attempt. Every transition out of
    /// `Connecting`/`Connected` bumps it, which leaves older timers and
    /// tasks without effect.
    epoch: AtomicU64,
    events: broadcast::Sender<ConnectionEvent>,
    heartbeat: Heartbeat,
    status: Mutex<Option<ReportedPrinterStatus>>,
    session: Mutex<Option<Session>>,
    retry: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkPrinterConnection {
    pub fn new(
        config: NetworkPrinterConfig,
        heartbeat: &HeartbeatConfig,
        retry_delay: Duration,
        dialer: Arc<dyn Dialer>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                address: config.address(),
                config,
                retry_delay,
                dialer,
                state,
                epoch: AtomicU64::new(0),
                events,
                heartbeat: Heartbeat::from_config(heartbeat),
                status: Mutex::new(None),
                session: Mutex::new(None),
                retry: Mutex::new(None),
            }),
        }
    }

    /// Network transport over raw TCP, or `None` when no host is configured.
    pub fn from_config(config: &DaemonConfig) -> Option<Self> {
        let network = config.network.clone()?;
        let dialer = Arc::new(TcpDialer::from_config(&network));
        Some(Self::new(network, &config.heartbeat, config.retry_delay(), dialer))
    }

    pub fn kind(&self) -> TransportKind {
        TransportKind::Network
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Last decoded status reply, if the printer ever sent one.
    pub fn reported_status(&self) -> Option<ReportedPrinterStatus> {
        *lock(&self.inner.status)
    }

    pub fn is_heartbeat_running(&self) -> bool {
        self.inner.heartbeat.is_running()
    }

    pub fn is_retry_scheduled(&self) -> bool {
        lock(&self.inner.retry)
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    /// Open the socket. Resolves once connected, rejects if the attempt fails.
    ///
    /// A no-op while already connecting or connected. Unreachable-peer
    /// failures (refused, timed out, ...) additionally schedule a retry.
    #[tracing::instrument(skip(self), fields(address = %self.inner.address))]
    pub async fn connect(&self) -> Result<()> {
        self.inner.connect().await
    }

    /// Tear down the session on request. Pending retries are cancelled and
    /// no new one is scheduled.
    #[tracing::instrument(skip(self), fields(address = %self.inner.address))]
    pub async fn disconnect(&self) {
        self.inner.disconnect().await
    }

    /// Drop the session because the peer is considered dead, then schedule a retry.
    pub fn force_disconnect(&self, reason: &str) {
        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        self.inner.force_disconnect(epoch, reason);
    }

    /// Queue `payload` for the socket in 1024-byte chunks.
    ///
    /// Fire-and-forget: a failing write shows up later as a forced
    /// disconnect, never as a result of this call.
    pub fn print(&self, payload: &[u8]) {
        if !self.state().is_usable() {
            error!("Cannot print: Not connected to network printer.");
            return;
        }

        let session = lock(&self.inner.session);
        let Some(session) = session.as_ref() else {
            error!("Cannot print: Not connected to network printer.");
            return;
        };

        let mut queued = 0;
        for chunk in chunk_payload(payload) {
            if session.frames.send(chunk.to_vec()).is_err() {
                warn!("Network printer writer stopped after {} chunks", queued);
                return;
            }
            queued += 1;
        }
        debug!("Queued {} bytes in {} chunks for {}", payload.len(), queued, self.inner.address);
    }
}

impl Inner {
    fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    async fn connect(self: &Arc<Self>) -> Result<()> {
        let result = self.attempt().await;
        if let Err(e) = &result {
            if e.is_retryable() {
                self.schedule_retry();
            }
        }
        result
    }

    async fn attempt(self: &Arc<Self>) -> Result<()> {
        let mut epoch = 0;
        let started = self.state.send_if_modified(|state| {
            if state.is_busy() {
                return false;
            }
            epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
            *state = ConnectionState::Connecting;
            true
        });
        if !started {
            info!("Already connected to network printer.");
            return Ok(());
        }

        info!("Connecting to network printer at {}", self.address);
        match self.dialer.dial(&self.config.host, self.config.port).await {
            Ok(stream) => self.open_session(epoch, stream),
            Err(e) => Err(self.fail_connect(epoch, e)),
        }
    }

    fn open_session(self: &Arc<Self>, epoch: u64, stream: BoxedStream) -> Result<()> {
        let (reader, writer) = tokio::io::split(stream);
        let (frames, frames_rx) = mpsc::unbounded_channel();
        let reader_task = tokio::spawn(read_loop(Arc::downgrade(self), epoch, reader));
        let writer_task = tokio::spawn(write_loop(Arc::downgrade(self), epoch, writer, frames_rx));
        let mut pending = Some(Session {
            epoch,
            frames,
            reader_task,
            writer_task,
        });

        // Install and publish in one step; a superseded dial keeps its
        // session local.
        let live = self.state.send_if_modified(|state| {
            if self.current_epoch() != epoch || *state != ConnectionState::Connecting {
                return false;
            }
            *lock(&self.session) = pending.take();
            *state = ConnectionState::Connected;
            true
        });
        if let Some(stale) = pending {
            debug!("Dropping superseded connection to {}", self.address);
            stale.abort();
        }
        if !live {
            return Err(PrinterError::ConnectionClosed(
                "connection closed during handshake".to_string(),
            ));
        }

        info!("Connected to network printer at {}", self.address);
        self.heartbeat.beat();
        let weak = Arc::downgrade(self);
        self.heartbeat.start(move |late| {
            if let Some(inner) = weak.upgrade() {
                inner.on_heartbeat(epoch, late);
            }
        });
        self.emit(ConnectionEvent::Connected);
        Ok(())
    }

    fn fail_connect(&self, epoch: u64, cause: io::Error) -> PrinterError {
        let err = if cause.kind() == io::ErrorKind::TimedOut {
            PrinterError::ConnectTimeout
        } else {
            PrinterError::Io(cause)
        };
        let timed_out = matches!(err, PrinterError::ConnectTimeout);

        let applied = self.state.send_if_modified(|state| {
            if self.current_epoch() != epoch || *state != ConnectionState::Connecting {
                return false;
            }
            *state = if timed_out {
                ConnectionState::Timeout
            } else {
                ConnectionState::Error
            };
            true
        });
        if !applied {
            debug!("Connect attempt to {} was superseded: {}", self.address, err);
            return PrinterError::ConnectionClosed("connect attempt superseded".to_string());
        }

        if err.is_connection_refused() {
            info!("Network printer at {} refused the connection", self.address);
        } else {
            warn!("Failed to connect to network printer at {}: {}", self.address, err);
        }
        if timed_out {
            self.emit(ConnectionEvent::Timeout);
        }
        self.emit(ConnectionEvent::Error(Arc::new(err.duplicate())));
        err
    }

    fn schedule_retry(self: &Arc<Self>) {
        let mut slot = lock(&self.retry);
        if slot.as_ref().map_or(false, |handle| !handle.is_finished()) {
            debug!("Retry for {} already scheduled", self.address);
            return;
        }

        let delay = self.retry_delay;
        info!("Will retry network printer at {} in {}s", self.address, delay.as_secs());
        let weak = Arc::downgrade(self);
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            // Free the slot so a failing attempt can schedule the next one
            lock(&inner.retry).take();
            inner.safe_connect().await;
        }));
    }

    /// Reconnect attempt whose failure is only logged.
    async fn safe_connect(self: &Arc<Self>) {
        if let Err(e) = self.connect().await {
            debug!("Retry to {} failed: {}", self.address, e);
        }
    }

    fn cancel_retry(&self) {
        if let Some(handle) = lock(&self.retry).take() {
            handle.abort();
        }
    }

    fn take_session(&self, epoch: u64) -> Option<Session> {
        let mut session = lock(&self.session);
        match session.as_ref() {
            Some(s) if s.epoch == epoch => session.take(),
            _ => None,
        }
    }

    fn drop_session(&self, epoch: u64) {
        if let Some(session) = self.take_session(epoch) {
            session.abort();
        }
    }

    /// Leave `Connecting`/`Connected` for `next`. Returns the epoch that was
    /// left, or `None` if `epoch` is stale or the transport is not live.
    fn leave_session(&self, epoch: Option<u64>, next: ConnectionState) -> Option<u64> {
        let mut left = None;
        self.state.send_if_modified(|state| {
            let current = self.current_epoch();
            if epoch.map_or(false, |e| e != current) || !state.is_busy() {
                return false;
            }
            self.epoch.fetch_add(1, Ordering::SeqCst);
            left = Some(current);
            *state = next;
            true
        });
        left
    }

    fn force_disconnect(self: &Arc<Self>, epoch: u64, reason: &str) {
        let Some(left) = self.leave_session(Some(epoch), ConnectionState::Disconnected) else {
            debug!("Ignoring forced disconnect ({}): session already gone", reason);
            return;
        };

        warn!("Forcing disconnect from network printer at {}: {}", self.address, reason);
        self.heartbeat.stop();
        self.drop_session(left);
        self.emit(ConnectionEvent::Disconnected { expected: false });
        self.schedule_retry();
    }

    async fn disconnect(&self) {
        self.cancel_retry();

        let left = self.leave_session(None, ConnectionState::Disconnected);
        self.heartbeat.stop();

        let Some(left) = left else {
            debug!("Network printer at {} already disconnected", self.address);
            return;
        };

        if let Some(session) = self.take_session(left) {
            session.close_gracefully().await;
        }
        info!("Disconnected from network printer at {}", self.address);
        self.emit(ConnectionEvent::Disconnected { expected: true });
    }

    fn on_heartbeat(self: &Arc<Self>, epoch: u64, late: bool) {
        if self.current_epoch() != epoch || !self.state.borrow().is_usable() {
            return;
        }

        if late {
            self.force_disconnect(epoch, "no data received within heartbeat timeout");
            return;
        }

        let queued = lock(&self.session)
            .as_ref()
            .filter(|s| s.epoch == epoch)
            .map_or(false, |s| s.frames.send(STATUS_POLL_COMMAND.to_vec()).is_ok());
        if queued {
            debug!("Polled status of network printer at {}", self.address);
        } else {
            self.force_disconnect(epoch, "status poll could not be queued");
        }
    }

    fn on_data(&self, epoch: u64, chunk: &[u8]) {
        if self.current_epoch() != epoch {
            return;
        }
        self.heartbeat.beat();

        if let Some(status) = ReportedPrinterStatus::from_chunk(chunk) {
            let changed = lock(&self.status).replace(status) != Some(status);
            if changed {
                info!(
                    "Network printer status: online={}, waiting_for_online_recovery={}",
                    status.online, status.waiting_for_online_recovery
                );
            }
            self.emit(ConnectionEvent::Status(status));
        }
        self.emit(ConnectionEvent::Data(chunk.to_vec()));
    }

    fn on_closed(self: &Arc<Self>, epoch: u64, cause: Option<io::Error>) {
        let next = if cause.is_some() {
            ConnectionState::Error
        } else {
            ConnectionState::Disconnected
        };
        let Some(left) = self.leave_session(Some(epoch), next) else {
            return;
        };

        self.heartbeat.stop();
        self.drop_session(left);
        match cause {
            Some(e) => {
                warn!("Network printer connection error: {}", e);
                self.emit(ConnectionEvent::Error(Arc::new(PrinterError::Io(e))));
            }
            None => info!("Network printer at {} closed the connection", self.address),
        }
        self.emit(ConnectionEvent::Disconnected { expected: false });
        self.schedule_retry();
    }

    fn on_write_failed(self: &Arc<Self>, epoch: u64, cause: io::Error) {
        if self.current_epoch() != epoch {
            return;
        }
        warn!("Write to network printer at {} failed: {}", self.address, cause);
        self.emit(ConnectionEvent::Error(Arc::new(PrinterError::Io(cause))));
        self.force_disconnect(epoch, "write failed");
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.retry).take() {
            handle.abort();
        }
        if let Some(session) = lock(&self.session).take() {
            session.abort();
        }
    }
}

async fn read_loop(inner: Weak<Inner>, epoch: u64, mut reader: ReadHalf<BoxedStream>) {
    let mut buf = vec![0u8; PRINT_CHUNK_SIZE];
    loop {
        let result = reader.read(&mut buf).await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match result {
            Ok(0) => {
                inner.on_closed(epoch, None);
                return;
            }
            Ok(n) => inner.on_data(epoch, &buf[..n]),
            Err(e) => {
                inner.on_closed(epoch, Some(e));
                return;
            }
        }
    }
}

async fn write_loop(
    inner: Weak<Inner>,
    epoch: u64,
    mut writer: WriteHalf<BoxedStream>,
    mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(frame) = frames.recv().await {
        let written = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = written {
            if let Some(inner) = inner.upgrade() {
                inner.on_write_failed(epoch, e);
            }
            return;
        }
    }

    if let Err(e) = writer.shutdown().await {
        debug!("Socket shutdown failed: {} (non-fatal)", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunks_rejoin_to_original() {
        for len in [0usize, 1, 1023, 1024, 1025, 2048, 4097, 10_000] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let chunks: Vec<&[u8]> = chunk_payload(&payload).collect();

            assert!(chunks.iter().all(|c| c.len() <= PRINT_CHUNK_SIZE));
            assert_eq!(chunks.len(), len.div_ceil(PRINT_CHUNK_SIZE));
            assert_eq!(chunks.concat(), payload, "length {}", len);
        }
    }

    #[test]
    fn test_only_last_chunk_is_short() {
        let payload = vec![0xAB; 2500];
        let sizes: Vec<usize> = chunk_payload(&payload).map(<[u8]>::len).collect();
        assert_eq!(sizes, vec![1024, 1024, 452]);
    }
}
