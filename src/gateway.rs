// On-demand connection lifecycle and the cooperative gateway tick.
// Numan Thabit 2025

use std::{
    io::{self, Read, Write},
    net::{TcpStream, ToSocketAddrs},
    sync::Arc,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::{
    config::{ConfigError, ConfigStore, DeviceConfig, DeviceIdentity},
    crypto::nonce::NonceSeq,
    metrics::Metrics,
    queue::TransmitQueue,
    report::MAX_REPORT_LEN,
    serial::{self, SerialBridge, NOT_READY_BYTE},
    session::{Session, SessionEvent},
    wire::{self, Cmd, GosterHdr, HDR_LEN, TRAILER_LEN},
};

/// TCP connect timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Ready with an empty queue for this long closes the socket.
pub const IDLE_CLOSE: Duration = Duration::from_secs(2);

/// Backoff after a failed connect attempt.
pub const CONNECT_BACKOFF: Duration = Duration::from_secs(2);

/// Backoff while the link layer reports down.
pub const LINK_DOWN_BACKOFF: Duration = Duration::from_secs(1);

/// Connect attempts are suppressed this long after serial traffic so a
/// sensor burst completes before the session opens.
pub const SERIAL_HOLDOFF: Duration = Duration::from_millis(500);

/// Default whole-device idle window before the sleep handoff.
pub const DEFAULT_SLEEP_IDLE: Duration = Duration::from_secs(10);

const SLEEP_IDLE_MIN: Duration = Duration::from_secs(2);
const SLEEP_IDLE_MAX: Duration = Duration::from_secs(10);

/// Link-layer collaborator: connectivity state and TCP stream factory.
/// Streams must be non-blocking; the tick never waits on IO.
pub trait Link {
    /// Stream type produced by [`Link::connect`].
    type Stream: Read + Write;

    /// Whether the underlying link is associated and has an address.
    fn is_up(&self) -> bool;

    /// Whether `host` currently resolves.
    fn resolvable(&self, host: &str) -> bool;

    /// Opens a TCP connection to the server.
    fn connect(&mut self, host: &str, port: u16, timeout: Duration) -> io::Result<Self::Stream>;
}

/// Wall-clock collaborator (NTP-backed on real devices).
pub trait TimeSource {
    /// Whether the clock has been synchronised since boot.
    fn time_valid(&self) -> bool;

    /// Current Unix timestamp in seconds.
    fn unix_timestamp(&self) -> u64;
}

/// [`Link`] over the host network stack.
#[derive(Debug, Default)]
pub struct TcpLink;

impl Link for TcpLink {
    type Stream = TcpStream;

    fn is_up(&self) -> bool {
        true
    }

    fn resolvable(&self, host: &str) -> bool {
        (host, 0u16).to_socket_addrs().is_ok()
    }

    fn connect(&mut self, host: &str, port: u16, timeout: Duration) -> io::Result<TcpStream> {
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "no address"))?;
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// [`TimeSource`] over the system clock. The clock is treated as valid
/// once it is past a fixed build-era floor, the same heuristic the device
/// applies before NTP settles.
#[derive(Debug, Default)]
pub struct SystemClock;

const CLOCK_VALID_FLOOR: u64 = 1_700_000_000; // 2023-11-14

impl TimeSource for SystemClock {
    fn time_valid(&self) -> bool {
        self.unix_timestamp() > CLOCK_VALID_FLOOR
    }

    fn unix_timestamp(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// Side effects surfaced to the caller; the gateway never touches
/// hardware itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    /// A valid sensor frame arrived (drive the activity LED).
    SensorFrame { cmd_id: u16 },
    /// Bytes to write back on the serial line toward the sensor MCU.
    SerialTx(Bytes),
    /// A server session opened and the handshake was sent.
    SessionOpened,
    /// The server socket closed.
    SessionClosed,
    /// Authentication was rejected; sending stays off until reset.
    AuthRejected { status: u8 },
    /// A server-issued token was persisted.
    TokenStored,
    /// Informational configuration push from the server.
    ConfigPushed(Bytes),
    /// No server address or Wi-Fi credentials; provisioning must run.
    ProvisioningRequired,
    /// Device idle; the sleep driver may enter deep sleep.
    SleepReady,
    /// Factory reset completed.
    FactoryReset,
}

/// The gateway core: serial bridge in, transmit queue, session machine,
/// short-lived server connections out.
///
/// Everything runs on one cooperative tick; no other context touches the
/// socket, the queue, or the session key material.
pub struct Gateway<L: Link, C: ConfigStore, T: TimeSource> {
    link: L,
    store: C,
    time: T,
    identity: DeviceIdentity,
    metrics: Arc<Metrics>,
    session: Session,
    queue: TransmitQueue,
    bridge: SerialBridge,
    serial_nonce: NonceSeq,
    stream: Option<L::Stream>,
    rx_buf: Vec<u8>,
    active_config: Option<DeviceConfig>,
    auth_latched: bool,
    retry_after: Option<Instant>,
    last_serial_rx: Option<Instant>,
    last_session_activity: Option<Instant>,
    last_device_activity: Option<Instant>,
    sleep_idle: Duration,
}

impl<L: Link, C: ConfigStore, T: TimeSource> Gateway<L, C, T> {
    /// Creates a gateway with an empty queue and no connection.
    pub fn new(
        link: L,
        store: C,
        time: T,
        identity: DeviceIdentity,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            link,
            store,
            time,
            identity,
            metrics,
            session: Session::new(),
            queue: TransmitQueue::new(),
            bridge: SerialBridge::new(),
            serial_nonce: NonceSeq::new(),
            stream: None,
            rx_buf: Vec::with_capacity(1024),
            active_config: None,
            auth_latched: false,
            retry_after: None,
            last_serial_rx: None,
            last_session_activity: None,
            last_device_activity: None,
            sleep_idle: DEFAULT_SLEEP_IDLE,
        }
    }

    /// Overrides the whole-device idle window, clamped to 2..=10 s.
    #[must_use]
    pub fn with_sleep_idle(mut self, idle: Duration) -> Self {
        self.sleep_idle = idle.clamp(SLEEP_IDLE_MIN, SLEEP_IDLE_MAX);
        self
    }

    /// Returns `true` while a server socket is open.
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Pending transmit queue entries.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Enqueues an uplink payload produced locally (diagnostics, self-test).
    /// Oversized payloads are refused.
    pub fn enqueue_report(&mut self, cmd_id: u16, payload: Bytes, now: Instant) -> bool {
        if payload.len() > MAX_REPORT_LEN {
            warn!(len = payload.len(), "refusing oversized report payload");
            return false;
        }
        if self.queue.enqueue(cmd_id, payload).is_some() {
            self.metrics.queue_evictions.inc();
        }
        self.metrics.queue_depth.set(self.queue.len() as i64);
        self.last_device_activity = Some(now);
        true
    }

    /// Feeds raw bytes read from the sensor UART.
    ///
    /// Valid report frames land in the transmit queue; a wake sentinel
    /// produces the serial reply bytes as a [`GatewayEvent::SerialTx`].
    pub fn on_serial_bytes(&mut self, chunk: &[u8], now: Instant) -> Vec<GatewayEvent> {
        let mut events = Vec::new();
        if chunk.is_empty() {
            return events;
        }

        let Self {
            bridge,
            queue,
            metrics,
            ..
        } = self;

        let mut accepted: Vec<u16> = Vec::new();
        let progress = bridge.push_bytes(chunk, |cmd_id, payload| {
            if !Cmd::is_uplink_report(cmd_id) {
                debug!(cmd_id, "ignoring non-report serial command");
                return;
            }
            if payload.len() > MAX_REPORT_LEN {
                warn!(cmd_id, len = payload.len(), "dropping oversized serial report");
                return;
            }
            if queue.enqueue(cmd_id, Bytes::copy_from_slice(payload)).is_some() {
                metrics.queue_evictions.inc();
            }
            accepted.push(cmd_id);
        });

        self.metrics.serial_frames.inc_by(progress.frames as u64);
        self.metrics.serial_rejects.inc_by(progress.rejected as u64);
        self.metrics.wake_signals.inc_by(progress.wakes as u64);
        self.metrics.queue_depth.set(self.queue.len() as i64);

        self.last_serial_rx = Some(now);
        self.last_device_activity = Some(now);

        for cmd_id in accepted {
            events.push(GatewayEvent::SensorFrame { cmd_id });
        }
        for _ in 0..progress.wakes {
            events.push(GatewayEvent::SerialTx(self.wake_reply()));
        }
        events
    }

    /// Advances the gateway by one cooperative tick: service server RX,
    /// drive the connection lifecycle, emit at most one queued frame,
    /// apply the idle-close and sleep policies.
    pub fn tick(&mut self, now: Instant) -> Vec<GatewayEvent> {
        let mut events = Vec::new();
        self.last_device_activity.get_or_insert(now);

        self.service_rx(now, &mut events);
        self.advance_lifecycle(now, &mut events);
        self.flush_one(now, &mut events);
        self.maybe_idle_close(now, &mut events);
        self.maybe_sleep(now, &mut events);
        events
    }

    /// Clears the persisted namespace, the queue, and any open session.
    pub fn factory_reset(&mut self) -> Result<Vec<GatewayEvent>, ConfigError> {
        info!("factory reset requested");
        self.store.clear()?;
        self.queue.clear();
        self.metrics.queue_depth.set(0);
        self.auth_latched = false;
        self.retry_after = None;

        let mut events = Vec::new();
        self.drop_connection(&mut events);
        events.push(GatewayEvent::FactoryReset);
        Ok(events)
    }

    fn wake_reply(&mut self) -> Bytes {
        if !self.time.time_valid() {
            debug!("wake sentinel before time sync, replying not-ready");
            return Bytes::from(vec![NOT_READY_BYTE]);
        }

        let ts = self.time.unix_timestamp();
        let nonce = self.next_serial_nonce();
        match wire::encode_plain(Cmd::TimeSync.into(), 0, nonce, &ts.to_le_bytes()) {
            Ok(frame) => Bytes::from(serial::encode_serial_frame(&frame)),
            Err(err) => {
                // An 8-byte payload cannot exceed the cap; fall back anyway.
                warn!(%err, "time-sync encode failed");
                Bytes::from(vec![NOT_READY_BYTE])
            }
        }
    }

    fn next_serial_nonce(&mut self) -> [u8; 12] {
        match self.serial_nonce.next() {
            Ok(nonce) => nonce,
            Err(_) => {
                self.serial_nonce = NonceSeq::new();
                self.serial_nonce.next().unwrap_or([0u8; 12])
            }
        }
    }

    fn service_rx(&mut self, now: Instant, events: &mut Vec<GatewayEvent>) {
        enum Outcome {
            Open,
            Closed,
        }

        if self.stream.is_none() {
            return;
        }

        let mut chunk = [0u8; 1024];
        let outcome = loop {
            let Some(stream) = self.stream.as_mut() else {
                return;
            };
            match stream.read(&mut chunk) {
                Ok(0) => {
                    info!("server closed the connection");
                    break Outcome::Closed;
                }
                Ok(n) => self.rx_buf.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break Outcome::Open,
                Err(err) => {
                    warn!(%err, "server read error");
                    break Outcome::Closed;
                }
            }
        };

        if matches!(outcome, Outcome::Closed) {
            self.drop_connection(events);
            return;
        }

        while self.rx_buf.len() >= HDR_LEN {
            let header = match GosterHdr::parse(&self.rx_buf[..HDR_LEN]) {
                Ok(header) => header,
                Err(err) => {
                    warn!(%err, "protocol violation in server stream");
                    self.metrics.protocol_violations.inc();
                    self.drop_connection(events);
                    return;
                }
            };

            let total = HDR_LEN + header.length as usize + TRAILER_LEN;
            if self.rx_buf.len() < total {
                break;
            }

            let frame: Vec<u8> = self.rx_buf.drain(..total).collect();
            self.metrics.frames_rx.inc();
            if !self.dispatch_frame(&frame, now, events) {
                self.drop_connection(events);
                return;
            }
        }
    }

    fn dispatch_frame(&mut self, frame: &[u8], now: Instant, events: &mut Vec<GatewayEvent>) -> bool {
        let config = match &self.active_config {
            Some(config) => config.clone(),
            None => self.store.load().unwrap_or_default(),
        };

        let (event, reply) = match self.session.handle_frame(frame, &config, &self.identity) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(%err, "dropping session");
                self.metrics.protocol_violations.inc();
                return false;
            }
        };

        if let Some(reply) = reply {
            if !self.write_all_now(&reply) {
                return false;
            }
        }
        self.last_session_activity = Some(now);
        self.last_device_activity = Some(now);

        match event {
            SessionEvent::None => {}
            SessionEvent::Ready { token } => {
                if let Some(token) = token {
                    match self.store.save_token(&token) {
                        Ok(()) => events.push(GatewayEvent::TokenStored),
                        Err(err) => warn!(%err, "failed to persist device token"),
                    }
                }
            }
            SessionEvent::AuthRejected { status } => {
                self.metrics.auth_rejects.inc();
                self.queue.clear();
                self.metrics.queue_depth.set(0);
                self.auth_latched = true;
                events.push(GatewayEvent::AuthRejected { status });
                return false;
            }
            SessionEvent::ReportAcked => {
                // Entries pop when written; the echo must not pop a second
                // time or a pending entry is discarded unsent.
                debug!("server acknowledged a report");
            }
            SessionEvent::ConfigPushed(data) => {
                events.push(GatewayEvent::ConfigPushed(Bytes::from(data)));
            }
        }
        true
    }

    fn advance_lifecycle(&mut self, now: Instant, events: &mut Vec<GatewayEvent>) {
        if self.stream.is_some() || self.queue.is_empty() || self.auth_latched {
            return;
        }
        if let Some(at) = self.retry_after {
            if now < at {
                return;
            }
        }
        if let Some(rx) = self.last_serial_rx {
            if now.duration_since(rx) < SERIAL_HOLDOFF {
                return;
            }
        }
        if !self.link.is_up() {
            self.retry_after = Some(now + LINK_DOWN_BACKOFF);
            return;
        }

        let config = match self.store.load() {
            Ok(config) => config,
            Err(err) => {
                warn!(%err, "config load failed");
                self.retry_after = Some(now + CONNECT_BACKOFF);
                return;
            }
        };
        if !config.is_provisioned() {
            events.push(GatewayEvent::ProvisioningRequired);
            self.retry_after = Some(now + CONNECT_BACKOFF);
            return;
        }
        if !self.link.resolvable(&config.srv_ip) {
            debug!(host = %config.srv_ip, "server not resolvable");
            self.retry_after = Some(now + LINK_DOWN_BACKOFF);
            return;
        }

        info!(host = %config.srv_ip, port = config.srv_port, "opening server session");
        match self.link.connect(&config.srv_ip, config.srv_port, CONNECT_TIMEOUT) {
            Ok(stream) => {
                self.stream = Some(stream);
                self.rx_buf.clear();
                self.retry_after = None;
                self.active_config = Some(config);
                self.metrics.sessions_opened.inc();
                self.last_session_activity = Some(now);
                self.last_device_activity = Some(now);

                match self.session.start() {
                    Ok(frame) => {
                        if self.write_all_now(&frame) {
                            events.push(GatewayEvent::SessionOpened);
                        } else {
                            self.drop_connection(events);
                            self.retry_after = Some(now + CONNECT_BACKOFF);
                        }
                    }
                    Err(err) => {
                        warn!(%err, "handshake start failed");
                        self.drop_connection(events);
                        self.retry_after = Some(now + CONNECT_BACKOFF);
                    }
                }
            }
            Err(err) => {
                warn!(%err, "server connect failed");
                self.metrics.connect_failures.inc();
                self.retry_after = Some(now + CONNECT_BACKOFF);
            }
        }
    }

    fn flush_one(&mut self, now: Instant, events: &mut Vec<GatewayEvent>) {
        if !self.session.is_ready() || self.stream.is_none() {
            return;
        }
        let Some((cmd_id, payload)) = self.queue.peek_front().cloned() else {
            return;
        };

        match self.session.seal_report(cmd_id, &payload) {
            Ok(frame) => {
                if self.write_all_now(&frame) {
                    // Deemed transmitted; this is the only place entries pop.
                    self.queue.pop_front();
                    self.metrics.queue_depth.set(self.queue.len() as i64);
                    self.last_session_activity = Some(now);
                    self.last_device_activity = Some(now);
                } else {
                    self.drop_connection(events);
                    self.retry_after = Some(now + CONNECT_BACKOFF);
                }
            }
            Err(err) => {
                warn!(%err, "seal failed, closing session");
                self.drop_connection(events);
            }
        }
    }

    fn maybe_idle_close(&mut self, now: Instant, events: &mut Vec<GatewayEvent>) {
        if self.stream.is_none() || !self.session.is_ready() || !self.queue.is_empty() {
            return;
        }
        if let Some(last) = self.last_session_activity {
            if now.duration_since(last) >= IDLE_CLOSE {
                info!("queue drained and idle, closing session");
                self.drop_connection(events);
            }
        }
    }

    fn maybe_sleep(&mut self, now: Instant, events: &mut Vec<GatewayEvent>) {
        if self.stream.is_some() || !self.queue.is_empty() {
            return;
        }
        if let Some(last) = self.last_device_activity {
            if now.duration_since(last) >= self.sleep_idle {
                debug!("device idle, sleep handoff");
                events.push(GatewayEvent::SleepReady);
                self.last_device_activity = Some(now);
            }
        }
    }

    fn drop_connection(&mut self, events: &mut Vec<GatewayEvent>) {
        if self.stream.take().is_some() {
            self.metrics.sessions_closed.inc();
            events.push(GatewayEvent::SessionClosed);
        }
        self.rx_buf.clear();
        self.session.reset();
        self.active_config = None;
    }

    fn write_all_now(&mut self, bytes: &[u8]) -> bool {
        let Some(stream) = self.stream.as_mut() else {
            return false;
        };
        // Partial writes are not retried; the server rejects the torn
        // frame by CRC or tag and the session restarts clean.
        match stream.write_all(bytes).and_then(|()| stream.flush()) {
            Ok(()) => {
                self.metrics.frames_tx.inc();
                true
            }
            Err(err) => {
                warn!(%err, "server write failed");
                false
            }
        }
    }
}
