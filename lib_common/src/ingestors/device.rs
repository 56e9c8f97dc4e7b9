//! # Serial Device
//!
//! One task per physical sensor gateway. The task owns the whole link
//! lifecycle: find a port, claim it, open it, read newline framed lines, and
//! start over with a growing delay when the link goes away.
//!
//! Lines are not forwarded from here. They are wrapped in a [`LineEnvelope`]
//! and pushed onto a queue shared by all devices; the forwarder drains that
//! queue at its own pace. A full queue costs lines, never a stalled port.
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::serial::{partition_ports, SerialBackend, SerialError, SerialStream};
use crate::core::{Backoff, PortRegistry};

/// Settings of one device task.
#[derive(Debug, Clone)]
pub struct SerialDeviceConfig {
    /// Owner name used in the port registry and in logs.
    pub name: String,
    /// Fixed port. `None` picks the first free USB port.
    pub port: Option<String>,
    pub baud_rate: u32,
    /// Longer lines are discarded.
    pub max_line_length: usize,
    /// First reconnect delay.
    pub reconnect_delay: Duration,
    /// Reconnect delay cap.
    pub reconnect_max_delay: Duration,
    /// Silence after which the link is treated as lost.
    pub idle_timeout: Option<Duration>,
}

impl Default for SerialDeviceConfig {
    fn default() -> Self {
        Self {
            name: "serial-0".to_string(),
            port: None,
            baud_rate: 9600,
            max_line_length: 256,
            reconnect_delay: Duration::from_secs(5),
            reconnect_max_delay: Duration::from_secs(60),
            idle_timeout: None,
        }
    }
}

/// Link state, published on a watch channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connected {
        /// The open port.
        port: String,
    },
}

/// A raw line plus where and when it was read.
#[derive(Debug, Clone, PartialEq)]
pub struct LineEnvelope {
    /// Port the line came from.
    pub port: String,
    /// Fresh per connection.
    pub session: Uuid,
    /// 1-based line counter within the session.
    pub seq: u64,
    /// The line without its terminator.
    pub line: String,
    /// Read time, used as the reading's timestamp.
    pub captured_at: DateTime<Utc>,
}

impl LineEnvelope {
    /// Key the server uses to recognise a resent line.
    pub fn idempotency_key(&self) -> String {
        format!("{}-{}", self.session, self.seq)
    }
}

enum ReadOutcome {
    Cancelled,
    QueueClosed,
    LinkLost(String),
}

/// A serial device task. Build it, then hand it to `tokio::spawn(device.run(token))`.
pub struct SerialDevice {
    config: SerialDeviceConfig,
    backend: Arc<dyn SerialBackend>,
    registry: PortRegistry,
    queue: mpsc::Sender<LineEnvelope>,
    state: watch::Sender<LinkState>,
    current_port: Option<String>,
    dropped: Arc<AtomicU64>,
}

impl SerialDevice {
    pub fn new(
        config: SerialDeviceConfig,
        backend: Arc<dyn SerialBackend>,
        registry: PortRegistry,
        queue: mpsc::Sender<LineEnvelope>,
    ) -> Self {
        let (state, _) = watch::channel(LinkState::Disconnected);
        Self {
            config,
            backend,
            registry,
            queue,
            state,
            current_port: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Follows link state changes.
    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    /// Shared counter of lines lost to a full queue.
    pub fn dropped_lines(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.dropped)
    }

    /// Claims and opens a port. On failure the claim is released and an
    /// unpinned device forgets the port so the next attempt rediscovers.
    pub fn connect(&mut self) -> Result<(String, SerialStream), SerialError> {
        let port = match (&self.config.port, &self.current_port) {
            (Some(pinned), _) => pinned.clone(),
            (None, Some(known)) => known.clone(),
            (None, None) => self.discover()?,
        };

        if !self.registry.claim(&port, &self.config.name) {
            if self.config.port.is_none() {
                self.current_port = None;
            }
            return Err(SerialError::PortBusy(port));
        }

        match self.backend.open(&port, self.config.baud_rate) {
            Ok(stream) => {
                self.current_port = Some(port.clone());
                Ok((port, stream))
            }
            Err(e) => {
                self.registry.release(&port);
                if self.config.port.is_none() {
                    self.current_port = None;
                }
                Err(e)
            }
        }
    }

    fn discover(&self) -> Result<String, SerialError> {
        let (usb, _) = partition_ports(self.backend.available_ports()?);
        usb.into_iter()
            .find(|p| !self.registry.is_reserved_for_other(&p.path, &self.config.name))
            .map(|p| p.path)
            .ok_or(SerialError::NoPortAvailable)
    }

    /// Connect, read, reconnect until `cancel` fires or the queue closes.
    pub async fn run(mut self, cancel: CancellationToken) {
        let name = self.config.name.clone();
        let mut backoff = Backoff::new(self.config.reconnect_delay, self.config.reconnect_max_delay);

        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self.connect() {
                Ok((port, stream)) => {
                    backoff.reset();
                    log::info!("{}: connected to {} at {} baud", name, port, self.config.baud_rate);
                    self.state.send_replace(LinkState::Connected { port: port.clone() });

                    let outcome = self.read_lines(&port, stream, &cancel).await;

                    self.registry.release(&port);
                    self.state.send_replace(LinkState::Disconnected);

                    match outcome {
                        ReadOutcome::Cancelled => break,
                        ReadOutcome::QueueClosed => {
                            log::warn!("{}: forward queue closed, stopping", name);
                            break;
                        }
                        ReadOutcome::LinkLost(reason) => {
                            log::warn!("{}: lost {}: {}", name, port, reason);
                        }
                    }
                }
                Err(e) => log::warn!("{}: connect failed: {}", name, e),
            }

            let delay = backoff.next_delay();
            log::info!("{}: reconnecting in {:?}", name, delay);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }

        self.state.send_replace(LinkState::Disconnected);
        log::info!("{}: stopped", name);
    }

    async fn read_lines(&self, port: &str, stream: SerialStream, cancel: &CancellationToken) -> ReadOutcome {
        let mut lines = FramedRead::new(stream, LinesCodec::new_with_max_length(self.config.max_line_length));
        let session = Uuid::new_v4();
        let mut seq: u64 = 0;
        // FramedRead yields one `None` right after a decode error, then resumes
        // once more bytes arrive.
        let mut after_error = false;

        loop {
            let next = match self.config.idle_timeout {
                Some(idle) => tokio::select! {
                    _ = cancel.cancelled() => return ReadOutcome::Cancelled,
                    res = timeout(idle, lines.next()) => match res {
                        Ok(next) => next,
                        Err(_) => return ReadOutcome::LinkLost(format!("no data for {:?}", idle)),
                    },
                },
                None => tokio::select! {
                    _ = cancel.cancelled() => return ReadOutcome::Cancelled,
                    next = lines.next() => next,
                },
            };

            match next {
                Some(Ok(raw)) => {
                    after_error = false;
                    let line = raw.trim();
                    if line.is_empty() {
                        continue;
                    }
                    seq += 1;
                    let envelope = LineEnvelope {
                        port: port.to_string(),
                        session,
                        seq,
                        line: line.to_string(),
                        captured_at: Utc::now(),
                    };
                    match self.queue.try_send(envelope) {
                        Ok(()) => log::debug!("{}: queued line {} from {}", self.config.name, seq, port),
                        Err(TrySendError::Full(dropped)) => {
                            self.dropped.fetch_add(1, Ordering::Relaxed);
                            log::warn!(
                                "{}: forward queue full, dropping line {} ({})",
                                self.config.name,
                                dropped.seq,
                                dropped.line
                            );
                        }
                        Err(TrySendError::Closed(_)) => return ReadOutcome::QueueClosed,
                    }
                }
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    after_error = true;
                    log::warn!(
                        "{}: line longer than {} bytes on {} discarded",
                        self.config.name,
                        self.config.max_line_length,
                        port
                    );
                }
                Some(Err(LinesCodecError::Io(e))) if e.kind() == std::io::ErrorKind::InvalidData => {
                    after_error = true;
                    log::warn!("{}: undecodable line on {} discarded: {}", self.config.name, port, e);
                }
                Some(Err(LinesCodecError::Io(e))) => return ReadOutcome::LinkLost(e.to_string()),
                None if after_error => after_error = false,
                None => return ReadOutcome::LinkLost("end of stream".to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestors::serial::PortInfo;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};

    #[derive(Default)]
    struct MockBackend {
        ports: Vec<PortInfo>,
        streams: Mutex<HashMap<String, VecDeque<DuplexStream>>>,
    }

    impl MockBackend {
        fn with_ports(ports: Vec<PortInfo>) -> Self {
            Self {
                ports,
                ..Default::default()
            }
        }

        /// Queues a link for `path` and returns the far end to write into.
        fn plug(&self, path: &str) -> DuplexStream {
            let (near, far) = duplex(1024);
            self.streams
                .lock()
                .unwrap()
                .entry(path.to_string())
                .or_default()
                .push_back(near);
            far
        }
    }

    impl SerialBackend for MockBackend {
        fn available_ports(&self) -> Result<Vec<PortInfo>, SerialError> {
            Ok(self.ports.clone())
        }

        fn open(&self, path: &str, _baud_rate: u32) -> Result<SerialStream, SerialError> {
            let stream = self
                .streams
                .lock()
                .unwrap()
                .get_mut(path)
                .and_then(|q| q.pop_front())
                .ok_or_else(|| SerialError::Open {
                    port: path.to_string(),
                    reason: "unplugged".to_string(),
                })?;
            Ok(Box::new(stream))
        }
    }

    fn ports() -> Vec<PortInfo> {
        vec![PortInfo::new("/dev/ttyS0", false), PortInfo::new("/dev/ttyUSB0", false)]
    }

    fn device(
        backend: Arc<MockBackend>,
        registry: PortRegistry,
        config: SerialDeviceConfig,
        capacity: usize,
    ) -> (SerialDevice, mpsc::Receiver<LineEnvelope>) {
        let (tx, rx) = mpsc::channel(capacity);
        (SerialDevice::new(config, backend, registry, tx), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn lines_become_numbered_envelopes() {
        let backend = Arc::new(MockBackend::with_ports(ports()));
        let mut far = backend.plug("/dev/ttyUSB0");
        let registry = PortRegistry::new(Duration::ZERO);
        let (dev, mut rx) = device(backend, registry.clone(), SerialDeviceConfig::default(), 8);
        let cancel = CancellationToken::new();
        let join = tokio::spawn(dev.run(cancel.clone()));

        far.write_all(b"01LI42\r\n\n01HU55\n").await.unwrap();
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();

        assert_eq!(first.port, "/dev/ttyUSB0");
        assert_eq!(first.line, "01LI42");
        assert_eq!(first.seq, 1);
        assert_eq!(second.line, "01HU55");
        assert_eq!(second.seq, 2);
        assert_eq!(first.session, second.session);
        assert_eq!(first.idempotency_key(), format!("{}-1", first.session));
        assert!(registry.is_claimed("/dev/ttyUSB0"));

        cancel.cancel();
        join.await.unwrap();
        assert!(!registry.is_claimed("/dev/ttyUSB0"));
    }

    #[tokio::test(start_paused = true)]
    async fn overlong_lines_are_skipped() {
        let backend = Arc::new(MockBackend::with_ports(ports()));
        let mut far = backend.plug("/dev/ttyUSB0");
        let config = SerialDeviceConfig {
            max_line_length: 8,
            ..Default::default()
        };
        let (dev, mut rx) = device(backend, PortRegistry::new(Duration::ZERO), config, 8);
        let cancel = CancellationToken::new();
        tokio::spawn(dev.run(cancel.clone()));

        far.write_all(b"0123456789ABCDEF\n01LI1\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        far.write_all(b"01LI2\n").await.unwrap();

        let env = rx.recv().await.unwrap();
        assert_eq!(env.line, "01LI1");
        assert_eq!(env.seq, 1);
        assert_eq!(rx.recv().await.unwrap().line, "01LI2");
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_with_a_new_session_after_link_loss() {
        let backend = Arc::new(MockBackend::with_ports(ports()));
        let mut first_link = backend.plug("/dev/ttyUSB0");
        let mut second_link = backend.plug("/dev/ttyUSB0");
        let (dev, mut rx) = device(backend, PortRegistry::new(Duration::ZERO), SerialDeviceConfig::default(), 8);
        let mut state = dev.subscribe();
        let cancel = CancellationToken::new();
        tokio::spawn(dev.run(cancel.clone()));

        first_link.write_all(b"01LI1\n").await.unwrap();
        let a = rx.recv().await.unwrap();
        drop(first_link);

        state.wait_for(|s| *s == LinkState::Disconnected).await.unwrap();
        state
            .wait_for(|s| matches!(s, LinkState::Connected { .. }))
            .await
            .unwrap();

        second_link.write_all(b"01LI2\n").await.unwrap();
        let b = rx.recv().await.unwrap();
        assert_eq!(b.seq, 1);
        assert_ne!(a.session, b.session);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_drops_lines_without_blocking() {
        let backend = Arc::new(MockBackend::with_ports(ports()));
        let mut far = backend.plug("/dev/ttyUSB0");
        let (dev, mut rx) = device(backend, PortRegistry::new(Duration::ZERO), SerialDeviceConfig::default(), 1);
        let dropped = dev.dropped_lines();
        let cancel = CancellationToken::new();
        tokio::spawn(dev.run(cancel.clone()));

        far.write_all(b"01LI1\n01LI2\n01LI3\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(dropped.load(Ordering::Relaxed), 2);
        assert_eq!(rx.recv().await.unwrap().line, "01LI1");
        cancel.cancel();
    }

    #[tokio::test]
    async fn ports_held_by_another_device_are_not_taken() {
        let backend = Arc::new(MockBackend::with_ports(ports()));
        backend.plug("/dev/ttyUSB0");
        let registry = PortRegistry::new(Duration::ZERO);
        assert!(registry.claim("/dev/ttyUSB0", "other"));

        let pinned = SerialDeviceConfig {
            port: Some("/dev/ttyUSB0".to_string()),
            ..Default::default()
        };
        let (mut dev, _rx) = device(backend.clone(), registry.clone(), pinned, 1);
        assert_eq!(
            dev.connect().err(),
            Some(SerialError::PortBusy("/dev/ttyUSB0".to_string()))
        );

        let (mut dev, _rx) = device(backend, registry, SerialDeviceConfig::default(), 1);
        assert_eq!(dev.connect().err(), Some(SerialError::NoPortAvailable));
    }

    #[tokio::test]
    async fn failed_open_releases_the_claim() {
        let backend = Arc::new(MockBackend::with_ports(ports()));
        let registry = PortRegistry::new(Duration::ZERO);
        let (mut dev, _rx) = device(backend, registry.clone(), SerialDeviceConfig::default(), 1);

        assert!(matches!(dev.connect(), Err(SerialError::Open { .. })));
        assert!(!registry.is_claimed("/dev/ttyUSB0"));
    }

    #[tokio::test(start_paused = true)]
    async fn silence_past_the_idle_timeout_drops_the_link() {
        let backend = Arc::new(MockBackend::with_ports(ports()));
        let _far = backend.plug("/dev/ttyUSB0");
        let config = SerialDeviceConfig {
            idle_timeout: Some(Duration::from_secs(1)),
            ..Default::default()
        };
        let (dev, _rx) = device(backend, PortRegistry::new(Duration::ZERO), config, 1);
        let mut state = dev.subscribe();
        let cancel = CancellationToken::new();
        tokio::spawn(dev.run(cancel.clone()));

        state
            .wait_for(|s| matches!(s, LinkState::Connected { .. }))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(*state.borrow(), LinkState::Disconnected);
        cancel.cancel();
    }
}
