//! Serial transport and async driver for the AUX link

use std::io;
use std::str::FromStr;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use serial2::{CharSize, FlowControl, Parity, SerialPort, Settings, StopBits};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use crate::config::LinkConfig;
use crate::link::{ByteStream, Clock, Link, LinkState, LinkStats, SystemClock};
use crate::sequence::StepOutcome;
use crate::types::{AcState, Command, ProtocolError, SequenceError};

/// AUX units talk at 4800 baud, 8 data bits, 1 stop bit
pub const BAUD_RATE: u32 = 4800;

/// How often the driver evaluates the link
pub const DEFAULT_TICK: Duration = Duration::from_millis(5);

/// Serial read timeout; keeps the reader thread responsive to shutdown
const READ_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParityMode {
    #[default]
    Even,
    Odd,
    None,
}

impl FromStr for ParityMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "even" | "e" => Ok(ParityMode::Even),
            "odd" | "o" => Ok(ParityMode::Odd),
            "none" | "n" => Ok(ParityMode::None),
            other => Err(format!("unknown parity: {other}")),
        }
    }
}

impl From<ParityMode> for Parity {
    fn from(mode: ParityMode) -> Self {
        match mode {
            ParityMode::Even => Parity::Even,
            ParityMode::Odd => Parity::Odd,
            ParityMode::None => Parity::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    pub path: String,
    pub baud_rate: u32,
    pub parity: ParityMode,
}

impl SerialConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            baud_rate: BAUD_RATE,
            parity: ParityMode::default(),
        }
    }
}

/// Command to send to the writer thread
enum WriteCommand {
    Send(Vec<u8>),
    Shutdown,
}

/// Non-blocking byte stream over a serial port.
///
/// A reader thread pushes received chunks into a channel which is drained into
/// a local queue on demand; writes are handed to a writer thread.
pub struct SerialStream {
    chunk_rx: mpsc::Receiver<Vec<u8>>,
    pending: BytesMut,
    write_tx: mpsc::Sender<WriteCommand>,
}

impl SerialStream {
    pub fn open(config: &SerialConfig) -> Result<Self, ProtocolError> {
        tracing::info!(
            "Opening {} at {} baud, parity {:?}",
            config.path,
            config.baud_rate,
            config.parity
        );

        let settings = |mut settings: Settings| -> io::Result<Settings> {
            settings.set_raw();
            settings.set_baud_rate(config.baud_rate)?;
            settings.set_char_size(CharSize::Bits8);
            settings.set_stop_bits(StopBits::One);
            settings.set_parity(config.parity.into());
            settings.set_flow_control(FlowControl::None);
            Ok(settings)
        };
        let mut port = SerialPort::open(&config.path, settings)?;
        port.set_read_timeout(READ_TIMEOUT)?;

        let reader_port = port.try_clone()?;
        let (chunk_tx, chunk_rx) = mpsc::channel(64);
        let (write_tx, write_rx) = mpsc::channel(32);

        std::thread::spawn(move || reader_thread(reader_port, chunk_tx));
        std::thread::spawn(move || writer_thread(port, write_rx));

        Ok(Self {
            chunk_rx,
            pending: BytesMut::with_capacity(256),
            write_tx,
        })
    }

    fn fill(&mut self) {
        while let Ok(chunk) = self.chunk_rx.try_recv() {
            self.pending.extend_from_slice(&chunk);
        }
    }
}

impl ByteStream for SerialStream {
    fn available(&mut self) -> usize {
        self.fill();
        self.pending.len()
    }

    fn peek(&mut self) -> Option<u8> {
        self.fill();
        self.pending.first().copied()
    }

    fn read_byte(&mut self) -> Option<u8> {
        self.fill();
        if self.pending.has_remaining() {
            Some(self.pending.get_u8())
        } else {
            None
        }
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.write_tx
            .try_send(WriteCommand::Send(data.to_vec()))
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e.to_string()))
    }

    /// The writer thread flushes after every frame
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for SerialStream {
    fn drop(&mut self) {
        let _ = self.write_tx.try_send(WriteCommand::Shutdown);
    }
}

fn writer_thread(port: SerialPort, mut rx: mpsc::Receiver<WriteCommand>) {
    while let Some(cmd) = rx.blocking_recv() {
        match cmd {
            WriteCommand::Send(data) => {
                if let Err(e) = port.write_all(&data) {
                    tracing::error!("Write error: {}", e);
                    continue;
                }
                if let Err(e) = port.flush() {
                    tracing::error!("Flush error: {}", e);
                }
            }
            WriteCommand::Shutdown => break,
        }
    }
    tracing::debug!("Writer thread shutting down");
}

fn reader_thread(port: SerialPort, chunk_tx: mpsc::Sender<Vec<u8>>) {
    tracing::debug!("Reader thread started");
    let mut buffer = [0u8; 256];

    loop {
        match port.read(&mut buffer) {
            Ok(0) => {
                tracing::warn!("Serial port closed");
                break;
            }
            Ok(n) => {
                tracing::trace!("Read {} bytes: {:02X?}", n, &buffer[..n]);
                if chunk_tx.blocking_send(buffer[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::TimedOut => {
                if chunk_tx.is_closed() {
                    break;
                }
            }
            Err(ref e) if e.raw_os_error() == Some(libc::EAGAIN) => continue,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => {
                tracing::error!("Serial read error: {}", e);
                break;
            }
        }
    }
    tracing::debug!("Reader thread shutting down");
}

/// Events published by the driver
#[derive(Debug, Clone, PartialEq)]
pub enum AcEvent {
    StateChanged(AcState),
    SequenceFinished,
    SequenceAborted(SequenceError),
}

/// Point-in-time view of the link
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Snapshot {
    pub state: AcState,
    pub link_state: LinkState,
    /// A transaction is in flight
    pub busy: bool,
    pub stats: LinkStats,
}

enum Request {
    Snapshot(oneshot::Sender<Snapshot>),
    Command(Command, oneshot::Sender<Result<(), SequenceError>>),
    Power(bool, oneshot::Sender<Result<(), SequenceError>>),
    RefreshStatus(oneshot::Sender<Result<(), SequenceError>>),
    Shutdown,
}

/// Handle to a link running in its own task.
///
/// The task owns every protocol buffer; callers talk to it over channels.
pub struct AuxTransport {
    request_tx: mpsc::Sender<Request>,
    event_tx: broadcast::Sender<AcEvent>,
}

impl AuxTransport {
    /// Open the serial port and start driving the link
    pub async fn connect(
        serial: &SerialConfig,
        config: LinkConfig,
        tick: Duration,
    ) -> Result<Self, ProtocolError> {
        let stream = SerialStream::open(serial)?;
        let transport = Self::spawn(stream, SystemClock::default(), config, tick);
        tracing::info!("Link running on {}", serial.path);
        Ok(transport)
    }

    /// Drive a link over any byte stream
    pub fn spawn<S, C>(stream: S, clock: C, config: LinkConfig, tick: Duration) -> Self
    where
        S: ByteStream + Send + 'static,
        C: Clock + Send + 'static,
    {
        let (event_tx, _) = broadcast::channel(64);
        let (request_tx, request_rx) = mpsc::channel(32);

        let mut link = Link::new(stream, clock, config);
        let listener_tx = event_tx.clone();
        link.set_state_listener(Box::new(move |state| {
            let _ = listener_tx.send(AcEvent::StateChanged(*state));
        }));

        tokio::spawn(Self::driver_task(link, request_rx, event_tx.clone(), tick));

        Self {
            request_tx,
            event_tx,
        }
    }

    async fn driver_task<S: ByteStream, C: Clock>(
        mut link: Link<S, C>,
        mut request_rx: mpsc::Receiver<Request>,
        event_tx: broadcast::Sender<AcEvent>,
        tick: Duration,
    ) {
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => match link.tick() {
                    Ok(StepOutcome::Finished) => {
                        let _ = event_tx.send(AcEvent::SequenceFinished);
                    }
                    Ok(StepOutcome::Aborted(e)) => {
                        let _ = event_tx.send(AcEvent::SequenceAborted(e));
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!("Link error: {}", e),
                },
                request = request_rx.recv() => match request {
                    Some(Request::Snapshot(tx)) => {
                        let _ = tx.send(Snapshot {
                            state: *link.ac_state(),
                            link_state: link.link_state(),
                            busy: link.is_busy(),
                            stats: *link.stats(),
                        });
                    }
                    Some(Request::Command(command, tx)) => {
                        let _ = tx.send(link.send_command(command));
                    }
                    Some(Request::Power(on, tx)) => {
                        let _ = tx.send(link.set_power(on));
                    }
                    Some(Request::RefreshStatus(tx)) => {
                        let _ = tx.send(link.request_status());
                    }
                    Some(Request::Shutdown) | None => break,
                },
            }
        }
        tracing::debug!("Driver task shutting down");
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Request,
    ) -> Result<T, ProtocolError> {
        let (tx, rx) = oneshot::channel();
        self.request_tx
            .send(make(tx))
            .await
            .map_err(|_| ProtocolError::NotConnected)?;
        rx.await.map_err(|_| ProtocolError::NotConnected)
    }

    pub async fn snapshot(&self) -> Result<Snapshot, ProtocolError> {
        self.call(Request::Snapshot).await
    }

    /// Queue a parameter change
    pub async fn send_command(&self, command: Command) -> Result<(), ProtocolError> {
        Ok(self.call(|tx| Request::Command(command, tx)).await??)
    }

    pub async fn set_power(&self, on: bool) -> Result<(), ProtocolError> {
        Ok(self.call(|tx| Request::Power(on, tx)).await??)
    }

    /// Ask for a small and big status refresh
    pub async fn request_status(&self) -> Result<(), ProtocolError> {
        Ok(self.call(Request::RefreshStatus).await??)
    }

    /// Subscribe to state changes and sequence results
    pub fn subscribe(&self) -> broadcast::Receiver<AcEvent> {
        self.event_tx.subscribe()
    }
}

impl Drop for AuxTransport {
    fn drop(&mut self) {
        let _ = self.request_tx.try_send(Request::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::commands::InfoCode;
    use crate::frame::checksum_bytes;
    use crate::mock::{ManualClock, MockStream};

    const TICK: Duration = Duration::from_millis(1);

    fn unit_frame(packet_type: u8, body: &[u8]) -> Vec<u8> {
        let mut raw = vec![0xBB, 0x00, packet_type, 0x00, 0x00, 0x00, body.len() as u8, 0x00];
        raw.extend_from_slice(body);
        let crc = checksum_bytes(&raw);
        raw.extend_from_slice(&crc);
        raw
    }

    async fn wait_for_written(stream: &MockStream, len: usize) -> Vec<u8> {
        let mut written = Vec::new();
        for _ in 0..200 {
            written.extend(stream.take_written());
            if written.len() >= len {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        written
    }

    #[test]
    fn test_parity_parsing() {
        assert_eq!("even".parse::<ParityMode>(), Ok(ParityMode::Even));
        assert_eq!("N".parse::<ParityMode>(), Ok(ParityMode::None));
        assert!("mark".parse::<ParityMode>().is_err());
    }

    #[tokio::test]
    async fn test_driver_answers_ping_and_publishes_state() {
        let stream = MockStream::default();
        let transport =
            AuxTransport::spawn(stream.clone(), ManualClock::default(), LinkConfig::default(), TICK);
        let mut events = transport.subscribe();

        stream.inject(&unit_frame(0x01, &[]));
        let pong = codec::pong(0).unwrap().to_bytes();
        let request = codec::status_request(InfoCode::SmallStatus, 0)
            .unwrap()
            .to_bytes();
        let written = wait_for_written(&stream, pong.len() + request.len()).await;
        assert_eq!(&written[..pong.len()], pong.as_slice());
        assert_eq!(&written[pong.len()..], request.as_slice());

        let mut body = [0u8; 15];
        body[0] = 0x01;
        body[1] = 0x11;
        body[2] = 0x98;
        body[10] = 0x20;
        stream.inject(&unit_frame(0x07, &body));

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        let AcEvent::StateChanged(state) = event else {
            panic!("expected a state change, got {event:?}");
        };
        assert_eq!(state.power, Some(true));
        assert_eq!(state.target_temp, Some(27.0));

        let snapshot = transport.snapshot().await.unwrap();
        assert_eq!(snapshot.state.power, Some(true));
        assert!(snapshot.busy);
        assert_eq!(snapshot.stats.frames_received, 2);
    }

    #[tokio::test]
    async fn test_commands_are_bounded() {
        let stream = MockStream::default();
        let transport =
            AuxTransport::spawn(stream, ManualClock::default(), LinkConfig::default(), TICK);

        transport
            .send_command(Command::new().power(true))
            .await
            .unwrap();
        transport.set_power(false).await.unwrap();

        let result = transport.send_command(Command::new().power(true)).await;
        assert!(matches!(
            result,
            Err(ProtocolError::Sequence(SequenceError::CapacityExceeded { needed: 6, free: 3 }))
        ));
        assert!(matches!(
            transport.request_status().await,
            Err(ProtocolError::Sequence(SequenceError::Busy))
        ));
    }
}
