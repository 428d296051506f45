//! Half-duplex link state machine.
//!
//! [`Link`] owns every buffer, the last known [`AcState`] and the running
//! [`Sequence`]. The host calls [`Link::tick`] as often as it likes; each call
//! evaluates exactly one link state and never blocks.

use std::io;
use std::time::Instant;

use serde::Serialize;

use crate::codec::{self, Message};
use crate::config::LinkConfig;
use crate::frame::{Frame, FrameBuffer, PushStatus, BUFFER_SIZE, HEADER_SIZE, START_BYTE};
use crate::sequence::{Sequence, StepContext, StepOutcome};
use crate::types::{AcState, Command, ProtocolError, SequenceError};

/// Non-blocking byte stream to the unit
pub trait ByteStream {
    /// Number of bytes that can be read right now
    fn available(&mut self) -> usize;
    fn peek(&mut self) -> Option<u8>;
    fn read_byte(&mut self) -> Option<u8>;
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()>;
}

/// Monotonic millisecond clock
pub trait Clock {
    fn now_ms(&self) -> u64;
}

/// Milliseconds since construction
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    #[allow(clippy::cast_possible_truncation)]
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Idle,
    Receiving,
    Parsing,
    Sending,
}

/// Link counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkStats {
    pub frames_received: u64,
    pub frames_sent: u64,
    pub checksum_errors: u64,
    pub framing_errors: u64,
    pub noise_bytes: u64,
    pub sequences_completed: u64,
    pub sequences_aborted: u64,
}

/// Called with the new state whenever a status frame changes it
pub type StateListener = Box<dyn FnMut(&AcState) + Send>;

pub struct Link<S, C> {
    stream: S,
    clock: C,
    config: LinkConfig,
    state: LinkState,
    incoming: FrameBuffer,
    outgoing: FrameBuffer,
    sequence: Sequence,
    ac_state: AcState,
    startup_loaded: bool,
    last_poll: u64,
    stats: LinkStats,
    last_frame: Option<Frame>,
    listener: Option<StateListener>,
}

impl<S: ByteStream, C: Clock> Link<S, C> {
    pub fn new(stream: S, clock: C, config: LinkConfig) -> Self {
        Self {
            stream,
            clock,
            sequence: Sequence::new(config.step_timeout_ms),
            config,
            state: LinkState::Idle,
            incoming: FrameBuffer::incoming(),
            outgoing: FrameBuffer::outgoing(),
            ac_state: AcState::default(),
            startup_loaded: false,
            last_poll: 0,
            stats: LinkStats::default(),
            last_frame: None,
            listener: None,
        }
    }

    /// Last known unit state
    pub fn ac_state(&self) -> &AcState {
        &self.ac_state
    }

    pub fn link_state(&self) -> LinkState {
        self.state
    }

    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    /// Most recent checksum-valid frame from the unit
    pub fn last_frame(&self) -> Option<&Frame> {
        self.last_frame.as_ref()
    }

    /// True while a sequence is running
    pub fn is_busy(&self) -> bool {
        self.sequence.is_active()
    }

    pub fn set_state_listener(&mut self, listener: StateListener) {
        self.listener = Some(listener);
    }

    /// Queue a parameter change; appended after a running sequence if it fits
    pub fn send_command(&mut self, command: Command) -> Result<(), SequenceError> {
        tracing::debug!("Queueing command: {:?}", command);
        self.sequence.load_command(command)
    }

    pub fn set_power(&mut self, on: bool) -> Result<(), SequenceError> {
        self.sequence.load_power(on)
    }

    /// Ask for a full status refresh (small and big)
    pub fn request_status(&mut self) -> Result<(), SequenceError> {
        self.sequence.load_startup()
    }

    /// Evaluate the current link state once. The returned outcome describes
    /// the sequence step run during this tick, if any.
    pub fn tick(&mut self) -> Result<StepOutcome, ProtocolError> {
        let now = self.clock.now_ms();
        match self.state {
            LinkState::Idle => {
                self.poll_status(now);
                self.handle_idle(now)
            }
            LinkState::Receiving => Ok(self.handle_receiving(now)),
            LinkState::Parsing => Ok(self.handle_parsing(now)),
            LinkState::Sending => self.handle_sending(),
        }
    }

    fn set_state(&mut self, state: LinkState) {
        if self.state != state {
            tracing::trace!("Link: {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    fn handle_idle(&mut self, now: u64) -> Result<StepOutcome, ProtocolError> {
        let outcome = self.run_sequence(now, None);

        if self.stream.available() == 0 {
            if !self.outgoing.is_empty() {
                self.set_state(LinkState::Sending);
            }
            return Ok(outcome);
        }

        if self.stream.peek() == Some(START_BYTE) {
            if !self.incoming.is_empty() {
                tracing::debug!("Unparsed data on the bus: {}", self.incoming);
            }
            self.incoming.reset();
            self.incoming.set_started_at(now);
            self.set_state(LinkState::Receiving);
            return Ok(outcome);
        }

        // noise only feeds the diagnostics dump
        while self.stream.peek().is_some_and(|b| b != START_BYTE) {
            let Some(byte) = self.stream.read_byte() else {
                break;
            };
            self.stats.noise_bytes += 1;
            if self.incoming.push_byte(byte).is_err() || self.incoming.is_full() {
                tracing::debug!("Unparsed data on the bus: {}", self.incoming);
                self.incoming.reset();
            }
        }
        Ok(outcome)
    }

    fn handle_receiving(&mut self, now: u64) -> StepOutcome {
        while self.stream.available() > 0 {
            if self.incoming.is_full() {
                self.drop_incoming(&ProtocolError::BufferOverflow(BUFFER_SIZE));
                return StepOutcome::Idle;
            }
            let Some(byte) = self.stream.read_byte() else {
                break;
            };
            match self.incoming.push_byte(byte) {
                Ok(PushStatus::Complete) => {
                    tracing::trace!("Frame loaded: {} bytes", self.incoming.len());
                    self.set_state(LinkState::Parsing);
                    return StepOutcome::Idle;
                }
                Ok(PushStatus::HeaderLoaded) if self.incoming.len() == HEADER_SIZE => {
                    if let Some(header) = self.incoming.header() {
                        tracing::trace!(
                            "Header loaded: type {:#04X}, body {} bytes",
                            header.packet_type,
                            header.body_length
                        );
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    self.drop_incoming(&e);
                    return StepOutcome::Idle;
                }
            }
        }

        let elapsed = now.saturating_sub(self.incoming.started_at());
        if elapsed >= self.config.receive_timeout_ms {
            self.drop_incoming(&ProtocolError::ReceiveTimeout(elapsed));
        }
        StepOutcome::Idle
    }

    fn drop_incoming(&mut self, error: &ProtocolError) {
        tracing::warn!("Dropping incoming frame: {} [{}]", error, self.incoming);
        self.stats.framing_errors += 1;
        self.incoming.reset();
        self.set_state(LinkState::Idle);
    }

    fn handle_parsing(&mut self, now: u64) -> StepOutcome {
        let frame = match self.incoming.to_frame(now) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!("Parser: {} [{}]", e, self.incoming);
                match e {
                    ProtocolError::ChecksumMismatch { .. } => self.stats.checksum_errors += 1,
                    _ => self.stats.framing_errors += 1,
                }
                self.incoming.reset();
                self.set_state(LinkState::Idle);
                return StepOutcome::Idle;
            }
        };

        tracing::debug!("[<=] {}", frame);
        self.stats.frames_received += 1;
        self.dispatch(&frame, now);

        let outcome = self.run_sequence(now, Some(&frame));
        self.last_frame = Some(frame);
        self.incoming.reset();
        self.set_state(LinkState::Idle);
        outcome
    }

    fn dispatch(&mut self, frame: &Frame, now: u64) {
        let message = match codec::decode(frame) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Parser: {}", e);
                return;
            }
        };

        match message {
            Message::Ping => {
                self.queue_pong(now);
                if !self.startup_loaded {
                    match self.sequence.load_startup() {
                        Ok(()) => {
                            tracing::info!("Unit answered, requesting initial status");
                            self.startup_loaded = true;
                            self.last_poll = now;
                        }
                        Err(e) => tracing::debug!("Startup sequence postponed: {}", e),
                    }
                }
            }
            Message::SmallStatus(status) => {
                if self.ac_state.apply_small_status(&status) {
                    self.notify_state_changed();
                }
            }
            Message::BigStatus(status) => {
                if self.ac_state.apply_big_status(&status) {
                    self.notify_state_changed();
                }
            }
            Message::SetParamsEcho { checksum } => {
                tracing::trace!("Set-params echo for {:02X?}", checksum);
            }
            Message::UnexpectedCommand => {
                tracing::warn!("Parser: command packet from the unit ignored");
            }
            Message::UnknownInfo(code) => {
                tracing::debug!("Parser: unknown info code {:#04X}", code);
            }
            Message::Init | Message::Vendor => {
                tracing::debug!("Parser: packet type {:#04X} ignored", frame.header.packet_type);
            }
        }
    }

    fn queue_pong(&mut self, now: u64) {
        if !self.outgoing.is_empty() {
            tracing::warn!("Pong replaces queued frame [{}]", self.outgoing);
        }
        if let Err(e) = codec::pong(now).and_then(|pong| self.outgoing.load(&pong)) {
            tracing::error!("Failed to queue pong: {}", e);
        }
    }

    fn notify_state_changed(&mut self) {
        tracing::info!("AC state changed: {:?}", self.ac_state);
        if let Some(listener) = self.listener.as_mut() {
            listener(&self.ac_state);
        }
    }

    fn handle_sending(&mut self) -> Result<StepOutcome, ProtocolError> {
        self.set_state(LinkState::Idle);
        if self.outgoing.is_empty() {
            tracing::trace!("Nothing to send");
            return Ok(StepOutcome::Idle);
        }

        tracing::debug!("[=>] {}", self.outgoing);
        let written = self.stream.write_all(self.outgoing.as_bytes());
        self.outgoing.reset();
        written?;
        self.stream.flush()?;
        self.stats.frames_sent += 1;
        Ok(StepOutcome::Idle)
    }

    fn run_sequence(&mut self, now: u64, incoming: Option<&Frame>) -> StepOutcome {
        let outcome = self.sequence.run_step(StepContext {
            now,
            incoming,
            outgoing: &mut self.outgoing,
            state: &self.ac_state,
        });
        match outcome {
            StepOutcome::Finished => self.stats.sequences_completed += 1,
            StepOutcome::Aborted(_) => self.stats.sequences_aborted += 1,
            _ => {}
        }
        outcome
    }

    /// Reload the status sequence every poll interval once the unit answered
    fn poll_status(&mut self, now: u64) {
        let Some(interval) = self.config.poll_interval_ms else {
            return;
        };
        if !self.startup_loaded || now.saturating_sub(self.last_poll) < interval {
            return;
        }
        self.last_poll = now;
        match self.sequence.load_startup() {
            Ok(()) => tracing::debug!("Periodic status refresh"),
            Err(e) => tracing::debug!("Periodic status refresh skipped: {}", e),
        }
    }
}
