//! Multi-step transactions with the unit.
//!
//! A [`Sequence`] is a short ordered list of steps executed one per link tick:
//! request steps queue a frame for sending, confirm steps check that the
//! unit's next frame is the expected answer. A step that times out or sees an
//! irrelevant answer clears the whole sequence; nothing is retried.

use crate::codec;
use crate::commands::{InfoCode, PacketType};
use crate::frame::{Frame, FrameBuffer};
use crate::types::{AcState, Command, ProtocolError, SequenceError};

/// Maximum number of steps a sequence can hold
pub const MAX_STEPS: usize = 15;

/// Timeout applied to steps that do not set their own
pub const DEFAULT_STEP_TIMEOUT_MS: u64 = 500;

/// Named step operations
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operation {
    RequestSmallStatus,
    ConfirmSmallStatus,
    RequestBigStatus,
    ConfirmBigStatus,
    RequestSetCommand(Command),
    ConfirmSetCommand,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepKind {
    Call(Operation),
    /// Wait for the step timeout, then move on
    Delay,
}

#[derive(Debug, Clone)]
pub struct Step {
    pub kind: StepKind,
    /// Zero selects the sequence default
    pub timeout_ms: u64,
    started_at: Option<u64>,
    /// Frame sent by a request step, or accepted by a confirm step
    frame: Option<Frame>,
}

impl Step {
    #[must_use]
    pub fn call(operation: Operation) -> Self {
        Self {
            kind: StepKind::Call(operation),
            timeout_ms: 0,
            started_at: None,
            frame: None,
        }
    }

    #[must_use]
    pub fn delay(timeout_ms: u64) -> Self {
        Self {
            kind: StepKind::Delay,
            timeout_ms,
            started_at: None,
            frame: None,
        }
    }

    #[must_use]
    pub fn frame(&self) -> Option<&Frame> {
        self.frame.as_ref()
    }
}

/// What the link hands to a step
pub struct StepContext<'a> {
    pub now: u64,
    /// Frame parsed during this tick, if any
    pub incoming: Option<&'a Frame>,
    pub outgoing: &'a mut FrameBuffer,
    pub state: &'a AcState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// No sequence loaded
    Idle,
    /// Current step has nothing to do yet
    Waiting,
    Advanced,
    /// Last step done, sequence cleared
    Finished,
    /// Sequence cleared after a failed step
    Aborted(SequenceError),
}

/// Ordered, bounded list of steps with a cursor
#[derive(Debug)]
pub struct Sequence {
    steps: Vec<Step>,
    cursor: usize,
    default_timeout_ms: u64,
}

impl Default for Sequence {
    fn default() -> Self {
        Self::new(DEFAULT_STEP_TIMEOUT_MS)
    }
}

impl Sequence {
    /// Zero selects [`DEFAULT_STEP_TIMEOUT_MS`]
    #[must_use]
    pub fn new(default_timeout_ms: u64) -> Self {
        Self {
            steps: Vec::with_capacity(MAX_STEPS),
            cursor: 0,
            default_timeout_ms: match default_timeout_ms {
                0 => DEFAULT_STEP_TIMEOUT_MS,
                t => t,
            },
        }
    }

    /// True while a transaction is in flight
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.steps.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Index of the step that runs next
    #[must_use]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    #[must_use]
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn clear(&mut self) {
        self.steps.clear();
        self.cursor = 0;
    }

    /// Load a new sequence; fails while another one is in flight
    pub fn start(&mut self, steps: Vec<Step>) -> Result<(), SequenceError> {
        if self.is_active() {
            return Err(SequenceError::Busy);
        }
        self.append(steps)
    }

    /// Add steps after the tail of the running sequence, if they fit
    pub fn append(&mut self, steps: Vec<Step>) -> Result<(), SequenceError> {
        let free = MAX_STEPS - self.steps.len();
        if steps.len() > free {
            return Err(SequenceError::CapacityExceeded {
                needed: steps.len(),
                free,
            });
        }
        tracing::trace!(
            "Sequence: adding {} steps after {} existing",
            steps.len(),
            self.steps.len()
        );
        self.steps.extend(steps);
        Ok(())
    }

    /// Small then big status, used after the first ping and for polling
    pub fn load_startup(&mut self) -> Result<(), SequenceError> {
        let mut steps = small_status_steps();
        steps.extend(big_status_steps());
        self.start(steps)
    }

    pub fn load_small_status(&mut self) -> Result<(), SequenceError> {
        self.start(small_status_steps())
    }

    pub fn load_big_status(&mut self) -> Result<(), SequenceError> {
        self.start(big_status_steps())
    }

    /// Refresh, send the command and its confirmation, refresh again
    pub fn load_command(&mut self, command: Command) -> Result<(), SequenceError> {
        let mut steps = small_status_steps();
        steps.push(Step::call(Operation::RequestSetCommand(command)));
        steps.push(Step::call(Operation::ConfirmSetCommand));
        steps.extend(small_status_steps());
        self.append(steps)
    }

    pub fn load_power(&mut self, on: bool) -> Result<(), SequenceError> {
        self.load_command(Command::new().power(on))
    }

    pub fn push_delay(&mut self, timeout_ms: u64) -> Result<(), SequenceError> {
        self.append(vec![Step::delay(timeout_ms)])
    }

    /// Run the current step once
    pub fn run_step(&mut self, mut ctx: StepContext<'_>) -> StepOutcome {
        if self.steps.is_empty() {
            return StepOutcome::Idle;
        }

        let index = self.cursor;
        let Some(step) = self.steps.get_mut(index) else {
            self.clear();
            return StepOutcome::Finished;
        };

        let started = *step.started_at.get_or_insert(ctx.now);
        let elapsed = ctx.now.saturating_sub(started);
        let timeout = match step.timeout_ms {
            0 => self.default_timeout_ms,
            t => t,
        };
        let kind = step.kind;

        match kind {
            StepKind::Delay => {
                if elapsed >= timeout {
                    tracing::trace!("Sequence: delay step {} elapsed", index);
                    self.advance()
                } else {
                    StepOutcome::Waiting
                }
            }
            StepKind::Call(operation) => {
                if elapsed >= timeout {
                    return self.abort(SequenceError::StepTimeout {
                        step: index,
                        elapsed_ms: elapsed,
                    });
                }
                match self.execute(index, operation, &mut ctx) {
                    Ok(true) => self.advance(),
                    Ok(false) => StepOutcome::Waiting,
                    Err(e) => self.abort(e),
                }
            }
        }
    }

    fn advance(&mut self) -> StepOutcome {
        self.cursor += 1;
        if self.cursor >= self.steps.len() {
            tracing::trace!("Sequence: finished");
            self.clear();
            StepOutcome::Finished
        } else {
            tracing::trace!("Sequence: moving to step {}", self.cursor);
            StepOutcome::Advanced
        }
    }

    fn abort(&mut self, error: SequenceError) -> StepOutcome {
        tracing::warn!("Sequence aborted: {}", error);
        self.clear();
        StepOutcome::Aborted(error)
    }

    /// Ok(true) to advance, Ok(false) to stay on the step
    fn execute(
        &mut self,
        index: usize,
        operation: Operation,
        ctx: &mut StepContext<'_>,
    ) -> Result<bool, SequenceError> {
        match operation {
            Operation::RequestSmallStatus => self.request(index, ctx, |ctx| {
                codec::status_request(InfoCode::SmallStatus, ctx.now)
            }),
            Operation::RequestBigStatus => self.request(index, ctx, |ctx| {
                codec::status_request(InfoCode::BigStatus, ctx.now)
            }),
            Operation::RequestSetCommand(command) => self.request(index, ctx, |ctx| {
                codec::set_params(ctx.state, &command, ctx.now)
            }),
            Operation::ConfirmSmallStatus => {
                self.confirm(index, ctx.incoming, InfoCode::SmallStatus, None)
            }
            Operation::ConfirmBigStatus => {
                self.confirm(index, ctx.incoming, InfoCode::BigStatus, None)
            }
            Operation::ConfirmSetCommand => {
                let sent = self.sent_command_checksum(index)?;
                self.confirm(index, ctx.incoming, InfoCode::SetParams, Some(sent))
            }
        }
    }

    fn request(
        &mut self,
        index: usize,
        ctx: &mut StepContext<'_>,
        build: impl FnOnce(&StepContext<'_>) -> Result<Frame, ProtocolError>,
    ) -> Result<bool, SequenceError> {
        // the unit sees one frame at a time; wait for the slot
        if !ctx.outgoing.is_empty() {
            return Ok(false);
        }
        let frame = build(&*ctx).map_err(|_| SequenceError::Malformed {
            step: index,
            reason: "request frame could not be built",
        })?;
        tracing::debug!("Sequence: step {} queued {}", index, frame);
        ctx.outgoing.load(&frame).map_err(|_| SequenceError::Malformed {
            step: index,
            reason: "request frame does not fit the buffer",
        })?;
        self.steps[index].frame = Some(frame);
        Ok(true)
    }

    fn confirm(
        &mut self,
        index: usize,
        incoming: Option<&Frame>,
        code: InfoCode,
        echo: Option<[u8; 2]>,
    ) -> Result<bool, SequenceError> {
        let Some(frame) = incoming else {
            return Ok(false);
        };
        if frame.kind() == Some(PacketType::Ping) {
            return Ok(false);
        }
        check_answer(index, frame, code, echo)?;
        self.steps[index].frame = Some(frame.clone());
        Ok(true)
    }

    /// Checksum of the set command sent by the step before `index`
    fn sent_command_checksum(&self, index: usize) -> Result<[u8; 2], SequenceError> {
        index
            .checked_sub(1)
            .and_then(|prev| self.steps.get(prev))
            .filter(|step| {
                matches!(step.kind, StepKind::Call(Operation::RequestSetCommand(_)))
            })
            .and_then(Step::frame)
            .map(|frame| frame.checksum)
            .ok_or(SequenceError::Malformed {
                step: index,
                reason: "no set command sent by the previous step",
            })
    }
}

fn small_status_steps() -> Vec<Step> {
    vec![
        Step::call(Operation::RequestSmallStatus),
        Step::call(Operation::ConfirmSmallStatus),
    ]
}

fn big_status_steps() -> Vec<Step> {
    vec![
        Step::call(Operation::RequestBigStatus),
        Step::call(Operation::ConfirmBigStatus),
    ]
}

fn check_answer(
    step: usize,
    frame: &Frame,
    code: InfoCode,
    echo: Option<[u8; 2]>,
) -> Result<(), SequenceError> {
    let irrelevant = |reason| SequenceError::IrrelevantResponse { step, reason };

    if frame.kind() != Some(PacketType::Info) {
        return Err(irrelevant("not an info packet"));
    }
    if frame.body.len() != code.body_length() {
        return Err(irrelevant("unexpected body length"));
    }
    if frame.body[0] != 0x01 || frame.body[1] != code as u8 {
        return Err(irrelevant("unexpected info code"));
    }
    if let Some(checksum) = echo {
        if frame.body[2..4] != checksum {
            return Err(irrelevant("echo does not match the sent command"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::checksum_bytes;

    fn unit_info(body: &[u8]) -> Frame {
        let mut raw = vec![0xBB, 0x00, 0x07, 0x00, 0x00, 0x00, body.len() as u8, 0x00];
        raw.extend_from_slice(body);
        let crc = checksum_bytes(&raw);
        raw.extend_from_slice(&crc);
        Frame::parse(&raw, 0).unwrap()
    }

    fn small_answer() -> Frame {
        let mut body = [0u8; 15];
        body[0] = 0x01;
        body[1] = 0x11;
        unit_info(&body)
    }

    fn big_answer() -> Frame {
        let mut body = [0u8; 24];
        body[0] = 0x01;
        body[1] = 0x21;
        unit_info(&body)
    }

    fn ping() -> Frame {
        let mut raw = vec![0xBB, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00];
        let crc = checksum_bytes(&raw);
        raw.extend_from_slice(&crc);
        Frame::parse(&raw, 0).unwrap()
    }

    struct Harness {
        sequence: Sequence,
        outgoing: FrameBuffer,
        state: AcState,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                sequence: Sequence::default(),
                outgoing: FrameBuffer::outgoing(),
                state: AcState::default(),
            }
        }

        fn step(&mut self, now: u64, incoming: Option<&Frame>) -> StepOutcome {
            self.sequence.run_step(StepContext {
                now,
                incoming,
                outgoing: &mut self.outgoing,
                state: &self.state,
            })
        }

        /// Pretend the queued frame went out on the wire
        fn send(&mut self) -> Frame {
            let frame = self.outgoing.to_frame(0).unwrap();
            self.outgoing.reset();
            frame
        }
    }

    #[test]
    fn test_startup_sequence_runs_to_completion() {
        let mut h = Harness::new();
        h.sequence.load_startup().unwrap();
        assert_eq!(h.sequence.len(), 4);

        assert_eq!(h.step(0, None), StepOutcome::Advanced);
        assert_eq!(h.send().body, vec![0x11, 0x01]);
        assert_eq!(h.step(10, None), StepOutcome::Waiting);
        assert_eq!(h.step(20, Some(&small_answer())), StepOutcome::Advanced);

        assert_eq!(h.step(30, None), StepOutcome::Advanced);
        assert_eq!(h.send().body, vec![0x21, 0x01]);
        assert_eq!(h.step(40, Some(&big_answer())), StepOutcome::Finished);
        assert!(!h.sequence.is_active());
        assert_eq!(h.step(50, None), StepOutcome::Idle);
    }

    #[test]
    fn test_zero_default_timeout_falls_back() {
        let mut h = Harness::new();
        h.sequence = Sequence::new(0);
        h.sequence.load_small_status().unwrap();

        assert_eq!(h.step(1000, None), StepOutcome::Advanced);
        h.send();
        assert_eq!(h.step(1000, None), StepOutcome::Waiting);
        assert_eq!(h.step(1499, None), StepOutcome::Waiting);
        assert!(matches!(
            h.step(1500, None),
            StepOutcome::Aborted(SequenceError::StepTimeout { step: 1, elapsed_ms: 500 })
        ));
    }

    #[test]
    fn test_request_waits_for_outgoing_slot() {
        let mut h = Harness::new();
        h.outgoing.load(&codec::pong(0).unwrap()).unwrap();
        h.sequence.load_small_status().unwrap();

        assert_eq!(h.step(0, None), StepOutcome::Waiting);
        assert_eq!(h.sequence.cursor(), 0);

        h.send();
        assert_eq!(h.step(5, None), StepOutcome::Advanced);
        assert!(h.sequence.steps()[0].frame().is_some());
    }

    #[test]
    fn test_ping_does_not_advance_or_abort_confirm() {
        let mut h = Harness::new();
        h.sequence.load_small_status().unwrap();
        h.step(0, None);
        h.send();

        assert_eq!(h.step(10, Some(&ping())), StepOutcome::Waiting);
        assert!(h.sequence.is_active());
        assert_eq!(h.sequence.cursor(), 1);
    }

    #[test]
    fn test_irrelevant_answer_aborts() {
        let mut h = Harness::new();
        h.sequence.load_small_status().unwrap();
        h.step(0, None);
        h.send();

        let outcome = h.step(10, Some(&big_answer()));
        assert!(matches!(
            outcome,
            StepOutcome::Aborted(SequenceError::IrrelevantResponse { step: 1, .. })
        ));
        assert!(!h.sequence.is_active());
    }

    #[test]
    fn test_step_timeout_aborts() {
        let mut h = Harness::new();
        h.sequence.load_small_status().unwrap();
        h.step(0, None);
        h.send();

        assert_eq!(h.step(100, None), StepOutcome::Waiting);
        assert_eq!(h.step(599, None), StepOutcome::Waiting);
        assert_eq!(
            h.step(600, None),
            StepOutcome::Aborted(SequenceError::StepTimeout { step: 1, elapsed_ms: 500 })
        );
        assert!(!h.sequence.is_active());
    }

    #[test]
    fn test_command_confirmation_checks_echo() {
        let mut h = Harness::new();
        h.sequence.load_command(Command::new().power(true)).unwrap();
        assert_eq!(h.sequence.len(), 6);

        h.step(0, None);
        h.send();
        h.step(10, Some(&small_answer()));

        assert_eq!(h.step(20, None), StepOutcome::Advanced);
        let sent = h.send();
        assert_eq!(sent.body.len(), 15);
        assert_eq!(sent.body[10] & 0x20, 0x20);

        let echo = unit_info(&[0x01, 0x01, sent.checksum[0], sent.checksum[1]]);
        assert_eq!(h.step(30, Some(&echo)), StepOutcome::Advanced);
        assert_eq!(h.sequence.cursor(), 4);
    }

    #[test]
    fn test_command_confirmation_rejects_wrong_echo() {
        let mut h = Harness::new();
        h.sequence.load_command(Command::new().power(false)).unwrap();
        h.step(0, None);
        h.send();
        h.step(10, Some(&small_answer()));
        h.step(20, None);
        let sent = h.send();

        let echo = unit_info(&[0x01, 0x01, sent.checksum[0] ^ 0xFF, sent.checksum[1]]);
        assert!(matches!(
            h.step(30, Some(&echo)),
            StepOutcome::Aborted(SequenceError::IrrelevantResponse { step: 3, .. })
        ));
    }

    #[test]
    fn test_confirm_without_request_is_malformed() {
        let mut h = Harness::new();
        h.sequence
            .start(vec![Step::call(Operation::ConfirmSetCommand)])
            .unwrap();
        assert!(matches!(
            h.step(0, None),
            StepOutcome::Aborted(SequenceError::Malformed { step: 0, .. })
        ));
    }

    #[test]
    fn test_command_appends_after_running_sequence() {
        let mut sequence = Sequence::default();
        sequence.load_startup().unwrap();
        assert_eq!(sequence.load_startup(), Err(SequenceError::Busy));

        sequence.load_command(Command::new().power(true)).unwrap();
        assert_eq!(sequence.len(), 10);
        assert_eq!(
            sequence.load_command(Command::new().power(false)),
            Err(SequenceError::CapacityExceeded { needed: 6, free: 5 })
        );
    }

    #[test]
    fn test_delay_step() {
        let mut h = Harness::new();
        h.sequence.push_delay(100).unwrap();
        assert_eq!(h.step(1000, None), StepOutcome::Waiting);
        assert_eq!(h.step(1099, None), StepOutcome::Waiting);
        assert_eq!(h.step(1100, None), StepOutcome::Finished);
    }
}
