//! Common types used throughout the protocol

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Frame buffer overflow: no complete frame within {0} bytes")]
    BufferOverflow(usize),

    #[error("Frame incomplete: {loaded} of {expected} bytes loaded")]
    IncompleteFrame { loaded: usize, expected: usize },

    #[error("Invalid start byte: {0:#04X}")]
    InvalidStartByte(u8),

    #[error("Body too long: {0} bytes")]
    BodyTooLong(usize),

    #[error("Body too short: expected {expected} bytes, got {actual}")]
    BodyTooShort { expected: usize, actual: usize },

    #[error("Checksum mismatch: expected {expected:04X}, got {actual:04X}")]
    ChecksumMismatch { expected: u16, actual: u16 },

    #[error("Unknown packet type: {0:#04X}")]
    UnknownPacketType(u8),

    #[error("Receive timeout after {0} ms")]
    ReceiveTimeout(u64),

    #[error("Serial port error: {0}")]
    SerialError(#[from] std::io::Error),

    #[error("Transport not connected")]
    NotConnected,

    #[error(transparent)]
    Sequence(#[from] SequenceError),
}

/// Failures that end a running sequence
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SequenceError {
    #[error("Another sequence is in flight")]
    Busy,

    #[error("Sequence capacity exceeded: need {needed} steps, {free} free")]
    CapacityExceeded { needed: usize, free: usize },

    #[error("Step {step} timed out after {elapsed_ms} ms")]
    StepTimeout { step: usize, elapsed_ms: u64 },

    #[error("Step {step} got an irrelevant response: {reason}")]
    IrrelevantResponse { step: usize, reason: &'static str },

    #[error("Step {step} is malformed: {reason}")]
    Malformed { step: usize, reason: &'static str },
}

/// Operating mode, bits 7..5 of small-status byte 7
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Auto,
    Cool,
    Dry,
    Heat,
    Fan,
    /// Undocumented bit pattern, kept as received
    Other(u8),
}

impl Mode {
    pub const MASK: u8 = 0xE0;

    #[must_use]
    pub fn from_bits(byte: u8) -> Self {
        match byte & Self::MASK {
            0x00 => Mode::Auto,
            0x20 => Mode::Cool,
            0x40 => Mode::Dry,
            0x80 => Mode::Heat,
            0xC0 => Mode::Fan,
            v => Mode::Other(v),
        }
    }

    #[must_use]
    pub fn bits(self) -> u8 {
        match self {
            Mode::Auto => 0x00,
            Mode::Cool => 0x20,
            Mode::Dry => 0x40,
            Mode::Heat => 0x80,
            Mode::Fan => 0xC0,
            Mode::Other(v) => v & Self::MASK,
        }
    }
}

/// Fan speed, bits 7..5 of small-status byte 5
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanSpeed {
    High,
    Medium,
    Low,
    Auto,
    Other(u8),
}

impl FanSpeed {
    pub const MASK: u8 = 0xE0;

    #[must_use]
    pub fn from_bits(byte: u8) -> Self {
        match byte & Self::MASK {
            0x20 => FanSpeed::High,
            0x40 => FanSpeed::Medium,
            0x60 => FanSpeed::Low,
            0xA0 => FanSpeed::Auto,
            v => FanSpeed::Other(v),
        }
    }

    #[must_use]
    pub fn bits(self) -> u8 {
        match self {
            FanSpeed::High => 0x20,
            FanSpeed::Medium => 0x40,
            FanSpeed::Low => 0x60,
            FanSpeed::Auto => 0xA0,
            FanSpeed::Other(v) => v & Self::MASK,
        }
    }
}

/// Vertical louver, bits 2..0 of small-status byte 2
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerticalLouver {
    Swing,
    Off,
    /// Fixed positions are not documented yet
    Other(u8),
}

impl VerticalLouver {
    pub const MASK: u8 = 0x07;

    #[must_use]
    pub fn from_bits(byte: u8) -> Self {
        match byte & Self::MASK {
            0x00 => VerticalLouver::Swing,
            0x07 => VerticalLouver::Off,
            v => VerticalLouver::Other(v),
        }
    }

    #[must_use]
    pub fn bits(self) -> u8 {
        match self {
            VerticalLouver::Swing => 0x00,
            VerticalLouver::Off => 0x07,
            VerticalLouver::Other(v) => v & Self::MASK,
        }
    }
}

/// Horizontal louver, bits 7..5 of small-status byte 3
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HorizontalLouver {
    Swing,
    Off,
    Other(u8),
}

impl HorizontalLouver {
    pub const MASK: u8 = 0xE0;

    #[must_use]
    pub fn from_bits(byte: u8) -> Self {
        match byte & Self::MASK {
            0x00 => HorizontalLouver::Swing,
            0xE0 => HorizontalLouver::Off,
            v => HorizontalLouver::Other(v),
        }
    }

    #[must_use]
    pub fn bits(self) -> u8 {
        match self {
            HorizontalLouver::Swing => 0x00,
            HorizontalLouver::Off => 0xE0,
            HorizontalLouver::Other(v) => v & Self::MASK,
        }
    }
}

/// Last known state of the unit. `None` means no status frame has reported
/// the field yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AcState {
    pub power: Option<bool>,
    /// Target temperature in °C
    pub target_temp: Option<f32>,
    /// Indoor temperature in °C
    pub ambient_temp: Option<f32>,
    /// Outdoor probe reading, only roughly a temperature
    pub outdoor_temp: Option<f32>,
    pub clean: Option<bool>,
    pub health: Option<bool>,
    pub health_status: Option<bool>,
    pub mode: Option<Mode>,
    pub sleep: Option<bool>,
    pub ifeel: Option<bool>,
    pub louver_vertical: Option<VerticalLouver>,
    pub louver_horizontal: Option<HorizontalLouver>,
    pub fan_speed: Option<FanSpeed>,
    pub fan_turbo: Option<bool>,
    pub fan_mute: Option<bool>,
    pub display: Option<bool>,
    pub mildew: Option<bool>,
}

impl AcState {
    /// Writable parameters as a command that leaves nothing untouched that is
    /// already known
    #[must_use]
    pub fn as_command(&self) -> Command {
        Command {
            power: self.power,
            target_temp: self.target_temp,
            clean: self.clean,
            health: self.health,
            mode: self.mode,
            sleep: self.sleep,
            ifeel: self.ifeel,
            louver_vertical: self.louver_vertical,
            louver_horizontal: self.louver_horizontal,
            fan_speed: self.fan_speed,
            fan_turbo: self.fan_turbo,
            fan_mute: self.fan_mute,
            display: self.display,
            mildew: self.mildew,
        }
    }
}

/// Parameter change request. Fields left as `None` keep the unit's current
/// value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Command {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_temp: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clean: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sleep: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ifeel: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub louver_vertical: Option<VerticalLouver>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub louver_horizontal: Option<HorizontalLouver>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fan_speed: Option<FanSpeed>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fan_turbo: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fan_mute: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mildew: Option<bool>,
}

impl Command {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn power(mut self, on: bool) -> Self {
        self.power = Some(on);
        self
    }

    #[must_use]
    pub fn target_temp(mut self, celsius: f32) -> Self {
        self.target_temp = Some(celsius);
        self
    }

    #[must_use]
    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = Some(mode);
        self
    }

    #[must_use]
    pub fn fan_speed(mut self, speed: FanSpeed) -> Self {
        self.fan_speed = Some(speed);
        self
    }

    #[must_use]
    pub fn louvers(mut self, vertical: VerticalLouver, horizontal: HorizontalLouver) -> Self {
        self.louver_vertical = Some(vertical);
        self.louver_horizontal = Some(horizontal);
        self
    }

    #[must_use]
    pub fn display(mut self, on: bool) -> Self {
        self.display = Some(on);
        self
    }

    /// True when no field is set
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_bits() {
        assert_eq!(Mode::from_bits(0x24), Mode::Cool);
        assert_eq!(Mode::from_bits(0xA0), Mode::Other(0xA0));
        assert_eq!(Mode::Other(0xA0).bits(), 0xA0);
        assert_eq!(Mode::Heat.bits(), 0x80);
    }

    #[test]
    fn test_louver_bits() {
        assert_eq!(VerticalLouver::from_bits(0x98), VerticalLouver::Swing);
        assert_eq!(VerticalLouver::from_bits(0x9F), VerticalLouver::Off);
        assert_eq!(VerticalLouver::from_bits(0x02), VerticalLouver::Other(0x02));
        assert_eq!(HorizontalLouver::from_bits(0xE5), HorizontalLouver::Off);
    }

    #[test]
    fn test_fan_speed_bits() {
        assert_eq!(FanSpeed::from_bits(0xA0), FanSpeed::Auto);
        assert_eq!(FanSpeed::Low.bits(), 0x60);
        assert_eq!(FanSpeed::from_bits(0x00), FanSpeed::Other(0x00));
    }

    #[test]
    fn test_command_builder() {
        let cmd = Command::new().power(true).mode(Mode::Cool).target_temp(24.0);
        assert_eq!(cmd.power, Some(true));
        assert_eq!(cmd.mode, Some(Mode::Cool));
        assert_eq!(cmd.fan_speed, None);
        assert!(!cmd.is_empty());
        assert!(Command::new().is_empty());
    }

    #[test]
    fn test_command_json_skips_untouched() {
        let json = serde_json::to_string(&Command::new().power(false)).unwrap();
        assert_eq!(json, r#"{"power":false}"#);

        let cmd: Command = serde_json::from_str(r#"{"mode":"heat","target_temp":22.5}"#).unwrap();
        assert_eq!(cmd.mode, Some(Mode::Heat));
        assert_eq!(cmd.target_temp, Some(22.5));
        assert_eq!(cmd.power, None);
    }

    #[test]
    fn test_state_as_command_keeps_known_fields() {
        let state = AcState {
            power: Some(true),
            ambient_temp: Some(23.4),
            fan_speed: Some(FanSpeed::Low),
            ..AcState::default()
        };
        let cmd = state.as_command();
        assert_eq!(cmd.power, Some(true));
        assert_eq!(cmd.fan_speed, Some(FanSpeed::Low));
        assert_eq!(cmd.mode, None);
    }
}
