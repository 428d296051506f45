//! Decoding of unit frames and encoding of module requests

use crate::commands::{InfoCode, PacketType};
use crate::frame::Frame;
use crate::types::{
    AcState, Command, FanSpeed, HorizontalLouver, Mode, ProtocolError, VerticalLouver,
};

/// Body of every pong: `1C 27` followed by six zero bytes
pub const PONG_BODY: [u8; 8] = [0x1C, 0x27, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
/// Set-params commands carry a body shaped like the small status
pub const SET_PARAMS_BODY_LEN: usize = 15;

pub const MIN_TARGET_TEMP: f32 = 16.0;
pub const MAX_TARGET_TEMP: f32 = 32.0;

// Small status / set-params body masks
const TEMP_INT_MASK: u8 = 0xF8;
const TEMP_FRAC_MASK: u8 = 0x80;
const TURBO_MASK: u8 = 0x40;
const MUTE_MASK: u8 = 0x80;
const SLEEP_MASK: u8 = 0x04;
const IFEEL_MASK: u8 = 0x08;
const POWER_MASK: u8 = 0x20;
const CLEAN_MASK: u8 = 0x04;
const HEALTH_MASK: u8 = 0x02;
const HEALTH_STATUS_MASK: u8 = 0x01;
/// Set means the display is off
const DISPLAY_OFF_MASK: u8 = 0x10;
const MILDEW_MASK: u8 = 0x08;

/// Operating parameters reported by a small status frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SmallStatus {
    pub power: bool,
    pub target_temp: f32,
    pub clean: bool,
    pub health: bool,
    pub health_status: bool,
    pub mode: Mode,
    pub sleep: bool,
    pub ifeel: bool,
    pub louver_vertical: VerticalLouver,
    pub louver_horizontal: HorizontalLouver,
    pub fan_speed: FanSpeed,
    pub fan_turbo: bool,
    pub fan_mute: bool,
    pub display: bool,
    pub mildew: bool,
}

/// Temperatures reported by a big or periodic status frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BigStatus {
    pub ambient_temp: f32,
    pub outdoor_temp: f32,
}

/// What a unit frame means to the module
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Ping,
    /// Command frames only ever flow from the module to the unit
    UnexpectedCommand,
    SmallStatus(SmallStatus),
    BigStatus(BigStatus),
    /// Echo of a set-params command; carries the checksum of that command
    SetParamsEcho { checksum: [u8; 2] },
    UnknownInfo(u8),
    Init,
    Vendor,
}

/// Interpret a checksum-valid frame
#[allow(clippy::missing_errors_doc)]
pub fn decode(frame: &Frame) -> Result<Message, ProtocolError> {
    let kind = frame
        .kind()
        .ok_or(ProtocolError::UnknownPacketType(frame.header.packet_type))?;

    match kind {
        PacketType::Ping => Ok(Message::Ping),
        PacketType::Command => Ok(Message::UnexpectedCommand),
        PacketType::Init => Ok(Message::Init),
        PacketType::Unknown => Ok(Message::Vendor),
        PacketType::Info => decode_info(&frame.body),
    }
}

fn decode_info(body: &[u8]) -> Result<Message, ProtocolError> {
    require_len(body, 2)?;
    match InfoCode::from_u8(body[1]) {
        Some(InfoCode::SmallStatus) => decode_small_status(body).map(Message::SmallStatus),
        Some(InfoCode::BigStatus | InfoCode::PeriodicStatus) => {
            decode_big_status(body).map(Message::BigStatus)
        }
        Some(InfoCode::SetParams) => {
            require_len(body, InfoCode::SetParams.body_length())?;
            Ok(Message::SetParamsEcho {
                checksum: [body[2], body[3]],
            })
        }
        None => Ok(Message::UnknownInfo(body[1])),
    }
}

/// Decode a small status body (15 bytes)
///
/// ```text
/// [2]  temperature integer (bits 7..3, +8) | vertical louver (bits 2..0)
/// [3]  horizontal louver (bits 7..5)
/// [4]  temperature half degree (bit 7)
/// [5]  fan speed (bits 7..5)
/// [6]  mute (bit 7) | turbo (bit 6)
/// [7]  mode (bits 7..5) | iFeel (bit 3) | sleep (bit 2)
/// [10] power (bit 5) | clean (bit 2) | health (bit 1) | health status (bit 0)
/// [12] display off (bit 4) | anti-mildew (bit 3)
/// ```
pub fn decode_small_status(body: &[u8]) -> Result<SmallStatus, ProtocolError> {
    require_len(body, InfoCode::SmallStatus.body_length())?;

    let half = if body[4] & TEMP_FRAC_MASK != 0 { 0.5 } else { 0.0 };
    Ok(SmallStatus {
        power: body[10] & POWER_MASK != 0,
        target_temp: 8.0 + f32::from(body[2] >> 3) + half,
        clean: body[10] & CLEAN_MASK != 0,
        health: body[10] & HEALTH_MASK != 0,
        health_status: body[10] & HEALTH_STATUS_MASK != 0,
        mode: Mode::from_bits(body[7]),
        sleep: body[7] & SLEEP_MASK != 0,
        ifeel: body[7] & IFEEL_MASK != 0,
        louver_vertical: VerticalLouver::from_bits(body[2]),
        louver_horizontal: HorizontalLouver::from_bits(body[3]),
        fan_speed: FanSpeed::from_bits(body[5]),
        fan_turbo: body[6] & TURBO_MASK != 0,
        fan_mute: body[6] & MUTE_MASK != 0,
        display: body[12] & DISPLAY_OFF_MASK == 0,
        mildew: body[12] & MILDEW_MASK != 0,
    })
}

/// Decode a big or periodic status body (24 bytes). Ambient temperature is
/// `b7 - 0x20 + b23 / 10`; the outdoor byte `b9 - 0x20` is only a rough
/// indication.
#[allow(clippy::missing_errors_doc)]
pub fn decode_big_status(body: &[u8]) -> Result<BigStatus, ProtocolError> {
    require_len(body, InfoCode::BigStatus.body_length())?;

    Ok(BigStatus {
        ambient_temp: f32::from(body[7]) - 32.0 + f32::from(body[23]) / 10.0,
        outdoor_temp: f32::from(body[9]) - 32.0,
    })
}

fn require_len(body: &[u8], expected: usize) -> Result<(), ProtocolError> {
    if body.len() < expected {
        return Err(ProtocolError::BodyTooShort {
            expected,
            actual: body.len(),
        });
    }
    Ok(())
}

fn update<T: PartialEq>(slot: &mut Option<T>, value: T) -> bool {
    let changed = slot.as_ref() != Some(&value);
    *slot = Some(value);
    changed
}

impl AcState {
    /// Store the reported parameters, returning true if anything changed
    pub fn apply_small_status(&mut self, status: &SmallStatus) -> bool {
        let mut changed = false;
        changed |= update(&mut self.power, status.power);
        changed |= update(&mut self.target_temp, status.target_temp);
        changed |= update(&mut self.clean, status.clean);
        changed |= update(&mut self.health, status.health);
        changed |= update(&mut self.health_status, status.health_status);
        changed |= update(&mut self.mode, status.mode);
        changed |= update(&mut self.sleep, status.sleep);
        changed |= update(&mut self.ifeel, status.ifeel);
        changed |= update(&mut self.louver_vertical, status.louver_vertical);
        changed |= update(&mut self.louver_horizontal, status.louver_horizontal);
        changed |= update(&mut self.fan_speed, status.fan_speed);
        changed |= update(&mut self.fan_turbo, status.fan_turbo);
        changed |= update(&mut self.fan_mute, status.fan_mute);
        changed |= update(&mut self.display, status.display);
        changed |= update(&mut self.mildew, status.mildew);
        changed
    }

    /// Store the reported temperatures, returning true if either changed
    pub fn apply_big_status(&mut self, status: &BigStatus) -> bool {
        let ambient = update(&mut self.ambient_temp, status.ambient_temp);
        let outdoor = update(&mut self.outdoor_temp, status.outdoor_temp);
        ambient || outdoor
    }
}

/// Answer to a ping
pub fn pong(now: u64) -> Result<Frame, ProtocolError> {
    Frame::build(PacketType::Ping, 0x01, &PONG_BODY, now)
}

/// Ask the unit for a small or big status report
pub fn status_request(code: InfoCode, now: u64) -> Result<Frame, ProtocolError> {
    Frame::build(PacketType::Command, 0x00, &[code as u8, 0x01], now)
}

/// Set-params body: every parameter already known in `state`, overridden by
/// whatever `command` sets.
#[must_use]
pub fn encode_set_params(state: &AcState, command: &Command) -> [u8; SET_PARAMS_BODY_LEN] {
    let mut body = [0u8; SET_PARAMS_BODY_LEN];
    body[0] = InfoCode::SetParams as u8;
    body[1] = 0x01;
    overlay(&mut body, &state.as_command());
    overlay(&mut body, command);
    body
}

/// Set-params command frame
pub fn set_params(state: &AcState, command: &Command, now: u64) -> Result<Frame, ProtocolError> {
    Frame::build(
        PacketType::Command,
        0x00,
        &encode_set_params(state, command),
        now,
    )
}

fn set_bits(byte: &mut u8, mask: u8, bits: u8) {
    *byte = (*byte & !mask) | (bits & mask);
}

fn set_flag(byte: &mut u8, mask: u8, on: bool) {
    set_bits(byte, mask, if on { mask } else { 0 });
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn overlay(body: &mut [u8; SET_PARAMS_BODY_LEN], command: &Command) {
    if let Some(temp) = command.target_temp.filter(|t| t.is_finite()) {
        let temp = temp.clamp(MIN_TARGET_TEMP, MAX_TARGET_TEMP);
        let whole = temp.trunc();
        set_bits(&mut body[2], TEMP_INT_MASK, ((whole as u8) - 8) << 3);
        set_flag(&mut body[4], TEMP_FRAC_MASK, temp > whole);
    }
    if let Some(louver) = command.louver_vertical {
        set_bits(&mut body[2], VerticalLouver::MASK, louver.bits());
    }
    if let Some(louver) = command.louver_horizontal {
        set_bits(&mut body[3], HorizontalLouver::MASK, louver.bits());
    }
    if let Some(speed) = command.fan_speed {
        set_bits(&mut body[5], FanSpeed::MASK, speed.bits());
    }
    if let Some(on) = command.fan_turbo {
        set_flag(&mut body[6], TURBO_MASK, on);
    }
    if let Some(on) = command.fan_mute {
        set_flag(&mut body[6], MUTE_MASK, on);
    }
    if let Some(mode) = command.mode {
        set_bits(&mut body[7], Mode::MASK, mode.bits());
    }
    if let Some(on) = command.sleep {
        set_flag(&mut body[7], SLEEP_MASK, on);
    }
    if let Some(on) = command.ifeel {
        set_flag(&mut body[7], IFEEL_MASK, on);
    }
    if let Some(on) = command.power {
        set_flag(&mut body[10], POWER_MASK, on);
    }
    if let Some(on) = command.clean {
        set_flag(&mut body[10], CLEAN_MASK, on);
    }
    if let Some(on) = command.health {
        set_flag(&mut body[10], HEALTH_MASK, on);
    }
    if let Some(on) = command.display {
        set_flag(&mut body[12], DISPLAY_OFF_MASK, !on);
    }
    if let Some(on) = command.mildew {
        set_flag(&mut body[12], MILDEW_MASK, on);
    }
}
