//! Packet types and info codes of the AUX serial protocol

/// Packet type carried in header byte 2
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Keep-alive from the unit; the module must answer with a pong
    Ping = 0x01,
    /// Command or status request sent by the module
    Command = 0x06,
    /// Status report or command echo sent by the unit
    Info = 0x07,
    /// Seen during power-up, never interpreted
    Init = 0x09,
    /// Vendor specific, never interpreted
    Unknown = 0x0B,
}

impl PacketType {
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(PacketType::Ping),
            0x06 => Some(PacketType::Command),
            0x07 => Some(PacketType::Info),
            0x09 => Some(PacketType::Init),
            0x0B => Some(PacketType::Unknown),
            _ => None,
        }
    }
}

/// Code in body byte 1 of info packets, echoing what the module asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InfoCode {
    /// Echo of a set-params command (4 byte body)
    SetParams = 0x01,
    /// Small status: operating parameters (15 byte body)
    SmallStatus = 0x11,
    /// Big status: temperatures and diagnostics (24 byte body)
    BigStatus = 0x21,
    /// Unsolicited big status, same layout as `BigStatus`
    PeriodicStatus = 0x2C,
}

impl InfoCode {
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(InfoCode::SetParams),
            0x11 => Some(InfoCode::SmallStatus),
            0x21 => Some(InfoCode::BigStatus),
            0x2C => Some(InfoCode::PeriodicStatus),
            _ => None,
        }
    }

    /// Body length the unit uses when answering with this code
    #[must_use]
    pub fn body_length(self) -> usize {
        match self {
            InfoCode::SetParams => 0x04,
            InfoCode::SmallStatus => 0x0F,
            InfoCode::BigStatus | InfoCode::PeriodicStatus => 0x18,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_type_lookup() {
        assert_eq!(PacketType::from_u8(0x07), Some(PacketType::Info));
        assert_eq!(PacketType::from_u8(0x0B), Some(PacketType::Unknown));
        assert_eq!(PacketType::from_u8(0x02), None);
    }

    #[test]
    fn test_info_code_lengths() {
        assert_eq!(InfoCode::from_u8(0x2C), Some(InfoCode::PeriodicStatus));
        assert_eq!(InfoCode::SmallStatus.body_length(), 15);
        assert_eq!(InfoCode::PeriodicStatus.body_length(), 24);
        assert_eq!(InfoCode::from_u8(0x99), None);
    }
}
