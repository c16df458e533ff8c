//! Binary command header.
//!
//! Every binary frame starts with a 4-byte header:
//!
//! ```text
//! byte 0                         byte 1      bytes 2..4
//! +------+-------+-----+--------+-----------+------------------+
//! | type | write | set | id hi3 | id low 8  | data length (BE) |
//! | 7..6 |   5   | 4..3|  2..0  |           |                  |
//! +------+-------+-----+--------+-----------+------------------+
//! ```
//!
//! Out-of-range fields are masked to their bit width, never rejected.

use byteorder::{BigEndian, ByteOrder};

/// Mask applied to the 11-bit command id.
pub const COMMAND_ID_MASK: u16 = 0x07FF;

/// Mask applied to the 2-bit command type.
pub const COMMAND_TYPE_MASK: u8 = 0x03;

/// Command set selector (bits 12..11 of the command word).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[repr(u8)]
pub enum CommandSet {
    /// General commands that need no login.
    #[default]
    System = 0,
    /// Commands accessible with a guest login.
    Guest = 1,
    /// Commands accessible with an operator login.
    Operator = 2,
    /// Commands accessible with an admin login.
    Admin = 3,
}

impl CommandSet {
    /// Build from the low two bits of `bits`.
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => Self::System,
            1 => Self::Guest,
            2 => Self::Operator,
            _ => Self::Admin,
        }
    }
}

/// System set commands used by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SystemCommand {
    /// Unit or host is closing the connection.
    Disconnect = 50,
    /// Link liveness probe, echoed by the unit.
    Keepalive = 51,
    /// Free-form UTF-8 message from the unit.
    MessageString = 52,
    /// Reboot the unit.
    Reboot = 53,
    /// Request a login.
    LoginRequest = 63,
    /// Login accepted.
    LoginSuccessful = 64,
    /// Login rejected.
    LoginFailed = 65,
    /// Log out.
    Logout = 66,
    /// Login user name.
    LoginUsername = 67,
    /// Login password.
    LoginPassword = 68,
    /// Firmware version as an ASCII decimal.
    FirmwareVersion = 69,
}

impl SystemCommand {
    /// Look up a system command by id.
    pub fn from_id(id: u16) -> Option<Self> {
        let cmd = match id {
            50 => Self::Disconnect,
            51 => Self::Keepalive,
            52 => Self::MessageString,
            53 => Self::Reboot,
            63 => Self::LoginRequest,
            64 => Self::LoginSuccessful,
            65 => Self::LoginFailed,
            66 => Self::Logout,
            67 => Self::LoginUsername,
            68 => Self::LoginPassword,
            69 => Self::FirmwareVersion,
            _ => return None,
        };
        Some(cmd)
    }
}

/// Admin set commands used by the transfer engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum AdminCommand {
    /// Write a block of firmware pages.
    Firmware = 4,
    /// Commit the uploaded firmware image.
    FirmwareLoad = 5,
    /// Read one page of the configuration export.
    ConfigExport = 6,
    /// Write one page of a configuration import.
    ConfigImport = 7,
    /// Apply the uploaded configuration.
    ConfigImportComplete = 8,
    /// Read the error report of a failed import.
    ConfigImportLogRead = 9,
    /// Abandon an import in progress.
    ConfigImportCancel = 10,
    /// Read back the current settings.
    SettingsGet = 11,
    /// Number of configuration export pages.
    ConfigExportCount = 12,
    /// Erase the event log.
    LogsClear = 160,
    /// Read one log entry.
    LogsRead = 161,
    /// Number of stored log entries.
    LogsCount = 162,
}

impl AdminCommand {
    /// Look up an admin command by id.
    pub fn from_id(id: u16) -> Option<Self> {
        let cmd = match id {
            4 => Self::Firmware,
            5 => Self::FirmwareLoad,
            6 => Self::ConfigExport,
            7 => Self::ConfigImport,
            8 => Self::ConfigImportComplete,
            9 => Self::ConfigImportLogRead,
            10 => Self::ConfigImportCancel,
            11 => Self::SettingsGet,
            12 => Self::ConfigExportCount,
            160 => Self::LogsClear,
            161 => Self::LogsRead,
            162 => Self::LogsCount,
            _ => return None,
        };
        Some(cmd)
    }
}

/// Decoded 4-byte command header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandWord {
    /// Command type (2 bits). The driver only uses type 0.
    pub command_type: u8,
    /// Write access flag.
    pub write: bool,
    /// Command set selector.
    pub set: CommandSet,
    /// Command id within the set (11 bits).
    pub id: u16,
    /// Number of data bytes following the header.
    pub data_length: u16,
}

impl CommandWord {
    /// Encoded header length in bytes.
    pub const LEN: usize = 4;

    /// Create a read command of type 0.
    pub fn new(set: CommandSet, id: u16) -> Self {
        Self {
            command_type: 0,
            write: false,
            set,
            id: id & COMMAND_ID_MASK,
            data_length: 0,
        }
    }

    /// Create a system set command.
    pub fn system(cmd: SystemCommand) -> Self {
        Self::new(CommandSet::System, cmd as u16)
    }

    /// Create an admin set command.
    pub fn admin(cmd: AdminCommand) -> Self {
        Self::new(CommandSet::Admin, cmd as u16)
    }

    /// Set the write access flag.
    #[must_use]
    pub fn with_write(mut self, write: bool) -> Self {
        self.write = write;
        self
    }

    /// Set the command type, masked to 2 bits.
    #[must_use]
    pub fn with_type(mut self, command_type: u8) -> Self {
        self.command_type = command_type & COMMAND_TYPE_MASK;
        self
    }

    /// Set the declared data length.
    #[must_use]
    pub fn with_data_length(mut self, data_length: u16) -> Self {
        self.data_length = data_length;
        self
    }

    /// The system command this header carries, if any.
    pub fn system_command(&self) -> Option<SystemCommand> {
        match self.set {
            CommandSet::System => SystemCommand::from_id(self.id),
            _ => None,
        }
    }

    /// The admin command this header carries, if any.
    pub fn admin_command(&self) -> Option<AdminCommand> {
        match self.set {
            CommandSet::Admin => AdminCommand::from_id(self.id),
            _ => None,
        }
    }

    /// Pack into the 4-byte wire form.
    pub fn encode(&self) -> [u8; 4] {
        let word = (u16::from(self.command_type & COMMAND_TYPE_MASK) << 14)
            | (u16::from(self.write) << 13)
            | (u16::from(self.set as u8 & 0x03) << 11)
            | (self.id & COMMAND_ID_MASK);

        let mut out = [0u8; Self::LEN];
        BigEndian::write_u16(&mut out[0..2], word);
        BigEndian::write_u16(&mut out[2..4], self.data_length);
        out
    }

    /// Unpack from the wire form.
    ///
    /// Returns `None` unless `bytes` is exactly 4 bytes long.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::LEN {
            return None;
        }

        let word = BigEndian::read_u16(&bytes[0..2]);
        Some(Self {
            command_type: (word >> 14) as u8 & COMMAND_TYPE_MASK,
            write: word & (1 << 13) != 0,
            set: CommandSet::from_bits((word >> 11) as u8),
            id: word & COMMAND_ID_MASK,
            data_length: BigEndian::read_u16(&bytes[2..4]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let word = CommandWord::admin(AdminCommand::ConfigImport)
            .with_write(true)
            .with_data_length(2);
        assert_eq!(word.encode(), [0x38, 0x07, 0x00, 0x02]);

        let keepalive = CommandWord::system(SystemCommand::Keepalive).with_write(true);
        assert_eq!(keepalive.encode(), [0x20, 0x33, 0x00, 0x00]);
    }

    #[test]
    fn test_encode_high_id_bits_land_in_first_byte() {
        let word = CommandWord::new(CommandSet::Operator, 0x5A5).with_type(2);
        let bytes = word.encode();
        // type 10, write 0, set 10, id high 101
        assert_eq!(bytes[0], 0b1001_0101);
        assert_eq!(bytes[1], 0xA5);
    }

    #[test]
    fn test_decode_roundtrips_every_field_combination() {
        for set in [
            CommandSet::System,
            CommandSet::Guest,
            CommandSet::Operator,
            CommandSet::Admin,
        ] {
            for write in [false, true] {
                for command_type in 0..4 {
                    for id in 0..=COMMAND_ID_MASK {
                        let word = CommandWord::new(set, id)
                            .with_write(write)
                            .with_type(command_type)
                            .with_data_length(id.rotate_left(5) ^ 0xBEEF);
                        assert_eq!(CommandWord::decode(&word.encode()), Some(word));
                    }
                }
            }
        }
    }

    #[test]
    fn test_out_of_range_fields_are_masked() {
        let word = CommandWord::new(CommandSet::Admin, 0x0FFF).with_type(0xFF);
        assert_eq!(word.id, 0x07FF);
        assert_eq!(word.command_type, 3);

        let decoded = CommandWord::decode(&word.encode()).unwrap();
        assert_eq!(decoded.id, 0x07FF);
        assert_eq!(decoded.set, CommandSet::Admin);

        // A field written directly past its width must not bleed into neighbours.
        let raw = CommandWord {
            id: 0xFFFF,
            ..CommandWord::default()
        };
        assert_eq!(raw.encode()[0], 0x07);
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        assert!(CommandWord::decode(&[]).is_none());
        assert!(CommandWord::decode(&[0x00, 0x33, 0x00]).is_none());
        assert!(CommandWord::decode(&[0x00, 0x33, 0x00, 0x00, 0x00]).is_none());
    }

    #[test]
    fn test_command_lookup() {
        let word = CommandWord::decode(&[0x18, 0xA1, 0x00, 0x00]).unwrap();
        assert_eq!(word.admin_command(), Some(AdminCommand::LogsRead));
        assert_eq!(word.system_command(), None);

        let word = CommandWord::decode(&[0x00, 0x45, 0x00, 0x04]).unwrap();
        assert_eq!(word.system_command(), Some(SystemCommand::FirmwareVersion));
        assert_eq!(word.data_length, 4);
    }
}
