// Command messages

pub const PC_to_RDR_IccPowerOn: u8 = 0x62;
pub const PC_to_RDR_IccPowerOff: u8 = 0x63;
pub const PC_to_RDR_GetSlotStatus: u8 = 0x65;
pub const PC_to_RDR_XfrBlock: u8 = 0x6F;

// Response messages
pub const RDR_to_PC_DataBlock: u8 = 0x80;
pub const RDR_to_PC_SlotStatus: u8 = 0x81;

// CCID response message error constants
pub const CMD_ABORTED: u8 = 0xFF;
pub const ICC_MUTE: u8 = 0xFE;
pub const XFR_PARITY_ERROR: u8 = 0xFD;
pub const XFR_OVERRUN: u8 = 0xFC;
pub const HW_ERROR: u8 = 0xFB;
pub const BAD_ATR_TS: u8 = 0xF8;
pub const BAD_ATR_TCK: u8 = 0xF7;
pub const ICC_PROTOCOL_NOT_SUPPORTED: u8 = 0xF6;
pub const ICC_CLASS_NOT_SUPPORTED: u8 = 0xF5;
pub const PROCEDURE_BYTE_CONFLICT: u8 = 0xF4;
pub const DEACTIVATED_PROTOCOL: u8 = 0xF3;
pub const BUSY_WITH_AUTO_SEQUENCE: u8 = 0xF2;
pub const PIN_TIMEOUT: u8 = 0xF0;
pub const PIN_CANCELLED: u8 = 0xEF;
pub const CMD_SLOT_BUSY: u8 = 0xE0;
pub const CMD_NOT_SUPPORTED: u8 = 0x00;

/// Size of the header shared by every bulk message
pub const CCID_HEADER_SIZE: usize = 10;

/// Payload of the test `PC_to_RDR_XfrBlock` message
pub const TEST_APDU: [u8; 5] = [0x00, 0xFD, 0x00, 0x00, 0x00];
