use crate::ccid_const::{self, CCID_HEADER_SIZE, TEST_APDU};
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use std::fmt::{Display, Formatter};
use std::io;
use std::ops::Deref;
use thiserror::Error;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CommonMessageHeader {
    pub bMessageType: u8,
    pub dwLength: u32,
    pub bSlot: u8,
    pub bSeq: u8,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CCIDError {
    #[error("CCID message is truncated, expects at least {expected} bytes, got {actual} bytes")]
    Truncated { expected: usize, actual: usize },
    #[error("CCID message declares {declared} data bytes but only {available} were received")]
    LengthMismatch { declared: u32, available: usize },
    #[error("Unknown CCID response type 0x{0:02X}")]
    UnknownResponseType(u8),
    #[error("Invalid slot status register value 0x{0:02X}")]
    InvalidSlotStatus(u8),
}

pub trait Decode {
    type Error;
    fn decode<T: ReadBytesExt>(input: &mut T) -> Result<Self, Self::Error>
    where
        Self: Sized;
}

impl CommonMessageHeader {
    pub const fn new(bMessageType: u8, dwLength: u32, bSlot: u8, bSeq: u8) -> Self {
        Self {
            bMessageType,
            dwLength,
            bSlot,
            bSeq,
        }
    }

    /// Lays the header out in wire order, followed by the three message specific bytes.
    pub fn to_bytes(self, specific: [u8; 3]) -> [u8; CCID_HEADER_SIZE] {
        let mut out = [0u8; CCID_HEADER_SIZE];
        out[0] = self.bMessageType;
        LittleEndian::write_u32(&mut out[1..5], self.dwLength);
        out[5] = self.bSlot;
        out[6] = self.bSeq;
        out[7..].copy_from_slice(&specific);
        out
    }
}

impl Decode for CommonMessageHeader {
    type Error = io::Error;
    fn decode<T: ReadBytesExt>(input: &mut T) -> Result<Self, Self::Error> {
        let bMessageType = input.read_u8()?;
        let dwLength = input.read_u32::<LittleEndian>()?;
        let bSlot = input.read_u8()?;
        let bSeq = input.read_u8()?;
        Ok(Self {
            bMessageType,
            dwLength,
            bSlot,
            bSeq,
        })
    }
}

// bPowerSelect: let the reader pick the voltage
const POWER_SELECT_AUTOMATIC: u8 = 0x00;

pub fn power_on(slot: u8, seq: u8) -> [u8; CCID_HEADER_SIZE] {
    CommonMessageHeader::new(ccid_const::PC_to_RDR_IccPowerOn, 0, slot, seq)
        .to_bytes([POWER_SELECT_AUTOMATIC, 0x00, 0x00])
}

pub fn power_off(slot: u8, seq: u8) -> [u8; CCID_HEADER_SIZE] {
    CommonMessageHeader::new(ccid_const::PC_to_RDR_IccPowerOff, 0, slot, seq)
        .to_bytes([0x00, 0x00, 0x00])
}

pub fn get_slot_status(slot: u8, seq: u8) -> [u8; CCID_HEADER_SIZE] {
    CommonMessageHeader::new(ccid_const::PC_to_RDR_GetSlotStatus, 0, slot, seq)
        .to_bytes([0x00, 0x00, 0x00])
}

const XFR_BLOCK_SIZE: usize = CCID_HEADER_SIZE + TEST_APDU.len();

/// `PC_to_RDR_XfrBlock` carrying the fixed test APDU, with BWI and level parameter zeroed.
pub fn xfr_block(slot: u8, seq: u8) -> [u8; XFR_BLOCK_SIZE] {
    let header = CommonMessageHeader::new(
        ccid_const::PC_to_RDR_XfrBlock,
        TEST_APDU.len() as u32,
        slot,
        seq,
    )
    .to_bytes([0x00, 0x00, 0x00]);
    let mut out = [0u8; XFR_BLOCK_SIZE];
    out[..CCID_HEADER_SIZE].copy_from_slice(&header);
    out[CCID_HEADER_SIZE..].copy_from_slice(&TEST_APDU);
    out
}

/// The commands this tool knows how to send.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Command {
    IccPowerOn,
    IccPowerOff,
    GetSlotStatus,
    XfrBlock,
}

impl Command {
    pub fn message_type(self) -> u8 {
        match self {
            Command::IccPowerOn => ccid_const::PC_to_RDR_IccPowerOn,
            Command::IccPowerOff => ccid_const::PC_to_RDR_IccPowerOff,
            Command::GetSlotStatus => ccid_const::PC_to_RDR_GetSlotStatus,
            Command::XfrBlock => ccid_const::PC_to_RDR_XfrBlock,
        }
    }

    pub fn encode(self, slot: u8, seq: u8) -> Vec<u8> {
        match self {
            Command::IccPowerOn => power_on(slot, seq).to_vec(),
            Command::IccPowerOff => power_off(slot, seq).to_vec(),
            Command::GetSlotStatus => get_slot_status(slot, seq).to_vec(),
            Command::XfrBlock => xfr_block(slot, seq).to_vec(),
        }
    }

    /// Number of bytes the LUFA demo answers with: the ATR is 17 bytes long and
    /// the test APDU is answered with a bare status word.
    pub fn expected_response_len(self) -> usize {
        match self {
            Command::IccPowerOn => CCID_HEADER_SIZE + 17,
            Command::IccPowerOff | Command::GetSlotStatus => CCID_HEADER_SIZE,
            Command::XfrBlock => CCID_HEADER_SIZE + 2,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SlotErrorRegister {
    CommandAbort,
    ICCMute,
    TransferParityError,
    TransferOverrun,
    HardwareError,
    BadATRTS,
    BadATRTCK,
    UnsupportedICCProtocol,
    UnsupportedICCClass,
    ProcedureByteConflict,
    DeactivatedProtocol,
    BusyWithAutoSequence,
    PINTimeout,
    PINCancelled,
    CommandSlotBusy,
    UnsupportedCommand,
    UserDefined(u8),
    RFU(u8),
    InvalidParameter(u8),
}

impl From<u8> for SlotErrorRegister {
    fn from(value: u8) -> Self {
        match value {
            ccid_const::CMD_ABORTED => SlotErrorRegister::CommandAbort,
            ccid_const::ICC_MUTE => SlotErrorRegister::ICCMute,
            ccid_const::XFR_PARITY_ERROR => SlotErrorRegister::TransferParityError,
            ccid_const::XFR_OVERRUN => SlotErrorRegister::TransferOverrun,
            ccid_const::HW_ERROR => SlotErrorRegister::HardwareError,
            ccid_const::BAD_ATR_TS => SlotErrorRegister::BadATRTS,
            ccid_const::BAD_ATR_TCK => SlotErrorRegister::BadATRTCK,
            ccid_const::ICC_PROTOCOL_NOT_SUPPORTED => SlotErrorRegister::UnsupportedICCProtocol,
            ccid_const::ICC_CLASS_NOT_SUPPORTED => SlotErrorRegister::UnsupportedICCClass,
            ccid_const::PROCEDURE_BYTE_CONFLICT => SlotErrorRegister::ProcedureByteConflict,
            ccid_const::DEACTIVATED_PROTOCOL => SlotErrorRegister::DeactivatedProtocol,
            ccid_const::BUSY_WITH_AUTO_SEQUENCE => SlotErrorRegister::BusyWithAutoSequence,
            ccid_const::PIN_TIMEOUT => SlotErrorRegister::PINTimeout,
            ccid_const::PIN_CANCELLED => SlotErrorRegister::PINCancelled,
            ccid_const::CMD_SLOT_BUSY => SlotErrorRegister::CommandSlotBusy,
            ccid_const::CMD_NOT_SUPPORTED => SlotErrorRegister::UnsupportedCommand,
            0x81..=0xC0 => SlotErrorRegister::UserDefined(value),
            0x01..=0x7F => SlotErrorRegister::InvalidParameter(value),
            _ => SlotErrorRegister::RFU(value),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ICCStatus {
    Active,
    Inactive,
    Absent,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CommandStatus {
    Success,
    Failure,
    TimeExtensionRequested,
}

/// `bStatus`: ICC status in bits 0..1, command status in bits 6..7.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SlotStatusRegister {
    pub icc: ICCStatus,
    pub command: CommandStatus,
}

impl TryFrom<u8> for SlotStatusRegister {
    type Error = CCIDError;
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let icc = match value & 0x03 {
            0x00 => ICCStatus::Active,
            0x01 => ICCStatus::Inactive,
            0x02 => ICCStatus::Absent,
            _ => return Err(CCIDError::InvalidSlotStatus(value)),
        };
        let command = match (value & 0xC0) >> 6 {
            0x00 => CommandStatus::Success,
            0x01 => CommandStatus::Failure,
            0x02 => CommandStatus::TimeExtensionRequested,
            _ => return Err(CCIDError::InvalidSlotStatus(value)),
        };
        Ok(Self { icc, command })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ICCClockStatus {
    Running,
    StoppedInL,
    StoppedInH,
    StoppedUnknown,
    RFU(u8),
}

impl From<u8> for ICCClockStatus {
    fn from(value: u8) -> Self {
        match value {
            0x00 => ICCClockStatus::Running,
            0x01 => ICCClockStatus::StoppedInL,
            0x02 => ICCClockStatus::StoppedInH,
            0x03 => ICCClockStatus::StoppedUnknown,
            other => ICCClockStatus::RFU(other),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ResponseMessageHeader {
    inner: CommonMessageHeader,
    pub bStatus: SlotStatusRegister,
    pub bError: SlotErrorRegister,
}

impl Deref for ResponseMessageHeader {
    type Target = CommonMessageHeader;
    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl ResponseMessageHeader {
    /// `bError` only carries meaning when the command failed.
    pub fn error(&self) -> Option<SlotErrorRegister> {
        match self.bStatus.command {
            CommandStatus::Failure => Some(self.bError),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    RDR_to_PC_DataBlock {
        header: ResponseMessageHeader,
        bChainParameter: u8,
        abData: Vec<u8>,
    },
    RDR_to_PC_SlotStatus {
        header: ResponseMessageHeader,
        bClockStatus: ICCClockStatus,
    },
}

impl Response {
    pub fn decode(data: &[u8]) -> Result<Self, CCIDError> {
        if data.len() < CCID_HEADER_SIZE {
            return Err(CCIDError::Truncated {
                expected: CCID_HEADER_SIZE,
                actual: data.len(),
            });
        }
        let mut input = io::Cursor::new(data);
        let inner = CommonMessageHeader::decode(&mut input).map_err(|_| CCIDError::Truncated {
            expected: CCID_HEADER_SIZE,
            actual: data.len(),
        })?;
        let bStatus = SlotStatusRegister::try_from(data[7])?;
        let header = ResponseMessageHeader {
            inner,
            bStatus,
            bError: SlotErrorRegister::from(data[8]),
        };
        let available = data.len() - CCID_HEADER_SIZE;
        if inner.dwLength as usize > available {
            return Err(CCIDError::LengthMismatch {
                declared: inner.dwLength,
                available,
            });
        }
        let payload = &data[CCID_HEADER_SIZE..CCID_HEADER_SIZE + inner.dwLength as usize];
        match inner.bMessageType {
            ccid_const::RDR_to_PC_DataBlock => Ok(Response::RDR_to_PC_DataBlock {
                header,
                bChainParameter: data[9],
                abData: payload.to_vec(),
            }),
            ccid_const::RDR_to_PC_SlotStatus => Ok(Response::RDR_to_PC_SlotStatus {
                header,
                bClockStatus: ICCClockStatus::from(data[9]),
            }),
            other => Err(CCIDError::UnknownResponseType(other)),
        }
    }

    pub fn header(&self) -> &ResponseMessageHeader {
        match self {
            Response::RDR_to_PC_DataBlock { header, .. }
            | Response::RDR_to_PC_SlotStatus { header, .. } => header,
        }
    }
}

impl Display for Response {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let header = self.header();
        let name = match self {
            Response::RDR_to_PC_DataBlock { .. } => "RDR_to_PC_DataBlock",
            Response::RDR_to_PC_SlotStatus { .. } => "RDR_to_PC_SlotStatus",
        };
        write!(
            f,
            "{} slot={} seq={} icc={:?} command={:?}",
            name, header.bSlot, header.bSeq, header.bStatus.icc, header.bStatus.command
        )?;
        if let Some(error) = header.error() {
            write!(f, " error={:?}", error)?;
        }
        match self {
            Response::RDR_to_PC_DataBlock { abData, .. } => write!(f, " data={:02X?}", abData),
            Response::RDR_to_PC_SlotStatus { bClockStatus, .. } => {
                write!(f, " clock={:?}", bClockStatus)
            }
        }
    }
}
