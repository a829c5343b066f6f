use crate::transport::TransferError;
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("No device with VID = 0x{vendor_id:04X}, PID = 0x{product_id:04X} found")]
    DeviceNotFound { vendor_id: u16, product_id: u16 },
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error("USB error: {0}")]
    Usb(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub fn usb(context: &str, e: impl std::fmt::Display) -> Self {
        Error::Usb(format!("{}: {}", context, e))
    }
}
