//! Interrupt report exchange with the LUFA WebUSB demo
use crate::transport::{EndpointIn, EndpointOut, TransferError};
use log::{debug, info};
use tokio::sync::watch;

pub const WEBUSB_VENDOR_ID: u16 = 0x03EB;
pub const WEBUSB_PRODUCT_ID: u16 = 0x206F;
pub const WEBUSB_INTERFACE: u8 = 0;

/// Size of the generic report exchanged on both interrupt endpoints
pub const WEBUSB_IO_EPSIZE: usize = 8;

pub type Report = [u8; WEBUSB_IO_EPSIZE];

/// Truncates or zero-pads `data` to one report.
pub fn to_report(data: &[u8]) -> Report {
    let mut report = [0u8; WEBUSB_IO_EPSIZE];
    let len = data.len().min(WEBUSB_IO_EPSIZE);
    report[..len].copy_from_slice(&data[..len]);
    report
}

/// Reads reports from the interrupt IN endpoint.
pub struct WebUSBReceiver<I> {
    input: I,
}

impl<I: EndpointIn> WebUSBReceiver<I> {
    pub fn new(input: I) -> Self {
        Self { input }
    }

    pub async fn receive(&mut self) -> Result<Report, TransferError> {
        let data = self.input.transfer_in(WEBUSB_IO_EPSIZE).await?;
        if data.len() != WEBUSB_IO_EPSIZE {
            debug!("Short report of {} bytes: {:02X?}", data.len(), data);
        }
        Ok(to_report(&data))
    }

    /// Receives and prints reports until `shutdown` turns true (or its sender goes away).
    /// Yields to the scheduler after every report. Returns how many reports were printed.
    pub async fn poll(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<u64, TransferError> {
        let mut received = 0u64;
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                report = self.receive() => {
                    let report = report?;
                    println!("{:?}", report);
                    received += 1;
                }
            }
            tokio::task::yield_now().await;
        }
        info!("Polling stopped after {} reports", received);
        Ok(received)
    }
}

/// Writes reports to the interrupt OUT endpoint.
pub struct WebUSBSender<O> {
    output: O,
}

impl<O: EndpointOut> WebUSBSender<O> {
    pub fn new(output: O) -> Self {
        Self { output }
    }

    /// Sends `data` as a single report; returns the bytes written.
    pub async fn send(&mut self, data: &[u8]) -> Result<usize, TransferError> {
        let report = to_report(data);
        debug!("Sending report {:02X?}", report);
        self.output.transfer_out(&report).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{self, Event};
    use crate::transport::{Direction, TransferStatus};

    #[tokio::test]
    async fn send_pads_to_report_size() {
        let (_, output, journal) = mock::pair();
        let mut sender = WebUSBSender::new(output);
        assert_eq!(sender.send(&[1, 2, 3, 4, 5]).await, Ok(8));
        assert_eq!(
            journal.borrow()[0],
            Event::WriteStart(vec![1, 2, 3, 4, 5, 0, 0, 0])
        );
    }

    #[tokio::test]
    async fn send_truncates_long_input() {
        let (_, output, journal) = mock::pair();
        let mut sender = WebUSBSender::new(output);
        sender.send(&[9; 12]).await.unwrap();
        assert_eq!(journal.borrow()[0], Event::WriteStart(vec![9; 8]));
    }

    #[tokio::test]
    async fn send_failure_carries_status() {
        let (_, mut output, _) = mock::pair();
        output.failures.push_back(Some(TransferStatus::Stall));
        let err = WebUSBSender::new(output).send(&[1]).await.unwrap_err();
        assert_eq!(err.direction, Direction::Out);
        assert!(err.to_string().contains("\"stall\""));
    }

    #[tokio::test]
    async fn receive_reads_one_report() {
        let (mut input, _, journal) = mock::pair();
        input.replies.push_back(Ok(vec![1, 2, 3, 4, 5, 6, 7, 8]));
        input.replies.push_back(Ok(vec![0xAA, 0xBB]));
        let mut receiver = WebUSBReceiver::new(input);
        assert_eq!(receiver.receive().await, Ok([1, 2, 3, 4, 5, 6, 7, 8]));
        assert_eq!(receiver.receive().await, Ok([0xAA, 0xBB, 0, 0, 0, 0, 0, 0]));
        assert_eq!(journal.borrow()[0], Event::ReadStart(WEBUSB_IO_EPSIZE));
    }

    #[tokio::test]
    async fn receive_failure_carries_status() {
        let (mut input, _, _) = mock::pair();
        input
            .replies
            .push_back(Err(TransferStatus::Other("babble".to_string())));
        let err = WebUSBReceiver::new(input).receive().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Transfer in failed with status \"babble\""
        );
    }

    #[tokio::test]
    async fn poll_stops_on_shutdown() {
        let (input, _, _) = mock::pair();
        let (tx, rx) = watch::channel(false);
        let mut receiver = WebUSBReceiver::new(input);
        let (polled, _) = tokio::join!(receiver.poll(rx), async {
            for _ in 0..5 {
                tokio::task::yield_now().await;
            }
            tx.send(true).unwrap();
        });
        assert!(polled.is_ok());
    }

    #[tokio::test]
    async fn poll_does_not_start_once_shut_down() {
        let (input, _, journal) = mock::pair();
        let (_tx, rx) = watch::channel(true);
        let polled = WebUSBReceiver::new(input).poll(rx).await;
        assert_eq!(polled, Ok(0));
        assert!(journal.borrow().is_empty());
    }

    #[tokio::test]
    async fn poll_ends_on_transfer_error() {
        let (mut input, _, _) = mock::pair();
        input.replies.push_back(Ok(vec![1; 8]));
        input.replies.push_back(Err(TransferStatus::Disconnected));
        let (_tx, rx) = watch::channel(false);
        let polled = WebUSBReceiver::new(input).poll(rx).await;
        assert_eq!(
            polled,
            Err(TransferError::new(Direction::In, TransferStatus::Disconnected))
        );
    }
}
