//! Opening the demo devices on the host USB stack: device lookup by VID/PID, interface
//! claim with kernel driver detach, and the nusb and rusb transfer backends.
use crate::error::{Error, Result};
use crate::transport::{Direction, EndpointIn, EndpointKind, EndpointOut, TransferError, TransferStatus};
use log::{debug, info, warn};
use nusb::transfer::{Buffer, Bulk, BulkOrInterrupt, In, Interrupt, Out};
use rusb::{DeviceHandle, GlobalContext};
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

/// Which host USB stack to talk through
#[derive(Debug, Copy, Clone, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    Nusb,
    Rusb,
}

/// Strings reported by the device, printed once it is connected
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
    pub product: Option<String>,
    pub manufacturer: Option<String>,
}

impl Display for DeviceIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "0x{:04X}/0x{:04X} - {} [{}]",
            self.vendor_id,
            self.product_id,
            self.product.as_deref().unwrap_or("unknown"),
            self.manufacturer.as_deref().unwrap_or("unknown")
        )
    }
}

/// A claimed interface split into its IN and OUT endpoints
pub struct ClaimedInterface<I, O> {
    pub identity: DeviceIdentity,
    pub input: I,
    pub output: O,
}

/// Picks the first IN and the first OUT endpoint of the requested transfer type.
pub fn select_endpoints(
    endpoints: impl IntoIterator<Item = (u8, Option<EndpointKind>)>,
    kind: EndpointKind,
) -> Result<(u8, u8)> {
    let mut address_in = None;
    let mut address_out = None;
    for (address, ep_kind) in endpoints {
        if ep_kind != Some(kind) {
            continue;
        }
        if address & 0x80 != 0 {
            address_in.get_or_insert(address);
        } else {
            address_out.get_or_insert(address);
        }
    }
    match (address_in, address_out) {
        (Some(ep_in), Some(ep_out)) => Ok((ep_in, ep_out)),
        (None, _) => Err(Error::Usb(format!("No {:?} IN endpoint on interface", kind))),
        (_, None) => Err(Error::Usb(format!("No {:?} OUT endpoint on interface", kind))),
    }
}

/// Maps a nusb endpoint type marker to the transfer type searched in the descriptors.
pub trait NusbEndpointType: BulkOrInterrupt {
    const KIND: EndpointKind;
}

impl NusbEndpointType for Bulk {
    const KIND: EndpointKind = EndpointKind::Bulk;
}

impl NusbEndpointType for Interrupt {
    const KIND: EndpointKind = EndpointKind::Interrupt;
}

/// Waits for `future`, giving up after `timeout`. `None` or a zero timeout waits forever.
async fn bounded<F: Future>(timeout: Option<Duration>, future: F) -> Option<F::Output> {
    match timeout.filter(|t| !t.is_zero()) {
        Some(timeout) => tokio::time::timeout(timeout, future).await.ok(),
        None => Some(future.await),
    }
}

/// Status of a transfer cancelled after its timeout. One that completed before the
/// cancel landed keeps its data.
fn settle_cancelled(
    status: &std::result::Result<(), nusb::transfer::TransferError>,
    direction: Direction,
) -> std::result::Result<(), TransferError> {
    match status {
        Ok(()) => Ok(()),
        Err(_) => Err(TransferError::new(direction, TransferStatus::Timeout)),
    }
}

fn nusb_status(e: nusb::transfer::TransferError) -> TransferStatus {
    match e {
        nusb::transfer::TransferError::Stall => TransferStatus::Stall,
        nusb::transfer::TransferError::Cancelled => TransferStatus::Cancelled,
        nusb::transfer::TransferError::Disconnected => TransferStatus::Disconnected,
        other => TransferStatus::Other(other.to_string()),
    }
}

pub struct NusbIn<E: NusbEndpointType> {
    _interface: nusb::Interface,
    endpoint: nusb::Endpoint<E, In>,
    timeout: Option<Duration>,
}

pub struct NusbOut<E: NusbEndpointType> {
    _interface: nusb::Interface,
    endpoint: nusb::Endpoint<E, Out>,
    timeout: Option<Duration>,
}

impl<E: NusbEndpointType> std::fmt::Debug for NusbIn<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NusbIn")
            .field("endpoint", &"Opaque")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl<E: NusbEndpointType> std::fmt::Debug for NusbOut<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NusbOut")
            .field("endpoint", &"Opaque")
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Opens the device through nusb and claims `interface`, detaching a bound kernel driver first.
pub async fn open_nusb<E: NusbEndpointType>(
    vendor_id: u16,
    product_id: u16,
    interface: u8,
    timeout: Option<Duration>,
) -> Result<ClaimedInterface<NusbIn<E>, NusbOut<E>>> {
    let info = nusb::list_devices()
        .await
        .map_err(|e| Error::usb("Failed to list USB devices", e))?
        .find(|device| device.vendor_id() == vendor_id && device.product_id() == product_id)
        .ok_or(Error::DeviceNotFound {
            vendor_id,
            product_id,
        })?;
    let identity = DeviceIdentity {
        vendor_id,
        product_id,
        product: info.product_string().map(str::to_owned),
        manufacturer: info.manufacturer_string().map(str::to_owned),
    };
    let device = info
        .open()
        .await
        .map_err(|e| Error::usb("Failed to open USB device", e))?;
    let (ep_in, ep_out) = {
        let config = device
            .active_configuration()
            .map_err(|e| Error::usb("Failed to get active configuration", e))?;
        let setting = config
            .interface_alt_settings()
            .find(|s| s.interface_number() == interface && s.alternate_setting() == 0)
            .ok_or(Error::Usb(format!(
                "Interface {} not found in active configuration",
                interface
            )))?;
        select_endpoints(
            setting.endpoints().map(|ep| {
                let kind = match ep.transfer_type() {
                    nusb::descriptors::TransferType::Bulk => Some(EndpointKind::Bulk),
                    nusb::descriptors::TransferType::Interrupt => Some(EndpointKind::Interrupt),
                    _ => None,
                };
                (ep.address(), kind)
            }),
            E::KIND,
        )?
    };
    debug!(
        "Interface {} endpoints: IN=0x{:02X} OUT=0x{:02X}",
        interface, ep_in, ep_out
    );
    let claimed = device
        .detach_and_claim_interface(interface)
        .await
        .map_err(|e| Error::usb("Failed to claim USB interface", e))?;
    let input = claimed
        .endpoint::<E, In>(ep_in)
        .map_err(|e| Error::usb("Failed to open IN endpoint", e))?;
    let output = claimed
        .endpoint::<E, Out>(ep_out)
        .map_err(|e| Error::usb("Failed to open OUT endpoint", e))?;
    Ok(ClaimedInterface {
        identity,
        input: NusbIn {
            _interface: claimed.clone(),
            endpoint: input,
            timeout,
        },
        output: NusbOut {
            _interface: claimed,
            endpoint: output,
            timeout,
        },
    })
}

impl<E: NusbEndpointType> EndpointIn for NusbIn<E> {
    async fn transfer_in(&mut self, max_len: usize) -> std::result::Result<Vec<u8>, TransferError> {
        // A poll cancelled mid-transfer leaves its transfer queued; reuse it.
        if self.endpoint.pending() == 0 {
            let packet = self.endpoint.max_packet_size().max(1);
            let request = max_len.div_ceil(packet).max(1) * packet;
            let mut buffer = self.endpoint.allocate(request);
            buffer.set_requested_len(request);
            self.endpoint.submit(buffer);
        }
        let completion = match bounded(self.timeout, self.endpoint.next_complete()).await {
            Some(completion) => completion,
            None => {
                self.endpoint.cancel_all();
                let completion = self.endpoint.next_complete().await;
                settle_cancelled(&completion.status, Direction::In)?;
                completion
            }
        };
        completion
            .status
            .map_err(|e| TransferError::new(Direction::In, nusb_status(e)))?;
        let mut data = completion.buffer.into_vec();
        if completion.actual_len > max_len {
            warn!(
                "Device sent {} bytes, keeping the first {}",
                completion.actual_len, max_len
            );
        }
        data.truncate(completion.actual_len.min(max_len));
        Ok(data)
    }
}

impl<E: NusbEndpointType> EndpointOut for NusbOut<E> {
    async fn transfer_out(&mut self, data: &[u8]) -> std::result::Result<usize, TransferError> {
        self.endpoint.submit(Buffer::from(data.to_vec()));
        let completion = match bounded(self.timeout, self.endpoint.next_complete()).await {
            Some(completion) => completion,
            None => {
                self.endpoint.cancel_all();
                let completion = self.endpoint.next_complete().await;
                settle_cancelled(&completion.status, Direction::Out)?;
                completion
            }
        };
        completion
            .status
            .map_err(|e| TransferError::new(Direction::Out, nusb_status(e)))?;
        Ok(completion.actual_len)
    }
}

fn rusb_status(e: rusb::Error) -> TransferStatus {
    match e {
        rusb::Error::Timeout => TransferStatus::Timeout,
        rusb::Error::Pipe => TransferStatus::Stall,
        rusb::Error::Overflow => TransferStatus::Babble,
        rusb::Error::NoDevice => TransferStatus::Disconnected,
        rusb::Error::Interrupted => TransferStatus::Cancelled,
        other => TransferStatus::Other(other.to_string()),
    }
}

/// An endpoint of a rusb device of the host; transfers run on the blocking pool
#[derive(Clone, Debug)]
pub struct RusbEndpoint {
    handle: Arc<DeviceHandle<GlobalContext>>,
    address: u8,
    kind: EndpointKind,
    timeout: Option<Duration>,
}

impl RusbEndpoint {
    // libusb waits forever on a zero timeout
    fn libusb_timeout(&self) -> Duration {
        self.timeout.unwrap_or(Duration::ZERO)
    }
}

/// Opens the device through libusb and claims `interface`, detaching a bound kernel driver first.
pub fn open_rusb(
    vendor_id: u16,
    product_id: u16,
    interface: u8,
    kind: EndpointKind,
    timeout: Option<Duration>,
) -> Result<ClaimedInterface<RusbEndpoint, RusbEndpoint>> {
    let (device, desc) = rusb::devices()
        .map_err(|e| Error::usb("Failed to list USB devices", e))?
        .iter()
        .find_map(|device| {
            let desc = device.device_descriptor().ok()?;
            (desc.vendor_id() == vendor_id && desc.product_id() == product_id)
                .then_some((device, desc))
        })
        .ok_or(Error::DeviceNotFound {
            vendor_id,
            product_id,
        })?;
    let handle = device
        .open()
        .map_err(|e| Error::usb("Failed to open USB device", e))?;
    let identity = DeviceIdentity {
        vendor_id: desc.vendor_id(),
        product_id: desc.product_id(),
        product: handle.read_product_string_ascii(&desc).ok(),
        manufacturer: handle.read_manufacturer_string_ascii(&desc).ok(),
    };
    let (ep_in, ep_out) = {
        let config = device
            .active_config_descriptor()
            .map_err(|e| Error::usb("Failed to get config descriptor", e))?;
        let setting = config
            .interfaces()
            .find(|i| i.number() == interface)
            .and_then(|i| i.descriptors().next())
            .ok_or(Error::Usb(format!(
                "Interface {} not found in active configuration",
                interface
            )))?;
        select_endpoints(
            setting.endpoint_descriptors().map(|ep| {
                let kind = match ep.transfer_type() {
                    rusb::TransferType::Bulk => Some(EndpointKind::Bulk),
                    rusb::TransferType::Interrupt => Some(EndpointKind::Interrupt),
                    _ => None,
                };
                (ep.address(), kind)
            }),
            kind,
        )?
    };
    debug!(
        "Interface {} endpoints: IN=0x{:02X} OUT=0x{:02X}",
        interface, ep_in, ep_out
    );
    // Not supported outside Linux; treat as no driver bound
    if handle.kernel_driver_active(interface).unwrap_or(false) {
        info!("Detaching kernel driver from interface {}", interface);
        handle
            .detach_kernel_driver(interface)
            .map_err(|e| Error::usb("Failed to detach kernel driver", e))?;
    }
    handle
        .claim_interface(interface)
        .map_err(|e| Error::usb("Failed to claim USB interface", e))?;
    let handle = Arc::new(handle);
    Ok(ClaimedInterface {
        identity,
        input: RusbEndpoint {
            handle: handle.clone(),
            address: ep_in,
            kind,
            timeout,
        },
        output: RusbEndpoint {
            handle,
            address: ep_out,
            kind,
            timeout,
        },
    })
}

impl EndpointIn for RusbEndpoint {
    async fn transfer_in(&mut self, max_len: usize) -> std::result::Result<Vec<u8>, TransferError> {
        let endpoint = self.clone();
        tokio::task::spawn_blocking(move || {
            let timeout = endpoint.libusb_timeout();
            let mut buffer = vec![0u8; max_len];
            let len = match endpoint.kind {
                EndpointKind::Bulk => {
                    endpoint
                        .handle
                        .read_bulk(endpoint.address, &mut buffer, timeout)
                }
                EndpointKind::Interrupt => {
                    endpoint
                        .handle
                        .read_interrupt(endpoint.address, &mut buffer, timeout)
                }
            }
            .map_err(|e| TransferError::new(Direction::In, rusb_status(e)))?;
            buffer.truncate(len);
            Ok(buffer)
        })
        .await
        .map_err(|e| TransferError::new(Direction::In, TransferStatus::Other(e.to_string())))?
    }
}

impl EndpointOut for RusbEndpoint {
    async fn transfer_out(&mut self, data: &[u8]) -> std::result::Result<usize, TransferError> {
        let endpoint = self.clone();
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || {
            let timeout = endpoint.libusb_timeout();
            let written = match endpoint.kind {
                EndpointKind::Bulk => {
                    endpoint
                        .handle
                        .write_bulk(endpoint.address, &data, timeout)
                }
                EndpointKind::Interrupt => {
                    endpoint
                        .handle
                        .write_interrupt(endpoint.address, &data, timeout)
                }
            };
            written.map_err(|e| TransferError::new(Direction::Out, rusb_status(e)))
        })
        .await
        .map_err(|e| TransferError::new(Direction::Out, TransferStatus::Other(e.to_string())))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_first_endpoints_of_kind() {
        let endpoints = [
            (0x83, Some(EndpointKind::Interrupt)),
            (0x81, Some(EndpointKind::Bulk)),
            (0x02, Some(EndpointKind::Bulk)),
            (0x82, Some(EndpointKind::Bulk)),
            (0x04, None),
        ];
        assert_eq!(
            select_endpoints(endpoints, EndpointKind::Bulk).unwrap(),
            (0x81, 0x02)
        );
    }

    #[test]
    fn missing_out_endpoint() {
        let endpoints = [(0x81, Some(EndpointKind::Interrupt))];
        let err = select_endpoints(endpoints, EndpointKind::Interrupt).unwrap_err();
        assert_eq!(err.to_string(), "USB error: No Interrupt OUT endpoint on interface");
    }

    #[test]
    fn identity_line() {
        let identity = DeviceIdentity {
            vendor_id: 0x03EB,
            product_id: 0x206E,
            product: Some("LUFA CCID Demo".to_string()),
            manufacturer: None,
        };
        assert_eq!(
            identity.to_string(),
            "0x03EB/0x206E - LUFA CCID Demo [unknown]"
        );
    }

    #[tokio::test]
    async fn no_timeout_waits_for_slow_transfer() {
        let slow = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            7
        };
        assert_eq!(bounded(None, slow).await, Some(7));
    }

    #[tokio::test]
    async fn zero_timeout_waits_forever() {
        let pending_once = async {
            tokio::task::yield_now().await;
            7
        };
        assert_eq!(bounded(Some(Duration::ZERO), pending_once).await, Some(7));
    }

    #[tokio::test]
    async fn timeout_gives_up() {
        let stuck = tokio::time::sleep(Duration::from_secs(5));
        assert_eq!(bounded(Some(Duration::from_millis(1)), stuck).await, None);
    }

    #[test]
    fn transfer_completed_before_cancel_keeps_data() {
        assert_eq!(settle_cancelled(&Ok(()), Direction::In), Ok(()));
        assert_eq!(
            settle_cancelled(
                &Err(nusb::transfer::TransferError::Cancelled),
                Direction::Out
            ),
            Err(TransferError::new(Direction::Out, TransferStatus::Timeout))
        );
    }

    #[test]
    fn rusb_errors_map_to_status() {
        assert_eq!(rusb_status(rusb::Error::Pipe), TransferStatus::Stall);
        assert_eq!(rusb_status(rusb::Error::Timeout), TransferStatus::Timeout);
        assert_eq!(rusb_status(rusb::Error::Overflow), TransferStatus::Babble);
    }
}
