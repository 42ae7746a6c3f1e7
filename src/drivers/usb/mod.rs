//! USB stack: UHCI host controller, enumeration and Bulk-Only mass storage
//!
//! A [`UsbBus`] owns one initialized controller and the devices found on its
//! root ports. Mass storage devices are handed out as [`UsbDisk`]s that
//! implement the [`BlockDevice`] contract; every disk serializes its
//! transfers through the bus' controller lock.

pub mod controller;
pub mod mass_storage;
pub mod protocol;
pub mod uhci;
pub mod uhci_regs;

#[cfg(test)]
pub(crate) mod testing;

pub use controller::{UsbController, UsbDevice, UsbError};
pub use mass_storage::{MassStorageDevice, MassStorageError};
pub use uhci::{UhciConfig, UhciController};

use spin::Mutex;

use crate::arch::PortIo;
use crate::drivers::block::{check_request, BlockDevice, BlockDeviceInfo, BlockError};
use crate::drivers::pci::PciFunction;
use crate::memory::DmaAllocator;
use crate::time::Clock;

use self::controller::class;
use self::uhci::MAX_DEVICES;

/// One UHCI controller with its enumerated devices
pub struct UsbBus<P: PortIo, C: Clock> {
    host: Mutex<UhciController<P, C>>,
    devices: heapless::Vec<UsbDevice, MAX_DEVICES>,
}

impl<P: PortIo, C: Clock> UsbBus<P, C> {
    /// Initialize the controller behind `pci` and enumerate its root ports
    pub fn attach<F: PciFunction, D: DmaAllocator>(
        pci: &mut F,
        io: P,
        dma: &mut D,
        clock: C,
        config: UhciConfig,
    ) -> Result<Self, UsbError> {
        let mut host = UhciController::new(pci, io, clock, config)?;
        let devices = host.setup(dma)?;
        Ok(Self {
            host: Mutex::new(host),
            devices,
        })
    }

    /// Devices that were addressed during enumeration
    pub fn devices(&self) -> &[UsbDevice] {
        &self.devices
    }

    /// The controller, for class drivers other than mass storage
    pub fn host(&self) -> &Mutex<UhciController<P, C>> {
        &self.host
    }

    /// Bring up every Bulk-Only mass storage device on the bus
    ///
    /// Devices that declare their class per interface are probed too; those
    /// without a mass storage interface are skipped quietly.
    pub fn probe_mass_storage(&self) -> heapless::Vec<UsbDisk<'_, UhciController<P, C>>, MAX_DEVICES> {
        let mut disks = heapless::Vec::new();

        for device in self.devices.iter() {
            if !matches!(device.class, class::INTERFACE | class::MASS_STORAGE) {
                continue;
            }

            let result = {
                let mut host = self.host.lock();
                MassStorageDevice::init(&mut *host, device.clone())
            };
            match result {
                Ok(storage) => {
                    // At most one disk per device, so this cannot overflow
                    let _ = disks.push(UsbDisk::new(&self.host, storage));
                }
                Err(MassStorageError::NoInterface) => {
                    log::debug!("USB: device at address {} is not mass storage", device.address());
                }
                Err(e) => log::warn!(
                    "USB: mass storage on port {} failed to initialize: {}",
                    device.port(),
                    e
                ),
            }
        }
        disks
    }
}

impl<P: PortIo, C: Clock> Drop for UsbBus<P, C> {
    fn drop(&mut self) {
        self.host.get_mut().shutdown();
    }
}

/// A mass storage device seen as a block device
pub struct UsbDisk<'a, H: UsbController> {
    host: &'a Mutex<H>,
    storage: MassStorageDevice,
}

impl<'a, H: UsbController> UsbDisk<'a, H> {
    pub fn new(host: &'a Mutex<H>, storage: MassStorageDevice) -> Self {
        Self { host, storage }
    }

    pub fn storage(&self) -> &MassStorageDevice {
        &self.storage
    }
}

impl<H: UsbController> BlockDevice for UsbDisk<'_, H> {
    fn info(&self) -> BlockDeviceInfo {
        BlockDeviceInfo {
            block_size: self.storage.block_size(),
            num_blocks: self.storage.block_count(),
        }
    }

    fn read_sectors(&mut self, lba: u64, count: usize, buffer: &mut [u8]) -> Result<(), BlockError> {
        let bytes = check_request(&self.info(), lba, count, buffer.len())?;
        if bytes == 0 {
            return Ok(());
        }
        let mut host = self.host.lock();
        self.storage
            .read_sectors(&mut *host, lba, count, &mut buffer[..bytes])
            .map_err(|e| {
                log::error!("USB disk: read of {} blocks at LBA {} failed: {}", count, lba, e);
                BlockError::IoError
            })
    }

    fn write_sectors(&mut self, lba: u64, count: usize, buffer: &[u8]) -> Result<(), BlockError> {
        let bytes = check_request(&self.info(), lba, count, buffer.len())?;
        if bytes == 0 {
            return Ok(());
        }
        let mut host = self.host.lock();
        self.storage
            .write_sectors(&mut *host, lba, count, &buffer[..bytes])
            .map_err(|e| {
                log::error!("USB disk: write of {} blocks at LBA {} failed: {}", count, lba, e);
                BlockError::IoError
            })
    }
}
