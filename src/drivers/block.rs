//! Block device abstraction
//!
//! The contract the filesystem layer consumes. A device reports a fixed
//! sector size and count and transfers whole sectors.

/// Block device error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    /// Device missing or not initialized
    NotReady,
    /// Transfer failed on the device
    IoError,
    /// Request extends past the end of the device
    OutOfRange,
    /// Caller buffer smaller than the requested sectors
    BufferTooSmall,
    /// Device does not accept writes
    ReadOnly,
}

/// Geometry of a block device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockDeviceInfo {
    /// Bytes per block
    pub block_size: u32,
    /// Number of addressable blocks
    pub num_blocks: u64,
}

pub trait BlockDevice {
    fn info(&self) -> BlockDeviceInfo;

    fn sector_size(&self) -> u32 {
        self.info().block_size
    }

    /// Read `count` sectors starting at `lba` into `buffer`
    fn read_sectors(&mut self, lba: u64, count: usize, buffer: &mut [u8]) -> Result<(), BlockError>;

    /// Read a single block
    fn read_block(&mut self, lba: u64, buffer: &mut [u8]) -> Result<(), BlockError> {
        self.read_sectors(lba, 1, buffer)
    }

    /// Write `count` sectors starting at `lba` from `buffer`
    fn write_sectors(&mut self, _lba: u64, _count: usize, _buffer: &[u8]) -> Result<(), BlockError> {
        Err(BlockError::ReadOnly)
    }
}

/// Validate a transfer against the device geometry, returning its byte length
pub fn check_request(
    info: &BlockDeviceInfo,
    lba: u64,
    count: usize,
    buffer_len: usize,
) -> Result<usize, BlockError> {
    let end = lba.checked_add(count as u64).ok_or(BlockError::OutOfRange)?;
    if end > info.num_blocks {
        return Err(BlockError::OutOfRange);
    }
    let bytes = count
        .checked_mul(info.block_size as usize)
        .ok_or(BlockError::OutOfRange)?;
    if buffer_len < bytes {
        return Err(BlockError::BufferTooSmall);
    }
    Ok(bytes)
}
