//! Erase and block-wise programming of a flash image.

use crate::protocol::MAX_CHUNK;
use crate::Error;

/// Operations the flashing algorithm needs from a connected bootloader
pub trait FlashTarget {
    fn write_unprotect(&mut self) -> Result<(), Error>;

    fn erase_all(&mut self) -> Result<(), Error>;

    /// Write a single block of at most [`MAX_CHUNK`] bytes
    fn write_block(&mut self, address: u32, data: &[u8]) -> Result<(), Error>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub bytes_complete: usize,
    pub bytes_total: usize,
}

/// Split `data` into protocol sized blocks paired with their target addresses
pub fn segments(data: &[u8], base: u32) -> impl Iterator<Item = (u32, &[u8])> {
    data.chunks(MAX_CHUNK)
        .enumerate()
        .map(move |(i, chunk)| (base.wrapping_add((i * MAX_CHUNK) as u32), chunk))
}

/// Erase the device then write `data` starting at `base`
///
/// A failure aborts the whole operation; retrying means starting again from the erase.
pub fn flash<T, F>(
    target: &mut T,
    data: &[u8],
    base: u32,
    unprotect: bool,
    mut progress: F,
) -> Result<(), Error>
where
    T: FlashTarget,
    F: FnMut(Progress),
{
    if base as u64 + data.len() as u64 > 1 << 32 {
        return Err(Error::InvalidArgument("image extends past the end of the address space"));
    }

    if unprotect {
        target
            .write_unprotect()
            .map_err(|e| e.context("write unprotect"))?;
    }

    target.erase_all().map_err(|e| e.context("erase memory"))?;

    let mut complete = 0;

    for (index, (address, block)) in segments(data, base).enumerate() {
        debug!(
            "wm: {} -> {} @ 0x{:08x} [l={}]",
            complete,
            complete + block.len(),
            address,
            block.len()
        );

        target
            .write_block(address, block)
            .map_err(|e| Error::Segment {
                index,
                inner: Box::new(e),
            })?;

        complete += block.len();
        progress(Progress {
            bytes_complete: complete,
            bytes_total: data.len(),
        });
    }

    Ok(())
}
