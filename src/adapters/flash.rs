//! Flash region adapters.
//!
//! - **`target_os = "espidf"`**: [`PartitionFlash`] wraps the `blowerdoor`
//!   data partition through the `esp_partition_*` API.
//! - **everywhere**: [`MemFlash`] emulates NOR semantics in RAM (erase to
//!   0xFF, program only clears bits) with fault injection for tests and the
//!   host simulation.

use crate::app::ports::{FlashRegion, check_flash_access};
use crate::error::FlashError;

/// Partition label in the partition table.
pub const PARTITION_LABEL: &str = "blowerdoor";
/// Region size used by the firmware (two 4 KiB sectors).
pub const REGION_LEN: usize = 8192;
pub const SECTOR_SIZE: usize = 4096;
pub const PAGE_SIZE: usize = 256;

// ───────────────────────────────────────────────────────────────
// ESP-IDF partition
// ───────────────────────────────────────────────────────────────

#[cfg(target_os = "espidf")]
pub use idf::PartitionFlash;

#[cfg(target_os = "espidf")]
mod idf {
    use core::ffi::c_void;

    use esp_idf_svc::sys;
    use log::{info, warn};

    use super::{PAGE_SIZE, PARTITION_LABEL, REGION_LEN, SECTOR_SIZE};
    use crate::app::ports::{FlashRegion, check_flash_access};
    use crate::error::FlashError;

    pub struct PartitionFlash {
        partition: *const sys::esp_partition_t,
        len: usize,
        erase_size: usize,
    }

    // SAFETY: the partition descriptor is a static table entry owned by
    // ESP-IDF and never freed; the esp_partition_* calls are thread safe.
    unsafe impl Send for PartitionFlash {}

    impl PartitionFlash {
        /// Find the data partition by label.  A missing partition yields a
        /// zero-length region, which disables persistence.
        pub fn open() -> Self {
            let label = format!("{PARTITION_LABEL}\0");
            // SAFETY: `label` is NUL-terminated and outlives the call.
            let partition = unsafe {
                sys::esp_partition_find_first(
                    sys::esp_partition_type_t_ESP_PARTITION_TYPE_DATA,
                    sys::esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_ANY,
                    label.as_ptr().cast(),
                )
            };
            if partition.is_null() {
                warn!("STORE | partition '{}' not found", PARTITION_LABEL);
                return Self {
                    partition,
                    len: 0,
                    erase_size: SECTOR_SIZE,
                };
            }
            // SAFETY: non-null pointers from esp_partition_find_first are
            // valid for the program's lifetime.
            let (size, erase) = unsafe { ((*partition).size as usize, (*partition).erase_size as usize) };
            let erase_size = if erase == 0 { SECTOR_SIZE } else { erase };
            let len = REGION_LEN.min(size);
            info!("STORE | partition '{}' size={} using={}", PARTITION_LABEL, size, len);
            Self {
                partition,
                len,
                erase_size,
            }
        }

        fn present(&self) -> Result<(), FlashError> {
            if self.partition.is_null() {
                Err(FlashError::OutOfBounds)
            } else {
                Ok(())
            }
        }
    }

    impl FlashRegion for PartitionFlash {
        fn len(&self) -> usize {
            self.len
        }

        fn erase_size(&self) -> usize {
            self.erase_size
        }

        fn page_size(&self) -> usize {
            PAGE_SIZE
        }

        fn erase(&mut self, offset: usize, len: usize) -> Result<(), FlashError> {
            check_flash_access(self.len, self.erase_size, offset, len)?;
            self.present()?;
            // SAFETY: range checked against the partition-backed region.
            let ret = unsafe { sys::esp_partition_erase_range(self.partition, offset, len) };
            if ret == sys::ESP_OK as i32 {
                Ok(())
            } else {
                Err(FlashError::Erase(ret))
            }
        }

        fn program(&mut self, offset: usize, bytes: &[u8]) -> Result<(), FlashError> {
            check_flash_access(self.len, PAGE_SIZE, offset, bytes.len())?;
            self.present()?;
            // SAFETY: `bytes` is valid for reads of its length.
            let ret = unsafe {
                sys::esp_partition_write(
                    self.partition,
                    offset,
                    bytes.as_ptr().cast::<c_void>(),
                    bytes.len(),
                )
            };
            if ret == sys::ESP_OK as i32 {
                Ok(())
            } else {
                Err(FlashError::Program(ret))
            }
        }

        fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), FlashError> {
            if offset.checked_add(buf.len()).is_none_or(|end| end > self.len) {
                return Err(FlashError::OutOfBounds);
            }
            self.present()?;
            // SAFETY: `buf` is valid for writes of its length.
            let ret = unsafe {
                sys::esp_partition_read(
                    self.partition,
                    offset,
                    buf.as_mut_ptr().cast::<c_void>(),
                    buf.len(),
                )
            };
            if ret == sys::ESP_OK as i32 {
                Ok(())
            } else {
                Err(FlashError::Read(ret))
            }
        }
    }
}

// ───────────────────────────────────────────────────────────────
// In-memory NOR emulation
// ───────────────────────────────────────────────────────────────

/// RAM-backed flash with injectable faults.
#[derive(Debug, Clone)]
pub struct MemFlash {
    bytes: Vec<u8>,
    erase_size: usize,
    page_size: usize,
    fail_erase: bool,
    fail_program: bool,
    drop_programs: bool,
    erase_count: u32,
}

impl Default for MemFlash {
    fn default() -> Self {
        Self::new(REGION_LEN, SECTOR_SIZE, PAGE_SIZE)
    }
}

impl MemFlash {
    /// A blank (all 0xFF) region.
    pub fn new(len: usize, erase_size: usize, page_size: usize) -> Self {
        Self {
            bytes: vec![0xFF; len],
            erase_size,
            page_size,
            fail_erase: false,
            fail_program: false,
            drop_programs: false,
            erase_count: 0,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Flip bits of one stored byte, bypassing NOR rules.
    pub fn corrupt(&mut self, offset: usize, mask: u8) {
        if let Some(b) = self.bytes.get_mut(offset) {
            *b ^= mask;
        }
    }

    pub fn fail_erase(&mut self, fail: bool) {
        self.fail_erase = fail;
    }

    pub fn fail_program(&mut self, fail: bool) {
        self.fail_program = fail;
    }

    /// Accept programs without storing them, so readback verify fails.
    pub fn drop_programs(&mut self, drop: bool) {
        self.drop_programs = drop;
    }

    pub fn erase_count(&self) -> u32 {
        self.erase_count
    }
}

impl FlashRegion for MemFlash {
    fn len(&self) -> usize {
        self.bytes.len()
    }

    fn erase_size(&self) -> usize {
        self.erase_size
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn erase(&mut self, offset: usize, len: usize) -> Result<(), FlashError> {
        check_flash_access(self.bytes.len(), self.erase_size, offset, len)?;
        if self.fail_erase {
            return Err(FlashError::Erase(-1));
        }
        self.bytes[offset..offset + len].fill(0xFF);
        self.erase_count += 1;
        Ok(())
    }

    fn program(&mut self, offset: usize, bytes: &[u8]) -> Result<(), FlashError> {
        check_flash_access(self.bytes.len(), self.page_size, offset, bytes.len())?;
        if self.fail_program {
            return Err(FlashError::Program(-1));
        }
        if self.drop_programs {
            return Ok(());
        }
        for (dst, src) in self.bytes[offset..offset + bytes.len()].iter_mut().zip(bytes) {
            *dst &= *src;
        }
        Ok(())
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), FlashError> {
        let src = offset
            .checked_add(buf.len())
            .and_then(|end| self.bytes.get(offset..end))
            .ok_or(FlashError::OutOfBounds)?;
        buf.copy_from_slice(src);
        Ok(())
    }
}
