//! Versioned, CRC-protected blob holding the test configuration and the
//! report history.
//!
//! Image format (little-endian):
//! ```text
//! ┌───────────┬───────────┬──────────────┬────────────┬──────────────┬──────────┬──────────┐
//! │ magic (4) │ version(2)│ payload_size │ sequence(4)│ postcard body│ CRC32 (4)│ 0xFF pad │
//! │ "RDTB"    │ 1         │ (2) = framed │            │              │ ISO-HDLC │ → region │
//! └───────────┴───────────┴──────────────┴────────────┴──────────────┴──────────┴──────────┘
//! ```
//!
//! `payload_size` covers header, body and CRC.  The CRC covers everything
//! before it.  The body is `{config, history_count, history_head, reserved,
//! history[4]}`.

use crc::{CRC_32_ISO_HDLC, Crc};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::app::ports::FlashRegion;
use crate::config::TestConfig;
use crate::error::{Error, FlashError, Result};
use crate::sequencer::report::{HISTORY_CAPACITY, ReportHistory, TestReport};

pub const BLOB_MAGIC: u32 = 0x4254_4452;
pub const BLOB_VERSION: u16 = 1;

const HEADER_LEN: usize = 12;
const CRC_LEN: usize = 4;

const BLOB_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Everything that survives a reboot.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedState {
    pub config: TestConfig,
    pub history: ReportHistory,
    /// Last report id handed out.
    pub sequence: u32,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            config: TestConfig::default(),
            history: ReportHistory::default(),
            sequence: 0,
        }
    }
}

impl PersistedState {
    /// Id for the next report: past the newest stored report and past the
    /// stored sequence, never below 1.
    pub fn next_report_id(&self) -> u32 {
        let after_latest = self
            .history
            .latest()
            .map_or(1, |r| r.report_id.wrapping_add(1));
        after_latest.max(self.sequence.wrapping_add(1)).max(1)
    }
}

#[derive(Serialize)]
struct BodyRef<'a> {
    config: &'a TestConfig,
    history_count: u8,
    history_head: u8,
    reserved: u16,
    history: &'a [TestReport; HISTORY_CAPACITY],
}

#[derive(Deserialize)]
struct Body {
    config: TestConfig,
    history_count: u8,
    history_head: u8,
    #[allow(dead_code)]
    reserved: u16,
    history: [TestReport; HISTORY_CAPACITY],
}

// ═══════════════════════════════════════════════════════════════════════════
//  Image codec
// ═══════════════════════════════════════════════════════════════════════════

/// Build a full region image (`region_len` bytes, 0xFF padded).
pub fn encode_image(state: &PersistedState, region_len: usize) -> Result<Vec<u8>> {
    let body = postcard::to_allocvec(&BodyRef {
        config: &state.config,
        history_count: state.history.len() as u8,
        history_head: state.history.head(),
        reserved: 0,
        history: state.history.slots(),
    })
    .map_err(|_| Error::ImageInvalid("body encode"))?;

    let framed = HEADER_LEN + body.len() + CRC_LEN;
    let payload_size = u16::try_from(framed).map_err(|_| Error::SizeOutOfRange)?;
    if framed > region_len {
        return Err(Error::SizeOutOfRange);
    }

    let mut image = Vec::with_capacity(region_len);
    image.extend_from_slice(&BLOB_MAGIC.to_le_bytes());
    image.extend_from_slice(&BLOB_VERSION.to_le_bytes());
    image.extend_from_slice(&payload_size.to_le_bytes());
    image.extend_from_slice(&state.sequence.to_le_bytes());
    image.extend_from_slice(&body);
    let crc = BLOB_CRC.checksum(&image);
    image.extend_from_slice(&crc.to_le_bytes());
    image.resize(region_len, 0xFF);
    Ok(image)
}

fn le_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn le_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// Validate and decode an image.  Never trusts a byte before the CRC passes.
pub fn decode_image(image: &[u8]) -> Result<PersistedState> {
    if image.len() < HEADER_LEN + CRC_LEN {
        return Err(Error::ImageInvalid("short image"));
    }
    if le_u32(image, 0) != BLOB_MAGIC {
        return Err(Error::ImageInvalid("magic"));
    }
    if le_u16(image, 4) != BLOB_VERSION {
        return Err(Error::ImageInvalid("version"));
    }
    let framed = usize::from(le_u16(image, 6));
    if framed < HEADER_LEN + CRC_LEN || framed > image.len() {
        return Err(Error::ImageInvalid("size"));
    }

    let crc_at = framed - CRC_LEN;
    if BLOB_CRC.checksum(&image[..crc_at]) != le_u32(image, crc_at) {
        return Err(Error::CrcMismatch);
    }

    let sequence = le_u32(image, 8);
    let body: Body = postcard::from_bytes(&image[HEADER_LEN..crc_at])
        .map_err(|_| Error::ImageInvalid("body"))?;

    Ok(PersistedState {
        config: body.config,
        history: ReportHistory::from_parts(body.history, body.history_count, body.history_head),
        sequence,
    })
}

// ═══════════════════════════════════════════════════════════════════════════
//  Flash store
// ═══════════════════════════════════════════════════════════════════════════

/// Writes and reads [`PersistedState`] images on a [`FlashRegion`].
pub struct Persistence<F> {
    flash: F,
}

impl<F: FlashRegion> Persistence<F> {
    /// Wrap `flash` after checking that its geometry is usable.
    pub fn new(flash: F) -> Result<Self> {
        let (len, erase, page) = (flash.len(), flash.erase_size(), flash.page_size());
        if len == 0 || erase == 0 || page == 0 {
            return Err(Error::SizeOutOfRange);
        }
        if len % erase != 0 || len % page != 0 {
            return Err(Error::OffsetMismatch);
        }
        if len < HEADER_LEN + CRC_LEN {
            return Err(Error::SizeOutOfRange);
        }
        info!("STORE | region len={} erase={} page={}", len, erase, page);
        Ok(Self { flash })
    }

    /// Erase the region, program the image page by page and read it back.
    pub fn persist(&mut self, state: &PersistedState) -> Result<()> {
        let len = self.flash.len();
        let image = encode_image(state, len)?;
        self.flash.erase(0, len)?;

        let page = self.flash.page_size();
        for (i, chunk) in image.chunks(page).enumerate() {
            self.flash.program(i * page, chunk)?;
        }

        let mut readback = vec![0u8; page];
        for (i, chunk) in image.chunks(page).enumerate() {
            let buf = &mut readback[..chunk.len()];
            self.flash.read(i * page, buf)?;
            if buf != chunk {
                warn!("STORE | verify failed at page {}", i);
                return Err(FlashError::VerifyFailed.into());
            }
        }
        info!(
            "STORE | persisted seq={} history={}",
            state.sequence,
            state.history.len()
        );
        Ok(())
    }

    /// Read and decode the stored image.  The config is re-validated; an
    /// invalid one is replaced by defaults.
    pub fn load(&self) -> Result<PersistedState> {
        let mut image = vec![0u8; self.flash.len()];
        self.flash.read(0, &mut image)?;
        let mut state = decode_image(&image)?;
        match state.config.validate_and_normalize() {
            Ok(config) => state.config = config,
            Err(e) => {
                warn!("STORE | stored config rejected ({}), using defaults", e);
                state.config = TestConfig::default();
            }
        }
        Ok(state)
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }
}
