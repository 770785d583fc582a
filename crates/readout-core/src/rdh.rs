//! Raw Data Header (RDH) wire format.
//!
//! The card prepends a fixed-layout 64-byte RDH to every sub-block it DMAs
//! into a page. Pages therefore contain a chain of packets, each starting
//! with an RDH whose `offset_next_packet` field points at the next one
//! (0 terminates the chain).
//!
//! Layout (little-endian, offsets in bytes):
//!
//! ```text
//!  0  version: u8            (= RDH_VERSION)
//!  1  header_size: u8        (= RDH_HEADER_SIZE)
//!  2  offset_next_packet: u16
//!  4  memory_size: u16       bytes of this packet including the header
//!  6  link_id: u8            <= MAX_LINK_ID
//!  7  packet_counter: u8     per-link, wraps mod 256
//!  8  cru_id: u16
//! 10  hb_bc: u16             heartbeat bunch crossing, < LHC_BUNCHES
//! 12  hb_orbit: u32          heartbeat orbit of this packet
//! 16  (reserved, zero)
//! ```

use crate::LHC_BUNCHES;

/// RDH version this pipeline understands.
pub const RDH_VERSION: u8 = 4;

/// Fixed RDH size in bytes.
pub const RDH_HEADER_SIZE: usize = 64;

/// Highest valid link id (vendor constant).
pub const MAX_LINK_ID: u8 = 31;

/// Decoded RDH fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rdh {
    pub version: u8,
    pub header_size: u8,
    pub offset_next_packet: u16,
    pub memory_size: u16,
    pub link_id: u8,
    pub packet_counter: u8,
    pub cru_id: u16,
    pub hb_bc: u16,
    pub hb_orbit: u32,
}

impl Rdh {
    /// Decode the header at the start of `buf` without validation.
    /// Returns `None` if the buffer is too short.
    #[must_use]
    pub fn read(buf: &[u8]) -> Option<Self> {
        if buf.len() < RDH_HEADER_SIZE {
            return None;
        }
        Some(Self {
            version: buf[0],
            header_size: buf[1],
            offset_next_packet: u16::from_le_bytes([buf[2], buf[3]]),
            memory_size: u16::from_le_bytes([buf[4], buf[5]]),
            link_id: buf[6],
            packet_counter: buf[7],
            cru_id: u16::from_le_bytes([buf[8], buf[9]]),
            hb_bc: u16::from_le_bytes([buf[10], buf[11]]),
            hb_orbit: u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
        })
    }

    /// Serialize into the first [`RDH_HEADER_SIZE`] bytes of `buf`,
    /// zeroing the reserved tail. Used by the software card and tests.
    ///
    /// # Panics
    /// Panics if `buf` is shorter than one header.
    pub fn write(&self, buf: &mut [u8]) {
        assert!(buf.len() >= RDH_HEADER_SIZE, "buffer too short for RDH");
        buf[..RDH_HEADER_SIZE].fill(0);
        buf[0] = self.version;
        buf[1] = self.header_size;
        buf[2..4].copy_from_slice(&self.offset_next_packet.to_le_bytes());
        buf[4..6].copy_from_slice(&self.memory_size.to_le_bytes());
        buf[6] = self.link_id;
        buf[7] = self.packet_counter;
        buf[8..10].copy_from_slice(&self.cru_id.to_le_bytes());
        buf[10..12].copy_from_slice(&self.hb_bc.to_le_bytes());
        buf[12..16].copy_from_slice(&self.hb_orbit.to_le_bytes());
    }

    /// One-line field summary for dump logs.
    #[must_use]
    pub fn describe(&self) -> String {
        format!(
            "v{} cru={} link={} packet={} orbit={} bc={} size={} next=+{}",
            self.version,
            self.cru_id,
            self.link_id,
            self.packet_counter,
            self.hb_orbit,
            self.hb_bc,
            self.memory_size,
            self.offset_next_packet
        )
    }
}

/// Validate the RDH at the start of `buf`.
///
/// Returns the decoded header on success, or a human-readable description
/// of the first structural problem found.
pub fn validate_rdh(buf: &[u8]) -> Result<Rdh, String> {
    let Some(h) = Rdh::read(buf) else {
        return Err(format!(
            "buffer too short for RDH: {} bytes < {}",
            buf.len(),
            RDH_HEADER_SIZE
        ));
    };
    if h.version != RDH_VERSION {
        return Err(format!(
            "unsupported RDH version {} (expected {})",
            h.version, RDH_VERSION
        ));
    }
    if h.header_size as usize != RDH_HEADER_SIZE {
        return Err(format!(
            "wrong RDH header size {} (expected {})",
            h.header_size, RDH_HEADER_SIZE
        ));
    }
    if h.link_id > MAX_LINK_ID {
        return Err(format!(
            "link id {} exceeds maximum {}",
            h.link_id, MAX_LINK_ID
        ));
    }
    if u32::from(h.hb_bc) >= LHC_BUNCHES {
        return Err(format!(
            "bunch crossing {} out of range (LHC has {} bunches)",
            h.hb_bc, LHC_BUNCHES
        ));
    }
    if h.offset_next_packet != 0 && (h.offset_next_packet as usize) < RDH_HEADER_SIZE {
        return Err(format!(
            "offset to next packet {} smaller than header size",
            h.offset_next_packet
        ));
    }
    if (h.memory_size as usize) < RDH_HEADER_SIZE {
        return Err(format!(
            "packet memory size {} smaller than header size",
            h.memory_size
        ));
    }
    if h.offset_next_packet != 0 && h.memory_size > h.offset_next_packet {
        return Err(format!(
            "packet memory size {} overlaps next packet at +{}",
            h.memory_size, h.offset_next_packet
        ));
    }
    Ok(h)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Rdh {
        Rdh {
            version: RDH_VERSION,
            header_size: RDH_HEADER_SIZE as u8,
            offset_next_packet: 128,
            memory_size: 128,
            link_id: 3,
            packet_counter: 0,
            cru_id: 12,
            hb_bc: 511,
            hb_orbit: 1000,
        }
    }

    #[test]
    fn test_write_read_roundtrip() {
        let mut buf = [0u8; RDH_HEADER_SIZE];
        let h = valid();
        h.write(&mut buf);
        assert_eq!(Rdh::read(&buf), Some(h));
    }

    #[test]
    fn test_validate_accepts_valid_header() {
        let mut buf = [0u8; 128];
        valid().write(&mut buf);
        assert_eq!(validate_rdh(&buf).unwrap(), valid());
    }

    #[test]
    fn test_validate_rejects_short_buffer() {
        let err = validate_rdh(&[0u8; 10]).unwrap_err();
        assert!(err.contains("too short"), "{err}");
    }

    #[test]
    fn test_validate_rejects_bad_version() {
        let mut buf = [0u8; 128];
        let mut h = valid();
        h.version = 9;
        h.write(&mut buf);
        let err = validate_rdh(&buf).unwrap_err();
        assert!(err.contains("version 9"), "{err}");
    }

    #[test]
    fn test_validate_rejects_link_id_out_of_range() {
        let mut buf = [0u8; 128];
        let mut h = valid();
        h.link_id = MAX_LINK_ID + 1;
        h.write(&mut buf);
        let err = validate_rdh(&buf).unwrap_err();
        assert!(err.contains("link id"), "{err}");
    }

    #[test]
    fn test_validate_rejects_bunch_crossing_out_of_range() {
        let mut buf = [0u8; 128];
        let mut h = valid();
        h.hb_bc = LHC_BUNCHES as u16;
        h.write(&mut buf);
        let err = validate_rdh(&buf).unwrap_err();
        assert!(err.contains("bunch crossing"), "{err}");

        h.hb_bc = LHC_BUNCHES as u16 - 1;
        h.write(&mut buf);
        assert!(validate_rdh(&buf).is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_offsets() {
        let mut buf = [0u8; 128];
        let mut h = valid();
        h.offset_next_packet = 10;
        h.write(&mut buf);
        assert!(validate_rdh(&buf).is_err());

        let mut h = valid();
        h.memory_size = 10;
        h.write(&mut buf);
        assert!(validate_rdh(&buf).is_err());

        let mut h = valid();
        h.memory_size = 200;
        h.offset_next_packet = 128;
        h.write(&mut buf);
        assert!(validate_rdh(&buf).is_err());
    }

    #[test]
    fn test_terminal_packet_is_valid() {
        let mut buf = [0u8; 128];
        let mut h = valid();
        h.offset_next_packet = 0;
        h.memory_size = 80;
        h.write(&mut buf);
        assert!(validate_rdh(&buf).is_ok());
    }
}
