//! Extent stream decoding.
//!
//! Extents follow the header region back to back until the end of the
//! archive. Each carries up to 59 cluster references; the payload holds
//! only the 4 KiB blocks whose mask bit is set, in slot order.

use crate::checksum::IntegrityChecker;
use crate::error::{Result, VmaError};
use crate::file_formats::{
    BLOCKS_PER_CLUSTER, BLOCKS_PER_EXTENT, BLOCK_SIZE, CLUSTER_SIZE, EXTENT_BLOCKINFO_OFFSET,
    EXTENT_BLOCK_COUNT_OFFSET, EXTENT_MD5_OFFSET, EXTENT_UUID_OFFSET, MD5_LEN, VMA_EXTENT_MAGIC,
};
use crate::header::ArchiveHeader;

/// One cluster slot of an extent header.
#[derive(Debug, Clone, Copy)]
pub struct BlockInfo {
    /// Bit i set means the i-th 4 KiB block of the cluster is present in
    /// the payload; bit 0 is the first block.
    pub mask: u16,
    /// Target device id; 0 marks an unused slot.
    pub dev_id: u8,
    /// Logical cluster index on the device.
    pub cluster: u32,
}

/// Parsed 512 byte extent header.
pub struct ExtentHeader {
    /// Archive offset of this extent, kept for error context.
    pub offset: u64,
    pub uuid: [u8; 16],
    pub md5sum: [u8; MD5_LEN],
    /// Payload blocks; checked against the bitmap popcount.
    pub block_count: u16,
    pub blockinfo: Vec<BlockInfo>,
    raw: Vec<u8>,
}

impl ExtentHeader {
    /// Structural parse of one extent header. The MD5 also covers the
    /// payload, so [`ExtentHeader::verify`] runs separately once the
    /// payload has been read.
    pub fn parse(raw: Vec<u8>, offset: u64) -> Result<Self> {
        if raw[..4] != VMA_EXTENT_MAGIC {
            return Err(VmaError::format(offset, "bad extent magic"));
        }

        let block_count = u16::from_be_bytes([
            raw[EXTENT_BLOCK_COUNT_OFFSET],
            raw[EXTENT_BLOCK_COUNT_OFFSET + 1],
        ]);
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&raw[EXTENT_UUID_OFFSET..EXTENT_UUID_OFFSET + 16]);
        let mut md5sum = [0u8; MD5_LEN];
        md5sum.copy_from_slice(&raw[EXTENT_MD5_OFFSET..EXTENT_MD5_OFFSET + MD5_LEN]);

        let mut blockinfo = Vec::with_capacity(BLOCKS_PER_EXTENT);
        let mut payload_blocks = 0usize;
        for slot in 0..BLOCKS_PER_EXTENT {
            let start = EXTENT_BLOCKINFO_OFFSET + slot * 8;
            let mut word = [0u8; 8];
            word.copy_from_slice(&raw[start..start + 8]);
            let word = u64::from_be_bytes(word);

            let info = BlockInfo {
                mask: (word >> 48) as u16,
                dev_id: (word >> 32) as u8,
                cluster: word as u32,
            };
            if info.dev_id == 0 && info.mask != 0 {
                return Err(VmaError::format(
                    offset,
                    format!("unused blockinfo slot {} carries payload blocks", slot),
                ));
            }
            payload_blocks += info.mask.count_ones() as usize;
            blockinfo.push(info);
        }

        if payload_blocks != block_count as usize {
            return Err(VmaError::format(
                offset,
                format!(
                    "block count {} does not match the bitmap ({} blocks)",
                    block_count, payload_blocks
                ),
            ));
        }

        Ok(Self {
            offset,
            uuid,
            md5sum,
            block_count,
            blockinfo,
            raw,
        })
    }

    /// Payload bytes following this header.
    pub fn payload_size(&self) -> usize {
        self.block_count as usize * BLOCK_SIZE
    }

    /// Check the extent MD5: header with zeroed digest field, then payload.
    pub fn verify(&self, checker: &IntegrityChecker, payload: &[u8]) -> Result<()> {
        checker.verify(
            "extent",
            self.offset,
            &self.raw[..EXTENT_MD5_OFFSET],
            &[&self.raw[EXTENT_MD5_OFFSET + MD5_LEN..], payload],
            &self.md5sum,
        )
    }

    /// Walk the cluster slots in order, slicing `payload` into placements.
    pub fn placements<'a>(
        &'a self,
        payload: &'a [u8],
        archive: &'a ArchiveHeader,
    ) -> Placements<'a> {
        Placements {
            extent: self,
            payload,
            archive,
            slot: 0,
            consumed: 0,
        }
    }
}

/// A decoded instruction to fill one cluster of one device.
pub struct ClusterPlacement {
    pub dev_id: u8,
    pub cluster: u32,
    pub data: ClusterData,
}

/// Cluster bytes to place. `Zero` lets the writer keep the target range an
/// unallocated hole.
pub enum ClusterData {
    Zero,
    /// A full cluster image; blocks absent from the mask are zero filled.
    Data(Vec<u8>),
}

/// Iterator over the placements of one extent, validating device
/// references against the archive header as it goes.
pub struct Placements<'a> {
    extent: &'a ExtentHeader,
    payload: &'a [u8],
    archive: &'a ArchiveHeader,
    slot: usize,
    consumed: usize,
}

impl Iterator for Placements<'_> {
    type Item = Result<ClusterPlacement>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.slot < self.extent.blockinfo.len() {
            let info = self.extent.blockinfo[self.slot];
            self.slot += 1;
            if info.dev_id == 0 {
                continue;
            }
            return Some(self.placement(info));
        }
        None
    }
}

impl Placements<'_> {
    fn placement(&mut self, info: BlockInfo) -> Result<ClusterPlacement> {
        let offset = self.extent.offset;

        let device = self.archive.device(info.dev_id).ok_or_else(|| {
            VmaError::format(
                offset,
                format!("extent references unknown device {}", info.dev_id),
            )
        })?;
        if (info.cluster as u64) >= device.cluster_count() {
            return Err(VmaError::format(
                offset,
                format!(
                    "cluster {} out of range for device {} ({} clusters)",
                    info.cluster,
                    info.dev_id,
                    device.cluster_count()
                ),
            ));
        }

        let data = if info.mask == 0xffff {
            let chunk = &self.payload[self.consumed..self.consumed + CLUSTER_SIZE];
            self.consumed += CLUSTER_SIZE;
            ClusterData::Data(chunk.to_vec())
        } else if info.mask == 0 {
            ClusterData::Zero
        } else {
            let mut buf = vec![0u8; CLUSTER_SIZE];
            for block in 0..BLOCKS_PER_CLUSTER {
                if info.mask & (1 << block) != 0 {
                    let chunk = &self.payload[self.consumed..self.consumed + BLOCK_SIZE];
                    buf[block * BLOCK_SIZE..(block + 1) * BLOCK_SIZE].copy_from_slice(chunk);
                    self.consumed += BLOCK_SIZE;
                }
            }
            ClusterData::Data(buf)
        };

        Ok(ClusterPlacement {
            dev_id: info.dev_id,
            cluster: info.cluster,
            data,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::file_formats::EXTENT_HEADER_SIZE;

    fn test_archive() -> ArchiveHeader {
        ArchiveHeader {
            uuid: [0x42; 16],
            ctime: 0,
            header_size: crate::file_formats::HEADER_SIZE as u32,
            devices: vec![
                crate::header::DeviceEntry {
                    id: 1,
                    name: "drive-scsi0".to_string(),
                    size: 4 * CLUSTER_SIZE as u64,
                },
                crate::header::DeviceEntry {
                    id: 2,
                    name: "drive-scsi1".to_string(),
                    size: CLUSTER_SIZE as u64,
                },
            ],
            configs: Vec::new(),
        }
    }

    /// Assemble an extent header with a valid digest over header + payload.
    fn build_extent(blockinfo: &[(u16, u8, u32)], payload: &[u8]) -> Vec<u8> {
        let mut raw = vec![0u8; EXTENT_HEADER_SIZE];
        raw[..4].copy_from_slice(&VMA_EXTENT_MAGIC);
        let blocks: u32 = blockinfo.iter().map(|(mask, _, _)| mask.count_ones()).sum();
        raw[EXTENT_BLOCK_COUNT_OFFSET..EXTENT_BLOCK_COUNT_OFFSET + 2]
            .copy_from_slice(&(blocks as u16).to_be_bytes());
        raw[EXTENT_UUID_OFFSET..EXTENT_UUID_OFFSET + 16].copy_from_slice(&[0x42; 16]);
        for (slot, (mask, dev_id, cluster)) in blockinfo.iter().enumerate() {
            let word = ((*mask as u64) << 48) | ((*dev_id as u64) << 32) | *cluster as u64;
            let start = EXTENT_BLOCKINFO_OFFSET + slot * 8;
            raw[start..start + 8].copy_from_slice(&word.to_be_bytes());
        }

        let mut digested = raw.clone();
        digested[EXTENT_MD5_OFFSET..EXTENT_MD5_OFFSET + MD5_LEN].fill(0);
        digested.extend_from_slice(payload);
        let digest =
            openssl::hash::hash(openssl::hash::MessageDigest::md5(), &digested).unwrap();
        raw[EXTENT_MD5_OFFSET..EXTENT_MD5_OFFSET + MD5_LEN].copy_from_slice(&digest);
        raw
    }

    #[test]
    fn test_full_partial_and_zero_clusters() {
        let mut payload = vec![0xaau8; CLUSTER_SIZE];
        payload.extend_from_slice(&[0x55; BLOCK_SIZE]);

        // full cluster on dev 1, hole on dev 2, single block on dev 1
        let raw = build_extent(
            &[(0xffff, 1, 0), (0x0000, 2, 0), (0x0002, 1, 3)],
            &payload,
        );
        let extent = ExtentHeader::parse(raw, 12288).unwrap();
        assert_eq!(extent.payload_size(), payload.len());

        let archive = test_archive();
        extent
            .verify(&IntegrityChecker::new(false), &payload)
            .unwrap();

        let placements: Vec<_> = extent
            .placements(&payload, &archive)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(placements.len(), 3);

        assert_eq!((placements[0].dev_id, placements[0].cluster), (1, 0));
        match &placements[0].data {
            ClusterData::Data(buf) => assert!(buf.iter().all(|&b| b == 0xaa)),
            ClusterData::Zero => panic!("expected data"),
        }

        assert!(matches!(placements[1].data, ClusterData::Zero));

        // mask bit 1: second block carries the payload, the rest is zero
        assert_eq!((placements[2].dev_id, placements[2].cluster), (1, 3));
        match &placements[2].data {
            ClusterData::Data(buf) => {
                assert!(buf[..BLOCK_SIZE].iter().all(|&b| b == 0));
                assert!(buf[BLOCK_SIZE..2 * BLOCK_SIZE].iter().all(|&b| b == 0x55));
                assert!(buf[2 * BLOCK_SIZE..].iter().all(|&b| b == 0));
            }
            ClusterData::Zero => panic!("expected data"),
        }
    }

    #[test]
    fn test_bad_magic() {
        let mut raw = build_extent(&[], &[]);
        raw[3] = b'X';
        assert!(matches!(
            ExtentHeader::parse(raw, 99),
            Err(VmaError::Format { offset: 99, .. })
        ));
    }

    #[test]
    fn test_block_count_mismatch() {
        let mut raw = build_extent(&[(0xffff, 1, 0)], &[0u8; CLUSTER_SIZE]);
        raw[EXTENT_BLOCK_COUNT_OFFSET + 1] ^= 1;
        assert!(matches!(
            ExtentHeader::parse(raw, 0),
            Err(VmaError::Format { .. })
        ));
    }

    #[test]
    fn test_payload_corruption_fails_checksum() {
        let mut payload = vec![0xaau8; CLUSTER_SIZE];
        let raw = build_extent(&[(0xffff, 1, 0)], &payload);
        let extent = ExtentHeader::parse(raw, 12288).unwrap();

        payload[17] ^= 0xff;
        let err = extent
            .verify(&IntegrityChecker::new(false), &payload)
            .unwrap_err();
        assert!(matches!(
            err,
            VmaError::Checksum {
                region: "extent",
                offset: 12288,
                ..
            }
        ));

        extent
            .verify(&IntegrityChecker::new(true), &payload)
            .unwrap();
    }

    #[test]
    fn test_unknown_device() {
        let raw = build_extent(&[(0x0000, 9, 0)], &[]);
        let extent = ExtentHeader::parse(raw, 0).unwrap();
        let archive = test_archive();
        let err = extent
            .placements(&[], &archive)
            .next()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, VmaError::Format { .. }));
    }

    #[test]
    fn test_cluster_out_of_range() {
        let raw = build_extent(&[(0x0000, 2, 1)], &[]);
        let extent = ExtentHeader::parse(raw, 0).unwrap();
        let archive = test_archive();
        let err = extent
            .placements(&[], &archive)
            .next()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, VmaError::Format { .. }));
    }

    #[test]
    fn test_used_slot_with_zero_device_rejected() {
        let mut raw = build_extent(&[], &[]);
        // slot 0: mask without a device
        let word = (1u64 << 48) | 7;
        raw[EXTENT_BLOCKINFO_OFFSET..EXTENT_BLOCKINFO_OFFSET + 8]
            .copy_from_slice(&word.to_be_bytes());
        assert!(matches!(
            ExtentHeader::parse(raw, 0),
            Err(VmaError::Format { .. })
        ));
    }
}
