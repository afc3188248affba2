//! Archive header decoding.
//!
//! The fixed header struct carries the archive identity, the config name
//! and data tables and the device table; all strings and config payloads
//! live in the blob buffer trailing the fixed struct. The header MD5
//! covers the complete header region (`header_size` bytes) with the digest
//! field itself zeroed.

use std::collections::HashMap;

use crate::byte_source::ByteSource;
use crate::checksum::IntegrityChecker;
use crate::error::{Result, VmaError};
use crate::file_formats::{
    CLUSTER_SIZE, DEV_INFO_SIZE, HEADER_BLOB_BUFFER_OFFSET, HEADER_BLOB_BUFFER_SIZE_OFFSET,
    HEADER_CONFIG_DATA_OFFSET, HEADER_CONFIG_NAMES_OFFSET, HEADER_CTIME_OFFSET,
    HEADER_DEV_INFO_OFFSET, HEADER_MD5_OFFSET, HEADER_SIZE, HEADER_SIZE_OFFSET,
    HEADER_UUID_OFFSET, HEADER_VERSION_OFFSET, MAX_CONFIGS, MAX_DEVICES, MD5_LEN, VMA_MAGIC,
    VMA_VERSION,
};

/// One populated slot of the device table.
#[derive(Debug, Clone)]
pub struct DeviceEntry {
    pub id: u8,
    pub name: String,
    /// Logical size in bytes; not necessarily a multiple of the cluster
    /// size.
    pub size: u64,
}

impl DeviceEntry {
    /// Logical clusters covering the device, the last one possibly partial.
    pub fn cluster_count(&self) -> u64 {
        (self.size + CLUSTER_SIZE as u64 - 1) / CLUSTER_SIZE as u64
    }

    /// Output file name inside the destination directory.
    pub fn file_name(&self) -> String {
        format!("{}.raw", self.name)
    }
}

/// A configuration blob referenced from the header, written out verbatim as
/// a file named after it.
#[derive(Debug, Clone)]
pub struct ConfigBlob {
    pub name: String,
    pub data: Vec<u8>,
}

/// Parsed and verified archive descriptor.
pub struct ArchiveHeader {
    pub uuid: [u8; 16],
    /// Creation time, Unix seconds.
    pub ctime: i64,
    /// Full header region length, including the blob buffer.
    pub header_size: u32,
    /// Populated device slots, ascending by id.
    pub devices: Vec<DeviceEntry>,
    pub configs: Vec<ConfigBlob>,
}

impl ArchiveHeader {
    /// Read and verify the header region from the start of the archive.
    pub fn read(source: &mut ByteSource, checker: &IntegrityChecker) -> Result<Self> {
        let fixed = source.read_exact_allocated(HEADER_SIZE)?;
        let header_size = validate_fixed(&fixed)?;
        let rest = source.read_exact_allocated(header_size as usize - HEADER_SIZE)?;
        Self::parse(fixed, rest, checker)
    }

    /// Device table lookup by id.
    pub fn device(&self, id: u8) -> Option<&DeviceEntry> {
        self.devices
            .binary_search_by_key(&id, |dev| dev.id)
            .ok()
            .map(|idx| &self.devices[idx])
    }

    fn parse(fixed: Vec<u8>, rest: Vec<u8>, checker: &IntegrityChecker) -> Result<Self> {
        let mut md5sum = [0u8; MD5_LEN];
        md5sum.copy_from_slice(&fixed[HEADER_MD5_OFFSET..HEADER_MD5_OFFSET + MD5_LEN]);

        checker.verify(
            "header",
            0,
            &fixed[..HEADER_MD5_OFFSET],
            &[&fixed[HEADER_MD5_OFFSET + MD5_LEN..], &rest],
            &md5sum,
        )?;

        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&fixed[HEADER_UUID_OFFSET..HEADER_UUID_OFFSET + 16]);
        let ctime = be_u64(&fixed, HEADER_CTIME_OFFSET) as i64;
        let header_size = be_u32(&fixed, HEADER_SIZE_OFFSET);

        let blob_buffer_offset = be_u32(&fixed, HEADER_BLOB_BUFFER_OFFSET);
        let blob_buffer_size = be_u32(&fixed, HEADER_BLOB_BUFFER_SIZE_OFFSET);
        let blobs = parse_blob_buffer(&rest, blob_buffer_offset, blob_buffer_size)?;

        let mut devices = Vec::new();
        for id in 1..MAX_DEVICES {
            let slot = HEADER_DEV_INFO_OFFSET + id * DEV_INFO_SIZE;
            let size = be_u64(&fixed, slot + 8);
            if size == 0 {
                continue;
            }
            let name_ptr = be_u32(&fixed, slot);
            let name = blob_name(&blobs, name_ptr, blob_buffer_offset, "device name")?;
            devices.push(DeviceEntry {
                id: id as u8,
                name,
                size,
            });
        }

        let mut configs = Vec::new();
        for slot in 0..MAX_CONFIGS {
            let name_ptr = be_u32(&fixed, HEADER_CONFIG_NAMES_OFFSET + slot * 4);
            if name_ptr == 0 {
                // a zero name offset terminates the config table
                break;
            }
            let data_ptr = be_u32(&fixed, HEADER_CONFIG_DATA_OFFSET + slot * 4);
            let name = blob_name(&blobs, name_ptr, blob_buffer_offset, "config name")?;
            let data = blobs
                .get(&data_ptr)
                .ok_or_else(|| {
                    VmaError::format(
                        blob_buffer_offset as u64 + data_ptr as u64,
                        format!("config {:?} references a missing blob", name),
                    )
                })?
                .clone();
            configs.push(ConfigBlob { name, data });
        }

        Ok(Self {
            uuid,
            ctime,
            header_size,
            devices,
            configs,
        })
    }
}

/// Check magic, version and the declared region geometry; returns the full
/// header region length.
fn validate_fixed(fixed: &[u8]) -> Result<u32> {
    if fixed[..4] != VMA_MAGIC {
        return Err(VmaError::format(0, "not a VMA archive (bad magic)"));
    }
    let version = be_u32(fixed, HEADER_VERSION_OFFSET);
    if version != VMA_VERSION {
        return Err(VmaError::format(
            HEADER_VERSION_OFFSET as u64,
            format!("unsupported archive version {}", version),
        ));
    }

    let header_size = be_u32(fixed, HEADER_SIZE_OFFSET);
    if (header_size as usize) < HEADER_SIZE {
        return Err(VmaError::format(
            HEADER_SIZE_OFFSET as u64,
            format!("declared header size {} is too small", header_size),
        ));
    }

    let blob_buffer_offset = be_u32(fixed, HEADER_BLOB_BUFFER_OFFSET);
    let blob_buffer_size = be_u32(fixed, HEADER_BLOB_BUFFER_SIZE_OFFSET);
    if blob_buffer_size != 0 {
        let start = blob_buffer_offset as u64;
        let end = start + blob_buffer_size as u64;
        if start < HEADER_SIZE as u64 || end > header_size as u64 {
            return Err(VmaError::format(
                HEADER_BLOB_BUFFER_OFFSET as u64,
                format!(
                    "blob buffer ({}+{}) outside the header region ({})",
                    blob_buffer_offset, blob_buffer_size, header_size
                ),
            ));
        }
    }

    Ok(header_size)
}

/// Split the blob buffer into its `(u16 little-endian length)(bytes)`
/// entries, keyed by their offset inside the buffer. Offset 0 is reserved;
/// the first entry starts right behind it.
fn parse_blob_buffer(
    region: &[u8],
    buffer_offset: u32,
    buffer_size: u32,
) -> Result<HashMap<u32, Vec<u8>>> {
    let mut blobs = HashMap::new();
    if buffer_size == 0 {
        return Ok(blobs);
    }

    let start = buffer_offset as usize - HEADER_SIZE;
    let buf = &region[start..start + buffer_size as usize];

    let mut pos = 1;
    while pos + 2 <= buf.len() {
        let len = u16::from_le_bytes([buf[pos], buf[pos + 1]]) as usize;
        if pos + 2 + len > buf.len() {
            return Err(VmaError::format(
                buffer_offset as u64 + pos as u64,
                "blob entry exceeds the blob buffer",
            ));
        }
        blobs.insert(pos as u32, buf[pos + 2..pos + 2 + len].to_vec());
        pos += 2 + len;
    }
    Ok(blobs)
}

/// Resolve a name blob to a string usable as a file name.
fn blob_name(
    blobs: &HashMap<u32, Vec<u8>>,
    ptr: u32,
    buffer_offset: u32,
    what: &str,
) -> Result<String> {
    let offset = buffer_offset as u64 + ptr as u64;
    let data = blobs
        .get(&ptr)
        .ok_or_else(|| VmaError::format(offset, format!("{} references a missing blob", what)))?;

    // names are NUL terminated inside their blob
    let raw = data.split(|&b| b == 0).next().unwrap_or(&[]);
    let name = std::str::from_utf8(raw)
        .map_err(|_| VmaError::format(offset, format!("{} is not valid UTF-8", what)))?;

    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(VmaError::format(
            offset,
            format!("{} {:?} is not a safe file name", what, name),
        ));
    }
    Ok(name.to_string())
}

fn be_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_be_bytes(bytes)
}

fn be_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_be_bytes(bytes)
}

#[cfg(test)]
mod test {
    use super::*;

    struct TestHeader {
        fixed: Vec<u8>,
        rest: Vec<u8>,
    }

    /// Assemble a minimal valid header region: one device, one config.
    fn build_test_header() -> TestHeader {
        fn add_blob(blob: &mut Vec<u8>, data: &[u8]) -> u32 {
            let offset = blob.len() as u32;
            blob.extend_from_slice(&(data.len() as u16).to_le_bytes());
            blob.extend_from_slice(data);
            offset
        }

        let mut blob = vec![0u8]; // reserved offset 0

        let dev_name_ptr = add_blob(&mut blob, b"drive-scsi0\0");
        let cfg_name_ptr = add_blob(&mut blob, b"qemu-server.conf\0");
        let cfg_data_ptr = add_blob(&mut blob, b"bootdisk: scsi0\n");

        let mut fixed = vec![0u8; HEADER_SIZE];
        fixed[..4].copy_from_slice(&VMA_MAGIC);
        fixed[HEADER_VERSION_OFFSET..HEADER_VERSION_OFFSET + 4]
            .copy_from_slice(&VMA_VERSION.to_be_bytes());
        fixed[HEADER_UUID_OFFSET..HEADER_UUID_OFFSET + 16].copy_from_slice(&[0x42; 16]);
        fixed[HEADER_CTIME_OFFSET..HEADER_CTIME_OFFSET + 8]
            .copy_from_slice(&1700000000u64.to_be_bytes());
        fixed[HEADER_BLOB_BUFFER_OFFSET..HEADER_BLOB_BUFFER_OFFSET + 4]
            .copy_from_slice(&(HEADER_SIZE as u32).to_be_bytes());
        fixed[HEADER_BLOB_BUFFER_SIZE_OFFSET..HEADER_BLOB_BUFFER_SIZE_OFFSET + 4]
            .copy_from_slice(&(blob.len() as u32).to_be_bytes());
        let header_size = (HEADER_SIZE + blob.len()) as u32;
        fixed[HEADER_SIZE_OFFSET..HEADER_SIZE_OFFSET + 4]
            .copy_from_slice(&header_size.to_be_bytes());

        fixed[HEADER_CONFIG_NAMES_OFFSET..HEADER_CONFIG_NAMES_OFFSET + 4]
            .copy_from_slice(&cfg_name_ptr.to_be_bytes());
        fixed[HEADER_CONFIG_DATA_OFFSET..HEADER_CONFIG_DATA_OFFSET + 4]
            .copy_from_slice(&cfg_data_ptr.to_be_bytes());

        let slot = HEADER_DEV_INFO_OFFSET + DEV_INFO_SIZE; // device id 1
        fixed[slot..slot + 4].copy_from_slice(&dev_name_ptr.to_be_bytes());
        fixed[slot + 8..slot + 16].copy_from_slice(&196608u64.to_be_bytes());

        // embed the md5 over the zeroed-field region
        let mut region = fixed.clone();
        region.extend_from_slice(&blob);
        let digest =
            openssl::hash::hash(openssl::hash::MessageDigest::md5(), &region).unwrap();
        fixed[HEADER_MD5_OFFSET..HEADER_MD5_OFFSET + MD5_LEN].copy_from_slice(&digest);

        TestHeader { fixed, rest: blob }
    }

    #[test]
    fn test_parse() {
        let TestHeader { fixed, rest } = build_test_header();
        assert_eq!(validate_fixed(&fixed).unwrap() as usize, HEADER_SIZE + rest.len());

        let checker = IntegrityChecker::new(false);
        let header = ArchiveHeader::parse(fixed, rest, &checker).unwrap();

        assert_eq!(header.uuid, [0x42; 16]);
        assert_eq!(header.ctime, 1700000000);
        assert_eq!(header.devices.len(), 1);
        let device = header.device(1).unwrap();
        assert_eq!(device.name, "drive-scsi0");
        assert_eq!(device.size, 196608);
        assert_eq!(device.cluster_count(), 3);
        assert_eq!(device.file_name(), "drive-scsi0.raw");
        assert!(header.device(2).is_none());

        assert_eq!(header.configs.len(), 1);
        assert_eq!(header.configs[0].name, "qemu-server.conf");
        assert_eq!(header.configs[0].data, b"bootdisk: scsi0\n");
    }

    #[test]
    fn test_bad_magic() {
        let TestHeader { mut fixed, .. } = build_test_header();
        fixed[0] = b'X';
        match validate_fixed(&fixed) {
            Err(VmaError::Format { offset: 0, .. }) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_version() {
        let TestHeader { mut fixed, .. } = build_test_header();
        fixed[HEADER_VERSION_OFFSET + 3] = 2;
        assert!(matches!(
            validate_fixed(&fixed),
            Err(VmaError::Format { .. })
        ));
    }

    #[test]
    fn test_corrupt_header_fails_checksum() {
        let TestHeader { mut fixed, rest } = build_test_header();
        fixed[HEADER_UUID_OFFSET] ^= 0xff;

        let err = ArchiveHeader::parse(fixed.clone(), rest.clone(), &IntegrityChecker::new(false))
            .unwrap_err();
        assert!(matches!(err, VmaError::Checksum { region: "header", .. }));

        // skip_hash parses the same bytes successfully
        let header = ArchiveHeader::parse(fixed, rest, &IntegrityChecker::new(true)).unwrap();
        assert_eq!(header.devices.len(), 1);
    }

    #[test]
    fn test_partial_cluster_device() {
        let device = DeviceEntry {
            id: 3,
            name: "drive-ide2".to_string(),
            size: CLUSTER_SIZE as u64 + 512,
        };
        assert_eq!(device.cluster_count(), 2);
    }
}
