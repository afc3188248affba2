//! On-disk format of the Virtual Machine Archive (VMA) container.
//!
//! The archive starts with a fixed 12288 byte header struct. The header
//! region as a whole is larger: the `header_size` field declares its full
//! length, which additionally covers the blob buffer holding all name
//! strings and config payloads. The rest of the file is a sequence of
//! extents, each a 512 byte header followed by its payload blocks.
//!
//! All multi-byte integers are big-endian, with one exception: the u16
//! length prefixes inside the blob buffer are little-endian.

// WARNING: PLEASE DO NOT MODIFY THOSE MAGIC VALUES

// b"VMA\0" as on-disk bytes
pub const VMA_MAGIC: [u8; 4] = [86, 77, 65, 0];

// b"VMAE" as on-disk bytes
pub const VMA_EXTENT_MAGIC: [u8; 4] = [86, 77, 65, 69];

/// The only format version ever written.
pub const VMA_VERSION: u32 = 1;

/// Logical cluster size of device images.
pub const CLUSTER_SIZE: usize = 65536;

/// Sub-cluster granularity of the extent block bitmap.
pub const BLOCK_SIZE: usize = 4096;

/// Width of a cluster mask.
pub const BLOCKS_PER_CLUSTER: usize = CLUSTER_SIZE / BLOCK_SIZE;

/// Size of the fixed header struct. The full header region is declared by
/// the `header_size` field and is at least this large.
pub const HEADER_SIZE: usize = 12288;

pub const EXTENT_HEADER_SIZE: usize = 512;

/// Cluster slots per extent header.
pub const BLOCKS_PER_EXTENT: usize = 59;

/// Device and config slots in the header. Device slot 0 is reserved, a
/// blockinfo entry with device id 0 is unused.
pub const MAX_DEVICES: usize = 256;
pub const MAX_CONFIGS: usize = 256;

// Field offsets inside the fixed header.
pub const HEADER_VERSION_OFFSET: usize = 0x04;
pub const HEADER_UUID_OFFSET: usize = 0x08;
pub const HEADER_CTIME_OFFSET: usize = 0x18;
pub const HEADER_MD5_OFFSET: usize = 0x20;
pub const HEADER_BLOB_BUFFER_OFFSET: usize = 0x30;
pub const HEADER_BLOB_BUFFER_SIZE_OFFSET: usize = 0x34;
pub const HEADER_SIZE_OFFSET: usize = 0x38;
pub const HEADER_CONFIG_NAMES_OFFSET: usize = 0x7fc;
pub const HEADER_CONFIG_DATA_OFFSET: usize = 0xbfc;
pub const HEADER_DEV_INFO_OFFSET: usize = 0x1000;

/// Size of one device table slot: name offset (u32), reserved (u32),
/// size (u64), reserved ([u8; 16]).
pub const DEV_INFO_SIZE: usize = 32;

// Field offsets inside the extent header.
pub const EXTENT_BLOCK_COUNT_OFFSET: usize = 0x06;
pub const EXTENT_UUID_OFFSET: usize = 0x08;
pub const EXTENT_MD5_OFFSET: usize = 0x18;
pub const EXTENT_BLOCKINFO_OFFSET: usize = 0x28;

/// Length of the embedded MD5 digests.
pub const MD5_LEN: usize = 16;
