//! Extract Proxmox VMA backup archives.
//!
//! A VMA archive bundles the configuration blobs of one VM together with
//! the disk images of its devices. The library parses the container,
//! verifies the embedded MD5 digests, and reassembles every device as a
//! sparse `.raw` image: the archive only carries the 4 KiB blocks that
//! were actually present, and everything it leaves out stays an
//! unallocated hole in the output.
//!
//! Decoding is single threaded; writing is handed to a bounded pool of
//! writer threads, so slow output storage applies backpressure to the
//! decoder instead of growing buffers.
//!
//! The input must already be decompressed; decompression, output
//! directory policy and image conversion are left to the caller.

pub mod byte_source;
pub mod checksum;
pub mod error;
pub mod extent;
pub mod extract;
pub mod file_formats;
pub mod header;
pub mod progress;
pub mod sparse_writer;
pub mod write_pool;

pub use error::{Result, VmaError};
pub use extract::{extract, ExtractOptions, ExtractSummary};
pub use progress::{ExtractProgress, ProgressSink};
