//! Per-device sparse image writer.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::{Result, VmaError};
use crate::extent::ClusterData;
use crate::file_formats::CLUSTER_SIZE;
use crate::header::DeviceEntry;
use crate::progress::Counters;

/// Reassembles one device image as `<name>.raw` in the output directory.
///
/// The file is pre-sized with `ftruncate`, so clusters the archive never
/// mentions stay unallocated holes. Workers share the writer; the state
/// mutex serializes writes to one device while distinct devices proceed in
/// parallel. Placements are address-indexed, so no ordering is required;
/// a cluster placed twice must carry identical bytes.
pub struct SparseWriter {
    device: DeviceEntry,
    path: PathBuf,
    state: Mutex<WriterState>,
    counters: Arc<Counters>,
}

struct WriterState {
    file: File,
    /// One bit per logical cluster that has been placed.
    written: Vec<u64>,
}

impl WriterState {
    fn test(&self, cluster: u32) -> bool {
        self.written[cluster as usize / 64] & (1 << (cluster % 64)) != 0
    }

    fn set(&mut self, cluster: u32) {
        self.written[cluster as usize / 64] |= 1 << (cluster % 64);
    }
}

impl SparseWriter {
    pub fn create(output_dir: &Path, device: DeviceEntry, counters: Arc<Counters>) -> Result<Self> {
        let path = output_dir.join(device.file_name());
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| VmaError::Resource {
                path: path.clone(),
                source,
            })?;

        nix::unistd::ftruncate(file.as_raw_fd(), device.size as i64).map_err(|err| {
            VmaError::Resource {
                path: path.clone(),
                source: err.into(),
            }
        })?;

        let words = (device.cluster_count() as usize + 63) / 64;
        Ok(Self {
            device,
            path,
            state: Mutex::new(WriterState {
                file,
                written: vec![0; words],
            }),
            counters,
        })
    }

    pub fn device(&self) -> &DeviceEntry {
        &self.device
    }

    /// Place one cluster at its logical offset.
    ///
    /// The cluster index was validated against the device table during
    /// decoding. A write reaching past the device end is capped, dropping
    /// the tail bytes of the final partial cluster.
    pub fn place(&self, cluster: u32, data: &ClusterData) -> Result<()> {
        let offset = cluster as u64 * CLUSTER_SIZE as u64;
        let len = std::cmp::min(CLUSTER_SIZE as u64, self.device.size - offset) as usize;

        let mut state = self.state.lock().unwrap();

        if state.test(cluster) {
            return self.check_rewrite(&state, cluster, offset, len, data);
        }

        if let ClusterData::Data(buf) = data {
            state
                .file
                .write_all_at(&buf[..len], offset)
                .map_err(|source| VmaError::Io { offset, source })?;
            self.counters.add_written(len as u64);
        }
        state.set(cluster);
        Ok(())
    }

    /// Compare a repeated placement against the bytes already on disk.
    /// Identical bytes are an idempotent no-op, anything else corrupts the
    /// image and is fatal.
    fn check_rewrite(
        &self,
        state: &WriterState,
        cluster: u32,
        offset: u64,
        len: usize,
        data: &ClusterData,
    ) -> Result<()> {
        let mut existing = vec![0u8; len];
        state
            .file
            .read_exact_at(&mut existing, offset)
            .map_err(|source| VmaError::Io { offset, source })?;

        let identical = match data {
            ClusterData::Zero => existing.iter().all(|&b| b == 0),
            ClusterData::Data(buf) => existing[..] == buf[..len],
        };
        if identical {
            Ok(())
        } else {
            Err(VmaError::Conflict {
                device: self.device.id,
                name: self.device.name.clone(),
                cluster,
            })
        }
    }

    /// Confirm the output has exactly the declared device size.
    pub fn finalize(&self) -> Result<()> {
        let state = self.state.lock().unwrap();
        let len = state
            .file
            .metadata()
            .map_err(|source| VmaError::Resource {
                path: self.path.clone(),
                source,
            })?
            .len();
        if len != self.device.size {
            return Err(VmaError::Resource {
                path: self.path.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("output is {} bytes, expected {}", len, self.device.size),
                ),
            });
        }
        log::debug!(
            "device {} ({}): finalized at {} bytes",
            self.device.id,
            self.path.display(),
            len
        );
        Ok(())
    }
}
