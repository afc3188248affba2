//! Top level extraction orchestrator.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use proxmox_uuid::Uuid;

use crate::byte_source::ByteSource;
use crate::checksum::IntegrityChecker;
use crate::error::{Result, VmaError};
use crate::extent::ExtentHeader;
use crate::file_formats::EXTENT_HEADER_SIZE;
use crate::header::ArchiveHeader;
use crate::progress::{Counters, ProgressReporter, ProgressSink};
use crate::sparse_writer::SparseWriter;
use crate::write_pool::WritePool;

/// Tunables for one extraction run.
#[derive(Default)]
pub struct ExtractOptions {
    /// Skip all MD5 verification.
    pub skip_hash: bool,
    /// Writer thread count; defaults to the number of hardware threads,
    /// never less than two.
    pub workers: Option<usize>,
    /// Replaces the default log based progress emission.
    pub progress: Option<ProgressSink>,
}

/// What a successful run produced.
pub struct ExtractSummary {
    pub uuid: Uuid,
    pub configs: usize,
    pub devices: usize,
    pub read_bytes: u64,
    pub written_bytes: u64,
    pub elapsed: Duration,
}

/// Extract `source_path` into `output_dir`.
///
/// The output directory must already exist. On error, partially written
/// outputs are left in place for inspection; the caller decides whether to
/// clean up.
pub fn extract(
    source_path: &Path,
    output_dir: &Path,
    options: ExtractOptions,
) -> Result<ExtractSummary> {
    let start = Instant::now();
    let counters = Arc::new(Counters::default());
    let checker = IntegrityChecker::new(options.skip_hash);

    let mut source = ByteSource::open(source_path, Arc::clone(&counters))?;
    let header = ArchiveHeader::read(&mut source, &checker)?;

    log::info!(
        "archive {}, created {}, {} device(s), {} config file(s)",
        Uuid::from(header.uuid),
        proxmox_time::strftime_local("%c", header.ctime)
            .unwrap_or_else(|_| header.ctime.to_string()),
        header.devices.len(),
        header.configs.len(),
    );

    write_configs(output_dir, &header)?;

    let mut writers = HashMap::new();
    for device in &header.devices {
        log::debug!(
            "device {}: {} ({} bytes)",
            device.id,
            device.file_name(),
            device.size
        );
        let writer = SparseWriter::create(output_dir, device.clone(), Arc::clone(&counters))?;
        writers.insert(device.id, Arc::new(writer));
    }
    let writers = Arc::new(writers);

    let pool = WritePool::new(worker_count(options.workers), Arc::clone(&writers));
    let mut reporter = ProgressReporter::new(Arc::clone(&counters), source.len(), options.progress);

    let streamed = stream_extents(&mut source, &header, &checker, &pool, &mut reporter);
    let drained = pool.complete();
    streamed?;
    drained?;

    for writer in writers.values() {
        writer.finalize()?;
    }
    reporter.finish();

    Ok(ExtractSummary {
        uuid: Uuid::from(header.uuid),
        configs: header.configs.len(),
        devices: header.devices.len(),
        read_bytes: counters.read(),
        written_bytes: counters.written(),
        elapsed: start.elapsed(),
    })
}

/// Decode extents until the end of the archive, feeding the pool.
fn stream_extents(
    source: &mut ByteSource,
    header: &ArchiveHeader,
    checker: &IntegrityChecker,
    pool: &WritePool,
    reporter: &mut ProgressReporter,
) -> Result<()> {
    while !source.eof() {
        let offset = source.position();
        let raw = source.read_exact_allocated(EXTENT_HEADER_SIZE)?;
        let extent = ExtentHeader::parse(raw, offset)?;
        if extent.uuid != header.uuid {
            return Err(VmaError::format(
                offset,
                "extent uuid does not match the archive uuid",
            ));
        }

        let payload = source.read_exact_allocated(extent.payload_size())?;
        extent.verify(checker, &payload)?;

        for placement in extent.placements(&payload, header) {
            pool.submit(placement?)?;
        }
        reporter.tick();
    }
    Ok(())
}

fn write_configs(output_dir: &Path, header: &ArchiveHeader) -> Result<()> {
    for config in &header.configs {
        let path = output_dir.join(&config.name);
        let mut file = std::fs::File::create(&path).map_err(|source| VmaError::Resource {
            path: path.clone(),
            source,
        })?;
        file.write_all(&config.data)
            .map_err(|source| VmaError::Resource {
                path: path.clone(),
                source,
            })?;
        log::debug!("wrote config {}", path.display());
    }
    Ok(())
}

fn worker_count(requested: Option<usize>) -> usize {
    requested
        .unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        })
        .max(2)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_worker_count_floor() {
        assert_eq!(worker_count(Some(1)), 2);
        assert_eq!(worker_count(Some(8)), 8);
        assert!(worker_count(None) >= 2);
    }
}
