//! Bounded worker pool placing decoded clusters.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Sender};

use crate::error::{Result, VmaError};
use crate::extent::ClusterPlacement;
use crate::sparse_writer::SparseWriter;

/// Queue slots per worker. Each queued placement may hold a full cluster,
/// so this bound also caps the memory held by the queue.
const QUEUE_DEPTH_PER_WORKER: usize = 4;

/// Fixed set of writer threads consuming cluster placements.
///
/// Submission blocks while the queue is full, pushing backpressure into
/// the extent decoder. The first worker error poisons the pool: later
/// submissions fail with it, placements already queued still complete, and
/// [`WritePool::complete`] surfaces whatever happened first.
pub struct WritePool {
    handles: Vec<JoinHandle<()>>,
    input: Sender<ClusterPlacement>,
    abort: Arc<Mutex<Option<VmaError>>>,
}

impl WritePool {
    pub fn new(threads: usize, writers: Arc<HashMap<u8, Arc<SparseWriter>>>) -> Self {
        let (input, rx) = bounded::<ClusterPlacement>(threads * QUEUE_DEPTH_PER_WORKER);
        let abort = Arc::new(Mutex::new(None));

        let mut handles = Vec::new();
        for i in 0..threads {
            let rx = rx.clone();
            let abort = Arc::clone(&abort);
            let writers = Arc::clone(&writers);
            handles.push(
                std::thread::Builder::new()
                    .name(format!("cluster writer ({})", i))
                    .spawn(move || loop {
                        let placement = match rx.recv() {
                            Ok(placement) => placement,
                            Err(_) => return,
                        };
                        if let Err(err) = write_placement(&writers, placement) {
                            let mut guard = abort.lock().unwrap();
                            if guard.is_none() {
                                *guard = Some(err);
                            }
                        }
                    })
                    .unwrap(),
            );
        }

        Self {
            handles,
            input,
            abort,
        }
    }

    /// Queue one placement, blocking while the queue is full.
    pub fn submit(&self, placement: ClusterPlacement) -> Result<()> {
        if let Some(err) = self.abort.lock().unwrap().take() {
            return Err(err);
        }
        self.input
            .send(placement)
            .map_err(|_| VmaError::Pool("all writer threads exited".to_string()))
    }

    /// Close the queue, wait for the workers to drain it, and surface the
    /// first error.
    pub fn complete(self) -> Result<()> {
        let WritePool {
            handles,
            input,
            abort,
        } = self;
        drop(input);

        let mut panics = Vec::new();
        for (i, handle) in handles.into_iter().enumerate() {
            if let Err(panic) = handle.join() {
                match panic.downcast::<&str>() {
                    Ok(msg) => panics.push(format!("cluster writer ({}) panicked: {}", i, msg)),
                    Err(_) => panics.push(format!("cluster writer ({}) panicked", i)),
                }
            }
        }

        if let Some(err) = abort.lock().unwrap().take() {
            return Err(err);
        }
        if !panics.is_empty() {
            return Err(VmaError::Pool(panics.join("\n")));
        }
        Ok(())
    }
}

fn write_placement(
    writers: &HashMap<u8, Arc<SparseWriter>>,
    placement: ClusterPlacement,
) -> Result<()> {
    match writers.get(&placement.dev_id) {
        Some(writer) => writer.place(placement.cluster, &placement.data),
        // decoding validates device ids, this cannot be reached via extract()
        None => Err(VmaError::Pool(format!(
            "no writer for device {}",
            placement.dev_id
        ))),
    }
}
