use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::trace;
use pollster::block_on;
use thiserror::Error;

use crate::gpu::GpuContext;

#[derive(Debug, Error)]
pub enum BufferPoolError {
    #[error("device memory ceiling reached (requested {size} bytes, {usage} in use, limit {limit})")]
    MemoryLimitExceeded { size: u64, usage: u64, limit: u64 },
    #[error("device rejected a {size} byte buffer: {reason}")]
    AllocationFailed { size: u64, reason: String },
}

struct IdleBuffer {
    buffer: wgpu::Buffer,
    size: u64,
}

/// Recycles device buffers between layers and runs.
///
/// Idle buffers are bucketed by usage flags and handed out best-fit. Every buffer created
/// through the pool counts against the optional memory ceiling until it is evicted; when a new
/// allocation would cross the ceiling the idle buffers are released first.
pub struct GpuBufferPool {
    context: Arc<GpuContext>,
    idle: Mutex<HashMap<wgpu::BufferUsages, Vec<IdleBuffer>>>,
    allocated_bytes: AtomicU64,
    max_memory: Option<u64>,
}

impl GpuBufferPool {
    pub fn new(context: Arc<GpuContext>, max_memory: Option<u64>) -> Self {
        Self {
            context,
            idle: Mutex::new(HashMap::new()),
            allocated_bytes: AtomicU64::new(0),
            max_memory,
        }
    }

    /// Hand out a buffer of at least `size` bytes with exactly `usage`.
    pub fn acquire(
        &self,
        size: u64,
        usage: wgpu::BufferUsages,
        label: Option<&str>,
    ) -> Result<(wgpu::Buffer, u64), BufferPoolError> {
        if let Some(entry) = self.take_best_fit(size, usage) {
            return Ok((entry.buffer, entry.size));
        }

        if let Some(limit) = self.max_memory
            && self.memory_usage() + size > limit
        {
            self.clear();
            let usage = self.memory_usage();
            if usage + size > limit {
                return Err(BufferPoolError::MemoryLimitExceeded { size, usage, limit });
            }
        }

        let device = self.context.device();
        device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label,
            size,
            usage,
            mapped_at_creation: false,
        });
        if let Some(err) = block_on(device.pop_error_scope()) {
            return Err(BufferPoolError::AllocationFailed {
                size,
                reason: err.to_string(),
            });
        }

        self.allocated_bytes.fetch_add(size, Ordering::Relaxed);
        trace!(target: "layerdrive::gpu", "allocated {size} byte buffer ({usage:?})");
        Ok((buffer, size))
    }

    /// Return a buffer previously handed out by [`acquire`](Self::acquire).
    pub fn recycle(&self, buffer: wgpu::Buffer, size: u64, usage: wgpu::BufferUsages) {
        self.lock_idle()
            .entry(usage)
            .or_default()
            .push(IdleBuffer { buffer, size });
    }

    /// Number of idle buffers waiting for reuse.
    pub fn available(&self) -> usize {
        self.lock_idle().values().map(Vec::len).sum()
    }

    /// Bytes created through this pool and not yet evicted.
    pub fn memory_usage(&self) -> u64 {
        self.allocated_bytes.load(Ordering::Relaxed)
    }

    /// Drop every idle buffer.
    pub fn clear(&self) {
        let mut idle = self.lock_idle();
        let freed: u64 = idle.values().flatten().map(|entry| entry.size).sum();
        idle.clear();
        self.allocated_bytes.fetch_sub(freed, Ordering::Relaxed);
    }

    fn take_best_fit(&self, size: u64, usage: wgpu::BufferUsages) -> Option<IdleBuffer> {
        let mut idle = self.lock_idle();
        let buffers = idle.get_mut(&usage)?;
        let index = buffers
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.size >= size)
            .min_by_key(|(_, entry)| entry.size)
            .map(|(index, _)| index)?;
        Some(buffers.swap_remove(index))
    }

    fn lock_idle(&self) -> MutexGuard<'_, HashMap<wgpu::BufferUsages, Vec<IdleBuffer>>> {
        self.idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for GpuBufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuBufferPool")
            .field("idle_buffers", &self.available())
            .field("memory_usage", &self.memory_usage())
            .field("max_memory", &self.max_memory)
            .finish()
    }
}
