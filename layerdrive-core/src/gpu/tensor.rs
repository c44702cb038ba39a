use bytemuck::cast_slice;
use std::{
    fmt,
    sync::{Arc, mpsc},
};

use layerdrive_utils::gpu::{GpuBufferPool, GpuContext};

use crate::{backend::DeviceBuffer, error::ConvError};

const F32_BYTES: u64 = std::mem::size_of::<f32>() as u64;

/// `f32` tensor living in a pooled storage buffer.
///
/// The pooled buffer may be larger than the tensor; only the first `len` values belong to it.
/// Tensors are not `Clone`: each owns its buffer, so a borrow-checked invocation never binds one
/// buffer as both output and input. Dropping a tensor hands the buffer back to the pool.
pub struct GpuTensor {
    context: Arc<GpuContext>,
    pool: Arc<GpuBufferPool>,
    buffer: wgpu::Buffer,
    capacity_bytes: u64,
    len: usize,
}

impl Drop for GpuTensor {
    fn drop(&mut self) {
        self.pool
            .recycle(self.buffer.clone(), self.capacity_bytes, storage_usage());
    }
}

impl GpuTensor {
    /// Allocate a tensor for `len` values with unspecified contents.
    pub fn uninitialized(
        context: Arc<GpuContext>,
        pool: Arc<GpuBufferPool>,
        len: usize,
        label: &str,
    ) -> Result<Self, ConvError> {
        if len == 0 {
            return Err(ConvError::dispatch("wgpu", format!("{label}: empty tensor")));
        }
        let size_bytes = len as u64 * F32_BYTES;
        let max_binding = u64::from(context.limits().max_storage_buffer_binding_size);
        if size_bytes > max_binding {
            return Err(ConvError::dispatch(
                "wgpu",
                format!("{label}: {size_bytes} bytes exceeds the {max_binding} byte binding limit"),
            ));
        }
        let (buffer, capacity_bytes) = pool
            .acquire(size_bytes, storage_usage(), Some(label))
            .map_err(|err| ConvError::dispatch("wgpu", format!("{label}: {err}")))?;
        Ok(Self {
            context,
            pool,
            buffer,
            capacity_bytes,
            len,
        })
    }

    /// Upload host values into a new tensor.
    pub fn from_slice(
        context: Arc<GpuContext>,
        pool: Arc<GpuBufferPool>,
        data: &[f32],
        label: &str,
    ) -> Result<Self, ConvError> {
        let tensor = Self::uninitialized(context, pool, data.len(), label)?;
        tensor
            .context()
            .queue()
            .write_buffer(tensor.buffer(), 0, cast_slice(data));
        Ok(tensor)
    }

    /// Copy the tensor back to the host, waiting for queued work that writes it.
    pub fn to_vec(&self) -> Result<Vec<f32>, ConvError> {
        let context = self.context();
        let device = context.device();
        let size_bytes = self.size_bytes();
        let usage = wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ;
        let (readback, readback_bytes) = self
            .pool
            .acquire(size_bytes, usage, Some("layerdrive_readback"))
            .map_err(|err| ConvError::dispatch("wgpu", format!("readback: {err}")))?;

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("layerdrive_readback_encoder"),
        });
        encoder.copy_buffer_to_buffer(self.buffer(), 0, &readback, 0, size_bytes);
        context.queue().submit(Some(encoder.finish()));

        let result = read_buffer(device, &readback, self.len);
        self.pool.recycle(readback, readback_bytes, usage);
        result
    }

    /// The backing storage buffer, for bind groups.
    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    /// Byte size of the tensor's own values.
    pub fn size_bytes(&self) -> u64 {
        self.len as u64 * F32_BYTES
    }

    /// Context the buffer was created on.
    pub fn context(&self) -> &Arc<GpuContext> {
        &self.context
    }
}

impl DeviceBuffer for GpuTensor {
    fn len(&self) -> usize {
        self.len
    }
}

impl fmt::Debug for GpuTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuTensor")
            .field("len", &self.len)
            .field("capacity_bytes", &self.capacity_bytes)
            .finish()
    }
}

fn storage_usage() -> wgpu::BufferUsages {
    wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST
}

fn read_buffer(
    device: &wgpu::Device,
    buffer: &wgpu::Buffer,
    len: usize,
) -> Result<Vec<f32>, ConvError> {
    let size_bytes = len as u64 * F32_BYTES;
    let slice = buffer.slice(0..size_bytes);
    let (sender, receiver) = mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = sender.send(result);
    });
    device
        .poll(wgpu::PollType::Wait {
            submission_index: None,
            timeout: None,
        })
        .map_err(|err| ConvError::dispatch("wgpu", format!("device poll during readback: {err}")))?;
    receiver
        .recv()
        .map_err(|_| ConvError::dispatch("wgpu", "readback callback dropped"))?
        .map_err(|err| ConvError::dispatch("wgpu", format!("failed to map readback: {err}")))?;

    let values: Vec<f32> = {
        let mapped = slice.get_mapped_range();
        cast_slice(&mapped).to_vec()
    };
    buffer.unmap();
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use layerdrive_utils::gpu::{GpuAvailability, GpuContextOptions};

    fn test_context() -> Option<Arc<GpuContext>> {
        match GpuContext::init_with_fallback(&GpuContextOptions::default()) {
            GpuAvailability::Available(ctx) => Some(ctx),
            other => {
                eprintln!("Skipping GPU tensor test: {other:?}");
                None
            }
        }
    }

    #[test]
    fn upload_download_roundtrip_keeps_bits() {
        let Some(ctx) = test_context() else {
            return;
        };
        let pool = Arc::new(GpuBufferPool::new(ctx.clone(), None));
        let data: Vec<f32> = vec![0.5, -0.0, f32::INFINITY, f32::from_bits(0x7fc0_0001), 1e-40];
        let tensor = GpuTensor::from_slice(ctx, pool, &data, "roundtrip").expect("upload");
        assert_eq!(tensor.len(), data.len());
        let back = tensor.to_vec().expect("download");
        let bits = |v: &[f32]| v.iter().map(|x| x.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(&back), bits(&data));
    }

    #[test]
    fn dropped_tensors_return_to_pool() {
        let Some(ctx) = test_context() else {
            return;
        };
        let pool = Arc::new(GpuBufferPool::new(ctx.clone(), None));
        {
            let first = GpuTensor::uninitialized(ctx.clone(), pool.clone(), 64, "pooled")
                .expect("allocate");
            let second = GpuTensor::uninitialized(ctx.clone(), pool.clone(), 64, "pooled")
                .expect("allocate");
            drop(first);
            assert_eq!(pool.available(), 1);
            drop(second);
        }
        assert_eq!(pool.available(), 2);

        // A smaller tensor reuses an idle buffer but reports its own length.
        let reused = GpuTensor::from_slice(ctx, pool.clone(), &[1.0, 2.0], "reused").expect("reuse");
        assert_eq!(pool.available(), 1);
        assert_eq!(reused.to_vec().expect("download"), vec![1.0, 2.0]);
    }

    #[test]
    fn empty_tensors_are_rejected() {
        let Some(ctx) = test_context() else {
            return;
        };
        let pool = Arc::new(GpuBufferPool::new(ctx.clone(), None));
        assert!(GpuTensor::uninitialized(ctx, pool, 0, "empty").is_err());
    }
}
