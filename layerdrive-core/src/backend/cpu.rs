//! Host reference backend.
//!
//! Output rows are spread over rayon workers. Each element accumulates in a fixed order: start
//! from the channel bias, then input channels ascending, kernel rows ascending, kernel columns
//! ascending, one fused multiply-add per term. The result is therefore identical run to run
//! regardless of thread count.

use rayon::{ThreadPool, ThreadPoolBuilder, prelude::*};

use super::{ConvBackend, ConvInvocation, ConvOperands, DeviceBuffer, KernelParams};
use crate::error::ConvError;

/// Host-resident tensor storage.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HostBuffer {
    data: Vec<f32>,
}

impl HostBuffer {
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }
}

impl From<Vec<f32>> for HostBuffer {
    fn from(data: Vec<f32>) -> Self {
        Self { data }
    }
}

impl DeviceBuffer for HostBuffer {
    fn len(&self) -> usize {
        self.data.len()
    }
}

/// Convolution on the CPU with rayon.
#[derive(Debug, Default)]
pub struct CpuBackend {
    pool: Option<ThreadPool>,
}

impl CpuBackend {
    /// Backend that runs on the global rayon pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend with its own pool of `threads` workers.
    pub fn with_threads(threads: usize) -> Result<Self, ConvError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|index| format!("layerdrive-cpu-{index}"))
            .build()
            .map_err(|err| ConvError::dispatch("cpu", format!("thread pool: {err}")))?;
        Ok(Self { pool: Some(pool) })
    }

    /// Worker count used for dispatches.
    pub fn threads(&self) -> usize {
        self.pool
            .as_ref()
            .map_or_else(rayon::current_num_threads, ThreadPool::current_num_threads)
    }
}

impl ConvBackend for CpuBackend {
    type Buffer = HostBuffer;

    fn name(&self) -> &'static str {
        "cpu"
    }

    fn upload(&self, data: &[f32], _label: &str) -> Result<HostBuffer, ConvError> {
        Ok(HostBuffer::from(data.to_vec()))
    }

    fn allocate(&self, len: usize, _label: &str) -> Result<HostBuffer, ConvError> {
        Ok(HostBuffer::from(vec![0.0; len]))
    }

    fn download(&self, buffer: &HostBuffer) -> Result<Vec<f32>, ConvError> {
        Ok(buffer.data.clone())
    }

    fn dispatch(&self, invocation: ConvInvocation<'_, HostBuffer>) -> Result<(), ConvError> {
        let (operands, output) = invocation.into_parts();
        let ConvOperands {
            params,
            input,
            weights,
            bias,
        } = operands;
        let (input, weights, bias) = (input.as_slice(), weights.as_slice(), bias.as_slice());
        let output = output.as_mut_slice();
        match &self.pool {
            Some(pool) => pool.install(|| convolve(&params, input, weights, bias, output)),
            None => convolve(&params, input, weights, bias, output),
        }
        Ok(())
    }
}

fn convolve(
    params: &KernelParams,
    input: &[f32],
    weights: &[f32],
    bias: &[f32],
    output: &mut [f32],
) {
    let out_h = params.out_h as usize;
    output
        .par_chunks_mut(params.out_w as usize)
        .enumerate()
        .for_each(|(row, out_row)| {
            let oc = row / out_h;
            let oy = row % out_h;
            for (ox, slot) in out_row.iter_mut().enumerate() {
                *slot = output_element(params, input, weights, bias[oc], oc, oy, ox);
            }
        });
}

fn output_element(
    params: &KernelParams,
    input: &[f32],
    weights: &[f32],
    bias: f32,
    oc: usize,
    oy: usize,
    ox: usize,
) -> f32 {
    let in_channels = params.in_channels as usize;
    let in_h = params.in_h as usize;
    let in_w = params.in_w as usize;
    let kernel_h = params.kernel_h as usize;
    let kernel_w = params.kernel_w as usize;
    let kernel_area = kernel_h * kernel_w;
    let y0 = oy * params.stride_h as usize;
    let x0 = ox * params.stride_w as usize;

    let mut acc = bias;
    for ic in 0..in_channels {
        let plane = ic * in_h * in_w;
        let weight_plane = (oc * in_channels + ic) * kernel_area;
        for ky in 0..kernel_h {
            let row = plane + (y0 + ky) * in_w + x0;
            let weight_row = weight_plane + ky * kernel_w;
            let pixels = &input[row..row + kernel_w];
            let taps = &weights[weight_row..weight_row + kernel_w];
            for (pixel, tap) in pixels.iter().zip(taps) {
                acc = pixel.mul_add(*tap, acc);
            }
        }
    }

    if params.apply_activation != 0 {
        acc.max(0.0)
    } else {
        acc
    }
}
