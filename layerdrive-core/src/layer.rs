//! Shape contract of a single valid-mode convolution layer.

use std::fmt;

use serde::Serialize;

use crate::error::ConvError;

/// Logical `(channels, height, width)` extent of a channel-major tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TensorDims {
    pub channels: u32,
    pub height: u32,
    pub width: u32,
}

impl TensorDims {
    pub const fn new(channels: u32, height: u32, width: u32) -> Self {
        Self {
            channels,
            height,
            width,
        }
    }

    /// Number of `f32` values a tensor with these dims holds.
    ///
    /// Saturates at `usize::MAX`; dims taken from a validated [`ConvLayerSpec`] never get there.
    pub fn len(&self) -> usize {
        element_count(&[self.channels, self.height, self.width])
            .and_then(|count| usize::try_from(count).ok())
            .unwrap_or(usize::MAX)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for TensorDims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.channels, self.height, self.width)
    }
}

/// Grid of independent output elements for one dispatch: `(out_channels, out_h, out_w)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkSize {
    pub channels: u32,
    pub rows: u32,
    pub cols: u32,
}

impl WorkSize {
    /// Total invocation count.
    pub fn items(&self) -> u64 {
        u64::from(self.channels) * u64::from(self.rows) * u64::from(self.cols)
    }
}

/// Immutable description of one convolution layer.
///
/// Construction validates the shape arithmetic, so every value of this type has
/// `out_h = (in_h - kernel_h) / stride_h + 1 >= 1` (and likewise for the width).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConvLayerSpec {
    in_channels: u32,
    out_channels: u32,
    in_h: u32,
    in_w: u32,
    kernel_h: u32,
    kernel_w: u32,
    stride_h: u32,
    stride_w: u32,
    apply_activation: bool,
    out_h: u32,
    out_w: u32,
}

impl ConvLayerSpec {
    /// Validate and build a layer spec.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        in_channels: u32,
        out_channels: u32,
        in_h: u32,
        in_w: u32,
        kernel_h: u32,
        kernel_w: u32,
        stride_h: u32,
        stride_w: u32,
        apply_activation: bool,
    ) -> Result<Self, ConvError> {
        if in_channels == 0 || out_channels == 0 {
            return Err(ConvError::InvalidShape(format!(
                "channel counts must be non-zero (in {in_channels}, out {out_channels})"
            )));
        }
        if in_h == 0 || in_w == 0 {
            return Err(ConvError::InvalidShape(format!(
                "input extent {in_h}x{in_w} is empty"
            )));
        }
        if kernel_h == 0 || kernel_w == 0 {
            return Err(ConvError::InvalidShape(format!(
                "kernel {kernel_h}x{kernel_w} is empty"
            )));
        }
        if stride_h == 0 || stride_w == 0 {
            return Err(ConvError::InvalidShape(format!(
                "stride {stride_h}x{stride_w} must be non-zero"
            )));
        }
        if kernel_h > in_h || kernel_w > in_w {
            return Err(ConvError::InvalidShape(format!(
                "kernel {kernel_h}x{kernel_w} exceeds input {in_h}x{in_w}"
            )));
        }

        let spec = Self {
            in_channels,
            out_channels,
            in_h,
            in_w,
            kernel_h,
            kernel_w,
            stride_h,
            stride_w,
            apply_activation,
            out_h: valid_output_dim(in_h, kernel_h, stride_h),
            out_w: valid_output_dim(in_w, kernel_w, stride_w),
        };
        spec.check_addressable()?;
        Ok(spec)
    }

    /// Square kernel, unit stride layer reading `input`.
    pub fn square(
        input: TensorDims,
        out_channels: u32,
        kernel: u32,
        apply_activation: bool,
    ) -> Result<Self, ConvError> {
        Self::new(
            input.channels,
            out_channels,
            input.height,
            input.width,
            kernel,
            kernel,
            1,
            1,
            apply_activation,
        )
    }

    pub fn in_channels(&self) -> u32 {
        self.in_channels
    }

    pub fn out_channels(&self) -> u32 {
        self.out_channels
    }

    pub fn in_h(&self) -> u32 {
        self.in_h
    }

    pub fn in_w(&self) -> u32 {
        self.in_w
    }

    pub fn kernel_h(&self) -> u32 {
        self.kernel_h
    }

    pub fn kernel_w(&self) -> u32 {
        self.kernel_w
    }

    pub fn stride_h(&self) -> u32 {
        self.stride_h
    }

    pub fn stride_w(&self) -> u32 {
        self.stride_w
    }

    pub fn apply_activation(&self) -> bool {
        self.apply_activation
    }

    pub fn out_h(&self) -> u32 {
        self.out_h
    }

    pub fn out_w(&self) -> u32 {
        self.out_w
    }

    pub fn input_dims(&self) -> TensorDims {
        TensorDims::new(self.in_channels, self.in_h, self.in_w)
    }

    pub fn output_dims(&self) -> TensorDims {
        TensorDims::new(self.out_channels, self.out_h, self.out_w)
    }

    pub fn input_len(&self) -> usize {
        self.input_dims().len()
    }

    /// `out_channels * in_channels * kernel_h * kernel_w`.
    pub fn weight_len(&self) -> usize {
        self.out_channels as usize * self.in_channels as usize * self.kernel_area()
    }

    fn weight_count(&self) -> Option<u128> {
        element_count(&[
            self.out_channels,
            self.in_channels,
            self.kernel_h,
            self.kernel_w,
        ])
    }

    pub fn bias_len(&self) -> usize {
        self.out_channels as usize
    }

    pub fn output_len(&self) -> usize {
        self.output_dims().len()
    }

    pub fn kernel_area(&self) -> usize {
        self.kernel_h as usize * self.kernel_w as usize
    }

    pub fn work_size(&self) -> WorkSize {
        WorkSize {
            channels: self.out_channels,
            rows: self.out_h,
            cols: self.out_w,
        }
    }

    /// Whether this layer's output can feed `next` directly.
    pub fn feeds(&self, next: &ConvLayerSpec) -> bool {
        self.output_dims() == next.input_dims()
    }

    // Every flat index of every buffer must fit in a u32 shader index. Counted in u128 so no
    // u32 extents can wrap before the bound is checked.
    fn check_addressable(&self) -> Result<(), ConvError> {
        let counts = [
            element_count(&[self.in_channels, self.in_h, self.in_w]),
            self.weight_count(),
            element_count(&[self.out_channels, self.out_h, self.out_w]),
        ];
        let largest = counts
            .iter()
            .map(|count| count.unwrap_or(u128::MAX))
            .max()
            .unwrap_or(0);
        if largest > u128::from(u32::MAX) {
            return Err(ConvError::InvalidShape(format!(
                "layer {} needs {largest} elements in one buffer, more than 32-bit indexing allows",
                self.input_dims()
            )));
        }
        Ok(())
    }
}

impl fmt::Display for ConvLayerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} (kernel {}x{}, stride {}x{}{})",
            self.input_dims(),
            self.output_dims(),
            self.kernel_h,
            self.kernel_w,
            self.stride_h,
            self.stride_w,
            if self.apply_activation { ", relu" } else { "" }
        )
    }
}

fn valid_output_dim(input: u32, kernel: u32, stride: u32) -> u32 {
    (input - kernel) / stride + 1
}

fn element_count(extents: &[u32]) -> Option<u128> {
    extents
        .iter()
        .try_fold(1u128, |acc, &extent| acc.checked_mul(u128::from(extent)))
}
