use bytemuck::bytes_of;
use log::trace;
use pollster::block_on;
use wgpu::util::DeviceExt;

use layerdrive_utils::gpu::GpuContext;

use super::GpuTensor;
use crate::{
    backend::{ConvInvocation, KernelParams},
    error::ConvError,
};

const CONV_WGSL: &str = include_str!("conv.wgsl");
const WORKGROUP_X: u32 = 8;
const WORKGROUP_Y: u32 = 8;

/// Compiled convolution kernel plus its bind group layout.
#[derive(Debug)]
pub(super) struct ConvPipeline {
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
}

impl ConvPipeline {
    pub(super) fn new(device: &wgpu::Device) -> Result<Self, ConvError> {
        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("layerdrive_conv_shader"),
            source: wgpu::ShaderSource::Wgsl(CONV_WGSL.into()),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("layerdrive_conv_bgl"),
            entries: &[
                storage_entry(0, true),
                storage_entry(1, true),
                storage_entry(2, true),
                storage_entry(3, false),
                uniform_entry(4),
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("layerdrive_conv_pipeline_layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("layerdrive_conv_pipeline"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: Some("main"),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        });

        if let Some(err) = block_on(device.pop_error_scope()) {
            return Err(ConvError::dispatch(
                "wgpu",
                format!("convolution kernel failed to compile: {err}"),
            ));
        }

        Ok(Self {
            pipeline,
            bind_group_layout,
        })
    }

    /// Record, submit and wait for one convolution.
    pub(super) fn execute(
        &self,
        context: &GpuContext,
        invocation: ConvInvocation<'_, GpuTensor>,
    ) -> Result<(), ConvError> {
        let device = context.device();
        let work = invocation.spec().work_size();
        let groups = [
            work.cols.div_ceil(WORKGROUP_X),
            work.rows.div_ceil(WORKGROUP_Y),
            work.channels,
        ];
        let max_groups = context.limits().max_compute_workgroups_per_dimension;
        if groups.iter().any(|&count| count > max_groups) {
            return Err(ConvError::dispatch(
                "wgpu",
                format!("workgroup grid {groups:?} exceeds the device limit of {max_groups}"),
            ));
        }

        let (operands, output) = invocation.into_parts();

        device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let uniforms = create_uniform_buffer(device, &operands.params);
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("layerdrive_conv_bg"),
            layout: &self.bind_group_layout,
            entries: &[
                tensor_binding(0, operands.input),
                tensor_binding(1, operands.weights),
                tensor_binding(2, operands.bias),
                tensor_binding(3, output),
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: uniforms.as_entire_binding(),
                },
            ],
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("layerdrive_conv_encoder"),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("layerdrive_conv_pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(groups[0], groups[1], groups[2]);
        }
        let submission = context.queue().submit(Some(encoder.finish()));

        let validation = block_on(device.pop_error_scope());
        let out_of_memory = block_on(device.pop_error_scope());
        if let Some(err) = validation.or(out_of_memory) {
            return Err(ConvError::dispatch("wgpu", err.to_string()));
        }

        device
            .poll(wgpu::PollType::Wait {
                submission_index: Some(submission),
                timeout: None,
            })
            .map_err(|err| ConvError::dispatch("wgpu", format!("device poll failed: {err}")))?;
        trace!(
            target: "layerdrive::gpu",
            "conv dispatch {groups:?} workgroups complete"
        );
        Ok(())
    }
}

fn create_uniform_buffer(device: &wgpu::Device, params: &KernelParams) -> wgpu::Buffer {
    device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some("layerdrive_conv_uniforms"),
        contents: bytes_of(params),
        usage: wgpu::BufferUsages::UNIFORM,
    })
}

// Bind only the tensor's own bytes; pooled buffers may be larger.
fn tensor_binding(binding: u32, tensor: &GpuTensor) -> wgpu::BindGroupEntry<'_> {
    wgpu::BindGroupEntry {
        binding,
        resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
            buffer: tensor.buffer(),
            offset: 0,
            size: wgpu::BufferSize::new(tensor.size_bytes()),
        }),
    }
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}
