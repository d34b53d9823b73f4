//! Compute kernels.
//!
//! A kernel is a compute shader together with a descriptor layout derived
//! from its arguments: argument `i` binds at binding `i` of set 0, as a
//! storage buffer or a uniform buffer. [`ComputeKernel`] derives the layout
//! from a tuple of argument types; [`KernelBuilder`] does the same from a
//! list of categories known only at runtime.
//!
//! Invocation is synchronous. Each call allocates a descriptor set, records
//! one dispatch, waits for it on a dedicated fence and frees the set again.

use crate::buffer::{BufferUsage, GpuBuffer};
use crate::command::{execute_one_shot, CommandPool};
use crate::context::DeviceContext;
use crate::descriptors::{
    tally_pool_sizes, write_buffers, BindingCategory, DescriptorPool, DescriptorSetLayoutBuilder,
};
use crate::error::{GpuError, Result};
use crate::shader::{create_shader_module, load_spirv};
use ash::vk;
use bytemuck::Pod;
use std::marker::PhantomData;
use std::path::Path;
use std::time::Duration;

/// Number of workgroups of `local_size` invocations needed to cover `items`.
pub fn group_count(items: u32, local_size: u32) -> u32 {
    items.div_ceil(local_size.max(1))
}

/// Queue and command pool that kernels are dispatched on.
pub struct ComputeContext {
    pool: CommandPool,
    queue: vk::Queue,
    timeout: Option<Duration>,
}

impl ComputeContext {
    /// Create a command pool on the device's compute queue family.
    pub fn new(ctx: &DeviceContext) -> Result<Self> {
        let compute = ctx.compute()?;
        // SAFETY: device is valid and the family exists
        let pool = unsafe {
            CommandPool::new(
                ctx.device(),
                compute.family,
                vk::CommandPoolCreateFlags::TRANSIENT,
            )
        }?;

        tracing::debug!(
            "Compute context on queue family {} ({})",
            compute.family,
            if ctx.has_separate_compute_family() {
                "dedicated"
            } else {
                "shared with graphics"
            }
        );

        Ok(Self {
            pool,
            queue: compute.queue,
            timeout: None,
        })
    }

    /// Bound the wait for each dispatch; an expired wait is reported as a
    /// lost device.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Compute queue.
    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    /// Queue family of the command pool.
    pub fn queue_family(&self) -> u32 {
        self.pool.queue_family()
    }

    /// Destroy the command pool.
    ///
    /// # Safety
    /// No dispatch may be pending.
    pub unsafe fn destroy(self, ctx: &DeviceContext) {
        // SAFETY: caller guarantees the pool is idle
        unsafe { self.pool.destroy(ctx.device()) };
    }
}

/// A value that can be bound as one kernel argument.
pub trait KernelArg {
    /// How the argument is bound.
    const CATEGORY: BindingCategory;

    /// Buffer range the argument binds.
    fn descriptor_info(&self) -> vk::DescriptorBufferInfo;
}

impl<T: Pod> KernelArg for GpuBuffer<T> {
    const CATEGORY: BindingCategory = BindingCategory::StorageBuffer;

    fn descriptor_info(&self) -> vk::DescriptorBufferInfo {
        GpuBuffer::descriptor_info(self)
    }
}

/// A single value bound as a uniform buffer.
pub struct Uniform<T: Pod> {
    buffer: GpuBuffer<T>,
}

impl<T: Pod> Uniform<T> {
    /// Allocate a uniform holding `value`, readable from compute.
    pub fn new(ctx: &DeviceContext, value: &T) -> Result<Self> {
        let buffer = GpuBuffer::allocate_and_fill(
            ctx,
            BufferUsage::UNIFORM | BufferUsage::COMPUTE,
            std::slice::from_ref(value),
        )?;
        Ok(Self { buffer })
    }

    /// Overwrite the value.
    pub fn set(&mut self, ctx: &DeviceContext, value: &T) -> Result<()> {
        self.buffer.upload(ctx, std::slice::from_ref(value), 0)
    }

    /// Underlying buffer.
    pub fn buffer(&self) -> &GpuBuffer<T> {
        &self.buffer
    }

    /// Release the buffer.
    ///
    /// # Safety
    /// No pending dispatch may reference the uniform.
    pub unsafe fn free(self, ctx: &DeviceContext) {
        // SAFETY: forwarded from the caller
        unsafe { self.buffer.free(ctx) };
    }
}

impl<T: Pod> KernelArg for Uniform<T> {
    const CATEGORY: BindingCategory = BindingCategory::UniformBuffer;

    fn descriptor_info(&self) -> vk::DescriptorBufferInfo {
        self.buffer.descriptor_info()
    }
}

/// A tuple of kernel arguments.
pub trait KernelArgs {
    /// Borrowed form of the arguments passed to an invocation.
    type Refs<'a>
    where
        Self: 'a;

    /// Binding category of each argument, in order.
    fn categories() -> Vec<BindingCategory>;

    /// Buffer range of each argument, in order.
    fn descriptor_infos(args: &Self::Refs<'_>) -> Vec<vk::DescriptorBufferInfo>;
}

impl KernelArgs for () {
    type Refs<'a> = ();

    fn categories() -> Vec<BindingCategory> {
        Vec::new()
    }

    fn descriptor_infos(_args: &()) -> Vec<vk::DescriptorBufferInfo> {
        Vec::new()
    }
}

macro_rules! impl_kernel_args {
    ($($arg:ident . $idx:tt),+) => {
        impl<$($arg: KernelArg),+> KernelArgs for ($($arg,)+) {
            type Refs<'a> = ($(&'a $arg,)+) where Self: 'a;

            fn categories() -> Vec<BindingCategory> {
                vec![$($arg::CATEGORY),+]
            }

            fn descriptor_infos(args: &Self::Refs<'_>) -> Vec<vk::DescriptorBufferInfo> {
                vec![$(args.$idx.descriptor_info()),+]
            }
        }
    };
}

impl_kernel_args!(A.0);
impl_kernel_args!(A.0, B.1);
impl_kernel_args!(A.0, B.1, C.2);
impl_kernel_args!(A.0, B.1, C.2, D.3);
impl_kernel_args!(A.0, B.1, C.2, D.3, E.4);
impl_kernel_args!(A.0, B.1, C.2, D.3, E.4, F.5);
impl_kernel_args!(A.0, B.1, C.2, D.3, E.4, F.5, G.6);
impl_kernel_args!(A.0, B.1, C.2, D.3, E.4, F.5, G.6, H.7);

/// Descriptor layout of a kernel: one binding per argument plus the pool
/// capacity a single invocation needs.
#[derive(Debug, Clone)]
pub struct KernelLayout {
    categories: Vec<BindingCategory>,
    pool_sizes: Vec<vk::DescriptorPoolSize>,
}

impl KernelLayout {
    /// Layout for arguments of the given categories.
    pub fn from_categories(categories: Vec<BindingCategory>) -> Self {
        let pool_sizes = tally_pool_sizes(&categories);
        Self {
            categories,
            pool_sizes,
        }
    }

    /// Layout for a tuple of argument types.
    pub fn of<Args: KernelArgs>() -> Self {
        Self::from_categories(Args::categories())
    }

    /// Category of each binding.
    pub fn categories(&self) -> &[BindingCategory] {
        &self.categories
    }

    /// Descriptor counts per type.
    pub fn pool_sizes(&self) -> &[vk::DescriptorPoolSize] {
        &self.pool_sizes
    }

    /// Number of arguments.
    pub fn arg_count(&self) -> usize {
        self.categories.len()
    }
}

/// Builds a [`KernelPipeline`] whose arguments are known at runtime.
#[derive(Debug, Clone, Default)]
pub struct KernelBuilder {
    label: Option<String>,
    categories: Vec<BindingCategory>,
}

impl KernelBuilder {
    /// Start with no arguments.
    pub fn new() -> Self {
        Self::default()
    }

    /// Name used in logs.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Append a storage buffer argument.
    pub fn storage_buffer(self) -> Self {
        self.arg(BindingCategory::StorageBuffer)
    }

    /// Append a uniform buffer argument.
    pub fn uniform_buffer(self) -> Self {
        self.arg(BindingCategory::UniformBuffer)
    }

    /// Append one argument.
    pub fn arg(mut self, category: BindingCategory) -> Self {
        self.categories.push(category);
        self
    }

    /// Append `count` arguments of one category.
    pub fn args(mut self, category: BindingCategory, count: usize) -> Self {
        self.categories
            .extend(std::iter::repeat(category).take(count));
        self
    }

    /// Layout the kernel will use.
    pub fn layout(&self) -> KernelLayout {
        KernelLayout::from_categories(self.categories.clone())
    }

    /// Create the kernel from SPIR-V words.
    pub fn build(self, ctx: &DeviceContext, spirv: &[u32]) -> Result<KernelPipeline> {
        let layout = self.layout();
        let label = self.label.unwrap_or_else(|| "kernel".to_owned());
        KernelPipeline::new(ctx, spirv, layout, label)
    }
}

/// A compute pipeline with its descriptor layout and pool.
pub struct KernelPipeline {
    label: String,
    layout: KernelLayout,
    set_layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
    module: vk::ShaderModule,
    pipeline: vk::Pipeline,
    pool: Option<DescriptorPool>,
}

impl KernelPipeline {
    /// Create the set layout, pipeline layout, shader module, pipeline and
    /// descriptor pool for `layout`.
    pub fn new(
        ctx: &DeviceContext,
        spirv: &[u32],
        layout: KernelLayout,
        label: impl Into<String>,
    ) -> Result<Self> {
        let mut kernel = Self {
            label: label.into(),
            layout,
            set_layout: vk::DescriptorSetLayout::null(),
            pipeline_layout: vk::PipelineLayout::null(),
            module: vk::ShaderModule::null(),
            pipeline: vk::Pipeline::null(),
            pool: None,
        };

        // SAFETY: every handle is created on this device; destroy skips nulls
        if let Err(e) = unsafe { kernel.create_objects(ctx.device(), spirv) } {
            tracing::error!("Failed to create kernel {}: {e}", kernel.label);
            // SAFETY: nothing has been dispatched
            unsafe { kernel.destroy(ctx) };
            return Err(e);
        }

        tracing::debug!(
            "Kernel {} created with {} arguments",
            kernel.label,
            kernel.layout.arg_count()
        );

        Ok(kernel)
    }

    unsafe fn create_objects(&mut self, device: &ash::Device, spirv: &[u32]) -> Result<()> {
        // SAFETY: caller guarantees the device is valid
        unsafe {
            self.set_layout = DescriptorSetLayoutBuilder::new()
                .categories(self.layout.categories(), vk::ShaderStageFlags::COMPUTE)
                .build(device)?;

            let set_layouts = [self.set_layout];
            let layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
            self.pipeline_layout = device
                .create_pipeline_layout(&layout_info, None)
                .map_err(GpuError::creation("pipeline layout"))?;

            self.module = create_shader_module(device, spirv)?;

            let stage_info = vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::COMPUTE)
                .module(self.module)
                .name(c"main");

            let pipeline_info = vk::ComputePipelineCreateInfo::default()
                .stage(stage_info)
                .layout(self.pipeline_layout);

            self.pipeline = device
                .create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
                .map_err(|(_pipelines, e)| GpuError::creation("compute pipeline")(e))?
                .into_iter()
                .next()
                .ok_or_else(|| GpuError::InvalidState("driver returned no pipeline".into()))?;

            if !self.layout.pool_sizes().is_empty() {
                self.pool = Some(DescriptorPool::new(device, 1, self.layout.pool_sizes())?);
            }
        }
        Ok(())
    }

    /// Name used in logs.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Descriptor layout.
    pub fn layout(&self) -> &KernelLayout {
        &self.layout
    }

    /// Raw pipeline handle.
    pub fn pipeline(&self) -> vk::Pipeline {
        self.pipeline
    }

    /// Bind `buffers` to bindings `0..n`, dispatch `groups` workgroups and
    /// block until the dispatch finishes.
    ///
    /// Shader writes are made visible to host reads and vertex fetches.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all, fields(kernel = %self.label))
    )]
    pub fn invoke_raw(
        &self,
        ctx: &DeviceContext,
        compute: &ComputeContext,
        buffers: &[vk::DescriptorBufferInfo],
        groups: [u32; 3],
    ) -> Result<()> {
        if buffers.len() != self.layout.arg_count() {
            return Err(GpuError::InvalidState(format!(
                "kernel {} takes {} arguments, got {}",
                self.label,
                self.layout.arg_count(),
                buffers.len()
            )));
        }

        let limits = ctx.capabilities().max_compute_workgroup_count;
        if groups.iter().zip(limits).any(|(&count, limit)| count > limit) {
            return Err(GpuError::InvalidState(format!(
                "kernel {}: {groups:?} workgroups exceed the device limit {limits:?}",
                self.label
            )));
        }

        let device = ctx.device();

        let set = match &self.pool {
            Some(pool) => {
                // SAFETY: the pool and layout belong to this device
                let set = unsafe { pool.allocate(device, &[self.set_layout]) }?
                    .into_iter()
                    .next()
                    .ok_or_else(|| GpuError::InvalidState("no descriptor set allocated".into()))?;
                // SAFETY: the set is fresh and the buffers are live
                unsafe { write_buffers(device, set, self.layout.categories(), buffers) };
                Some(set)
            }
            None => None,
        };

        // SAFETY: the pool belongs to the compute queue's family
        let result = unsafe {
            execute_one_shot(device, &compute.pool, compute.queue, compute.timeout, |cmd| {
                self.record(device, cmd, set, groups);
            })
        };

        if let (Some(pool), Some(set)) = (&self.pool, set) {
            // A lost device may still reference the set
            if !matches!(result, Err(GpuError::DeviceLost)) {
                // SAFETY: the dispatch completed
                if let Err(e) = unsafe { pool.free(device, &[set]) } {
                    tracing::warn!("Failed to free descriptor set of kernel {}: {e}", self.label);
                }
            }
        }

        result
    }

    fn record(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        set: Option<vk::DescriptorSet>,
        groups: [u32; 3],
    ) {
        let barrier = vk::MemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::SHADER_WRITE)
            .dst_access_mask(
                vk::AccessFlags::HOST_READ
                    | vk::AccessFlags::VERTEX_ATTRIBUTE_READ
                    | vk::AccessFlags::SHADER_READ,
            );

        // SAFETY: cmd is recording and every handle belongs to this device
        unsafe {
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, self.pipeline);
            if let Some(set) = set {
                device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::COMPUTE,
                    self.pipeline_layout,
                    0,
                    &[set],
                    &[],
                );
            }
            device.cmd_dispatch(cmd, groups[0], groups[1], groups[2]);
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::PipelineStageFlags::HOST
                    | vk::PipelineStageFlags::VERTEX_INPUT
                    | vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            );
        }
    }

    /// Destroy the pool, pipeline, pipeline layout, set layout and shader
    /// module, in that order.
    ///
    /// # Safety
    /// No dispatch may be pending.
    pub unsafe fn destroy(mut self, ctx: &DeviceContext) {
        let device = ctx.device();
        // SAFETY: caller guarantees the kernel is idle; null handles are ignored
        unsafe {
            if let Some(pool) = self.pool.take() {
                pool.destroy(device);
            }
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.pipeline_layout, None);
            device.destroy_descriptor_set_layout(self.set_layout, None);
            device.destroy_shader_module(self.module, None);
        }
    }
}

/// A kernel whose arguments are the tuple `Args`.
///
/// ```ignore
/// let kernel = ComputeKernel::<(GpuBuffer<f32>, Uniform<Params>)>::from_file(&ctx, "scale.spv")?;
/// kernel.invoke(&ctx, &compute, (&values, &params), [group_count(n, 64), 1, 1])?;
/// ```
pub struct ComputeKernel<Args: KernelArgs> {
    pipeline: KernelPipeline,
    _args: PhantomData<fn(&Args)>,
}

impl<Args: KernelArgs> ComputeKernel<Args> {
    /// Create the kernel from SPIR-V words.
    pub fn create(ctx: &DeviceContext, spirv: &[u32]) -> Result<Self> {
        let label = std::any::type_name::<Args>();
        Ok(Self {
            pipeline: KernelPipeline::new(ctx, spirv, KernelLayout::of::<Args>(), label)?,
            _args: PhantomData,
        })
    }

    /// Load a SPIR-V file and create the kernel from it.
    pub fn from_file(ctx: &DeviceContext, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let spirv = load_spirv(path)?;
        let mut kernel = Self::create(ctx, &spirv)?;
        kernel.pipeline.label = path.display().to_string();
        Ok(kernel)
    }

    /// Run the kernel over `groups` workgroups and wait for it to finish.
    pub fn invoke(
        &self,
        ctx: &DeviceContext,
        compute: &ComputeContext,
        args: Args::Refs<'_>,
        groups: [u32; 3],
    ) -> Result<()> {
        let buffers = Args::descriptor_infos(&args);
        self.pipeline.invoke_raw(ctx, compute, &buffers, groups)
    }

    /// Descriptor layout.
    pub fn layout(&self) -> &KernelLayout {
        self.pipeline.layout()
    }

    /// Untyped pipeline.
    pub fn pipeline(&self) -> &KernelPipeline {
        &self.pipeline
    }

    /// Destroy the kernel's objects.
    ///
    /// # Safety
    /// No dispatch may be pending.
    pub unsafe fn destroy(self, ctx: &DeviceContext) {
        // SAFETY: forwarded from the caller
        unsafe { self.pipeline.destroy(ctx) };
    }
}
