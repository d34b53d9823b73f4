//! Typed GPU buffers.

use crate::context::DeviceContext;
use crate::error::{GpuError, Result};
use crate::memory::{MemoryBlock, MemoryTarget};
use ash::vk;
use bitflags::bitflags;
use bytemuck::Pod;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};

bitflags! {
    /// How a buffer is used and from which queues.
    ///
    /// `GRAPHICS` and `COMPUTE` select the queue families that may access the
    /// buffer; the remaining flags map to Vulkan buffer usage bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const VERTEX = 1;
        const INDEX = 1 << 1;
        const UNIFORM = 1 << 2;
        const STORAGE = 1 << 3;
        const GRAPHICS = 1 << 4;
        const COMPUTE = 1 << 5;
    }
}

impl BufferUsage {
    /// Vulkan usage bits for these flags.
    pub fn vk_usage(self) -> vk::BufferUsageFlags {
        let mut usage = vk::BufferUsageFlags::empty();
        if self.contains(Self::VERTEX) {
            usage |= vk::BufferUsageFlags::VERTEX_BUFFER;
        }
        if self.contains(Self::INDEX) {
            usage |= vk::BufferUsageFlags::INDEX_BUFFER;
        }
        if self.contains(Self::UNIFORM) {
            usage |= vk::BufferUsageFlags::UNIFORM_BUFFER;
        }
        if self.contains(Self::STORAGE) {
            usage |= vk::BufferUsageFlags::STORAGE_BUFFER;
        }
        usage
    }

    /// Distinct queue families that will access the buffer.
    ///
    /// A buffer naming neither queue is used from graphics.
    pub fn queue_families(self, graphics: u32, compute: Option<u32>) -> Result<Vec<u32>> {
        let mut families = Vec::with_capacity(2);
        if self.contains(Self::GRAPHICS) || !self.contains(Self::COMPUTE) {
            families.push(graphics);
        }
        if self.contains(Self::COMPUTE) {
            let compute = compute.ok_or(GpuError::NoComputeQueue)?;
            if !families.contains(&compute) {
                families.push(compute);
            }
        }
        Ok(families)
    }
}

/// Memory properties requested for every buffer.
pub const BUFFER_MEMORY_FLAGS: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
    vk::MemoryPropertyFlags::DEVICE_LOCAL.as_raw() | vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw(),
);

/// A buffer of `count` elements of `T` backed by its own host-visible device
/// memory.
///
/// Must be released with [`GpuBuffer::free`]; dropping a live buffer only logs
/// a warning.
#[derive(Debug)]
pub struct GpuBuffer<T: Pod> {
    buffer: vk::Buffer,
    memory: Option<MemoryBlock>,
    count: usize,
    usage: BufferUsage,
    _marker: PhantomData<T>,
}

impl<T: Pod> GpuBuffer<T> {
    /// Create a buffer of `count` elements and bind fresh memory to it.
    pub fn allocate(ctx: &DeviceContext, usage: BufferUsage, count: usize) -> Result<Self> {
        if count == 0 {
            return Err(GpuError::InvalidState(
                "buffers must hold at least one element".into(),
            ));
        }
        let size = std::mem::size_of::<T>()
            .checked_mul(count)
            .ok_or(GpuError::OutOfDeviceMemory)? as vk::DeviceSize;

        let compute_family = ctx.compute().ok().map(|queue| queue.family);
        let families = usage.queue_families(ctx.graphics_queue_family(), compute_family)?;
        let sharing_mode = if families.len() > 1 {
            vk::SharingMode::CONCURRENT
        } else {
            vk::SharingMode::EXCLUSIVE
        };

        let mut create_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage.vk_usage())
            .sharing_mode(sharing_mode);
        if sharing_mode == vk::SharingMode::CONCURRENT {
            create_info = create_info.queue_family_indices(&families);
        }

        let device = ctx.device();
        // SAFETY: device is valid and create_info is complete
        let buffer = unsafe { device.create_buffer(&create_info, None) }
            .map_err(GpuError::creation("buffer"))?;

        let name = format!("buffer<{}>[{count}]", std::any::type_name::<T>());
        // SAFETY: the buffer was just created on this device and is unbound
        let memory = match unsafe {
            ctx.memory()
                .allocate_and_bind(MemoryTarget::Buffer(buffer), BUFFER_MEMORY_FLAGS, &name)
        } {
            Ok(memory) => memory,
            Err(e) => {
                // SAFETY: the buffer was never used
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        Ok(Self {
            buffer,
            memory: Some(memory),
            count,
            usage,
            _marker: PhantomData,
        })
    }

    /// Allocate a buffer sized for `data` and upload it.
    pub fn allocate_and_fill(ctx: &DeviceContext, usage: BufferUsage, data: &[T]) -> Result<Self> {
        let mut buffer = Self::allocate(ctx, usage, data.len())?;
        if let Err(e) = buffer.upload(ctx, data, 0) {
            // SAFETY: the buffer was never submitted
            unsafe { buffer.free(ctx) };
            return Err(e);
        }
        Ok(buffer)
    }

    /// Raw buffer handle.
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Whether the buffer holds no elements. Always false for a live buffer.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Size of the element data in bytes.
    pub fn size_bytes(&self) -> vk::DeviceSize {
        (self.count * std::mem::size_of::<T>()) as vk::DeviceSize
    }

    /// Usage the buffer was created with.
    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    /// Backing memory, if the buffer has not been freed.
    pub fn memory(&self) -> Option<&MemoryBlock> {
        self.memory.as_ref()
    }

    /// Descriptor covering the whole element range.
    pub fn descriptor_info(&self) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo::default()
            .buffer(self.buffer)
            .offset(0)
            .range(self.size_bytes())
    }

    /// Map the buffer for host access.
    ///
    /// The mapping ends when the returned guard is dropped. The caller must not
    /// touch memory that pending GPU work may access.
    pub fn map<'a>(&'a mut self, ctx: &'a DeviceContext) -> Result<BufferMapping<'a, T>> {
        let memory = self
            .memory
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("buffer was freed".into()))?;
        let device = ctx.device();

        // SAFETY: memory is host visible, owned by this buffer and not mapped;
        // the &mut borrow rules out a second mapping
        let ptr = unsafe {
            device.map_memory(
                memory.handle(),
                0,
                vk::WHOLE_SIZE,
                vk::MemoryMapFlags::empty(),
            )
        }?;

        let coherent = memory.is_host_coherent();
        if !coherent {
            let range = vk::MappedMemoryRange::default()
                .memory(memory.handle())
                .offset(0)
                .size(vk::WHOLE_SIZE);
            // SAFETY: the range is currently mapped
            if let Err(e) = unsafe { device.invalidate_mapped_memory_ranges(&[range]) } {
                // SAFETY: mapped above
                unsafe { device.unmap_memory(memory.handle()) };
                return Err(e.into());
            }
        }

        Ok(BufferMapping {
            device,
            memory: memory.handle(),
            coherent,
            ptr: ptr.cast::<T>(),
            len: self.count,
            _buffer: PhantomData,
        })
    }

    /// Copy `data` into the buffer starting at element `offset`.
    pub fn upload(&mut self, ctx: &DeviceContext, data: &[T], offset: usize) -> Result<()> {
        let end = offset.checked_add(data.len()).unwrap_or(usize::MAX);
        if end > self.count {
            return Err(GpuError::OutOfBounds {
                offset,
                end,
                len: self.count,
            });
        }

        let mut mapping = self.map(ctx)?;
        mapping[offset..end].copy_from_slice(data);
        Ok(())
    }

    /// Copy the buffer contents back to the host.
    pub fn read(&mut self, ctx: &DeviceContext) -> Result<Vec<T>> {
        let mapping = self.map(ctx)?;
        Ok(mapping.to_vec())
    }

    /// Release the memory and then the buffer handle.
    ///
    /// # Safety
    /// No pending GPU work may reference the buffer.
    pub unsafe fn free(mut self, ctx: &DeviceContext) {
        if let Some(memory) = self.memory.take() {
            // SAFETY: caller guarantees the buffer is idle
            unsafe {
                ctx.memory().free(memory);
                ctx.device().destroy_buffer(self.buffer, None);
            }
        }
    }
}

impl<T: Pod> Drop for GpuBuffer<T> {
    fn drop(&mut self) {
        if self.memory.is_some() {
            tracing::warn!(
                "GpuBuffer<{}> with {} elements dropped without free",
                std::any::type_name::<T>(),
                self.count
            );
        }
    }
}

/// Host mapping of a [`GpuBuffer`], unmapped on drop.
///
/// Non-coherent memory is invalidated when the mapping is created and flushed
/// when it is dropped.
pub struct BufferMapping<'a, T: Pod> {
    device: &'a ash::Device,
    memory: vk::DeviceMemory,
    coherent: bool,
    ptr: *mut T,
    len: usize,
    _buffer: PhantomData<&'a mut GpuBuffer<T>>,
}

impl<T: Pod> Deref for BufferMapping<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        // SAFETY: ptr points at len mapped elements that stay mapped for 'a;
        // vkMapMemory returns pointers aligned to at least 64 bytes
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl<T: Pod> DerefMut for BufferMapping<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        // SAFETY: see Deref; the mapping holds the buffer's unique borrow
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl<T: Pod> Drop for BufferMapping<'_, T> {
    fn drop(&mut self) {
        // SAFETY: the memory was mapped when self was created
        unsafe {
            if !self.coherent {
                let range = vk::MappedMemoryRange::default()
                    .memory(self.memory)
                    .offset(0)
                    .size(vk::WHOLE_SIZE);
                if let Err(e) = self.device.flush_mapped_memory_ranges(&[range]) {
                    tracing::error!("Failed to flush mapped buffer memory: {e}");
                }
            }
            self.device.unmap_memory(self.memory);
        }
    }
}
