//! Command buffer management.

use crate::error::{GpuError, Result};
use crate::sync::{create_fence, wait_for_fence};
use ash::vk;
use std::time::Duration;

/// Command pool for allocating command buffers.
pub struct CommandPool {
    pool: vk::CommandPool,
    queue_family: u32,
}

impl CommandPool {
    /// Create a new command pool.
    ///
    /// # Safety
    /// The device must be valid and the queue family must exist.
    pub unsafe fn new(
        device: &ash::Device,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(flags);

        // SAFETY: caller guarantees the device and family are valid
        let pool = unsafe { device.create_command_pool(&create_info, None) }
            .map_err(GpuError::creation("command pool"))?;

        Ok(Self { pool, queue_family })
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// Get the queue family index.
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Allocate primary command buffers.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn allocate(&self, device: &ash::Device, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        // SAFETY: caller guarantees the device is valid
        unsafe { device.allocate_command_buffers(&alloc_info) }
            .map_err(GpuError::creation("command buffer"))
    }

    /// Return command buffers to the pool.
    ///
    /// # Safety
    /// The buffers must come from this pool and must not be pending.
    pub unsafe fn free(&self, device: &ash::Device, buffers: &[vk::CommandBuffer]) {
        // SAFETY: caller guarantees the buffers are idle
        unsafe { device.free_command_buffers(self.pool, buffers) };
    }

    /// Destroy the command pool.
    ///
    /// # Safety
    /// The device must be valid and the pool must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        // SAFETY: caller guarantees the pool is idle
        unsafe { device.destroy_command_pool(self.pool, None) };
    }
}

/// Begin recording a command buffer.
///
/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn begin_command_buffer(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    flags: vk::CommandBufferUsageFlags,
) -> Result<()> {
    let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
    // SAFETY: caller guarantees the handles are valid
    unsafe { device.begin_command_buffer(cmd, &begin_info) }?;
    Ok(())
}

/// End recording a command buffer.
///
/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn end_command_buffer(device: &ash::Device, cmd: vk::CommandBuffer) -> Result<()> {
    // SAFETY: caller guarantees the handles are valid
    unsafe { device.end_command_buffer(cmd) }?;
    Ok(())
}

/// Submit command buffers to a queue.
///
/// # Safety
/// All handles must be valid.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn submit_command_buffers(
    device: &ash::Device,
    queue: vk::Queue,
    command_buffers: &[vk::CommandBuffer],
    wait_semaphores: &[vk::Semaphore],
    wait_stages: &[vk::PipelineStageFlags],
    signal_semaphores: &[vk::Semaphore],
    fence: vk::Fence,
) -> Result<()> {
    let submit_info = vk::SubmitInfo::default()
        .command_buffers(command_buffers)
        .wait_semaphores(wait_semaphores)
        .wait_dst_stage_mask(wait_stages)
        .signal_semaphores(signal_semaphores);

    // SAFETY: caller guarantees the handles are valid
    unsafe { device.queue_submit(queue, &[submit_info], fence) }.map_err(GpuError::submit)
}

/// Record a command buffer with `record`, submit it on `queue` and block
/// until a dedicated fence signals.
///
/// The command buffer and fence are released on every path.
///
/// # Safety
/// All handles must be valid and `pool` must belong to `queue`'s family.
pub unsafe fn execute_one_shot<F>(
    device: &ash::Device,
    pool: &CommandPool,
    queue: vk::Queue,
    timeout: Option<Duration>,
    record: F,
) -> Result<()>
where
    F: FnOnce(vk::CommandBuffer),
{
    // SAFETY: caller guarantees the handles are valid
    unsafe {
        let cmd = pool.allocate(device, 1)?[0];
        let fence = match create_fence(device, false) {
            Ok(fence) => fence,
            Err(e) => {
                pool.free(device, &[cmd]);
                return Err(e);
            }
        };

        let result = (|| {
            begin_command_buffer(device, cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
            record(cmd);
            end_command_buffer(device, cmd)?;
            submit_command_buffers(device, queue, &[cmd], &[], &[], &[], fence)?;
            wait_for_fence(device, fence, timeout)
        })();

        // A lost device never signals; the command buffer may still be pending
        if !matches!(result, Err(GpuError::DeviceLost)) {
            pool.free(device, &[cmd]);
        }
        device.destroy_fence(fence, None);

        result
    }
}
