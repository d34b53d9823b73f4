//! Device memory selection and allocation.
//!
//! Every buffer and image owns exactly one `vk::DeviceMemory` block, bound at
//! offset zero. There is no sub-allocation.

use crate::error::{GpuError, Result};
use ash::vk;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Find the first memory type accepted by `type_bits` whose property flags
/// contain `required`.
///
/// Returns `None` when no type matches, including when `type_bits` is zero.
pub fn find_memory_type(
    properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Option<u32> {
    properties
        .memory_types
        .iter()
        .take(properties.memory_type_count as usize)
        .enumerate()
        .find(|(index, memory_type)| {
            type_bits & (1 << index) != 0 && memory_type.property_flags.contains(required)
        })
        .map(|(index, _)| index as u32)
}

/// Resource that memory is bound to.
#[derive(Debug, Clone, Copy)]
pub enum MemoryTarget {
    Buffer(vk::Buffer),
    Image(vk::Image),
}

/// A single device memory allocation owned by one resource.
#[derive(Debug)]
pub struct MemoryBlock {
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    type_index: u32,
    flags: vk::MemoryPropertyFlags,
}

impl MemoryBlock {
    /// Raw memory handle.
    pub fn handle(&self) -> vk::DeviceMemory {
        self.memory
    }

    /// Allocated size in bytes.
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Index into the device memory type table.
    pub fn type_index(&self) -> u32 {
        self.type_index
    }

    /// Property flags of the chosen memory type.
    pub fn flags(&self) -> vk::MemoryPropertyFlags {
        self.flags
    }

    /// Whether host writes are visible without explicit flushes.
    pub fn is_host_coherent(&self) -> bool {
        self.flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT)
    }
}

#[derive(Debug)]
struct AllocationRecord {
    name: String,
    size: vk::DeviceSize,
    type_index: u32,
}

/// Allocates one memory block per resource and tracks the live ones.
pub struct MemoryAllocator {
    device: Arc<ash::Device>,
    properties: vk::PhysicalDeviceMemoryProperties,
    live: Mutex<HashMap<vk::DeviceMemory, AllocationRecord>>,
}

impl MemoryAllocator {
    pub(crate) fn new(device: Arc<ash::Device>, properties: vk::PhysicalDeviceMemoryProperties) -> Self {
        for (index, memory_type) in properties
            .memory_types
            .iter()
            .take(properties.memory_type_count as usize)
            .enumerate()
        {
            tracing::debug!(
                "Memory type {index}: heap {} {:?}",
                memory_type.heap_index,
                memory_type.property_flags
            );
        }

        Self {
            device,
            properties,
            live: Mutex::new(HashMap::new()),
        }
    }

    /// Snapshot of the device memory properties.
    pub fn properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.properties
    }

    /// Find a memory type on this device. See [`find_memory_type`].
    pub fn find_memory_type(&self, type_bits: u32, required: vk::MemoryPropertyFlags) -> Option<u32> {
        find_memory_type(&self.properties, type_bits, required)
    }

    /// Allocate memory for `target` with the requested properties and bind it
    /// at offset zero.
    ///
    /// # Safety
    /// `target` must be a valid, unbound resource created on this device.
    pub unsafe fn allocate_and_bind(
        &self,
        target: MemoryTarget,
        flags: vk::MemoryPropertyFlags,
        name: &str,
    ) -> Result<MemoryBlock> {
        // SAFETY: caller guarantees the target belongs to this device
        let requirements = unsafe {
            match target {
                MemoryTarget::Buffer(buffer) => self.device.get_buffer_memory_requirements(buffer),
                MemoryTarget::Image(image) => self.device.get_image_memory_requirements(image),
            }
        };

        let type_index = self
            .find_memory_type(requirements.memory_type_bits, flags)
            .ok_or(GpuError::NoSuitableMemoryType {
                type_bits: requirements.memory_type_bits,
                flags,
            })?;

        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(type_index);

        // SAFETY: device is valid and the allocate info is fully initialized
        let memory = unsafe { self.device.allocate_memory(&alloc_info, None) }
            .map_err(GpuError::creation("device memory"))?;

        // SAFETY: memory was allocated with the size and type the target requires
        let bound = unsafe {
            match target {
                MemoryTarget::Buffer(buffer) => self.device.bind_buffer_memory(buffer, memory, 0),
                MemoryTarget::Image(image) => self.device.bind_image_memory(image, memory, 0),
            }
        };
        if let Err(e) = bound {
            // SAFETY: memory is not bound to anything
            unsafe { self.device.free_memory(memory, None) };
            return Err(GpuError::creation("memory binding")(e));
        }

        self.live.lock().insert(
            memory,
            AllocationRecord {
                name: name.to_string(),
                size: requirements.size,
                type_index,
            },
        );

        tracing::trace!(
            "Allocated {} bytes for {name} from memory type {type_index}",
            requirements.size
        );

        Ok(MemoryBlock {
            memory,
            size: requirements.size,
            type_index,
            flags: self.properties.memory_types[type_index as usize].property_flags,
        })
    }

    /// Release a memory block.
    ///
    /// # Safety
    /// The block must not be mapped or in use by pending GPU work.
    pub unsafe fn free(&self, block: MemoryBlock) {
        self.live.lock().remove(&block.memory);
        // SAFETY: caller guarantees the block is idle
        unsafe { self.device.free_memory(block.memory, None) };
    }

    /// Number of blocks that have not been freed yet.
    pub fn live_allocations(&self) -> usize {
        self.live.lock().len()
    }

    /// Total bytes held by live blocks.
    pub fn live_bytes(&self) -> vk::DeviceSize {
        self.live.lock().values().map(|record| record.size).sum()
    }

    /// Log and release every block still alive.
    ///
    /// # Safety
    /// The device must be idle.
    pub(crate) unsafe fn release_leaked(&self) {
        let leaked: Vec<_> = self.live.lock().drain().collect();
        if !leaked.is_empty() {
            tracing::warn!(
                "{} allocations leaked; the buffer and image handles bound to them are not destroyed",
                leaked.len()
            );
        }
        for (memory, record) in leaked {
            tracing::warn!(
                "Leaked allocation '{}' ({} bytes, memory type {})",
                record.name,
                record.size,
                record.type_index
            );
            // SAFETY: caller guarantees the device is idle
            unsafe { self.device.free_memory(memory, None) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn properties(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (slot, flags) in props.memory_types.iter_mut().zip(types) {
            slot.property_flags = *flags;
        }
        props
    }

    fn desktop_like() -> vk::PhysicalDeviceMemoryProperties {
        properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT
                | vk::MemoryPropertyFlags::HOST_CACHED,
            vk::MemoryPropertyFlags::DEVICE_LOCAL
                | vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
        ])
    }

    #[test]
    fn empty_bitmask_finds_nothing() {
        let props = desktop_like();
        assert_eq!(
            find_memory_type(&props, 0, vk::MemoryPropertyFlags::empty()),
            None
        );
        assert_eq!(
            find_memory_type(&props, 0, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            None
        );
    }

    #[test]
    fn first_matching_type_wins() {
        let props = desktop_like();
        assert_eq!(
            find_memory_type(&props, u32::MAX, vk::MemoryPropertyFlags::HOST_VISIBLE),
            Some(1)
        );
        assert_eq!(
            find_memory_type(
                &props,
                u32::MAX,
                vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE
            ),
            Some(3)
        );
    }

    #[test]
    fn bitmask_excludes_types() {
        let props = desktop_like();
        assert_eq!(
            find_memory_type(&props, 0b0100, vk::MemoryPropertyFlags::HOST_VISIBLE),
            Some(2)
        );
        assert_eq!(
            find_memory_type(&props, 0b0001, vk::MemoryPropertyFlags::HOST_VISIBLE),
            None
        );
    }

    #[test]
    fn types_past_count_are_ignored() {
        let mut props = desktop_like();
        props.memory_types[5].property_flags = vk::MemoryPropertyFlags::LAZILY_ALLOCATED;
        assert_eq!(
            find_memory_type(&props, u32::MAX, vk::MemoryPropertyFlags::LAZILY_ALLOCATED),
            None
        );
    }

    #[test]
    fn every_result_satisfies_mask_and_flags() {
        let props = desktop_like();
        let candidates = [
            vk::MemoryPropertyFlags::empty(),
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::HOST_CACHED,
            vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::PROTECTED,
        ];

        for bits in 0..32u32 {
            for required in candidates {
                match find_memory_type(&props, bits, required) {
                    Some(index) => {
                        assert_ne!(bits & (1 << index), 0);
                        assert!(props.memory_types[index as usize]
                            .property_flags
                            .contains(required));
                    }
                    None => {
                        let any = (0..props.memory_type_count).any(|i| {
                            bits & (1 << i) != 0
                                && props.memory_types[i as usize]
                                    .property_flags
                                    .contains(required)
                        });
                        assert!(!any, "missed a match for bits {bits:#b} {required:?}");
                    }
                }
            }
        }
    }
}
