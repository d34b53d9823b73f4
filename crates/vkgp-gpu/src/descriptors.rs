//! Descriptor set management.

use crate::error::{GpuError, Result};
use ash::vk;

/// Kind of resource a kernel argument binds as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingCategory {
    /// Read-write shader storage buffer.
    StorageBuffer,
    /// Read-only uniform buffer.
    UniformBuffer,
}

impl BindingCategory {
    /// Vulkan descriptor type for this category.
    pub fn descriptor_type(self) -> vk::DescriptorType {
        match self {
            Self::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
            Self::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        }
    }
}

/// Count descriptors per category, in order of first appearance.
pub fn tally_pool_sizes(categories: &[BindingCategory]) -> Vec<vk::DescriptorPoolSize> {
    let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
    for category in categories {
        let ty = category.descriptor_type();
        match sizes.iter_mut().find(|size| size.ty == ty) {
            Some(size) => size.descriptor_count += 1,
            None => sizes.push(vk::DescriptorPoolSize {
                ty,
                descriptor_count: 1,
            }),
        }
    }
    sizes
}

/// Descriptor set layout builder.
#[derive(Default)]
pub struct DescriptorSetLayoutBuilder<'a> {
    bindings: Vec<vk::DescriptorSetLayoutBinding<'a>>,
}

impl<'a> DescriptorSetLayoutBuilder<'a> {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a binding.
    pub fn binding(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        count: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(descriptor_type)
                .descriptor_count(count)
                .stage_flags(stage_flags),
        );
        self
    }

    /// Add one binding per category, numbered from 0 in order.
    pub fn categories(self, categories: &[BindingCategory], stage_flags: vk::ShaderStageFlags) -> Self {
        categories
            .iter()
            .zip(0u32..)
            .fold(self, |builder, (category, binding)| {
                builder.binding(binding, category.descriptor_type(), 1, stage_flags)
            })
    }

    /// Bindings added so far.
    pub fn bindings(&self) -> &[vk::DescriptorSetLayoutBinding<'a>] {
        &self.bindings
    }

    /// Build the descriptor set layout.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn build(&self, device: &ash::Device) -> Result<vk::DescriptorSetLayout> {
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&self.bindings);

        // SAFETY: caller guarantees the device is valid
        unsafe { device.create_descriptor_set_layout(&layout_info, None) }
            .map_err(GpuError::creation("descriptor set layout"))
    }
}

/// Descriptor pool whose sets can be freed individually.
pub struct DescriptorPool {
    pool: vk::DescriptorPool,
}

impl DescriptorPool {
    /// Create a new descriptor pool.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(
        device: &ash::Device,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<Self> {
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes)
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET);

        // SAFETY: caller guarantees the device is valid
        let pool = unsafe { device.create_descriptor_pool(&create_info, None) }
            .map_err(GpuError::creation("descriptor pool"))?;
        Ok(Self { pool })
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }

    /// Allocate one set per layout.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn allocate(
        &self,
        device: &ash::Device,
        layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Vec<vk::DescriptorSet>> {
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(layouts);

        // SAFETY: caller guarantees the device is valid
        unsafe { device.allocate_descriptor_sets(&alloc_info) }
            .map_err(GpuError::creation("descriptor set"))
    }

    /// Return sets to the pool.
    ///
    /// # Safety
    /// The sets must come from this pool and must not be in use.
    pub unsafe fn free(&self, device: &ash::Device, sets: &[vk::DescriptorSet]) -> Result<()> {
        // SAFETY: caller guarantees the sets are idle
        unsafe { device.free_descriptor_sets(self.pool, sets) }?;
        Ok(())
    }

    /// Destroy the pool.
    ///
    /// # Safety
    /// The device must be valid and the pool must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        // SAFETY: caller guarantees the pool is idle
        unsafe { device.destroy_descriptor_pool(self.pool, None) };
    }
}

/// Point consecutive bindings of `set`, starting at 0, at `buffers`.
///
/// # Safety
/// Device, set and buffers must be valid, and the set must not be in use.
pub unsafe fn write_buffers(
    device: &ash::Device,
    set: vk::DescriptorSet,
    categories: &[BindingCategory],
    buffers: &[vk::DescriptorBufferInfo],
) {
    let writes: Vec<_> = categories
        .iter()
        .zip(buffers)
        .zip(0u32..)
        .map(|((category, info), binding)| {
            vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(binding)
                .descriptor_type(category.descriptor_type())
                .buffer_info(std::slice::from_ref(info))
        })
        .collect();

    // SAFETY: caller guarantees the handles are valid
    unsafe { device.update_descriptor_sets(&writes, &[]) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_map_to_descriptor_types() {
        assert_eq!(
            BindingCategory::StorageBuffer.descriptor_type(),
            vk::DescriptorType::STORAGE_BUFFER
        );
        assert_eq!(
            BindingCategory::UniformBuffer.descriptor_type(),
            vk::DescriptorType::UNIFORM_BUFFER
        );
    }

    #[test]
    fn pool_sizes_count_each_category() {
        use BindingCategory::{StorageBuffer, UniformBuffer};

        let sizes = tally_pool_sizes(&[StorageBuffer, UniformBuffer, StorageBuffer]);
        assert_eq!(sizes.len(), 2);
        assert_eq!(sizes[0].ty, vk::DescriptorType::STORAGE_BUFFER);
        assert_eq!(sizes[0].descriptor_count, 2);
        assert_eq!(sizes[1].ty, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(sizes[1].descriptor_count, 1);

        let total: u32 = sizes.iter().map(|size| size.descriptor_count).sum();
        assert_eq!(total, 3);
        assert!(tally_pool_sizes(&[]).is_empty());
    }

    #[test]
    fn layout_bindings_follow_argument_order() {
        use BindingCategory::{StorageBuffer, UniformBuffer};

        let builder = DescriptorSetLayoutBuilder::new().categories(
            &[UniformBuffer, StorageBuffer, StorageBuffer],
            vk::ShaderStageFlags::COMPUTE,
        );
        let bindings = builder.bindings();
        assert_eq!(bindings.len(), 3);
        for (i, binding) in bindings.iter().enumerate() {
            assert_eq!(binding.binding, i as u32);
            assert_eq!(binding.descriptor_count, 1);
            assert_eq!(binding.stage_flags, vk::ShaderStageFlags::COMPUTE);
        }
        assert_eq!(bindings[0].descriptor_type, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(bindings[2].descriptor_type, vk::DescriptorType::STORAGE_BUFFER);
    }
}
