//! Graphics pipelines.

use crate::error::{GpuError, Result};
use crate::shader::create_shader_module;
use ash::vk;

/// Graphics pipeline configuration.
#[derive(Clone)]
pub struct GraphicsPipelineConfig {
    pub vertex_shader: Vec<u32>,
    pub fragment_shader: Vec<u32>,
    pub vertex_bindings: Vec<vk::VertexInputBindingDescription>,
    pub vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
    pub push_constant_ranges: Vec<vk::PushConstantRange>,
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare: vk::CompareOp,
    /// Render pass the pipeline draws in, at subpass 0.
    pub render_pass: vk::RenderPass,
}

impl Default for GraphicsPipelineConfig {
    fn default() -> Self {
        Self {
            vertex_shader: Vec::new(),
            fragment_shader: Vec::new(),
            vertex_bindings: Vec::new(),
            vertex_attributes: Vec::new(),
            push_constant_ranges: Vec::new(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            depth_test: true,
            depth_write: true,
            depth_compare: vk::CompareOp::LESS,
            render_pass: vk::RenderPass::null(),
        }
    }
}

/// Graphics pipeline wrapper.
pub struct GraphicsPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
}

impl GraphicsPipeline {
    /// Create a pipeline with dynamic viewport and scissor.
    ///
    /// # Safety
    /// The device and render pass must be valid.
    pub unsafe fn new(
        device: &ash::Device,
        config: &GraphicsPipelineConfig,
        descriptor_set_layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Self> {
        if config.render_pass == vk::RenderPass::null() {
            return Err(GpuError::InvalidState(
                "graphics pipeline needs a render pass".into(),
            ));
        }

        // SAFETY: caller guarantees the device is valid
        let vert_module = unsafe { create_shader_module(device, &config.vertex_shader) }?;
        // SAFETY: as above
        let frag_module = match unsafe { create_shader_module(device, &config.fragment_shader) } {
            Ok(module) => module,
            Err(e) => {
                // SAFETY: the module is unused
                unsafe { device.destroy_shader_module(vert_module, None) };
                return Err(e);
            }
        };

        // SAFETY: modules were created on this device
        let result =
            unsafe { Self::create(device, config, descriptor_set_layouts, vert_module, frag_module) };

        // SAFETY: pipeline creation has finished with the modules
        unsafe {
            device.destroy_shader_module(vert_module, None);
            device.destroy_shader_module(frag_module, None);
        }

        result
    }

    unsafe fn create(
        device: &ash::Device,
        config: &GraphicsPipelineConfig,
        descriptor_set_layouts: &[vk::DescriptorSetLayout],
        vert_module: vk::ShaderModule,
        frag_module: vk::ShaderModule,
    ) -> Result<Self> {
        let shader_stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vert_module)
                .name(c"main"),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(frag_module)
                .name(c"main"),
        ];

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&config.vertex_bindings)
            .vertex_attribute_descriptions(&config.vertex_attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(config.topology)
            .primitive_restart_enable(false);

        // Viewport and scissor are dynamic
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(config.polygon_mode)
            .cull_mode(config.cull_mode)
            .front_face(config.front_face)
            .depth_bias_enable(false)
            .line_width(1.0);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1)
            .sample_shading_enable(false);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(config.depth_test)
            .depth_write_enable(config.depth_write)
            .depth_compare_op(config.depth_compare)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        let color_blend_attachment = vk::PipelineColorBlendAttachmentState::default()
            .blend_enable(false)
            .color_write_mask(vk::ColorComponentFlags::RGBA);

        let color_blending = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(std::slice::from_ref(&color_blend_attachment));

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(descriptor_set_layouts)
            .push_constant_ranges(&config.push_constant_ranges);

        // SAFETY: caller guarantees the device is valid
        let layout = unsafe { device.create_pipeline_layout(&layout_info, None) }
            .map_err(GpuError::creation("pipeline layout"))?;

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .render_pass(config.render_pass)
            .subpass(0);

        // SAFETY: every referenced object is alive
        let created = unsafe {
            device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        };

        match created.map(|pipelines| pipelines.into_iter().next()) {
            Ok(Some(pipeline)) => Ok(Self { pipeline, layout }),
            Ok(None) => {
                // SAFETY: the layout is unused
                unsafe { device.destroy_pipeline_layout(layout, None) };
                Err(GpuError::InvalidState("driver returned no pipeline".into()))
            }
            Err((_pipelines, e)) => {
                // SAFETY: the layout is unused
                unsafe { device.destroy_pipeline_layout(layout, None) };
                Err(GpuError::creation("graphics pipeline")(e))
            }
        }
    }

    /// Destroy the pipeline.
    ///
    /// # Safety
    /// The device must be valid and the pipeline must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        // SAFETY: caller guarantees the pipeline is idle
        unsafe {
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.layout, None);
        }
    }
}
