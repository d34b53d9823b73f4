//! Mesh drawing.

use crate::error::Result;
use crate::mesh::{Color, GpuMesh, Vertex};
use ash::vk;
use glam::Mat4;
use vkgp_gpu::{DeviceContext, Frame, GpuBuffer, GraphicsPipeline, GraphicsPipelineConfig};

/// Vertex stage push constants.
#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct PushMatrices {
    pub mvp: [[f32; 4]; 4],
    pub model_view: [[f32; 4]; 4],
}

impl PushMatrices {
    /// Matrices for an object placed by `transform`.
    pub fn new(view: Mat4, projection: Mat4, transform: Mat4) -> Self {
        let model_view = view * transform;
        Self {
            mvp: (projection * model_view).to_cols_array_2d(),
            model_view: model_view.to_cols_array_2d(),
        }
    }
}

/// A mesh placed in the world.
#[derive(Clone, Copy)]
pub struct Model<'a> {
    pub mesh: &'a GpuMesh,
    pub transform: Mat4,
}

impl<'a> Model<'a> {
    /// Place `mesh` with `transform`.
    pub fn new(mesh: &'a GpuMesh, transform: Mat4) -> Self {
        Self { mesh, transform }
    }
}

/// Draws [`GpuMesh`]es inside the frame render pass.
pub struct MeshRenderer {
    pipeline: GraphicsPipeline,
}

impl MeshRenderer {
    /// Build the mesh pipeline for `render_pass`.
    pub fn new(ctx: &DeviceContext, render_pass: vk::RenderPass) -> Result<Self> {
        let config = pipeline_config(render_pass);
        // SAFETY: device and render pass are valid
        let pipeline = unsafe { GraphicsPipeline::new(ctx.device(), &config, &[]) }?;
        tracing::debug!("Mesh pipeline created");
        Ok(Self { pipeline })
    }

    /// Record an indexed draw of `mesh`.
    pub fn draw_mesh(
        &self,
        ctx: &DeviceContext,
        frame: &Frame,
        mesh: &GpuMesh,
        matrices: &PushMatrices,
    ) {
        self.draw_with_vertices(ctx, frame, mesh, &mesh.vertices, matrices);
    }

    /// Record an indexed draw of `mesh` with its positions, texture
    /// coordinates and normals read from `vertices` instead, e.g. the output
    /// of a deformation kernel.
    pub fn draw_with_vertices(
        &self,
        ctx: &DeviceContext,
        frame: &Frame,
        mesh: &GpuMesh,
        vertices: &GpuBuffer<Vertex>,
        matrices: &PushMatrices,
    ) {
        let device = ctx.device();
        let cmd = frame.command_buffer;
        let index_count = u32::try_from(mesh.index_count()).unwrap_or(u32::MAX);

        if vertices.len() < mesh.vertex_count() {
            tracing::warn!(
                "Skipping draw: {} vertices bound for a mesh of {}",
                vertices.len(),
                mesh.vertex_count()
            );
            return;
        }

        // SAFETY: frame's command buffer is recording inside the render pass
        // and the borrowed buffers outlive the recording call
        unsafe {
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline.pipeline);
            device.cmd_push_constants(
                cmd,
                self.pipeline.layout,
                vk::ShaderStageFlags::VERTEX,
                0,
                bytemuck::bytes_of(matrices),
            );
            device.cmd_bind_vertex_buffers(
                cmd,
                0,
                &[vertices.handle(), mesh.colors.handle()],
                &[0, 0],
            );
            device.cmd_bind_index_buffer(cmd, mesh.indices.handle(), 0, vk::IndexType::UINT32);
            device.cmd_draw_indexed(cmd, index_count, 1, 0, 0, 0);
        }
    }

    /// Draw `model` seen through `view` and `projection`.
    pub fn draw_model(
        &self,
        ctx: &DeviceContext,
        frame: &Frame,
        view: Mat4,
        projection: Mat4,
        model: &Model<'_>,
    ) {
        let matrices = PushMatrices::new(view, projection, model.transform);
        self.draw_mesh(ctx, frame, model.mesh, &matrices);
    }

    /// Destroy the pipeline.
    ///
    /// # Safety
    /// No frame in flight may use the pipeline.
    pub unsafe fn destroy(self, ctx: &DeviceContext) {
        // SAFETY: forwarded from the caller
        unsafe { self.pipeline.destroy(ctx.device()) };
    }
}

fn pipeline_config(render_pass: vk::RenderPass) -> GraphicsPipelineConfig {
    let mut vertex_attributes = Vertex::attribute_descriptions(0).to_vec();
    vertex_attributes.push(vk::VertexInputAttributeDescription {
        location: 3,
        binding: 1,
        format: vk::Format::R32G32B32_SFLOAT,
        offset: 0,
    });

    GraphicsPipelineConfig {
        vertex_shader: vkgp_shaders::mesh_vertex_shader().to_vec(),
        fragment_shader: vkgp_shaders::mesh_fragment_shader().to_vec(),
        vertex_bindings: vec![
            Vertex::binding_description(0),
            vk::VertexInputBindingDescription {
                binding: 1,
                stride: std::mem::size_of::<Color>() as u32,
                input_rate: vk::VertexInputRate::VERTEX,
            },
        ],
        vertex_attributes,
        push_constant_ranges: vec![vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::VERTEX,
            offset: 0,
            size: std::mem::size_of::<PushMatrices>() as u32,
        }],
        render_pass,
        ..GraphicsPipelineConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn push_constants_fit_minimum_limit() {
        // 128 bytes is the smallest maxPushConstantsSize a device may report
        assert_eq!(std::mem::size_of::<PushMatrices>(), 128);
    }

    #[test]
    fn matrices_compose_view_then_projection() {
        let view = Mat4::look_at_rh(Vec3::new(0.0, 3.0, 0.0), Vec3::ZERO, Vec3::Z);
        let projection = Mat4::perspective_rh(1.0, 1.5, 0.1, 10.0);
        let transform = Mat4::from_translation(Vec3::new(1.0, 0.0, 0.0));

        let m = PushMatrices::new(view, projection, transform);
        assert_eq!(m.model_view, (view * transform).to_cols_array_2d());
        assert_eq!(m.mvp, (projection * (view * transform)).to_cols_array_2d());
    }

    #[test]
    fn pipeline_reads_vertices_and_colors() {
        let config = pipeline_config(vk::RenderPass::null());
        assert_eq!(config.vertex_bindings.len(), 2);
        assert_eq!(config.vertex_bindings[1].stride, 12);
        let locations: Vec<_> = config
            .vertex_attributes
            .iter()
            .map(|a| (a.location, a.binding))
            .collect();
        assert_eq!(locations, [(0, 0), (1, 0), (2, 0), (3, 1)]);
        assert_eq!(config.cull_mode, vk::CullModeFlags::BACK);
        assert_eq!(config.depth_compare, vk::CompareOp::LESS);
    }
}
