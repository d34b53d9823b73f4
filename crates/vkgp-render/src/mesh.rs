//! Mesh data and its GPU representation.
//!
//! [`MeshData`] is the ingestion boundary: attribute arrays that are already
//! loaded by the caller and validated here. [`GpuMesh`] holds the uploaded
//! form as three buffers (interleaved vertices, per-vertex colours, indices).

use crate::error::{MeshError, RenderError, Result};
use ash::vk;
use glam::{Vec2, Vec3};
use vkgp_gpu::{BufferUsage, DeviceContext, GpuBuffer};

/// Per-vertex colour, one `vec3` at shader location 3.
pub type Color = [f32; 3];

/// Interleaved vertex as read by the mesh pipeline and the compute kernels.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub uv: [f32; 2],
    pub normal: [f32; 3],
}

impl Vertex {
    /// Create a vertex.
    pub const fn new(position: [f32; 3], uv: [f32; 2], normal: [f32; 3]) -> Self {
        Self {
            position,
            uv,
            normal,
        }
    }

    /// Per-vertex binding description.
    pub fn binding_description(binding: u32) -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding,
            stride: std::mem::size_of::<Self>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }

    /// Position, uv and normal at locations 0, 1 and 2.
    pub fn attribute_descriptions(binding: u32) -> [vk::VertexInputAttributeDescription; 3] {
        [
            vk::VertexInputAttributeDescription {
                location: 0,
                binding,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: std::mem::offset_of!(Self, position) as u32,
            },
            vk::VertexInputAttributeDescription {
                location: 1,
                binding,
                format: vk::Format::R32G32_SFLOAT,
                offset: std::mem::offset_of!(Self, uv) as u32,
            },
            vk::VertexInputAttributeDescription {
                location: 2,
                binding,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: std::mem::offset_of!(Self, normal) as u32,
            },
        ]
    }
}

/// Mesh attributes on the host.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshData {
    pub positions: Vec<Vec3>,
    pub uvs: Vec<Vec2>,
    pub normals: Vec<Vec3>,
    pub indices: Vec<u32>,
}

impl MeshData {
    /// Build and validate a mesh.
    pub fn new(
        positions: Vec<Vec3>,
        uvs: Vec<Vec2>,
        normals: Vec<Vec3>,
        indices: Vec<u32>,
    ) -> std::result::Result<Self, MeshError> {
        let mesh = Self {
            positions,
            uvs,
            normals,
            indices,
        };
        mesh.validate()?;
        Ok(mesh)
    }

    /// Check that attribute arrays line up and indices form in-range
    /// triangles.
    pub fn validate(&self) -> std::result::Result<(), MeshError> {
        let vertex_count = self.positions.len();
        if vertex_count == 0 || self.indices.is_empty() {
            return Err(MeshError::Empty);
        }
        for (attribute, actual) in [("uvs", self.uvs.len()), ("normals", self.normals.len())] {
            if actual != vertex_count {
                return Err(MeshError::AttributeLength {
                    attribute,
                    expected: vertex_count,
                    actual,
                });
            }
        }
        if self.indices.len() % 3 != 0 {
            return Err(MeshError::IndexCount(self.indices.len()));
        }
        if let Some(&index) = self
            .indices
            .iter()
            .find(|&&index| index as usize >= vertex_count)
        {
            return Err(MeshError::IndexOutOfRange {
                index,
                vertex_count,
            });
        }
        Ok(())
    }

    /// Number of vertices.
    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    /// Number of triangles.
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Interleave the attributes.
    pub fn vertices(&self) -> Vec<Vertex> {
        self.positions
            .iter()
            .zip(&self.uvs)
            .zip(&self.normals)
            .map(|((p, uv), n)| Vertex::new(p.to_array(), uv.to_array(), n.to_array()))
            .collect()
    }

    /// Colours taken from the texture coordinates, `(u, v, 0)`.
    pub fn uv_colors(&self) -> Vec<Color> {
        self.uvs.iter().map(|uv| [uv.x, uv.y, 0.0]).collect()
    }

    /// Unit quad in the XY plane facing +Z.
    pub fn quad() -> Self {
        Self {
            positions: vec![
                Vec3::new(-0.5, -0.5, 0.0),
                Vec3::new(0.5, -0.5, 0.0),
                Vec3::new(0.5, 0.5, 0.0),
                Vec3::new(-0.5, 0.5, 0.0),
            ],
            uvs: vec![
                Vec2::new(0.0, 0.0),
                Vec2::new(1.0, 0.0),
                Vec2::new(1.0, 1.0),
                Vec2::new(0.0, 1.0),
            ],
            normals: vec![Vec3::Z; 4],
            indices: vec![0, 1, 2, 0, 2, 3],
        }
    }

    /// Unit square in the XY plane split into `cells` x `cells` quads.
    pub fn grid(cells: u32) -> Self {
        let cells = cells.max(1);
        let side = cells + 1;
        let step = 1.0 / cells as f32;

        let mut mesh = Self::default();
        for y in 0..side {
            for x in 0..side {
                let uv = Vec2::new(x as f32 * step, y as f32 * step);
                mesh.positions.push((uv - Vec2::splat(0.5)).extend(0.0));
                mesh.uvs.push(uv);
                mesh.normals.push(Vec3::Z);
            }
        }

        for y in 0..cells {
            for x in 0..cells {
                let i = y * side + x;
                mesh.indices
                    .extend_from_slice(&[i, i + 1, i + side + 1, i, i + side + 1, i + side]);
            }
        }

        mesh
    }

    /// Sphere of `radius` around the origin with `segments` divisions of
    /// longitude and `rings` of latitude. The seam and pole vertices are
    /// duplicated so texture coordinates stay continuous.
    pub fn sphere(radius: f32, segments: u32, rings: u32) -> Self {
        let segments = segments.max(3);
        let rings = rings.max(2);
        let side = segments + 1;

        let mut mesh = Self::default();
        for ring in 0..=rings {
            let v = ring as f32 / rings as f32;
            let latitude = (v - 0.5) * std::f32::consts::PI;
            for segment in 0..=segments {
                let u = segment as f32 / segments as f32;
                let longitude = u * std::f32::consts::TAU;
                let normal = Vec3::new(
                    latitude.cos() * longitude.cos(),
                    latitude.cos() * longitude.sin(),
                    latitude.sin(),
                );
                mesh.positions.push(normal * radius);
                mesh.uvs.push(Vec2::new(u, v));
                mesh.normals.push(normal);
            }
        }

        for ring in 0..rings {
            for segment in 0..segments {
                let i = ring * side + segment;
                mesh.indices
                    .extend_from_slice(&[i, i + 1, i + side + 1, i, i + side + 1, i + side]);
            }
        }

        mesh
    }
}

/// Mesh buffers on the GPU.
pub struct GpuMesh {
    pub vertices: GpuBuffer<Vertex>,
    pub colors: GpuBuffer<Color>,
    pub indices: GpuBuffer<u32>,
}

impl GpuMesh {
    /// Allocate buffers for `vertex_count` vertices and `triangle_count`
    /// triangles. `vertex_usage` is added to the vertex buffer's usage, e.g.
    /// `STORAGE | COMPUTE` for a kernel that writes the vertices.
    pub fn allocate(
        ctx: &DeviceContext,
        vertex_count: usize,
        triangle_count: usize,
        vertex_usage: BufferUsage,
    ) -> Result<Self> {
        let vertices = GpuBuffer::allocate(
            ctx,
            BufferUsage::VERTEX | BufferUsage::GRAPHICS | vertex_usage,
            vertex_count,
        )?;

        let colors = match GpuBuffer::allocate(
            ctx,
            BufferUsage::VERTEX | BufferUsage::GRAPHICS,
            vertex_count,
        ) {
            Ok(colors) => colors,
            Err(e) => {
                // SAFETY: never used by the GPU
                unsafe { vertices.free(ctx) };
                return Err(e.into());
            }
        };

        let indices = match GpuBuffer::allocate(
            ctx,
            BufferUsage::INDEX | BufferUsage::GRAPHICS,
            triangle_count * 3,
        ) {
            Ok(indices) => indices,
            Err(e) => {
                // SAFETY: never used by the GPU
                unsafe {
                    vertices.free(ctx);
                    colors.free(ctx);
                }
                return Err(e.into());
            }
        };

        Ok(Self {
            vertices,
            colors,
            indices,
        })
    }

    /// Allocate a mesh sized for `data`, upload it and colour it from its
    /// texture coordinates.
    pub fn from_data(ctx: &DeviceContext, data: &MeshData, vertex_usage: BufferUsage) -> Result<Self> {
        data.validate()?;
        let mut mesh = Self::allocate(ctx, data.vertex_count(), data.triangle_count(), vertex_usage)?;
        let filled = mesh
            .upload(ctx, data)
            .and_then(|()| mesh.set_colors(ctx, &data.uv_colors()));
        if let Err(e) = filled {
            // SAFETY: never used by the GPU
            unsafe { mesh.destroy(ctx) };
            return Err(e);
        }
        Ok(mesh)
    }

    /// Upload vertices and indices. Sizes must match the buffers exactly.
    ///
    /// The caller must make sure no frame in flight still reads the mesh.
    pub fn upload(&mut self, ctx: &DeviceContext, data: &MeshData) -> Result<()> {
        data.validate()?;
        if data.vertex_count() != self.vertices.len() || data.indices.len() != self.indices.len() {
            return Err(RenderError::Mesh(MeshError::SizeMismatch {
                vertices: data.vertex_count(),
                indices: data.indices.len(),
                vertex_capacity: self.vertices.len(),
                index_capacity: self.indices.len(),
            }));
        }

        self.vertices.upload(ctx, &data.vertices(), 0)?;
        self.indices.upload(ctx, &data.indices, 0)?;
        Ok(())
    }

    /// Overwrite the per-vertex colours.
    pub fn set_colors(&mut self, ctx: &DeviceContext, colors: &[Color]) -> Result<()> {
        self.colors.upload(ctx, colors, 0)?;
        Ok(())
    }

    /// Number of vertices.
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    /// Number of indices.
    pub fn index_count(&self) -> usize {
        self.indices.len()
    }

    /// Free all three buffers.
    ///
    /// # Safety
    /// No pending GPU work may reference the mesh.
    pub unsafe fn destroy(self, ctx: &DeviceContext) {
        // SAFETY: forwarded from the caller
        unsafe {
            self.vertices.free(ctx);
            self.colors.free(ctx);
            self.indices.free(ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_layout_is_32_bytes() {
        assert_eq!(std::mem::size_of::<Vertex>(), 32);
        let binding = Vertex::binding_description(0);
        assert_eq!(binding.stride, 32);

        let offsets: Vec<_> = Vertex::attribute_descriptions(0)
            .iter()
            .map(|a| (a.location, a.offset))
            .collect();
        assert_eq!(offsets, [(0, 0), (1, 12), (2, 20)]);
    }

    #[test]
    fn quad_is_valid() {
        let quad = MeshData::quad();
        assert_eq!(quad.validate(), Ok(()));
        assert_eq!(quad.vertex_count(), 4);
        assert_eq!(quad.triangle_count(), 2);
        assert_eq!(quad.vertices()[2].position, [0.5, 0.5, 0.0]);
    }

    #[test]
    fn grid_has_expected_topology() {
        let grid = MeshData::grid(4);
        assert_eq!(grid.validate(), Ok(()));
        assert_eq!(grid.vertex_count(), 25);
        assert_eq!(grid.triangle_count(), 32);
        assert_eq!(grid.positions[0], Vec3::new(-0.5, -0.5, 0.0));
        assert_eq!(grid.positions[24], Vec3::new(0.5, 0.5, 0.0));

        assert_eq!(MeshData::grid(0).triangle_count(), 2);
    }

    #[test]
    fn grid_triangles_face_up() {
        let grid = MeshData::grid(3);
        for tri in grid.indices.chunks_exact(3) {
            let [a, b, c] = [0, 1, 2].map(|i| grid.positions[tri[i] as usize]);
            assert!((b - a).cross(c - a).z > 0.0);
        }
    }

    #[test]
    fn sphere_faces_outward() {
        let sphere = MeshData::sphere(2.0, 16, 8);
        assert_eq!(sphere.validate(), Ok(()));
        assert_eq!(sphere.vertex_count(), 17 * 9);
        assert_eq!(sphere.triangle_count(), 16 * 8 * 2);

        for (p, n) in sphere.positions.iter().zip(&sphere.normals) {
            assert!((p.length() - 2.0).abs() < 1e-5);
            assert!((*p / 2.0 - *n).length() < 1e-5);
        }
        for tri in sphere.indices.chunks_exact(3) {
            let [a, b, c] = [0, 1, 2].map(|i| sphere.positions[tri[i] as usize]);
            let normal = (b - a).cross(c - a);
            // Triangles touching a pole collapse to zero area
            if normal.length() > 1e-6 {
                assert!(normal.dot(a + b + c) > 0.0);
            }
        }
    }

    #[test]
    fn mismatched_attributes_are_rejected() {
        let mut mesh = MeshData::quad();
        mesh.normals.pop();
        assert_eq!(
            mesh.validate(),
            Err(MeshError::AttributeLength {
                attribute: "normals",
                expected: 4,
                actual: 3
            })
        );
    }

    #[test]
    fn bad_indices_are_rejected() {
        let mut mesh = MeshData::quad();
        mesh.indices.push(0);
        assert_eq!(mesh.validate(), Err(MeshError::IndexCount(7)));

        let mut mesh = MeshData::quad();
        mesh.indices[4] = 4;
        assert_eq!(
            mesh.validate(),
            Err(MeshError::IndexOutOfRange {
                index: 4,
                vertex_count: 4
            })
        );

        assert_eq!(MeshData::default().validate(), Err(MeshError::Empty));
    }

    #[test]
    fn uv_colors_follow_texture_coordinates() {
        let colors = MeshData::quad().uv_colors();
        assert_eq!(colors[2], [1.0, 1.0, 0.0]);
    }
}
