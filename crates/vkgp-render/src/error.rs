//! Rendering error types.

use thiserror::Error;
use vkgp_gpu::GpuError;

/// Mesh data rejected at the ingestion boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MeshError {
    /// The mesh has no vertices or no triangles.
    #[error("Mesh has no vertices or no triangles")]
    Empty,

    /// An attribute array does not have one entry per position.
    #[error("Mesh has {actual} {attribute} but {expected} positions")]
    AttributeLength {
        /// Attribute name.
        attribute: &'static str,
        /// Number of positions.
        expected: usize,
        /// Number of attribute entries.
        actual: usize,
    },

    /// The index count is not a multiple of three.
    #[error("Index count {0} is not a multiple of 3")]
    IndexCount(usize),

    /// An index refers past the last vertex.
    #[error("Index {index} is out of range for {vertex_count} vertices")]
    IndexOutOfRange {
        /// Offending index value.
        index: u32,
        /// Number of vertices.
        vertex_count: usize,
    },

    /// Data does not match the buffer sizes of a mesh.
    #[error("Mesh data with {vertices} vertices and {indices} indices does not match buffers for {vertex_capacity} vertices and {index_capacity} indices")]
    SizeMismatch {
        /// Vertices supplied.
        vertices: usize,
        /// Indices supplied.
        indices: usize,
        /// Vertices the mesh holds.
        vertex_capacity: usize,
        /// Indices the mesh holds.
        index_capacity: usize,
    },
}

/// Rendering errors.
#[derive(Error, Debug)]
pub enum RenderError {
    /// GPU error.
    #[error(transparent)]
    Gpu(#[from] GpuError),

    /// Invalid mesh data.
    #[error(transparent)]
    Mesh(#[from] MeshError),
}

/// Result type for rendering operations.
pub type Result<T> = std::result::Result<T, RenderError>;
