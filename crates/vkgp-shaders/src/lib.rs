//! GLSL shaders for vkgp.
//!
//! The sources under `shaders/` are compiled to SPIR-V by the build script
//! and embedded here. Accessors return word slices ready for
//! `vkCreateShaderModule`.

use std::sync::OnceLock;

/// Workgroup size of the wiggle kernel.
pub const WIGGLE_LOCAL_SIZE: u32 = 32;

/// Embedded SPIR-V bytecode (raw bytes, may not be aligned).
mod spirv_bytes {
    pub static MESH_VERT: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/mesh.vert.spv"));
    pub static MESH_FRAG: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/mesh.frag.spv"));
    pub static WIGGLE_COMP: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/wiggle.comp.spv"));
}

/// Copy bytecode into aligned words. Compiler output is always a whole
/// number of words.
fn bytes_to_spirv(bytes: &[u8]) -> Vec<u32> {
    debug_assert!(bytes.len() % 4 == 0, "SPIR-V bytecode must be whole words");
    bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

static MESH_VERT_SPIRV: OnceLock<Vec<u32>> = OnceLock::new();
static MESH_FRAG_SPIRV: OnceLock<Vec<u32>> = OnceLock::new();
static WIGGLE_COMP_SPIRV: OnceLock<Vec<u32>> = OnceLock::new();

/// Mesh vertex shader.
pub fn mesh_vertex_shader() -> &'static [u32] {
    MESH_VERT_SPIRV.get_or_init(|| bytes_to_spirv(spirv_bytes::MESH_VERT))
}

/// Mesh fragment shader.
pub fn mesh_fragment_shader() -> &'static [u32] {
    MESH_FRAG_SPIRV.get_or_init(|| bytes_to_spirv(spirv_bytes::MESH_FRAG))
}

/// Vertex displacement kernel: base vertices, output vertices, time.
pub fn wiggle_kernel() -> &'static [u32] {
    WIGGLE_COMP_SPIRV.get_or_init(|| bytes_to_spirv(spirv_bytes::WIGGLE_COMP))
}

/// Raw bytes of the wiggle kernel, as they would be read from a file.
pub fn wiggle_kernel_bytes() -> &'static [u8] {
    spirv_bytes::WIGGLE_COMP
}
