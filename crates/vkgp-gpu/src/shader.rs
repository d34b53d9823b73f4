//! SPIR-V loading.

use crate::error::{GpuError, Result};
use ash::vk;
use std::path::Path;

/// First word of every SPIR-V module.
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Reinterpret a SPIR-V binary as words.
///
/// The length must be a non-zero multiple of four and the module must start
/// with the SPIR-V magic number in either byte order. Byte-swapped modules
/// are converted to native order.
pub fn parse_spirv(bytes: &[u8]) -> Result<Vec<u32>> {
    if bytes.is_empty() {
        return Err(GpuError::InvalidKernelBinary("empty binary".into()));
    }
    if bytes.len() % 4 != 0 {
        return Err(GpuError::InvalidKernelBinary(format!(
            "length {} is not a multiple of 4",
            bytes.len()
        )));
    }

    let mut words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();

    match words[0] {
        SPIRV_MAGIC => {}
        magic if magic.swap_bytes() == SPIRV_MAGIC => {
            for word in &mut words {
                *word = word.swap_bytes();
            }
        }
        magic => {
            return Err(GpuError::InvalidKernelBinary(format!(
                "bad magic number {magic:#010x}"
            )))
        }
    }

    Ok(words)
}

/// Read and validate a SPIR-V file.
pub fn load_spirv(path: impl AsRef<Path>) -> Result<Vec<u32>> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)?;
    parse_spirv(&bytes).map_err(|e| match e {
        GpuError::InvalidKernelBinary(reason) => {
            GpuError::InvalidKernelBinary(format!("{}: {reason}", path.display()))
        }
        other => other,
    })
}

/// Create a shader module from validated words.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_shader_module(device: &ash::Device, code: &[u32]) -> Result<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::default().code(code);
    // SAFETY: caller guarantees the device is valid
    unsafe { device.create_shader_module(&create_info, None) }.map_err(|e| match e {
        vk::Result::ERROR_INVALID_SHADER_NV => {
            GpuError::InvalidKernelBinary("rejected by the driver".into())
        }
        other => GpuError::creation("shader module")(other),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module_bytes(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_ne_bytes()).collect()
    }

    #[test]
    fn valid_module_parses() {
        let bytes = module_bytes(&[SPIRV_MAGIC, 0x0001_0000, 0, 1, 0]);
        let words = parse_spirv(&bytes).unwrap();
        assert_eq!(words.len(), 5);
        assert_eq!(words[0], SPIRV_MAGIC);
    }

    #[test]
    fn byte_swapped_module_is_normalised() {
        let bytes: Vec<u8> = [SPIRV_MAGIC, 0x0001_0000]
            .iter()
            .flat_map(|w| w.swap_bytes().to_ne_bytes())
            .collect();
        let words = parse_spirv(&bytes).unwrap();
        assert_eq!(words, [SPIRV_MAGIC, 0x0001_0000]);
    }

    #[test]
    fn seven_bytes_are_rejected() {
        let err = parse_spirv(&[0x03, 0x02, 0x23, 0x07, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, GpuError::InvalidKernelBinary(_)));
    }

    #[test]
    fn empty_and_foreign_binaries_are_rejected() {
        assert!(matches!(
            parse_spirv(&[]),
            Err(GpuError::InvalidKernelBinary(_))
        ));
        assert!(matches!(
            parse_spirv(b"\x7fELF\x02\x01\x01\x00"),
            Err(GpuError::InvalidKernelBinary(_))
        ));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = load_spirv("/nonexistent/kernel.spv").unwrap_err();
        assert!(matches!(err, GpuError::Io(_)));
    }
}
