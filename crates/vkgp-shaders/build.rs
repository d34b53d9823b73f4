//! Build script to compile GLSL shaders to SPIR-V.

use shaderc::{Compiler, ShaderKind};
use std::env;
use std::fs;
use std::path::Path;

const SHADERS: [(&str, ShaderKind); 3] = [
    ("mesh.vert", ShaderKind::Vertex),
    ("mesh.frag", ShaderKind::Fragment),
    ("wiggle.comp", ShaderKind::Compute),
];

fn main() {
    let out_dir = env::var("OUT_DIR").unwrap();
    let shader_dir = Path::new("shaders");

    println!("cargo:rerun-if-changed=shaders/");

    let compiler = Compiler::new().expect("Failed to create shader compiler");

    for (name, kind) in SHADERS {
        compile_shader(
            &compiler,
            shader_dir.join(name),
            Path::new(&out_dir).join(format!("{name}.spv")),
            kind,
        );
    }
}

fn compile_shader(
    compiler: &Compiler,
    input: impl AsRef<Path>,
    output: impl AsRef<Path>,
    kind: ShaderKind,
) {
    let input_path = input.as_ref();
    let output_path = output.as_ref();

    let source = fs::read_to_string(input_path)
        .unwrap_or_else(|e| panic!("Failed to read shader {}: {e}", input_path.display()));

    let file_name = input_path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("shader");

    let mut options = shaderc::CompileOptions::new().expect("Failed to create compile options");
    // Devices are created against Vulkan 1.1
    options.set_target_env(
        shaderc::TargetEnv::Vulkan,
        shaderc::EnvVersion::Vulkan1_1 as u32,
    );
    options.set_target_spirv(shaderc::SpirvVersion::V1_3);
    options.set_optimization_level(shaderc::OptimizationLevel::Performance);

    let result = compiler
        .compile_into_spirv(&source, kind, file_name, "main", Some(&options))
        .unwrap_or_else(|e| panic!("Failed to compile shader {}: {e}", input_path.display()));

    if result.get_num_warnings() > 0 {
        println!(
            "cargo:warning=Shader warnings in {}: {}",
            input_path.display(),
            result.get_warning_messages()
        );
    }

    fs::write(
        output_path,
        bytemuck::cast_slice::<u32, u8>(result.as_binary()),
    )
    .unwrap_or_else(|e| panic!("Failed to write shader {}: {e}", output_path.display()));
}
