//! Tests against a real device. Each returns early when none is available.

use approx::assert_relative_eq;
use vkgp_gpu::{
    group_count, vk, BufferUsage, ComputeKernel, FrameConfig, FrameScheduler, GpuBuffer, GpuError,
    KernelArg, KernelArgs, KernelBuilder, KernelLayout, Uniform,
};
use vkgp_render::{MeshData, RenderError, Vertex, Wiggle};
use vkgp_test::{wiggle_reference, HeadlessGpu};

type WiggleArgs = (GpuBuffer<Vertex>, GpuBuffer<Vertex>, GpuBuffer<f32>);

#[test]
fn buffer_contents_survive_round_trip() {
    let Some(gpu) = HeadlessGpu::try_new() else {
        return;
    };
    let ctx = gpu.ctx();

    let data: Vec<u32> = (0..1000).map(|i| i * 7 + 3).collect();
    let mut buffer = GpuBuffer::allocate_and_fill(ctx, BufferUsage::STORAGE, &data).unwrap();
    assert_eq!(buffer.len(), 1000);
    assert_eq!(buffer.size_bytes(), 4000);
    assert_eq!(buffer.read(ctx).unwrap(), data);

    buffer.upload(ctx, &[1, 2, 3], 997).unwrap();
    let read = buffer.read(ctx).unwrap();
    assert_eq!(&read[997..], &[1, 2, 3]);
    assert_eq!(&read[..997], &data[..997]);

    let err = buffer.upload(ctx, &[1, 2], 999).unwrap_err();
    assert!(matches!(
        err,
        GpuError::OutOfBounds {
            offset: 999,
            end: 1001,
            len: 1000
        }
    ));

    unsafe { buffer.free(ctx) };
}

#[test]
fn empty_buffers_are_rejected() {
    let Some(gpu) = HeadlessGpu::try_new() else {
        return;
    };
    let err = GpuBuffer::<f32>::allocate(gpu.ctx(), BufferUsage::STORAGE, 0).unwrap_err();
    assert!(matches!(err, GpuError::InvalidState(_)));
}

#[test]
fn freeing_buffers_releases_memory() {
    let Some(gpu) = HeadlessGpu::try_new() else {
        return;
    };
    let ctx = gpu.ctx();
    let before = ctx.memory().live_allocations();

    let a = GpuBuffer::<f32>::allocate(ctx, BufferUsage::STORAGE | BufferUsage::COMPUTE, 64).unwrap();
    let b = GpuBuffer::<u32>::allocate(ctx, BufferUsage::INDEX | BufferUsage::GRAPHICS, 6).unwrap();
    let c = Uniform::new(ctx, &[1.0f32, 2.0, 3.0, 4.0]).unwrap();
    assert_eq!(ctx.memory().live_allocations(), before + 3);
    assert!(a.memory().is_some());

    unsafe {
        a.free(ctx);
        b.free(ctx);
        c.free(ctx);
    }
    assert_eq!(ctx.memory().live_allocations(), before);
}

#[test]
fn memory_type_lookup_respects_mask() {
    let Some(gpu) = HeadlessGpu::try_new() else {
        return;
    };
    let memory = gpu.ctx().memory();

    assert_eq!(memory.find_memory_type(0, vk::MemoryPropertyFlags::empty()), None);
    assert_eq!(
        memory.find_memory_type(u32::MAX, vk::MemoryPropertyFlags::empty()),
        Some(0)
    );
    // Vulkan guarantees a host-visible coherent type
    assert!(memory
        .find_memory_type(
            u32::MAX,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
        )
        .is_some());
}

#[test]
fn truncated_kernel_file_is_rejected() {
    let Some(gpu) = HeadlessGpu::try_new() else {
        return;
    };
    let path = std::env::temp_dir().join(format!("vkgp-truncated-{}.spv", std::process::id()));
    std::fs::write(&path, &vkgp_shaders::wiggle_kernel_bytes()[..7]).unwrap();

    let result = ComputeKernel::<WiggleArgs>::from_file(gpu.ctx(), &path);
    std::fs::remove_file(&path).unwrap();
    assert!(matches!(result, Err(GpuError::InvalidKernelBinary(_))));

    let missing = ComputeKernel::<WiggleArgs>::from_file(gpu.ctx(), &path);
    assert!(matches!(missing, Err(GpuError::Io(_))));
}

#[test]
fn kernel_loads_from_file() {
    let Some(gpu) = HeadlessGpu::try_new() else {
        return;
    };
    let ctx = gpu.ctx();
    let path = std::env::temp_dir().join(format!("vkgp-wiggle-{}.spv", std::process::id()));
    std::fs::write(&path, vkgp_shaders::wiggle_kernel_bytes()).unwrap();

    let kernel = ComputeKernel::<WiggleArgs>::from_file(ctx, &path);
    std::fs::remove_file(&path).unwrap();
    let kernel = kernel.unwrap();
    assert_eq!(kernel.layout().arg_count(), 3);
    assert_eq!(kernel.pipeline().label(), path.display().to_string());

    unsafe { kernel.destroy(ctx) };
}

#[test]
fn wiggle_matches_cpu_reference() {
    let Some(gpu) = HeadlessGpu::try_new() else {
        return;
    };
    // 81 vertices: the last workgroup is partly out of range
    let mesh = MeshData::grid(8);
    let t = 0.75;

    let displaced = gpu.run_wiggle(&mesh, t).unwrap();
    assert_eq!(displaced.len(), mesh.vertex_count());

    for (base, gpu_vertex) in mesh.vertices().iter().zip(&displaced) {
        let expected = wiggle_reference(base, t);
        for axis in 0..3 {
            assert_relative_eq!(gpu_vertex.position[axis], expected.position[axis], epsilon = 1e-4);
        }
        assert_eq!(gpu_vertex.uv, base.uv);
        assert_eq!(gpu_vertex.normal, base.normal);
    }
}

#[test]
fn untyped_kernel_checks_arguments() {
    let Some(gpu) = HeadlessGpu::try_new() else {
        return;
    };
    let ctx = gpu.ctx();
    let usage = BufferUsage::STORAGE | BufferUsage::COMPUTE;

    let kernel = KernelBuilder::new()
        .label("wiggle")
        .storage_buffer()
        .storage_buffer()
        .storage_buffer()
        .build(ctx, vkgp_shaders::wiggle_kernel())
        .unwrap();
    assert_eq!(
        kernel.layout().categories(),
        KernelLayout::of::<WiggleArgs>().categories()
    );

    let vertices = MeshData::quad().vertices();
    let base = GpuBuffer::allocate_and_fill(ctx, usage, &vertices).unwrap();
    let mut out = GpuBuffer::<Vertex>::allocate(ctx, usage, vertices.len()).unwrap();
    let time = GpuBuffer::allocate_and_fill(ctx, usage, &[0.0f32]).unwrap();

    let err = kernel
        .invoke_raw(ctx, gpu.compute(), &[base.descriptor_info()], [1, 1, 1])
        .unwrap_err();
    assert!(matches!(err, GpuError::InvalidState(_)));

    let args = [base.descriptor_info(), out.descriptor_info(), time.descriptor_info()];
    let err = kernel
        .invoke_raw(ctx, gpu.compute(), &args, [u32::MAX, 1, 1])
        .unwrap_err();
    assert!(matches!(err, GpuError::InvalidState(_)));

    let groups = group_count(vertices.len() as u32, vkgp_shaders::WIGGLE_LOCAL_SIZE);
    kernel.invoke_raw(ctx, gpu.compute(), &args, [groups, 1, 1]).unwrap();
    let expected: Vec<Vertex> = vertices.iter().map(|v| wiggle_reference(v, 0.0)).collect();
    for (actual, expected) in out.read(ctx).unwrap().iter().zip(&expected) {
        for axis in 0..3 {
            assert_relative_eq!(actual.position[axis], expected.position[axis], epsilon = 1e-4);
        }
    }

    unsafe {
        kernel.destroy(ctx);
        base.free(ctx);
        out.free(ctx);
        time.free(ctx);
    }
}

#[test]
fn uniform_arguments_bind_as_uniform_buffers() {
    let Some(gpu) = HeadlessGpu::try_new() else {
        return;
    };
    let ctx = gpu.ctx();

    let mut uniform = Uniform::new(ctx, &[0.5f32, 1.0]).unwrap();
    uniform.set(ctx, &[2.0, 4.0]).unwrap();
    let info = uniform.descriptor_info();
    assert_eq!(info.range, 8);
    assert_eq!(info.buffer, uniform.buffer().handle());

    let layout = KernelLayout::of::<(GpuBuffer<f32>, Uniform<[f32; 2]>)>();
    assert_eq!(layout.arg_count(), 2);
    assert_eq!(
        <(GpuBuffer<f32>, Uniform<[f32; 2]>) as KernelArgs>::categories(),
        layout.categories()
    );

    unsafe { uniform.free(ctx) };
}

#[test]
fn wiggle_rejects_short_output() {
    let Some(gpu) = HeadlessGpu::try_new() else {
        return;
    };
    let ctx = gpu.ctx();
    let usage = BufferUsage::STORAGE | BufferUsage::COMPUTE;
    let vertices = MeshData::quad().vertices();

    let mut wiggle = Wiggle::new(ctx).unwrap();
    let base = GpuBuffer::allocate_and_fill(ctx, usage, &vertices).unwrap();
    let out = GpuBuffer::<Vertex>::allocate(ctx, usage, vertices.len() - 1).unwrap();

    let err = wiggle.run(ctx, gpu.compute(), &base, &out, 0.0).unwrap_err();
    assert!(matches!(
        err,
        RenderError::Gpu(GpuError::OutOfBounds { offset: 0, end, len }) if end == vertices.len() && len == end - 1
    ));

    unsafe {
        wiggle.destroy(ctx);
        base.free(ctx);
        out.free(ctx);
    }
}

#[test]
fn failed_kernel_load_leaves_nothing_allocated() {
    let Some(gpu) = HeadlessGpu::try_new() else {
        return;
    };
    let ctx = gpu.ctx();
    let before = ctx.memory().live_allocations();

    let missing = std::env::temp_dir().join(format!("vkgp-missing-{}.spv", std::process::id()));
    assert!(Wiggle::from_file(ctx, &missing).is_err());
    assert_eq!(ctx.memory().live_allocations(), before);
}

#[test]
fn frames_rotate_through_slots_and_survive_recreation() {
    let Some((gpu, surface)) = HeadlessGpu::try_presentable() else {
        return;
    };
    let ctx = gpu.ctx();
    let before = ctx.memory().live_allocations();

    let extent = vk::Extent2D {
        width: 64,
        height: 48,
    };
    let mut frames = FrameScheduler::new(ctx, surface, extent, FrameConfig::default()).unwrap();
    assert!(frames.swapchain().is_consistent());
    let n = frames.config().frames_in_flight;

    let render = |frames: &mut FrameScheduler, count: usize| {
        for _ in 0..count {
            let index = frames.frame_index();
            let frame = frames
                .begin_frame(ctx)
                .unwrap()
                .expect("swapchain has area");
            assert_eq!(frame.index, index);
            assert_eq!(frame.slot, (index % n as u64) as usize);
            assert!((frame.image_index as usize) < frames.swapchain().image_count());
            frames.end_frame(ctx, frame).unwrap();
        }
    };

    render(&mut frames, 3 * n + 1);
    assert_eq!(frames.frame_index(), (3 * n + 1) as u64);

    // A frame must be ended before the next one begins
    let frame = frames.begin_frame(ctx).unwrap().expect("swapchain has area");
    assert!(matches!(
        frames.begin_frame(ctx),
        Err(GpuError::InvalidState(_))
    ));
    frames.end_frame(ctx, frame).unwrap();

    let resized = vk::Extent2D {
        width: 80,
        height: 60,
    };
    frames.recreate_swapchain(ctx, resized).unwrap();
    let live = ctx.memory().live_allocations();
    let bytes = ctx.memory().live_bytes();

    frames.recreate_swapchain(ctx, resized).unwrap();
    assert!(frames.swapchain().is_consistent());
    assert!(!frames.is_stale());
    assert_eq!(ctx.memory().live_allocations(), live);
    assert_eq!(ctx.memory().live_bytes(), bytes);
    render(&mut frames, n);

    // Minimised: frames are skipped until the window has area again
    frames
        .recreate_swapchain(ctx, vk::Extent2D::default())
        .unwrap();
    assert!(frames.is_stale());
    assert!(frames.begin_frame(ctx).unwrap().is_none());
    frames.recreate_swapchain(ctx, extent).unwrap();
    assert!(frames.swapchain().is_consistent());
    render(&mut frames, 1);

    frames.destroy(ctx);
    assert_eq!(ctx.memory().live_allocations(), before);
}
