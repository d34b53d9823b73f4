//! Viewer application implementation.

use std::f32::consts::TAU;
use std::time::{Duration, Instant};

use glam::{Mat4, Vec2, Vec3};
use tracing::info;
use vkgp_app::{AppContext, Frame, GpApp};
use vkgp_gpu::{BufferUsage, GpuBuffer};
use vkgp_render::{Camera, GpuMesh, MeshData, MeshRenderer, OrbitCamera, PushMatrices, Vertex, Wiggle};
use winit::event::{ElementState, MouseButton, MouseScrollDelta, WindowEvent};

use crate::ViewerOptions;

/// Rotations per second around the world up axis.
const SPIN_FREQUENCY: f32 = 0.5;

/// Pixels of smooth scrolling that count as one wheel step.
const PIXELS_PER_SCROLL_STEP: f32 = 40.0;

/// GPU objects owned by the viewer.
struct Resources {
    renderer: MeshRenderer,
    /// Undisplaced mesh; its vertex buffer is the kernel input.
    mesh: GpuMesh,
    /// Kernel output, one buffer per frame slot.
    displaced: Vec<GpuBuffer<Vertex>>,
    wiggle: Wiggle,
}

impl Resources {
    /// Build everything the viewer draws with. Parts already created are
    /// destroyed again if a later one fails.
    fn new(ctx: &AppContext, options: &ViewerOptions) -> anyhow::Result<Self> {
        let gpu = &ctx.gpu;
        let data = MeshData::sphere(1.0, 64, 32);
        let usage = BufferUsage::STORAGE | BufferUsage::COMPUTE;

        let renderer = MeshRenderer::new(gpu, ctx.render_pass())?;

        let mesh = match GpuMesh::from_data(gpu, &data, usage) {
            Ok(mesh) => mesh,
            Err(e) => {
                // SAFETY: nothing has been recorded with the renderer
                unsafe { renderer.destroy(gpu) };
                return Err(e.into());
            }
        };

        let slots = ctx.frames.config().frames_in_flight.max(1);
        let displaced = match allocate_displaced(ctx, &data.vertices(), slots) {
            Ok(displaced) => displaced,
            Err(e) => {
                // SAFETY: nothing has been recorded or dispatched
                unsafe {
                    mesh.destroy(gpu);
                    renderer.destroy(gpu);
                }
                return Err(e);
            }
        };

        let wiggle = match load_wiggle(ctx, options) {
            Ok(wiggle) => wiggle,
            Err(e) => {
                // SAFETY: nothing has been recorded or dispatched
                unsafe {
                    free_buffers(ctx, displaced);
                    mesh.destroy(gpu);
                    renderer.destroy(gpu);
                }
                return Err(e);
            }
        };

        info!(
            "Mesh: {} vertices, {} triangles",
            data.vertex_count(),
            data.triangle_count()
        );

        Ok(Self {
            renderer,
            mesh,
            displaced,
            wiggle,
        })
    }

    /// # Safety
    /// The device must be idle.
    unsafe fn destroy(self, ctx: &AppContext) {
        // SAFETY: forwarded from the caller
        unsafe {
            self.wiggle.destroy(&ctx.gpu);
            free_buffers(ctx, self.displaced);
            self.mesh.destroy(&ctx.gpu);
            self.renderer.destroy(&ctx.gpu);
        }
    }
}

/// One kernel output buffer per frame slot, initialised with `vertices`.
fn allocate_displaced(
    ctx: &AppContext,
    vertices: &[Vertex],
    slots: usize,
) -> anyhow::Result<Vec<GpuBuffer<Vertex>>> {
    let usage = BufferUsage::STORAGE
        | BufferUsage::COMPUTE
        | BufferUsage::VERTEX
        | BufferUsage::GRAPHICS;
    let mut buffers = Vec::with_capacity(slots);
    for _ in 0..slots {
        match GpuBuffer::allocate_and_fill(&ctx.gpu, usage, vertices) {
            Ok(buffer) => buffers.push(buffer),
            Err(e) => {
                // SAFETY: the buffers were never used
                unsafe { free_buffers(ctx, buffers) };
                return Err(e.into());
            }
        }
    }
    Ok(buffers)
}

fn load_wiggle(ctx: &AppContext, options: &ViewerOptions) -> anyhow::Result<Wiggle> {
    Ok(match &options.kernel {
        Some(path) => {
            info!("Loading kernel from {}", path.display());
            Wiggle::from_file(&ctx.gpu, path)?
        }
        None => Wiggle::new(&ctx.gpu)?,
    })
}

/// # Safety
/// No pending GPU work may use the buffers.
unsafe fn free_buffers(ctx: &AppContext, buffers: Vec<GpuBuffer<Vertex>>) {
    for buffer in buffers {
        // SAFETY: forwarded from the caller
        unsafe { buffer.free(&ctx.gpu) };
    }
}

/// Viewer application state.
pub struct Viewer {
    resources: Option<Resources>,
    camera: Camera,
    orbit: OrbitCamera,
    transform: Mat4,
    /// Cursor in normalized device coordinates, +Y up.
    cursor: Vec2,
    orbiting: bool,
    time: f32,
    compute_time: Duration,
}

impl GpApp for Viewer {
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self> {
        let options = ViewerOptions::from_args()?;
        let resources = Resources::new(ctx, &options)?;

        let mut camera = Camera::default();
        let extent = ctx.extent();
        camera.set_viewport(extent.width, extent.height);
        let orbit = OrbitCamera::default();
        orbit.apply(&mut camera);

        Ok(Self {
            resources: Some(resources),
            camera,
            orbit,
            transform: Mat4::IDENTITY,
            cursor: Vec2::ZERO,
            orbiting: false,
            time: 0.0,
            compute_time: Duration::ZERO,
        })
    }

    fn update(&mut self, ctx: &mut AppContext, _dt: f32) -> anyhow::Result<()> {
        self.time = ctx.elapsed();
        self.transform = model_transform(self.time);
        self.orbit.apply(&mut self.camera);
        Ok(())
    }

    fn render(&mut self, ctx: &AppContext, frame: &Frame) -> anyhow::Result<()> {
        let Some(res) = &mut self.resources else {
            return Ok(());
        };
        let displaced = &res.displaced[frame.slot % res.displaced.len()];

        // The slot's previous frame has finished, so its buffer is free
        let start = Instant::now();
        res.wiggle
            .run(&ctx.gpu, &ctx.compute, &res.mesh.vertices, displaced, self.time)?;
        self.compute_time += start.elapsed();

        self.camera.set_viewport(frame.extent.width, frame.extent.height);
        let matrices = PushMatrices::new(
            self.camera.view_matrix(),
            self.camera.projection_matrix(),
            self.transform,
        );
        res.renderer
            .draw_with_vertices(&ctx.gpu, frame, &res.mesh, displaced, &matrices);

        Ok(())
    }

    fn on_event(&mut self, ctx: &AppContext, event: &WindowEvent) -> bool {
        match event {
            WindowEvent::CursorMoved { position, .. } => {
                let extent = ctx.extent();
                if extent.width == 0 || extent.height == 0 {
                    return false;
                }
                let cursor = Vec2::new(
                    2.0 * position.x as f32 / extent.width as f32 - 1.0,
                    1.0 - 2.0 * position.y as f32 / extent.height as f32,
                );
                if self.orbiting {
                    self.orbit.drag(cursor - self.cursor);
                }
                self.cursor = cursor;
                self.orbiting
            }
            WindowEvent::MouseInput {
                state,
                button: MouseButton::Middle,
                ..
            } => {
                self.orbiting = *state == ElementState::Pressed;
                true
            }
            WindowEvent::MouseWheel { delta, .. } => {
                let steps = match delta {
                    MouseScrollDelta::LineDelta(_, y) => *y,
                    MouseScrollDelta::PixelDelta(pixels) => pixels.y as f32 / PIXELS_PER_SCROLL_STEP,
                };
                self.orbit.zoom(steps, self.camera.near, self.camera.far);
                true
            }
            _ => false,
        }
    }

    fn cleanup(&mut self, ctx: &mut AppContext) {
        let elapsed = ctx.elapsed();
        if elapsed > 0.0 {
            let compute = self.compute_time.as_secs_f32();
            info!("Average FPS: {:.1}", ctx.frame_count as f32 / elapsed);
            info!("Total elapsed: {elapsed:.2}s, compute: {compute:.2}s");
            info!("Compute: {:.1}%", 100.0 * compute / elapsed);
        }

        if let Some(res) = self.resources.take() {
            // SAFETY: the framework idles the device before cleanup
            unsafe { res.destroy(ctx) };
        }
    }
}

/// Half size, sliding along X and spinning around Z.
fn model_transform(t: f32) -> Mat4 {
    Mat4::from_scale(Vec3::splat(0.5))
        * Mat4::from_translation(Vec3::new(t.sin(), 0.0, 0.0))
        * Mat4::from_rotation_z(TAU * SPIN_FREQUENCY * t)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_starts_at_half_scale() {
        let m = model_transform(0.0);
        assert_eq!(m, Mat4::from_scale(Vec3::splat(0.5)));
    }

    #[test]
    fn model_slides_along_x() {
        let t = std::f32::consts::FRAC_PI_2;
        let origin = model_transform(t).transform_point3(Vec3::ZERO);
        assert!((origin - Vec3::new(0.5, 0.0, 0.0)).length() < 1e-6);
    }
}
