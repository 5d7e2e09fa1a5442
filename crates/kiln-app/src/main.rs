// SPDX-License-Identifier: CEPL-1.0
use anyhow::Result;
use clap::{Parser, ValueEnum};
use kiln_core::{init_tracing, load_cfg, KilnConfig, RenderCfg, VsyncMode};
use kiln_math::{Camera, Vec3};
use kiln_platform::AppWindow;
use kiln_render::{FrameError, FrameInfo, FrameOrchestrator, PresentDevice, RenderSize, RenderSystem};
use kiln_render_vk::{VkPresentConfig, VkPresentDevice, VkVsyncMode};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{error, info};

type Cmd = <VkPresentDevice as PresentDevice>::CommandBuffer;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML config
    #[arg(long, default_value = "kiln.toml")]
    config: PathBuf,
    /// Override `render.vsync_mode` from the config
    #[arg(long, value_enum)]
    vsync_mode: Option<VsyncArg>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum VsyncArg {
    Fifo,
    Mailbox,
}

impl From<VsyncArg> for VsyncMode {
    fn from(v: VsyncArg) -> Self {
        match v {
            VsyncArg::Fifo => VsyncMode::Fifo,
            VsyncArg::Mailbox => VsyncMode::Mailbox,
        }
    }
}

fn present_config(r: &RenderCfg) -> VkPresentConfig {
    VkPresentConfig {
        vsync: r.vsync,
        vsync_mode: match r.vsync_mode {
            VsyncMode::Fifo => VkVsyncMode::Fifo,
            VsyncMode::Mailbox => VkVsyncMode::Mailbox,
        },
        min_image_count: r.min_image_count,
    }
}

/// Logs frames per second; draws nothing.
struct FpsCounter {
    frames: u32,
    last: Instant,
}

impl FpsCounter {
    fn new() -> Self {
        Self {
            frames: 0,
            last: Instant::now(),
        }
    }
}

impl<C> RenderSystem<C> for FpsCounter {
    fn render(&mut self, _frame: &FrameInfo<'_, C>) -> Result<()> {
        // count only frames that were actually rendered
        self.frames = self.frames.saturating_add(1);
        let now = Instant::now();
        if now.duration_since(self.last).as_secs_f32() >= 1.0 {
            info!("fps ~ {}", self.frames);
            self.frames = 0;
            self.last = now;
        }
        Ok(())
    }
}

fn run(cfg: KilnConfig) -> Result<()> {
    let size = RenderSize::new(cfg.window.width, cfg.window.height);
    let window = AppWindow::new(&cfg.window.title, size)?;
    let device = VkPresentDevice::new(&window, &window, present_config(&cfg.render))?;
    info!(
        "vsync={} mode={:?} min_image_count={}",
        cfg.render.vsync, cfg.render.vsync_mode, cfg.render.min_image_count
    );

    let mut renderer = match FrameOrchestrator::new(device, window) {
        Ok(r) => r,
        Err(FrameError::SurfaceClosed) => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    renderer.set_clear_color(cfg.render.clear_color);

    let mut camera = Camera::default();
    camera.look_at(Vec3::new(0.0, 0.0, 3.0), Vec3::ZERO, Vec3::Y);
    let mut systems: Vec<Box<dyn RenderSystem<Cmd>>> = vec![Box::new(FpsCounter::new())];

    let mut last = Instant::now();
    loop {
        renderer.surface_mut().poll_events();
        if renderer.surface().should_close() {
            break;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(last).as_secs_f32();
        last = now;

        match draw_frame(&mut renderer, &mut camera, &mut systems, frame_time) {
            Ok(()) => {}
            Err(FrameError::SurfaceClosed) => break,
            Err(e) => return Err(e.into()),
        }
    }

    renderer.wait_idle()?;
    info!("exiting");
    Ok(())
}

fn draw_frame(
    renderer: &mut FrameOrchestrator<VkPresentDevice, AppWindow>,
    camera: &mut Camera,
    systems: &mut [Box<dyn RenderSystem<Cmd>>],
    frame_time: f32,
) -> Result<(), FrameError> {
    let aspect = renderer.aspect_ratio()?;
    camera.set_perspective(50f32.to_radians(), aspect, 0.1, 100.0);

    // None: the chain was just rebuilt, try again next iteration.
    let Some(cmd) = renderer.begin_frame()? else {
        return Ok(());
    };
    renderer.begin_render_pass(cmd)?;

    let info = FrameInfo {
        frame_index: renderer.frame_index(),
        frame_time,
        command_buffer: cmd,
        camera: &*camera,
    };
    for system in systems.iter_mut() {
        system.render(&info)?;
    }

    renderer.end_render_pass(cmd)?;
    renderer.end_frame()
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut cfg = load_cfg(&args.config);
    if let Some(mode) = args.vsync_mode {
        cfg.render.vsync_mode = mode.into();
    }

    if let Err(e) = run(cfg) {
        error!("fatal: {e:#}");
        return Err(e);
    }
    Ok(())
}
