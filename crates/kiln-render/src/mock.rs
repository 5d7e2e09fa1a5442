// SPDX-License-Identifier: CEPL-1.0
//! Scripted stand-ins for the GPU and the window.
//!
//! The device keeps an in-order queue of submissions that only retire when a
//! fence wait or `wait_idle` asks for them, and panics on any use the real
//! API forbids: reusing a command buffer or fence the queue still holds,
//! double-signalling a semaphore, presenting without a signalled wait.

use anyhow::{anyhow, bail, Result};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

use crate::device::{ClearValues, PresentDevice, PresentStatus, SwapchainTargets};
use crate::surface::SurfaceProvider;
use crate::RenderSize;

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Event {
    CreateTargets {
        id: u64,
        extent: RenderSize,
        images: usize,
        reused_pass: bool,
    },
    DestroyTargets(u64),
    WaitFence(u64),
    ResetFence(u64),
    Acquire { image: Option<u32>, status: PresentStatus },
    Submit { cmd: u64, fence: u64 },
    Present { image: u32 },
    AllocateCommandBuffers(Vec<u64>),
    FreeCommandBuffers(Vec<u64>),
    BeginCommandBuffer(u64),
    EndCommandBuffer(u64),
    BeginRenderPass { cmd: u64, image: u32, clear: [f32; 4] },
    SetViewportScissor { cmd: u64, extent: RenderSize },
    EndRenderPass(u64),
    PushConstants { cmd: u64, layout: u64, len: usize },
    WaitIdle,
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum Scripted {
    Status(PresentStatus),
    Image(u32),
    Fail,
}

struct Submission {
    cmd: u64,
    fence: u64,
}

#[derive(Default)]
struct State {
    next_id: u64,
    image_count: usize,
    fail_next_targets: bool,
    events: Vec<Event>,
    fences: HashMap<u64, bool>,
    semaphores: HashMap<u64, bool>,
    queue: VecDeque<Submission>,
    acquire_script: VecDeque<Scripted>,
    present_script: VecDeque<Scripted>,
    next_image: u32,
    command_buffers: HashSet<u64>,
    recording: HashSet<u64>,
    live_targets: usize,
    submissions: usize,
}

impl State {
    fn id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn fence_pending(&self, fence: u64) -> bool {
        self.queue.iter().any(|s| s.fence == fence)
    }

    fn cmd_pending(&self, cmd: u64) -> bool {
        self.queue.iter().any(|s| s.cmd == cmd)
    }

    fn retire_front(&mut self) {
        if let Some(done) = self.queue.pop_front() {
            self.fences.insert(done.fence, true);
        }
    }
}

#[derive(Clone)]
pub(crate) struct MockDevice {
    state: Rc<RefCell<State>>,
}

impl MockDevice {
    pub fn new(image_count: usize) -> Self {
        let state = State {
            image_count,
            ..State::default()
        };
        Self {
            state: Rc::new(RefCell::new(state)),
        }
    }

    /// Image count handed to the next generation of targets.
    pub fn set_image_count(&self, n: usize) {
        self.state.borrow_mut().image_count = n;
    }

    pub fn fail_next_targets(&self) {
        self.state.borrow_mut().fail_next_targets = true;
    }

    pub fn script_acquire(&self, s: Scripted) {
        self.state.borrow_mut().acquire_script.push_back(s);
    }

    pub fn script_present(&self, s: Scripted) {
        self.state.borrow_mut().present_script.push_back(s);
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.borrow().events.clone()
    }

    pub fn clear_events(&self) {
        self.state.borrow_mut().events.clear();
    }

    pub fn live_fences(&self) -> usize {
        self.state.borrow().fences.len()
    }

    pub fn live_semaphores(&self) -> usize {
        self.state.borrow().semaphores.len()
    }

    pub fn live_targets(&self) -> usize {
        self.state.borrow().live_targets
    }

    pub fn live_command_buffers(&self) -> usize {
        self.state.borrow().command_buffers.len()
    }

    pub fn submissions(&self) -> usize {
        self.state.borrow().submissions
    }

    pub fn targets_created(&self) -> usize {
        self.state
            .borrow()
            .events
            .iter()
            .filter(|e| matches!(e, Event::CreateTargets { .. }))
            .count()
    }

    fn push(&self, e: Event) {
        self.state.borrow_mut().events.push(e);
    }
}

pub(crate) struct MockTargets {
    id: u64,
    images: usize,
    extent: RenderSize,
    render_pass: u64,
    state: Rc<RefCell<State>>,
}

impl SwapchainTargets for MockTargets {
    type RenderPass = u64;

    fn image_count(&self) -> usize {
        self.images
    }

    fn extent(&self) -> RenderSize {
        self.extent
    }

    fn render_pass(&self) -> u64 {
        self.render_pass
    }
}

impl Drop for MockTargets {
    fn drop(&mut self) {
        let mut st = self.state.borrow_mut();
        st.live_targets -= 1;
        st.events.push(Event::DestroyTargets(self.id));
    }
}

impl PresentDevice for MockDevice {
    type CommandBuffer = u64;
    type Fence = u64;
    type Semaphore = u64;
    type PipelineLayout = u64;
    type Targets = MockTargets;

    fn create_targets(&self, extent: RenderSize, previous: Option<&MockTargets>) -> Result<MockTargets> {
        assert!(!extent.is_empty(), "targets requested for a zero-area surface");
        let mut st = self.state.borrow_mut();
        if std::mem::take(&mut st.fail_next_targets) {
            bail!("out of device memory");
        }
        let id = st.id();
        let render_pass = match previous {
            Some(p) => p.render_pass,
            None => st.id(),
        };
        st.live_targets += 1;
        st.next_image = 0;
        let images = st.image_count;
        st.events.push(Event::CreateTargets {
            id,
            extent,
            images,
            reused_pass: previous.is_some(),
        });
        Ok(MockTargets {
            id,
            images,
            extent,
            render_pass,
            state: Rc::clone(&self.state),
        })
    }

    fn create_fence(&self, signaled: bool) -> Result<u64> {
        let mut st = self.state.borrow_mut();
        let id = st.id();
        st.fences.insert(id, signaled);
        Ok(id)
    }

    fn destroy_fence(&self, fence: u64) {
        let mut st = self.state.borrow_mut();
        assert!(!st.fence_pending(fence), "fence {fence} destroyed while the GPU still uses it");
        assert!(st.fences.remove(&fence).is_some(), "unknown fence {fence}");
    }

    fn create_semaphore(&self) -> Result<u64> {
        let mut st = self.state.borrow_mut();
        let id = st.id();
        st.semaphores.insert(id, false);
        Ok(id)
    }

    fn destroy_semaphore(&self, semaphore: u64) {
        let mut st = self.state.borrow_mut();
        assert!(st.semaphores.remove(&semaphore).is_some(), "unknown semaphore {semaphore}");
    }

    fn wait_for_fence(&self, fence: u64) -> Result<()> {
        let mut st = self.state.borrow_mut();
        st.events.push(Event::WaitFence(fence));
        match st.fences.get(&fence) {
            None => panic!("wait on unknown fence {fence}"),
            Some(true) => return Ok(()),
            Some(false) => {}
        }
        if !st.fence_pending(fence) {
            bail!("fence {fence} is unsignalled and nothing will signal it");
        }
        while st.fences.get(&fence) == Some(&false) {
            st.retire_front();
        }
        Ok(())
    }

    fn reset_fence(&self, fence: u64) -> Result<()> {
        let mut st = self.state.borrow_mut();
        assert!(!st.fence_pending(fence), "fence {fence} reset while pending");
        st.events.push(Event::ResetFence(fence));
        st.fences.insert(fence, false);
        Ok(())
    }

    fn acquire_next_image(&self, targets: &MockTargets, signal: u64) -> Result<(u32, PresentStatus)> {
        let mut st = self.state.borrow_mut();
        let (image, status) = match st.acquire_script.pop_front() {
            Some(Scripted::Fail) => return Err(anyhow!("device lost")),
            Some(Scripted::Status(PresentStatus::OutOfDate)) => {
                st.events.push(Event::Acquire {
                    image: None,
                    status: PresentStatus::OutOfDate,
                });
                return Ok((0, PresentStatus::OutOfDate));
            }
            Some(Scripted::Image(i)) => (i, PresentStatus::Ok),
            Some(Scripted::Status(s)) => (st.next_image, s),
            None => (st.next_image, PresentStatus::Ok),
        };
        st.next_image = (image + 1) % targets.images as u32;
        let signalled = st.semaphores.get_mut(&signal).expect("unknown semaphore");
        assert!(!*signalled, "acquire would signal semaphore {signal} twice");
        *signalled = true;
        st.events.push(Event::Acquire {
            image: Some(image),
            status,
        });
        Ok((image, status))
    }

    fn submit(&self, cmd: u64, wait: u64, signal: u64, fence: u64) -> Result<()> {
        let mut st = self.state.borrow_mut();
        assert!(st.command_buffers.contains(&cmd), "unknown command buffer {cmd}");
        assert!(!st.recording.contains(&cmd), "command buffer {cmd} submitted while recording");
        assert!(!st.cmd_pending(cmd), "command buffer {cmd} submitted twice");
        assert_eq!(st.fences.get(&fence), Some(&false), "submit needs an unsignalled fence");
        assert!(!st.fence_pending(fence), "fence {fence} already pending");

        let w = st.semaphores.get_mut(&wait).expect("unknown semaphore");
        assert!(*w, "submit waits on semaphore {wait} that nothing signalled");
        *w = false;
        let s = st.semaphores.get_mut(&signal).expect("unknown semaphore");
        assert!(!*s, "submit would signal semaphore {signal} twice");
        *s = true;

        st.queue.push_back(Submission { cmd, fence });
        st.submissions += 1;
        st.events.push(Event::Submit { cmd, fence });
        Ok(())
    }

    fn present(&self, targets: &MockTargets, image_index: u32, wait: u64) -> Result<PresentStatus> {
        let mut st = self.state.borrow_mut();
        assert!((image_index as usize) < targets.images, "present of unknown image");
        let w = st.semaphores.get_mut(&wait).expect("unknown semaphore");
        assert!(*w, "present waits on semaphore {wait} that nothing signalled");
        *w = false;
        st.events.push(Event::Present { image: image_index });
        match st.present_script.pop_front() {
            Some(Scripted::Fail) => Err(anyhow!("device lost")),
            Some(Scripted::Status(s)) => Ok(s),
            Some(Scripted::Image(_)) | None => Ok(PresentStatus::Ok),
        }
    }

    fn allocate_command_buffers(&self, count: usize) -> Result<Vec<u64>> {
        let mut st = self.state.borrow_mut();
        let bufs: Vec<u64> = (0..count).map(|_| st.id()).collect();
        st.command_buffers.extend(&bufs);
        st.events.push(Event::AllocateCommandBuffers(bufs.clone()));
        Ok(bufs)
    }

    fn free_command_buffers(&self, bufs: &[u64]) {
        let mut st = self.state.borrow_mut();
        for b in bufs {
            assert!(!st.cmd_pending(*b), "command buffer {b} freed while pending");
            assert!(st.command_buffers.remove(b), "double free of command buffer {b}");
            st.recording.remove(b);
        }
        st.events.push(Event::FreeCommandBuffers(bufs.to_vec()));
    }

    fn begin_command_buffer(&self, cmd: u64) -> Result<()> {
        let mut st = self.state.borrow_mut();
        assert!(st.command_buffers.contains(&cmd), "unknown command buffer {cmd}");
        assert!(!st.cmd_pending(cmd), "command buffer {cmd} reused while the GPU still reads it");
        assert!(st.recording.insert(cmd), "command buffer {cmd} begun twice");
        st.events.push(Event::BeginCommandBuffer(cmd));
        Ok(())
    }

    fn end_command_buffer(&self, cmd: u64) -> Result<()> {
        let mut st = self.state.borrow_mut();
        assert!(st.recording.remove(&cmd), "command buffer {cmd} ended without begin");
        st.events.push(Event::EndCommandBuffer(cmd));
        Ok(())
    }

    fn cmd_begin_render_pass(&self, cmd: u64, targets: &MockTargets, image_index: u32, clear: &ClearValues) {
        assert!((image_index as usize) < targets.images);
        assert!(self.state.borrow().recording.contains(&cmd));
        self.push(Event::BeginRenderPass {
            cmd,
            image: image_index,
            clear: clear.color,
        });
    }

    fn cmd_set_viewport_scissor(&self, cmd: u64, extent: RenderSize) {
        self.push(Event::SetViewportScissor { cmd, extent });
    }

    fn cmd_end_render_pass(&self, cmd: u64) {
        self.push(Event::EndRenderPass(cmd));
    }

    fn cmd_push_constants(&self, cmd: u64, layout: u64, bytes: &[u8]) {
        assert!(self.state.borrow().recording.contains(&cmd));
        self.push(Event::PushConstants {
            cmd,
            layout,
            len: bytes.len(),
        });
    }

    fn wait_idle(&self) -> Result<()> {
        let mut st = self.state.borrow_mut();
        while !st.queue.is_empty() {
            st.retire_front();
        }
        st.events.push(Event::WaitIdle);
        Ok(())
    }
}

/// Window stand-in. Each `wait_events` applies the next queued extent, which
/// is how tests model a user restoring a minimized window.
pub(crate) struct MockSurface {
    pub extent: RenderSize,
    pub resized: bool,
    pub restore: VecDeque<RenderSize>,
    pub waits: usize,
    pub closing: bool,
}

impl MockSurface {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            extent: RenderSize::new(width, height),
            resized: false,
            restore: VecDeque::new(),
            waits: 0,
            closing: false,
        }
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.extent = RenderSize::new(width, height);
        self.resized = true;
    }
}

impl SurfaceProvider for MockSurface {
    fn extent(&self) -> RenderSize {
        self.extent
    }

    fn was_resized(&self) -> bool {
        self.resized
    }

    fn reset_resized_flag(&mut self) {
        self.resized = false;
    }

    fn wait_events(&mut self) {
        self.waits += 1;
        assert!(self.waits < 1000, "surface never became usable");
        if let Some(next) = self.restore.pop_front() {
            self.resize(next.width, next.height);
        }
    }

    fn is_closing(&self) -> bool {
        self.closing
    }
}
