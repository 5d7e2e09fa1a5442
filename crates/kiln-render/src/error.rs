// SPDX-License-Identifier: CEPL-1.0
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("begin_frame called while a frame is already being recorded")]
    AlreadyRecording,
    #[error("no frame is being recorded")]
    NotRecording,
    #[error("command buffer does not belong to the frame being recorded")]
    ForeignCommandBuffer,
    #[error("presentation chain was lost by a failed recreation")]
    ChainLost,
    #[error("surface closed while waiting for a usable size")]
    SurfaceClosed,
    #[error(transparent)]
    Device(#[from] anyhow::Error),
}

impl FrameError {
    /// Caller bugs, as opposed to platform failures.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            FrameError::AlreadyRecording | FrameError::NotRecording | FrameError::ForeignCommandBuffer
        )
    }
}
