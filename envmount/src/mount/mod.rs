//! Image mounting: the single-flight gate and the mounter seam.

mod gate;
mod mounter;

pub use gate::{MountError, MountGate, MountStatus};
pub use mounter::{ImageMounter, RemoteImageMounter};
