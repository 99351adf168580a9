use std::error::Error;
use std::fmt;

use crate::handle::EntityHandle;
use crate::math::Vector3;

/// Host-supplied canonicalization applied to a candidate position right
/// before write-back (world bounds, grid snapping). Absent means identity.
pub type NormalizeFn = Box<dyn Fn(Vector3) -> Vector3 + Send + Sync>;

/// Read-only transform snapshot handed to scripts on request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransformView {
    pub position: Vector3,
}

/// The host accessors the bridge depends on. Transform storage stays on the
/// host side; every bridge access is one synchronous call through this trait.
pub trait TransformHost {
    fn is_alive(&self, handle: EntityHandle) -> bool;

    fn get_position(&self, handle: EntityHandle) -> Result<(f64, f64, f64), InvalidHandle>;

    fn set_position(
        &mut self,
        handle: EntityHandle,
        x: f64,
        y: f64,
        z: f64,
    ) -> Result<(), InvalidHandle>;

    fn get_transform(&self, handle: EntityHandle) -> Result<TransformView, InvalidHandle> {
        let (x, y, z) = self.get_position(handle)?;
        Ok(TransformView { position: Vector3::new(x, y, z) })
    }
}

/// The handle refers to an entity the host no longer recognizes as live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidHandle(pub EntityHandle);

impl fmt::Display for InvalidHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entity handle {} is no longer valid", self.0)
    }
}

impl Error for InvalidHandle {}
