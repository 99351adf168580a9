use rhai::{Dynamic, EvalAltResult, Position};

use crate::handle::EntityHandle;
use crate::host::{InvalidHandle, NormalizeFn, TransformHost, TransformView};
use crate::math::Vector3;

/// Forwards position access to host storage instead of caching it, so a
/// stale read is impossible by construction. Holds raw pointers so it can
/// cross into the interpreter; they must only be dereferenced during the
/// update call the proxy was resolved for.
#[derive(Clone, Copy, Debug)]
pub struct EntityProxy {
    handle: EntityHandle,
    host: *mut dyn TransformHost,
    normalize: *const Option<NormalizeFn>,
}

unsafe impl Send for EntityProxy {}
unsafe impl Sync for EntityProxy {}

impl EntityProxy {
    /// Binds a proxy to a live entity. Fails with `InvalidHandle` when the
    /// host no longer recognizes the handle.
    pub fn resolve(
        host: &mut dyn TransformHost,
        normalize: &Option<NormalizeFn>,
        handle: EntityHandle,
    ) -> Result<Self, InvalidHandle> {
        if !host.is_alive(handle) {
            return Err(InvalidHandle(handle));
        }
        Ok(Self {
            handle,
            host: unsafe {
                std::mem::transmute::<&mut dyn TransformHost, *mut dyn TransformHost>(host)
            },
            normalize: normalize as *const Option<NormalizeFn>,
        })
    }

    pub fn handle(&self) -> EntityHandle {
        self.handle
    }

    /// One host call per read; nothing is cached between calls.
    pub fn position(&self) -> Result<Vector3, InvalidHandle> {
        let host = unsafe { &*self.host };
        let (x, y, z) = host.get_position(self.handle)?;
        Ok(Vector3::new(x, y, z))
    }

    /// One host call per write. The normalization hook, when configured,
    /// runs on the candidate value here and nowhere else.
    pub fn set_position(&mut self, value: Vector3) -> Result<(), InvalidHandle> {
        let normalize = unsafe { &*self.normalize };
        let value = match normalize {
            Some(fix) => fix(value),
            None => value,
        };
        let host = unsafe { &mut *self.host };
        host.set_position(self.handle, value.x, value.y, value.z)
    }

    pub fn transform(&self) -> Result<TransformView, InvalidHandle> {
        let host = unsafe { &*self.host };
        host.get_transform(self.handle)
    }

    // Rhai-facing wrappers. A dead handle surfaces as a runtime error whose
    // payload carries the typed `InvalidHandle` back across `call_fn`.
    pub(crate) fn script_get_position(&mut self) -> Result<Vector3, Box<EvalAltResult>> {
        self.position().map_err(into_script_error)
    }

    pub(crate) fn script_set_position(&mut self, value: Vector3) -> Result<(), Box<EvalAltResult>> {
        self.set_position(value).map_err(into_script_error)
    }

    pub(crate) fn script_get_transform(&mut self) -> Result<TransformView, Box<EvalAltResult>> {
        self.transform().map_err(into_script_error)
    }
}

fn into_script_error(err: InvalidHandle) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorRuntime(Dynamic::from(err), Position::NONE))
}
