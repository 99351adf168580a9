use bevy_ecs::prelude::*;
use glam::DVec3;

use crate::handle::EntityHandle;
use crate::host::{InvalidHandle, TransformHost};
use crate::math::Vector3;

// ---------- Components ----------
#[derive(Component, Clone, Copy)]
pub struct Transform {
    pub position: DVec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self { position: DVec3::ZERO }
    }
}

// ---------- World container ----------
/// Reference transform store used by the harness and the test suite. A real
/// host implements `TransformHost` over its own storage instead.
pub struct HostWorld {
    pub world: World,
}

impl HostWorld {
    pub fn new() -> Self {
        Self { world: World::new() }
    }

    pub fn spawn_at(&mut self, position: Vector3) -> EntityHandle {
        let entity = self.world.spawn(Transform { position: position.into() }).id();
        EntityHandle::from_bits(entity.to_bits())
    }

    pub fn despawn(&mut self, handle: EntityHandle) -> bool {
        match self.entity(handle) {
            Some(entity) if self.world.get_entity(entity).is_ok() => self.world.despawn(entity),
            _ => false,
        }
    }

    pub fn position(&self, handle: EntityHandle) -> Option<Vector3> {
        let entity = self.entity(handle)?;
        self.world.get::<Transform>(entity).map(|t| t.position.into())
    }

    pub fn entity_count(&self) -> usize {
        self.world.entities().len() as usize
    }

    fn entity(&self, handle: EntityHandle) -> Option<Entity> {
        Entity::try_from_bits(handle.to_bits()).ok()
    }
}

impl TransformHost for HostWorld {
    fn is_alive(&self, handle: EntityHandle) -> bool {
        self.entity(handle)
            .is_some_and(|entity| self.world.get::<Transform>(entity).is_some())
    }

    fn get_position(&self, handle: EntityHandle) -> Result<(f64, f64, f64), InvalidHandle> {
        let position = self
            .entity(handle)
            .and_then(|entity| self.world.get::<Transform>(entity))
            .ok_or(InvalidHandle(handle))?
            .position;
        Ok((position.x, position.y, position.z))
    }

    fn set_position(
        &mut self,
        handle: EntityHandle,
        x: f64,
        y: f64,
        z: f64,
    ) -> Result<(), InvalidHandle> {
        let entity = self.entity(handle).ok_or(InvalidHandle(handle))?;
        let mut transform =
            self.world.get_mut::<Transform>(entity).ok_or(InvalidHandle(handle))?;
        transform.position = DVec3::new(x, y, z);
        Ok(())
    }
}
