//! Registry of live draw objects and the pool resources they hold.

use std::collections::BTreeMap;

use kestrel_core::{DrawObject, ObjectId, PipelineId, PipelineModifier};
use kestrel_gpu::{PoolHandle, RegionHandle};

/// Pool resources an object holds in one frame slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlotResources {
    pub object_set: PoolHandle,
    /// One set per primitive, reserved up front for the object's lifetime.
    pub primitive_sets: Vec<PoolHandle>,
    pub region: RegionHandle,
}

impl SlotResources {
    /// Every descriptor set handle, for releasing in one call.
    pub fn pool_handles(&self) -> Vec<PoolHandle> {
        std::iter::once(self.object_set)
            .chain(self.primitive_sets.iter().copied())
            .collect()
    }
}

#[derive(Clone, Debug)]
pub struct SceneEntry {
    pub object: DrawObject,
    /// Indexed by frame slot.
    pub slots: Vec<SlotResources>,
    /// Queued for deletion; never drawn again.
    pub marked: bool,
    pub stenciled: bool,
    /// Needs a bottom-level acceleration structure (re)build.
    pub geometry_dirty: bool,
}

impl SceneEntry {
    pub fn new(object: DrawObject, slots: Vec<SlotResources>) -> Self {
        Self {
            object,
            slots,
            marked: false,
            stenciled: false,
            geometry_dirty: true,
        }
    }

    /// Drawn this tick.
    pub fn is_drawable(&self) -> bool {
        self.object.visible && !self.marked
    }

    /// Primitive sets reserved per slot.
    pub fn primitive_capacity(&self) -> usize {
        self.slots.first().map_or(0, |s| s.primitive_sets.len())
    }

    /// Pipeline variant the object is drawn with.
    pub fn pipeline_id(&self, wireframe: bool) -> PipelineId {
        let modifier = if self.stenciled {
            PipelineModifier::Stencil
        } else if wireframe {
            PipelineModifier::Wireframe
        } else {
            PipelineModifier::None
        };
        PipelineId::new(self.object.kind, modifier)
    }
}

/// Live objects ordered by id, so draw order is stable across ticks.
#[derive(Debug, Default)]
pub struct Scene {
    entries: BTreeMap<ObjectId, SceneEntry>,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `entry`, failing if the id is taken.
    pub fn insert(&mut self, entry: SceneEntry) -> kestrel_core::Result<()> {
        let id = entry.object.id;
        if self.entries.contains_key(&id) {
            return Err(kestrel_core::Error::DuplicateObject(id));
        }
        self.entries.insert(id, entry);
        Ok(())
    }

    pub fn get(&self, id: ObjectId) -> Option<&SceneEntry> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut SceneEntry> {
        self.entries.get_mut(&id)
    }

    /// Entry that still accepts updates.
    pub fn live_mut(&mut self, id: ObjectId) -> kestrel_core::Result<&mut SceneEntry> {
        self.entries
            .get_mut(&id)
            .filter(|e| !e.marked)
            .ok_or(kestrel_core::Error::UnknownObject(id))
    }

    pub fn remove(&mut self, id: ObjectId) -> Option<SceneEntry> {
        self.entries.remove(&id)
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SceneEntry> {
        self.entries.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut SceneEntry> {
        self.entries.values_mut()
    }

    pub fn drawable(&self) -> impl Iterator<Item = &SceneEntry> {
        self.entries.values().filter(|e| e.is_drawable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::{MeshRef, PipelineKind};
    use kestrel_gpu::{FrequencyClass, vk};

    fn entry(id: u64) -> SceneEntry {
        SceneEntry::new(DrawObject::new(ObjectId(id), MeshRef::default()), Vec::new())
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut scene = Scene::new();
        scene.insert(entry(1)).unwrap();
        assert_eq!(
            scene.insert(entry(1)),
            Err(kestrel_core::Error::DuplicateObject(ObjectId(1)))
        );
        assert_eq!(scene.len(), 1);
    }

    #[test]
    fn marked_objects_are_not_drawable_or_updatable() {
        let mut scene = Scene::new();
        scene.insert(entry(2)).unwrap();
        scene.insert(entry(1)).unwrap();
        scene.get_mut(ObjectId(2)).unwrap().marked = true;

        let drawn: Vec<_> = scene.drawable().map(|e| e.object.id).collect();
        assert_eq!(drawn, vec![ObjectId(1)]);
        assert!(scene.live_mut(ObjectId(2)).is_err());
        assert!(scene.live_mut(ObjectId(1)).is_ok());
    }

    #[test]
    fn stencil_wins_over_wireframe() {
        let mut e = entry(1);
        assert_eq!(
            e.pipeline_id(true),
            PipelineId::new(PipelineKind::Color, PipelineModifier::Wireframe)
        );
        e.stenciled = true;
        assert_eq!(
            e.pipeline_id(true),
            PipelineId::new(PipelineKind::Color, PipelineModifier::Stencil)
        );
    }

    #[test]
    fn pool_handles_include_every_set() {
        use ash::vk::Handle;
        let handle = |raw, class| PoolHandle {
            set: vk::DescriptorSet::from_raw(raw),
            class,
            frame: 0,
        };
        let resources = SlotResources {
            object_set: handle(1, FrequencyClass::PerObject),
            primitive_sets: vec![
                handle(2, FrequencyClass::PerPrimitive),
                handle(3, FrequencyClass::PerPrimitive),
            ],
            region: RegionHandle {
                offset: 0,
                size: 144,
                capacity: 256,
                frame: 0,
            },
        };
        assert_eq!(resources.pool_handles().len(), 3);
    }
}
