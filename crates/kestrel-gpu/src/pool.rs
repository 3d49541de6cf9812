//! Fixed-capacity descriptor set and transform region pool.
//!
//! Everything is reserved once at startup as `frame slots x per-frame caps`
//! and never grows. Handles are checked out per frame slot and returned
//! through [`ResourcePool::release`] once the deferred-deletion protocol
//! has proven the GPU no longer reads them. Running out is a configuration
//! error, reported as [`GpuError::PoolExhausted`].

use ash::vk;
use gpu_allocator::MemoryLocation;
use hashbrown::HashSet;
use serde::{Deserialize, Serialize};

use crate::device::{DeviceBuffer, GpuDevice};
use crate::error::{GpuError, Result};
use crate::region::{Region, RegionAllocator};

/// Update frequency of a descriptor set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrequencyClass {
    /// Bound once per frame: camera, lighting, acceleration structure.
    LowFrequency,
    /// One per drawable object.
    PerObject,
    /// One per primitive (material group) of a drawable.
    PerPrimitive,
}

impl FrequencyClass {
    pub const ALL: [Self; 3] = [Self::LowFrequency, Self::PerObject, Self::PerPrimitive];

    pub(crate) const fn index(self) -> usize {
        match self {
            Self::LowFrequency => 0,
            Self::PerObject => 1,
            Self::PerPrimitive => 2,
        }
    }
}

/// Per-frame-slot capacities.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub low_frequency_per_frame: u32,
    pub per_object_per_frame: u32,
    pub per_primitive_per_frame: u32,
    /// Size of each slot's persistently-mapped transform buffer.
    pub transform_bytes_per_frame: u64,
    /// Power-of-two alignment of transform regions.
    pub transform_alignment: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            low_frequency_per_frame: 1,
            per_object_per_frame: 1000,
            per_primitive_per_frame: 2000,
            transform_bytes_per_frame: 256 * 1024,
            transform_alignment: 256,
        }
    }
}

impl PoolConfig {
    /// Capacity of `class` in each frame slot.
    pub const fn cap(&self, class: FrequencyClass) -> u32 {
        match class {
            FrequencyClass::LowFrequency => self.low_frequency_per_frame,
            FrequencyClass::PerObject => self.per_object_per_frame,
            FrequencyClass::PerPrimitive => self.per_primitive_per_frame,
        }
    }

    pub fn with_cap(mut self, class: FrequencyClass, cap: u32) -> Self {
        match class {
            FrequencyClass::LowFrequency => self.low_frequency_per_frame = cap,
            FrequencyClass::PerObject => self.per_object_per_frame = cap,
            FrequencyClass::PerPrimitive => self.per_primitive_per_frame = cap,
        }
        self
    }

    pub fn with_transform_bytes(mut self, bytes: u64) -> Self {
        self.transform_bytes_per_frame = bytes;
        self
    }
}

/// A descriptor set checked out of the pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PoolHandle {
    pub set: vk::DescriptorSet,
    pub class: FrequencyClass,
    pub frame: usize,
}

/// A transform region checked out of a frame slot's buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RegionHandle {
    pub offset: u64,
    pub size: u64,
    pub capacity: u64,
    pub frame: usize,
}

impl RegionHandle {
    const fn region(&self) -> Region {
        Region {
            offset: self.offset,
            size: self.size,
            capacity: self.capacity,
        }
    }
}

#[derive(Debug, Default)]
struct FreeList {
    free: Vec<vk::DescriptorSet>,
    reserved: HashSet<vk::DescriptorSet>,
    capacity: usize,
}

struct FrameResources {
    lists: [FreeList; 3],
    regions: RegionAllocator,
    transform_buffer: DeviceBuffer,
}

/// Pool of per-frame descriptor sets and transform regions.
pub struct ResourcePool {
    frames: Vec<FrameResources>,
    config: PoolConfig,
}

impl ResourcePool {
    /// Reserve every handle the pool will ever hand out.
    pub fn new<D: GpuDevice + ?Sized>(
        device: &mut D,
        frame_count: usize,
        config: &PoolConfig,
    ) -> Result<Self> {
        let mut frames = Vec::with_capacity(frame_count);
        for frame in 0..frame_count {
            let mut lists: [FreeList; 3] = Default::default();
            for class in FrequencyClass::ALL {
                let cap = config.cap(class);
                let sets = if cap == 0 {
                    Vec::new()
                } else {
                    device.allocate_descriptor_sets(class, cap)?
                };
                let list = &mut lists[class.index()];
                list.capacity = sets.len();
                // Pop order hands out the first allocated set first.
                list.free = sets.into_iter().rev().collect();
            }

            let transform_buffer = device.create_buffer(
                config.transform_bytes_per_frame.max(config.transform_alignment),
                vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                MemoryLocation::CpuToGpu,
                &format!("transform_arena_{frame}"),
            )?;
            let regions = RegionAllocator::new(
                config.transform_bytes_per_frame,
                config.transform_alignment,
            )?;

            frames.push(FrameResources {
                lists,
                regions,
                transform_buffer,
            });
        }

        tracing::info!(
            "Resource pool reserved: {} frame slots x [{} low, {} object, {} primitive] sets, {} KiB transforms",
            frame_count,
            config.low_frequency_per_frame,
            config.per_object_per_frame,
            config.per_primitive_per_frame,
            config.transform_bytes_per_frame / 1024,
        );

        Ok(Self {
            frames,
            config: config.clone(),
        })
    }

    fn frame(&self, frame: usize) -> Result<&FrameResources> {
        self.frames.get(frame).ok_or_else(|| {
            GpuError::invariant(format!(
                "frame slot {frame} out of range ({} slots)",
                self.frames.len()
            ))
        })
    }

    fn frame_mut(&mut self, frame: usize) -> Result<&mut FrameResources> {
        let len = self.frames.len();
        self.frames.get_mut(frame).ok_or_else(|| {
            GpuError::invariant(format!("frame slot {frame} out of range ({len} slots)"))
        })
    }

    /// Check out `count` descriptor sets of `class` for `frame`.
    ///
    /// Fails without side effects if fewer than `count` are free.
    pub fn reserve(
        &mut self,
        frame: usize,
        class: FrequencyClass,
        count: usize,
    ) -> Result<Vec<PoolHandle>> {
        let list = &mut self.frame_mut(frame)?.lists[class.index()];
        if list.free.len() < count {
            return Err(GpuError::PoolExhausted {
                class,
                frame,
                requested: count,
                available: list.free.len(),
            });
        }

        let at = list.free.len() - count;
        let sets: Vec<vk::DescriptorSet> = list.free.drain(at..).rev().collect();
        list.reserved.extend(sets.iter().copied());

        Ok(sets
            .into_iter()
            .map(|set| PoolHandle { set, class, frame })
            .collect())
    }

    /// Return descriptor sets to their free lists.
    ///
    /// Every handle must currently be reserved; otherwise nothing is
    /// released and an invariant violation is returned.
    pub fn release(&mut self, handles: &[PoolHandle]) -> Result<()> {
        let mut seen = HashSet::with_capacity(handles.len());
        for handle in handles {
            let list = &self.frame(handle.frame)?.lists[handle.class.index()];
            if !list.reserved.contains(&handle.set) || !seen.insert(*handle) {
                return Err(GpuError::invariant(format!(
                    "release of {:?} set {:?} in frame slot {} that is not reserved",
                    handle.class, handle.set, handle.frame
                )));
            }
        }

        for handle in handles {
            let list = &mut self.frame_mut(handle.frame)?.lists[handle.class.index()];
            list.reserved.remove(&handle.set);
            list.free.push(handle.set);
        }
        Ok(())
    }

    /// Check out a transform region of `size` bytes in `frame`'s buffer.
    pub fn reserve_region(&mut self, frame: usize, size: u64) -> Result<RegionHandle> {
        let regions = &mut self.frame_mut(frame)?.regions;
        let region = regions
            .allocate(size)
            .ok_or_else(|| GpuError::PoolExhausted {
                class: FrequencyClass::PerObject,
                frame,
                requested: usize::try_from(size).unwrap_or(usize::MAX),
                available: usize::try_from(regions.largest_free()).unwrap_or(usize::MAX),
            })?;
        Ok(RegionHandle {
            offset: region.offset,
            size: region.size,
            capacity: region.capacity,
            frame,
        })
    }

    /// Return a transform region.
    pub fn release_region(&mut self, handle: &RegionHandle) -> Result<()> {
        self.frame_mut(handle.frame)?
            .regions
            .release(&handle.region())
    }

    /// Copy `data` into a reserved region of its frame slot's buffer.
    pub fn write_region<D: GpuDevice + ?Sized>(
        &self,
        device: &mut D,
        handle: &RegionHandle,
        data: &[u8],
    ) -> Result<()> {
        if data.len() as u64 > handle.capacity {
            return Err(GpuError::InvalidState(format!(
                "{} bytes do not fit a region of {} bytes",
                data.len(),
                handle.capacity
            )));
        }
        let buffer = self.frame(handle.frame)?.transform_buffer;
        device.write_buffer(&buffer, handle.offset, data)
    }

    /// Verify that no descriptor set is both free and reserved, none is
    /// duplicated, and every slot accounts for its full capacity.
    pub fn check_exclusivity(&self) -> Result<()> {
        for (frame, resources) in self.frames.iter().enumerate() {
            for class in FrequencyClass::ALL {
                let list = &resources.lists[class.index()];
                let mut free = HashSet::with_capacity(list.free.len());
                for set in &list.free {
                    if !free.insert(*set) {
                        return Err(GpuError::invariant(format!(
                            "{class:?} set {set:?} listed free twice in frame slot {frame}"
                        )));
                    }
                    if list.reserved.contains(set) {
                        return Err(GpuError::invariant(format!(
                            "{class:?} set {set:?} both free and reserved in frame slot {frame}"
                        )));
                    }
                }
                if free.len() + list.reserved.len() != list.capacity {
                    return Err(GpuError::invariant(format!(
                        "{class:?} pool in frame slot {frame} holds {} sets, expected {}",
                        free.len() + list.reserved.len(),
                        list.capacity
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Fixed capacity of `class` in each frame slot.
    pub fn capacity(&self, class: FrequencyClass) -> usize {
        self.frames
            .first()
            .map_or(0, |f| f.lists[class.index()].capacity)
    }

    /// Free sets of `class` in `frame`.
    pub fn available(&self, frame: usize, class: FrequencyClass) -> usize {
        self.frames
            .get(frame)
            .map_or(0, |f| f.lists[class.index()].free.len())
    }

    /// Reserved sets of `class` in `frame`.
    pub fn reserved(&self, frame: usize, class: FrequencyClass) -> usize {
        self.frames
            .get(frame)
            .map_or(0, |f| f.lists[class.index()].reserved.len())
    }

    /// Whether `handle` is currently checked out.
    pub fn is_reserved(&self, handle: &PoolHandle) -> bool {
        self.frames
            .get(handle.frame)
            .is_some_and(|f| f.lists[handle.class.index()].reserved.contains(&handle.set))
    }

    /// Transform regions checked out in `frame`.
    pub fn region_count(&self, frame: usize) -> usize {
        self.frames
            .get(frame)
            .map_or(0, |f| f.regions.allocation_count())
    }

    /// Backing buffer of `frame`'s transform regions.
    pub fn transform_buffer(&self, frame: usize) -> Option<&DeviceBuffer> {
        self.frames.get(frame).map(|f| &f.transform_buffer)
    }

    /// Destroy the transform buffers. Descriptor sets go with their device pools.
    ///
    /// The device must be idle.
    pub fn destroy<D: GpuDevice + ?Sized>(self, device: &mut D) -> Result<()> {
        for frame in self.frames {
            device.destroy_buffer(frame.transform_buffer)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessDevice;

    fn pool(frames: usize, config: &PoolConfig) -> (HeadlessDevice, ResourcePool) {
        let mut device = HeadlessDevice::new(frames);
        let pool = ResourcePool::new(&mut device, frames, config).unwrap();
        (device, pool)
    }

    #[test]
    fn huge_region_request_is_exhaustion() {
        let (_device, mut pool) = pool(2, &PoolConfig::default());
        let err = pool.reserve_region(0, u64::MAX).unwrap_err();
        assert!(matches!(
            err,
            GpuError::PoolExhausted {
                class: FrequencyClass::PerObject,
                frame: 0,
                ..
            }
        ));
        assert_eq!(pool.region_count(0), 0);
    }

    #[test]
    fn per_object_cap_scenario() {
        let config = PoolConfig::default()
            .with_cap(FrequencyClass::LowFrequency, 1)
            .with_cap(FrequencyClass::PerObject, 1000);
        let (_device, mut pool) = pool(3, &config);

        let err = pool.reserve(0, FrequencyClass::PerObject, 1001).unwrap_err();
        assert!(matches!(
            err,
            GpuError::PoolExhausted {
                class: FrequencyClass::PerObject,
                frame: 0,
                requested: 1001,
                available: 1000,
            }
        ));
        // The failed request has no side effects.
        assert_eq!(pool.available(0, FrequencyClass::PerObject), 1000);

        let handles = pool.reserve(0, FrequencyClass::PerObject, 1000).unwrap();
        assert_eq!(handles.len(), 1000);
        assert_eq!(pool.available(0, FrequencyClass::PerObject), 0);
        pool.check_exclusivity().unwrap();

        pool.release(&handles[..1]).unwrap();
        let again = pool.reserve(0, FrequencyClass::PerObject, 1).unwrap();
        assert_eq!(again[0].set, handles[0].set);
        assert_eq!(pool.capacity(FrequencyClass::PerObject), 1000);
        pool.check_exclusivity().unwrap();
    }

    #[test]
    fn frame_slots_are_independent() {
        let (_device, mut pool) = pool(3, &PoolConfig::default());
        let cap = pool.capacity(FrequencyClass::PerObject);
        pool.reserve(1, FrequencyClass::PerObject, cap).unwrap();
        assert_eq!(pool.available(1, FrequencyClass::PerObject), 0);
        assert_eq!(pool.available(0, FrequencyClass::PerObject), cap);
        assert_eq!(pool.available(2, FrequencyClass::PerObject), cap);
        assert!(pool.reserve(1, FrequencyClass::PerObject, 1).is_err());
    }

    #[test]
    fn low_frequency_cap_is_one() {
        let (_device, mut pool) = pool(2, &PoolConfig::default());
        pool.reserve(0, FrequencyClass::LowFrequency, 1).unwrap();
        assert!(matches!(
            pool.reserve(0, FrequencyClass::LowFrequency, 1),
            Err(GpuError::PoolExhausted { .. })
        ));
    }

    #[test]
    fn double_release_is_rejected_atomically() {
        let (_device, mut pool) = pool(1, &PoolConfig::default());
        let handles = pool.reserve(0, FrequencyClass::PerPrimitive, 4).unwrap();
        pool.release(&handles[..2]).unwrap();

        let err = pool.release(&handles).unwrap_err();
        assert!(matches!(err, GpuError::InvariantViolation(_)));
        // Handles 2 and 3 are still reserved.
        assert!(pool.is_reserved(&handles[2]));
        assert!(pool.is_reserved(&handles[3]));
        pool.check_exclusivity().unwrap();
    }

    #[test]
    fn duplicate_handles_in_one_release_are_rejected() {
        let (_device, mut pool) = pool(1, &PoolConfig::default());
        let handles = pool.reserve(0, FrequencyClass::PerObject, 1).unwrap();
        let err = pool.release(&[handles[0], handles[0]]).unwrap_err();
        assert!(matches!(err, GpuError::InvariantViolation(_)));
        assert!(pool.is_reserved(&handles[0]));
    }

    #[test]
    fn exclusivity_holds_through_churn() {
        let (_device, mut pool) = pool(3, &PoolConfig::default());
        let mut held = Vec::new();
        for round in 0..50usize {
            let frame = round % 3;
            held.extend(pool.reserve(frame, FrequencyClass::PerObject, 7).unwrap());
            if round % 2 == 1 {
                let keep = held.split_off(held.len() / 2);
                pool.release(&held).unwrap();
                held = keep;
            }
            pool.check_exclusivity().unwrap();
        }
    }

    #[test]
    fn regions_are_pooled_per_frame() {
        let config = PoolConfig::default().with_transform_bytes(1024);
        let (mut device, mut pool) = pool(2, &config);

        let a = pool.reserve_region(0, 144).unwrap();
        let b = pool.reserve_region(0, 144).unwrap();
        assert_eq!((a.offset, b.offset), (0, 256));
        assert_eq!(pool.region_count(0), 2);
        assert_eq!(pool.region_count(1), 0);

        pool.write_region(&mut device, &b, &[7u8; 144]).unwrap();
        let buffer = *pool.transform_buffer(0).unwrap();
        assert_eq!(device.buffer_contents(&buffer).unwrap()[256], 7);

        pool.reserve_region(0, 256).unwrap();
        pool.reserve_region(0, 256).unwrap();
        assert!(matches!(
            pool.reserve_region(0, 1),
            Err(GpuError::PoolExhausted { frame: 0, .. })
        ));

        pool.release_region(&a).unwrap();
        assert!(pool.release_region(&a).is_err());
        assert_eq!(pool.reserve_region(0, 200).unwrap().offset, 0);
    }

    #[test]
    fn write_region_rejects_oversized_data() {
        let (mut device, mut pool) = pool(1, &PoolConfig::default());
        let region = pool.reserve_region(0, 16).unwrap();
        assert!(pool
            .write_region(&mut device, &region, &[0u8; 512])
            .is_err());
    }

    #[test]
    fn destroy_frees_transform_buffers() {
        let (mut device, pool) = pool(3, &PoolConfig::default());
        assert_eq!(device.live_buffer_count(), 3);
        pool.destroy(&mut device).unwrap();
        assert_eq!(device.live_buffer_count(), 0);
    }
}
