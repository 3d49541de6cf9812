//! Descriptor set layouts and pools for the frequency classes.

use ash::vk;

use crate::error::Result;
use crate::pool::{FrequencyClass, PoolConfig};

/// Descriptor set layout builder.
#[derive(Default)]
pub struct DescriptorSetLayoutBuilder<'a> {
    bindings: Vec<vk::DescriptorSetLayoutBinding<'a>>,
}

impl DescriptorSetLayoutBuilder<'_> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a single-descriptor binding.
    pub fn binding(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        stage_flags: vk::ShaderStageFlags,
    ) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(descriptor_type)
                .descriptor_count(1)
                .stage_flags(stage_flags),
        );
        self
    }

    pub fn descriptor_types(&self) -> impl Iterator<Item = vk::DescriptorType> + '_ {
        self.bindings.iter().map(|b| b.descriptor_type)
    }

    /// # Safety
    /// The device must be valid.
    pub unsafe fn build(&self, device: &ash::Device) -> Result<vk::DescriptorSetLayout> {
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&self.bindings);
        Ok(unsafe { device.create_descriptor_set_layout(&layout_info, None) }?)
    }
}

/// Layout of each frequency class.
///
/// Low frequency carries the camera uniforms and, with ray tracing, the
/// top-level structure. Per object points at the object's transform region.
/// Per primitive carries a material's parameters and texture.
pub fn class_layout<'a>(class: FrequencyClass, ray_tracing: bool) -> DescriptorSetLayoutBuilder<'a> {
    let graphics = vk::ShaderStageFlags::ALL_GRAPHICS;
    match class {
        FrequencyClass::LowFrequency => {
            let builder =
                DescriptorSetLayoutBuilder::new().binding(0, vk::DescriptorType::UNIFORM_BUFFER, graphics);
            if ray_tracing {
                builder.binding(
                    1,
                    vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
                    vk::ShaderStageFlags::FRAGMENT,
                )
            } else {
                builder
            }
        }
        FrequencyClass::PerObject => {
            DescriptorSetLayoutBuilder::new().binding(0, vk::DescriptorType::UNIFORM_BUFFER, graphics)
        }
        FrequencyClass::PerPrimitive => DescriptorSetLayoutBuilder::new()
            .binding(0, vk::DescriptorType::UNIFORM_BUFFER, graphics)
            .binding(
                1,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                vk::ShaderStageFlags::FRAGMENT,
            ),
    }
}

/// Descriptor counts and set count for one pool holding every class for
/// `frames` slots.
pub fn pool_sizes(
    config: &PoolConfig,
    frames: u32,
    ray_tracing: bool,
) -> (u32, Vec<vk::DescriptorPoolSize>) {
    let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
    let mut max_sets = 0;
    for class in FrequencyClass::ALL {
        let sets = config.cap(class) * frames;
        max_sets += sets;
        for ty in class_layout(class, ray_tracing).descriptor_types() {
            match sizes.iter_mut().find(|s| s.ty == ty) {
                Some(size) => size.descriptor_count += sets,
                None => sizes.push(vk::DescriptorPoolSize {
                    ty,
                    descriptor_count: sets,
                }),
            }
        }
    }
    (max_sets, sizes)
}

/// The descriptor pool backing a resource pool, plus one layout per class.
pub struct ClassDescriptors {
    pool: vk::DescriptorPool,
    layouts: [vk::DescriptorSetLayout; 3],
}

impl ClassDescriptors {
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(
        device: &ash::Device,
        config: &PoolConfig,
        frames: u32,
        ray_tracing: bool,
    ) -> Result<Self> {
        let mut layouts = [vk::DescriptorSetLayout::null(); 3];
        for (i, class) in FrequencyClass::ALL.into_iter().enumerate() {
            match unsafe { class_layout(class, ray_tracing).build(device) } {
                Ok(layout) => layouts[i] = layout,
                Err(e) => {
                    for &layout in &layouts[..i] {
                        unsafe { device.destroy_descriptor_set_layout(layout, None) };
                    }
                    return Err(e);
                }
            }
        }

        let (max_sets, sizes) = pool_sizes(config, frames, ray_tracing);
        // Sets live for the whole run, so no FREE_DESCRIPTOR_SET.
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(&sizes);
        let pool = match unsafe { device.create_descriptor_pool(&create_info, None) } {
            Ok(pool) => pool,
            Err(e) => {
                for layout in layouts {
                    unsafe { device.destroy_descriptor_set_layout(layout, None) };
                }
                return Err(e.into());
            }
        };

        tracing::debug!("Descriptor pool: {max_sets} sets across {} types", sizes.len());
        Ok(Self { pool, layouts })
    }

    pub fn layout(&self, class: FrequencyClass) -> vk::DescriptorSetLayout {
        self.layouts[class.index()]
    }

    /// # Safety
    /// The device must be valid.
    pub unsafe fn allocate(
        &self,
        device: &ash::Device,
        class: FrequencyClass,
        count: u32,
    ) -> Result<Vec<vk::DescriptorSet>> {
        let layouts = vec![self.layout(class); count as usize];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(&layouts);
        Ok(unsafe { device.allocate_descriptor_sets(&alloc_info) }?)
    }

    /// # Safety
    /// No set from the pool may still be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_descriptor_pool(self.pool, None);
            for &layout in &self.layouts {
                device.destroy_descriptor_set_layout(layout, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count_of(sizes: &[vk::DescriptorPoolSize], ty: vk::DescriptorType) -> u32 {
        sizes
            .iter()
            .find(|s| s.ty == ty)
            .map_or(0, |s| s.descriptor_count)
    }

    #[test]
    fn pool_sizes_cover_every_class() {
        let config = PoolConfig::default();
        let (max_sets, sizes) = pool_sizes(&config, 3, false);
        assert_eq!(max_sets, 3 * (1 + 1000 + 2000));
        assert_eq!(
            count_of(&sizes, vk::DescriptorType::UNIFORM_BUFFER),
            3 * (1 + 1000 + 2000)
        );
        assert_eq!(
            count_of(&sizes, vk::DescriptorType::COMBINED_IMAGE_SAMPLER),
            3 * 2000
        );
        assert_eq!(
            count_of(&sizes, vk::DescriptorType::ACCELERATION_STRUCTURE_KHR),
            0
        );
    }

    #[test]
    fn ray_tracing_adds_structure_binding() {
        let (_, sizes) = pool_sizes(&PoolConfig::default(), 2, true);
        assert_eq!(
            count_of(&sizes, vk::DescriptorType::ACCELERATION_STRUCTURE_KHR),
            2
        );
    }
}
