// Scene lighting
//
// A small consumer of the RHI: keeps up to MAX_LIGHTS lights and mirrors
// them into a host-visible uniform buffer once per frame.

pub mod light;

pub use light::{
    DirectionalLight, Light, LightBuffer, LightData, LightType, PointLight, SpotLight, MAX_LIGHTS,
};

use crate::rhi::{Buffer, BufferDesc, BufferUsage, GraphicsDevice, MemoryUsage, RhiResult};

/// Stable name for a light in a `Scene`, valid until it is removed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LightHandle(u64);

/// What `Scene::update_light_buffer` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightBufferUpdate {
    /// The full block was written
    Uploaded,
    /// `initialize_light_buffer` has not run; nothing was written
    NotInitialized,
}

#[derive(Default)]
pub struct Scene {
    lights: Vec<(LightHandle, Light)>,
    next_handle: u64,
    light_buffer: Option<Buffer>,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `None` and leaves the scene untouched once it holds MAX_LIGHTS
    pub fn add_light(&mut self, light: impl Into<Light>) -> Option<LightHandle> {
        if self.lights.len() >= MAX_LIGHTS {
            log::warn!("Cannot add light: maximum of {} lights reached", MAX_LIGHTS);
            return None;
        }
        let handle = LightHandle(self.next_handle);
        self.next_handle += 1;
        self.lights.push((handle, light.into()));
        log::info!("Added light, total count: {}", self.lights.len());
        Some(handle)
    }

    pub fn remove_light(&mut self, handle: LightHandle) -> Option<Light> {
        let index = self.lights.iter().position(|(h, _)| *h == handle)?;
        let (_, light) = self.lights.remove(index);
        log::info!("Removed light, remaining count: {}", self.lights.len());
        Some(light)
    }

    pub fn clear_lights(&mut self) {
        self.lights.clear();
    }

    pub fn light(&self, handle: LightHandle) -> Option<&Light> {
        self.lights.iter().find(|(h, _)| *h == handle).map(|(_, l)| l)
    }

    pub fn light_mut(&mut self, handle: LightHandle) -> Option<&mut Light> {
        self.lights
            .iter_mut()
            .find(|(h, _)| *h == handle)
            .map(|(_, l)| l)
    }

    /// Lights in insertion order
    pub fn lights(&self) -> impl Iterator<Item = &Light> {
        self.lights.iter().map(|(_, light)| light)
    }

    pub fn light_count(&self) -> usize {
        self.lights.len()
    }

    pub fn has_lights(&self) -> bool {
        !self.lights.is_empty()
    }

    /// Create the uniform buffer the lights are mirrored into. Calling it
    /// again keeps the existing buffer.
    pub fn initialize_light_buffer(&mut self, device: &GraphicsDevice) -> RhiResult<&Buffer> {
        let buffer = match self.light_buffer.take() {
            Some(buffer) => buffer,
            None => {
                let desc =
                    BufferDesc::new(LightBuffer::SIZE, BufferUsage::UNIFORM, MemoryUsage::CpuToGpu)
                        .with_label("light buffer");
                let buffer = device.create_buffer(&desc)?;
                log::info!("Light buffer created: {} bytes", LightBuffer::SIZE);
                buffer
            }
        };
        Ok(self.light_buffer.insert(buffer))
    }

    pub fn light_buffer(&self) -> Option<&Buffer> {
        self.light_buffer.as_ref()
    }

    /// The current lights packed into the uniform block layout
    pub fn gpu_data(&self) -> LightBuffer {
        LightBuffer::from_lights(self.lights())
    }

    /// Call once per frame before recording work that reads the lights
    pub fn update_light_buffer(&self) -> RhiResult<LightBufferUpdate> {
        let Some(buffer) = &self.light_buffer else {
            log::warn!("Light buffer not initialized");
            return Ok(LightBufferUpdate::NotInitialized);
        };
        buffer.copy_data(self.gpu_data().as_bytes())?;
        Ok(LightBufferUpdate::Uploaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn seventeenth_light_is_rejected() {
        let mut scene = Scene::new();
        for i in 0..MAX_LIGHTS {
            let position = Vec3::new(i as f32, 0.0, 0.0);
            assert!(scene
                .add_light(PointLight::new(position, 5.0, Vec3::ONE, 1.0))
                .is_some());
        }
        let before: Vec<Light> = scene.lights().cloned().collect();

        assert_eq!(scene.add_light(SpotLight::default()), None);
        assert_eq!(scene.light_count(), MAX_LIGHTS);
        assert_eq!(scene.lights().cloned().collect::<Vec<_>>(), before);
    }

    #[test]
    fn handles_survive_removal_of_others() {
        let mut scene = Scene::new();
        let a = scene.add_light(DirectionalLight::default()).unwrap();
        let b = scene.add_light(PointLight::default()).unwrap();
        assert!(scene.remove_light(a).is_some());
        assert!(scene.remove_light(a).is_none());
        assert_eq!(scene.light(b).map(Light::light_type), Some(LightType::Point));

        scene.light_mut(b).unwrap().set_intensity(4.0);
        assert_eq!(scene.gpu_data().lights[0].color_and_intensity[3], 4.0);

        scene.clear_lights();
        assert!(!scene.has_lights());
        assert_eq!(scene.gpu_data().light_count, 0);
    }

    #[test]
    fn update_without_buffer_is_a_no_op() {
        let mut scene = Scene::new();
        scene.add_light(PointLight::default());
        assert_eq!(
            scene.update_light_buffer(),
            Ok(LightBufferUpdate::NotInitialized)
        );
        assert!(scene.light_buffer().is_none());
    }
}
