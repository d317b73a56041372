// Lights and their GPU layout
//
// `LightData` and `LightBuffer` mirror the std140 uniform block the shaders
// declare:
//
//   struct Light { vec4 positionAndType; vec4 directionAndRange;
//                  vec4 colorAndIntensity; vec4 spotAngles; };
//   uniform Lights { uint count; Light lights[16]; };
//
// The CPU-side lights are a closed enum; each variant fills the record its
// own way and leaves the fields it does not use at zero.

use std::mem::{offset_of, size_of};

use bytemuck::{Pod, Zeroable};
use glam::Vec3;

/// Lights one `LightBuffer` can hold
pub const MAX_LIGHTS: usize = 16;

const MIN_RANGE: f32 = 0.01;
const DEFAULT_RANGE: f32 = 10.0;
const DEFAULT_ATTENUATION: (f32, f32) = (1.0, 0.09);
const DEFAULT_CONE_DEGREES: (f32, f32) = (12.5, 17.5);
const DEFAULT_DIRECTION: Vec3 = Vec3::NEG_Y;

/// Type code stored in `position_and_type.w`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum LightType {
    Directional = 0,
    Point = 1,
    Spot = 2,
}

/// One light as the shader reads it
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct LightData {
    /// xyz position (world space), w type code
    pub position_and_type: [f32; 4],
    /// xyz normalized direction, w range
    pub direction_and_range: [f32; 4],
    /// rgb color, w intensity
    pub color_and_intensity: [f32; 4],
    /// inner cone, outer cone (radians), attenuation constant, attenuation linear
    pub spot_angles: [f32; 4],
}

/// Complete uniform block: count, padding to 16 bytes, fixed light array
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct LightBuffer {
    pub light_count: u32,
    pub _padding: [u32; 3],
    pub lights: [LightData; MAX_LIGHTS],
}

const _: () = assert!(size_of::<LightData>() == 64);
const _: () = assert!(size_of::<LightBuffer>() == 1040);
const _: () = assert!(offset_of!(LightBuffer, lights) == 16);
const _: () = assert!(offset_of!(LightData, spot_angles) == 48);

impl Default for LightBuffer {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl LightBuffer {
    pub const SIZE: u64 = size_of::<LightBuffer>() as u64;

    /// Pack up to `MAX_LIGHTS` lights; extras are ignored
    pub fn from_lights<'a>(lights: impl IntoIterator<Item = &'a Light>) -> Self {
        let mut buffer = Self::default();
        for (slot, light) in buffer.lights.iter_mut().zip(lights) {
            *slot = light.to_gpu_data();
            buffer.light_count += 1;
        }
        buffer
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    /// Reinterpret a byte image read back from the GPU. `None` when the
    /// length is wrong.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        bytemuck::try_pod_read_unaligned(bytes).ok()
    }

    /// The records that are in use
    pub fn active(&self) -> &[LightData] {
        let count = (self.light_count as usize).min(MAX_LIGHTS);
        &self.lights[..count]
    }
}

fn normalized(direction: Vec3) -> Vec3 {
    direction.try_normalize().unwrap_or_else(|| {
        log::warn!("Light direction {:?} cannot be normalized, using -Y", direction);
        DEFAULT_DIRECTION
    })
}

fn clamp_attenuation(constant: f32, linear: f32) -> (f32, f32) {
    (constant.max(0.0), linear.max(0.0))
}

// =============================================================================
// LIGHT KINDS
// =============================================================================

/// Parallel rays, like the sun
#[derive(Debug, Clone, PartialEq)]
pub struct DirectionalLight {
    direction: Vec3,
    color: Vec3,
    intensity: f32,
}

impl Default for DirectionalLight {
    fn default() -> Self {
        Self::new(DEFAULT_DIRECTION, Vec3::ONE, 1.0)
    }
}

impl DirectionalLight {
    pub fn new(direction: Vec3, color: Vec3, intensity: f32) -> Self {
        Self {
            direction: normalized(direction),
            color,
            intensity: intensity.max(0.0),
        }
    }

    pub fn direction(&self) -> Vec3 {
        self.direction
    }

    pub fn set_direction(&mut self, direction: Vec3) {
        self.direction = normalized(direction);
    }
}

/// Omnidirectional with a finite range, like a bulb
#[derive(Debug, Clone, PartialEq)]
pub struct PointLight {
    position: Vec3,
    range: f32,
    attenuation: (f32, f32),
    color: Vec3,
    intensity: f32,
}

impl Default for PointLight {
    fn default() -> Self {
        Self::new(Vec3::ZERO, DEFAULT_RANGE, Vec3::ONE, 1.0)
    }
}

impl PointLight {
    pub fn new(position: Vec3, range: f32, color: Vec3, intensity: f32) -> Self {
        Self {
            position,
            range: range.max(MIN_RANGE),
            attenuation: DEFAULT_ATTENUATION,
            color,
            intensity: intensity.max(0.0),
        }
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn set_position(&mut self, position: Vec3) {
        self.position = position;
    }

    pub fn range(&self) -> f32 {
        self.range
    }

    pub fn set_range(&mut self, range: f32) {
        self.range = range.max(MIN_RANGE);
    }

    /// (constant, linear)
    pub fn attenuation(&self) -> (f32, f32) {
        self.attenuation
    }

    pub fn set_attenuation(&mut self, constant: f32, linear: f32) {
        self.attenuation = clamp_attenuation(constant, linear);
    }
}

/// A cone of light, like a flashlight. Cone angles are given in degrees and
/// stored in radians.
#[derive(Debug, Clone, PartialEq)]
pub struct SpotLight {
    position: Vec3,
    direction: Vec3,
    inner_cone: f32,
    outer_cone: f32,
    range: f32,
    attenuation: (f32, f32),
    color: Vec3,
    intensity: f32,
}

impl Default for SpotLight {
    fn default() -> Self {
        Self::new(
            Vec3::ZERO,
            DEFAULT_DIRECTION,
            DEFAULT_CONE_DEGREES.0,
            DEFAULT_CONE_DEGREES.1,
            DEFAULT_RANGE,
            Vec3::ONE,
            1.0,
        )
    }
}

impl SpotLight {
    pub fn new(
        position: Vec3,
        direction: Vec3,
        inner_degrees: f32,
        outer_degrees: f32,
        range: f32,
        color: Vec3,
        intensity: f32,
    ) -> Self {
        let mut light = Self {
            position,
            direction: normalized(direction),
            inner_cone: 0.0,
            outer_cone: 0.0,
            range: range.max(MIN_RANGE),
            attenuation: DEFAULT_ATTENUATION,
            color,
            intensity: intensity.max(0.0),
        };
        light.set_cone_angles(inner_degrees, outer_degrees);
        light
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn set_position(&mut self, position: Vec3) {
        self.position = position;
    }

    pub fn direction(&self) -> Vec3 {
        self.direction
    }

    pub fn set_direction(&mut self, direction: Vec3) {
        self.direction = normalized(direction);
    }

    /// (inner, outer) in degrees
    pub fn cone_angles(&self) -> (f32, f32) {
        (self.inner_cone.to_degrees(), self.outer_cone.to_degrees())
    }

    /// The outer cone must be the wider one; reversed angles are swapped
    pub fn set_cone_angles(&mut self, inner_degrees: f32, outer_degrees: f32) {
        let (mut inner, mut outer) = (inner_degrees.to_radians(), outer_degrees.to_radians());
        if outer < inner {
            log::warn!("SpotLight: outer cone angle was smaller than inner, swapped values");
            std::mem::swap(&mut inner, &mut outer);
        }
        self.inner_cone = inner;
        self.outer_cone = outer;
    }

    pub fn range(&self) -> f32 {
        self.range
    }

    pub fn set_range(&mut self, range: f32) {
        self.range = range.max(MIN_RANGE);
    }

    pub fn attenuation(&self) -> (f32, f32) {
        self.attenuation
    }

    pub fn set_attenuation(&mut self, constant: f32, linear: f32) {
        self.attenuation = clamp_attenuation(constant, linear);
    }
}

// =============================================================================
// LIGHT
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Light {
    Directional(DirectionalLight),
    Point(PointLight),
    Spot(SpotLight),
}

impl From<DirectionalLight> for Light {
    fn from(light: DirectionalLight) -> Self {
        Light::Directional(light)
    }
}

impl From<PointLight> for Light {
    fn from(light: PointLight) -> Self {
        Light::Point(light)
    }
}

impl From<SpotLight> for Light {
    fn from(light: SpotLight) -> Self {
        Light::Spot(light)
    }
}

impl Light {
    pub fn light_type(&self) -> LightType {
        match self {
            Light::Directional(_) => LightType::Directional,
            Light::Point(_) => LightType::Point,
            Light::Spot(_) => LightType::Spot,
        }
    }

    pub fn color(&self) -> Vec3 {
        match self {
            Light::Directional(l) => l.color,
            Light::Point(l) => l.color,
            Light::Spot(l) => l.color,
        }
    }

    pub fn set_color(&mut self, color: Vec3) {
        match self {
            Light::Directional(l) => l.color = color,
            Light::Point(l) => l.color = color,
            Light::Spot(l) => l.color = color,
        }
    }

    pub fn intensity(&self) -> f32 {
        match self {
            Light::Directional(l) => l.intensity,
            Light::Point(l) => l.intensity,
            Light::Spot(l) => l.intensity,
        }
    }

    /// Negative intensities clamp to zero
    pub fn set_intensity(&mut self, intensity: f32) {
        let intensity = intensity.max(0.0);
        match self {
            Light::Directional(l) => l.intensity = intensity,
            Light::Point(l) => l.intensity = intensity,
            Light::Spot(l) => l.intensity = intensity,
        }
    }

    pub fn to_gpu_data(&self) -> LightData {
        let ty = self.light_type() as u32 as f32;
        let color = self.color().extend(self.intensity()).to_array();
        match self {
            Light::Directional(l) => LightData {
                position_and_type: [0.0, 0.0, 0.0, ty],
                direction_and_range: l.direction.extend(0.0).to_array(),
                color_and_intensity: color,
                spot_angles: [0.0; 4],
            },
            Light::Point(l) => LightData {
                position_and_type: l.position.extend(ty).to_array(),
                direction_and_range: [0.0, 0.0, 0.0, l.range],
                color_and_intensity: color,
                spot_angles: [0.0, 0.0, l.attenuation.0, l.attenuation.1],
            },
            Light::Spot(l) => LightData {
                position_and_type: l.position.extend(ty).to_array(),
                direction_and_range: l.direction.extend(l.range).to_array(),
                color_and_intensity: color,
                spot_angles: [l.inner_cone, l.outer_cone, l.attenuation.0, l.attenuation.1],
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_layout_matches_uniform_block() {
        assert_eq!(LightBuffer::SIZE, 1040);
        assert_eq!(offset_of!(LightBuffer, lights), 16);
        assert_eq!(offset_of!(LightData, direction_and_range), 16);
        assert_eq!(offset_of!(LightData, color_and_intensity), 32);
    }

    #[test]
    fn setters_clamp() {
        let mut point = PointLight::new(Vec3::ZERO, -5.0, Vec3::ONE, 1.0);
        assert_eq!(point.range(), 0.01);
        point.set_attenuation(-1.0, -0.5);
        assert_eq!(point.attenuation(), (0.0, 0.0));

        let mut light = Light::from(point);
        light.set_intensity(-3.0);
        assert_eq!(light.intensity(), 0.0);
    }

    #[test]
    fn reversed_cone_angles_are_swapped() {
        let spot = SpotLight::new(Vec3::ZERO, Vec3::X, 30.0, 10.0, 5.0, Vec3::ONE, 1.0);
        let (inner, outer) = spot.cone_angles();
        assert!((inner - 10.0).abs() < 1e-4);
        assert!((outer - 30.0).abs() < 1e-4);
    }

    #[test]
    fn spot_constructor_sets_range_color_and_intensity() {
        let spot = SpotLight::new(
            Vec3::ZERO,
            Vec3::NEG_Y,
            10.0,
            20.0,
            -1.0,
            Vec3::new(1.0, 0.5, 0.25),
            -2.0,
        );
        assert_eq!(spot.range(), MIN_RANGE);

        let light = Light::from(spot);
        assert_eq!(light.color(), Vec3::new(1.0, 0.5, 0.25));
        assert_eq!(light.intensity(), 0.0);
        assert_eq!(light.to_gpu_data().color_and_intensity, [1.0, 0.5, 0.25, 0.0]);
    }

    #[test]
    fn directions_are_normalized() {
        let sun = DirectionalLight::new(Vec3::new(0.0, -4.0, 3.0), Vec3::ONE, 1.0);
        assert!((sun.direction().length() - 1.0).abs() < 1e-6);

        // A zero vector has no direction; fall back instead of producing NaN
        let broken = DirectionalLight::new(Vec3::ZERO, Vec3::ONE, 1.0);
        assert_eq!(broken.direction(), Vec3::NEG_Y);
    }

    #[test]
    fn defaults() {
        let spot = SpotLight::default();
        assert_eq!(spot.range(), 10.0);
        assert_eq!(spot.attenuation(), (1.0, 0.09));
        let data = Light::Spot(spot).to_gpu_data();
        assert!((data.spot_angles[0] - 12.5f32.to_radians()).abs() < 1e-6);
        assert!((data.spot_angles[1] - 17.5f32.to_radians()).abs() < 1e-6);
    }

    #[test]
    fn gpu_records_per_kind() {
        let sun = Light::from(DirectionalLight::new(Vec3::NEG_Z, Vec3::new(1.0, 0.9, 0.8), 2.0));
        let data = sun.to_gpu_data();
        assert_eq!(data.position_and_type, [0.0, 0.0, 0.0, 0.0]);
        assert_eq!(data.direction_and_range, [0.0, 0.0, -1.0, 0.0]);
        assert_eq!(data.color_and_intensity, [1.0, 0.9, 0.8, 2.0]);
        assert_eq!(data.spot_angles, [0.0; 4]);

        let bulb = Light::from(PointLight::new(Vec3::new(1.0, 2.0, 3.0), 5.0, Vec3::ONE, 1.0));
        let data = bulb.to_gpu_data();
        assert_eq!(data.position_and_type, [1.0, 2.0, 3.0, 1.0]);
        assert_eq!(data.direction_and_range, [0.0, 0.0, 0.0, 5.0]);
        assert_eq!(data.spot_angles, [0.0, 0.0, 1.0, 0.09]);

        let spot = Light::from(SpotLight::default());
        assert_eq!(spot.to_gpu_data().position_and_type[3], 2.0);
    }

    #[test]
    fn packing_stops_at_capacity() {
        let lights: Vec<Light> = (0..20).map(|_| PointLight::default().into()).collect();
        let buffer = LightBuffer::from_lights(&lights);
        assert_eq!(buffer.light_count, MAX_LIGHTS as u32);
        assert_eq!(buffer.active().len(), MAX_LIGHTS);
    }

    #[test]
    fn bytes_decode_to_the_same_block() {
        let lights = [Light::from(SpotLight::default()), PointLight::default().into()];
        let buffer = LightBuffer::from_lights(&lights);
        let decoded = LightBuffer::from_bytes(buffer.as_bytes());
        assert_eq!(decoded, Some(buffer));
        assert_eq!(LightBuffer::from_bytes(&[0u8; 12]), None);
    }
}
