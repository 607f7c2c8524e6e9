// gpu/program.rs — Fragment programs of the reference device.
//
// A `Program` is the reference device's shader: a declared parameter list
// plus a pure function evaluated once per output pixel. The function sees
// only its fragment coordinate, the viewport size (`texSize`) and the
// uniforms bound for this call, which is exactly the fragment-shader
// compute model the keypoint kernels are written for:
//
//   for each output pixel (x, y):
//       out[x, y] = program.main(Fragment { x, y, texSize, uniforms })
//
// A program cannot observe other output pixels or keep state between
// pixels, so the output of a call is fully determined by its inputs.
//
// UNIFORM ACCESS
// ──────────────
// Uniforms are read by parameter index. Programs name their indices with
// local constants:
//
//   const IMAGE: usize = 0;
//   const THRESHOLD: usize = 1;
//   let t = frag.float(THRESHOLD);
//
// The `Kernel` wrapper validates argument kinds against the declared
// parameter list before the first pixel runs, so accessors never see a
// uniform of the wrong kind.

use crate::gpu::texture::Texture;

/// Signature of a fragment program's entry point.
pub type FragmentFn = fn(&Fragment<'_>) -> [u8; 4];

/// 3×3 matrix uniform, column-major. Opaque to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mat3(pub [f32; 9]);

impl Mat3 {
    pub const IDENTITY: Mat3 = Mat3([1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0]);

    /// Multiply a homogeneous point (x, y, 1) and dehomogenise.
    pub fn transform_point(&self, x: f32, y: f32) -> (f32, f32) {
        let m = &self.0;
        let u = m[0] * x + m[3] * y + m[6];
        let v = m[1] * x + m[4] * y + m[7];
        let w = m[2] * x + m[5] * y + m[8];
        (u / w, v / w)
    }
}

/// Kind of a declared parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Int,
    Float,
    Vec2,
    Mat3,
    Texture,
    /// `float name[N]`, bound element-wise as `name[0]` .. `name[N-1]`.
    FloatArray(usize),
}

impl ParamKind {
    pub fn describe(self) -> String {
        match self {
            ParamKind::Int => "int".into(),
            ParamKind::Float => "float".into(),
            ParamKind::Vec2 => "vec2".into(),
            ParamKind::Mat3 => "mat3".into(),
            ParamKind::Texture => "sampler2D".into(),
            ParamKind::FloatArray(n) => format!("float[{n}]"),
        }
    }
}

/// A declared program parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Param {
    pub name: &'static str,
    pub kind: ParamKind,
}

impl Param {
    pub const fn int(name: &'static str) -> Self {
        Param { name, kind: ParamKind::Int }
    }

    pub const fn float(name: &'static str) -> Self {
        Param { name, kind: ParamKind::Float }
    }

    pub const fn vec2(name: &'static str) -> Self {
        Param { name, kind: ParamKind::Vec2 }
    }

    pub const fn mat3(name: &'static str) -> Self {
        Param { name, kind: ParamKind::Mat3 }
    }

    pub const fn texture(name: &'static str) -> Self {
        Param { name, kind: ParamKind::Texture }
    }

    pub const fn float_array(name: &'static str, len: usize) -> Self {
        Param { name, kind: ParamKind::FloatArray(len) }
    }

    /// Uniform names this parameter occupies once bound.
    pub fn uniform_names(&self) -> Vec<String> {
        match self.kind {
            ParamKind::FloatArray(n) => (0..n).map(|i| format!("{}[{i}]", self.name)).collect(),
            _ => vec![self.name.to_string()],
        }
    }
}

/// A named fragment program, registered in a group of the program center.
#[derive(Debug, Clone, Copy)]
pub struct Program {
    pub group: &'static str,
    pub name: &'static str,
    pub params: &'static [Param],
    pub main: FragmentFn,
}

impl Program {
    /// `"group.name"`.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.group, self.name)
    }
}

/// A bound uniform value, valid for the duration of one call.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Uniform<'a> {
    Int(i32),
    Float(f32),
    Vec2([f32; 2]),
    Mat3(Mat3),
    Texture(&'a Texture),
    FloatArray(&'a [f32]),
}

static UNBOUND_TEXTURE: Texture = Texture::EMPTY;

/// What a program sees while shading one output pixel.
pub struct Fragment<'a> {
    /// Output pixel column.
    pub x: u32,
    /// Output pixel row.
    pub y: u32,
    /// Viewport size, bound automatically as `texSize`.
    pub tex_size: (u32, u32),
    pub(crate) uniforms: &'a [Uniform<'a>],
}

impl<'a> Fragment<'a> {
    /// Row-major index of this pixel in the output.
    #[inline]
    pub fn index(&self) -> u32 {
        self.y * self.tex_size.0 + self.x
    }

    #[inline]
    pub fn int(&self, param: usize) -> i32 {
        match self.uniforms.get(param) {
            Some(Uniform::Int(v)) => *v,
            _ => 0,
        }
    }

    #[inline]
    pub fn float(&self, param: usize) -> f32 {
        match self.uniforms.get(param) {
            Some(Uniform::Float(v)) => *v,
            _ => 0.0,
        }
    }

    pub fn vec2(&self, param: usize) -> [f32; 2] {
        match self.uniforms.get(param) {
            Some(Uniform::Vec2(v)) => *v,
            _ => [0.0; 2],
        }
    }

    pub fn mat3(&self, param: usize) -> Mat3 {
        match self.uniforms.get(param) {
            Some(Uniform::Mat3(m)) => *m,
            _ => Mat3::IDENTITY,
        }
    }

    #[inline]
    pub fn texture(&self, param: usize) -> &'a Texture {
        match self.uniforms.get(param) {
            Some(Uniform::Texture(t)) => t,
            _ => &UNBOUND_TEXTURE,
        }
    }

    pub fn array(&self, param: usize) -> &'a [f32] {
        match self.uniforms.get(param) {
            Some(Uniform::FloatArray(a)) => a,
            _ => &[],
        }
    }

    /// `texelFetch(sampler, ivec2(x, y), 0)`.
    #[inline]
    pub fn texel(&self, param: usize, x: i64, y: i64) -> [u8; 4] {
        self.texture(param).texel(x, y)
    }

    /// Fetch the pixel under this fragment from an input texture.
    #[inline]
    pub fn texel_here(&self, param: usize) -> [u8; 4] {
        self.texel(param, self.x as i64, self.y as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_params_expand_to_indexed_names() {
        let p = Param::float_array("kernel", 3);
        assert_eq!(p.uniform_names(), vec!["kernel[0]", "kernel[1]", "kernel[2]"]);
        assert_eq!(Param::int("n").uniform_names(), vec!["n"]);
    }

    #[test]
    fn identity_transform_keeps_points() {
        assert_eq!(Mat3::IDENTITY.transform_point(3.0, -2.0), (3.0, -2.0));
        let shift = Mat3([1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 5.0, 1.0, 1.0]);
        assert_eq!(shift.transform_point(1.0, 1.0), (6.0, 2.0));
    }
}
