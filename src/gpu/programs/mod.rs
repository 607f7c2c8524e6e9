// gpu/programs/mod.rs — Program center: every fragment program the device
// knows, addressed as "group.name".
//
//   utils       copy
//   filters     rgb2grey
//   pyramids    smoothX, smoothY, downsample2
//   keypoints   fastScore, nonmaxSuppression, countCorners, encodeKeypoints,
//               sortCreatePermutation, sortMergePermutation,
//               sortApplyPermutation, mixKeypointsConcat, shuffleKeypoints,
//               clipKeypoints, clipBorder

pub mod fast;
pub mod filters;
pub mod keypoints;
pub mod pyramids;
pub mod utils;

use std::collections::HashMap;

use crate::error::{PipelineError, Result};
use crate::gpu::program::Program;
use crate::gpu::texture::Texture;

pub const GROUP_UTILS: &str = "utils";
pub const GROUP_FILTERS: &str = "filters";
pub const GROUP_PYRAMIDS: &str = "pyramids";
pub const GROUP_KEYPOINTS: &str = "keypoints";

/// Registry of fragment programs.
#[derive(Debug, Clone, Default)]
pub struct ProgramCenter {
    programs: HashMap<(&'static str, &'static str), Program>,
}

impl ProgramCenter {
    /// All built-in groups.
    pub fn standard() -> Self {
        let mut center = ProgramCenter::default();
        for group in [
            utils::PROGRAMS,
            filters::PROGRAMS,
            pyramids::PROGRAMS,
            fast::PROGRAMS,
            keypoints::PROGRAMS,
        ] {
            for &program in group {
                center.register(program);
            }
        }
        center
    }

    pub fn register(&mut self, program: Program) {
        self.programs.insert((program.group, program.name), program);
    }

    /// # Errors
    /// `UnknownProgram` if `group.name` is not registered.
    pub fn get(&self, group: &str, name: &str) -> Result<Program> {
        self.programs
            .values()
            .find(|p| p.group == group && p.name == name)
            .copied()
            .ok_or_else(|| PipelineError::UnknownProgram {
                group: group.to_string(),
                name: name.to_string(),
            })
    }

    pub fn contains(&self, group: &str, name: &str) -> bool {
        self.get(group, name).is_ok()
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }
}

/// Texel number `i` of a texture in row-major order.
#[inline]
pub(crate) fn linear_texel(tex: &Texture, i: usize) -> [u8; 4] {
    let w = tex.width().max(1) as usize;
    tex.texel((i % w) as i64, (i / w) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_groups_are_registered() {
        let center = ProgramCenter::standard();
        for (group, name) in [
            ("utils", "copy"),
            ("filters", "rgb2grey"),
            ("pyramids", "smoothX"),
            ("pyramids", "downsample2"),
            ("keypoints", "fastScore"),
            ("keypoints", "sortMergePermutation"),
            ("keypoints", "mixKeypointsConcat"),
            ("keypoints", "shuffleKeypoints"),
            ("keypoints", "clipBorder"),
        ] {
            assert!(center.contains(group, name), "{group}.{name} missing");
        }
    }

    #[test]
    fn unknown_program_is_a_configuration_error() {
        let center = ProgramCenter::standard();
        match center.get("keypoints", "nope") {
            Err(PipelineError::UnknownProgram { group, name }) => {
                assert_eq!((group.as_str(), name.as_str()), ("keypoints", "nope"));
            }
            other => panic!("expected UnknownProgram, got {other:?}"),
        }
    }
}
