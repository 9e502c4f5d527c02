//! 骨骼系统
//!
//! - BoneLink: 单个骨骼节点（类型行为、动画状态、世界/本地变换）
//! - BoneSet: 扁平数组 + 拓扑求值顺序，管理骨骼层次结构
//! - IkSolver: CCD IK 求解器

mod bone_link;
mod bone_set;
mod ik_solver;
mod local_axes;

pub use bone_link::{type_code, BoneBehavior, BoneFlags, BoneId, BoneLink, IkConstraint};
pub use bone_set::{BoneSet, IkChainDesc};
pub use ik_solver::{IkSolver, IK_DISTANCE_TOLERANCE};
pub use local_axes::{name_suggests_knee, name_suggests_local_axes};

use glam::{Quat, Vec3};

// ============================================================================
// 公共类型定义
// ============================================================================

/// 骨骼动画姿态（相对绑定姿态的平移与旋转）
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BonePose {
    pub translation: Vec3,
    pub rotation: Quat,
}

impl Default for BonePose {
    fn default() -> Self {
        Self {
            translation: Vec3::ZERO,
            rotation: Quat::IDENTITY,
        }
    }
}

impl BonePose {
    pub fn new(translation: Vec3, rotation: Quat) -> Self {
        Self {
            translation,
            rotation,
        }
    }
}

// ============================================================================
// 类型别名
// ============================================================================

/// Bone 别名
pub type Bone = BoneLink;
