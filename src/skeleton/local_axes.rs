//! 本地轴推断
//!
//! 手指、手臂、手肘、手腕骨骼按名称推断本地轴。

use glam::{Mat3, Vec3};

const FINGER_TOKENS: [&str; 2] = ["指", "finger"];
const LIMB_SUFFIX_TOKENS: [&str; 6] = ["腕", "ひじ", "手首", "arm", "elbow", "wrist"];
const LEFT_PREFIX_TOKENS: [&str; 2] = ["左", "left"];
const KNEE_TOKENS: [&str; 2] = ["ひざ", "knee"];

/// 名称包含手指标记，或以手臂/手肘/手腕标记结尾
pub fn name_suggests_local_axes(name: &str) -> bool {
    let lower = name.to_lowercase();
    FINGER_TOKENS.iter().any(|t| lower.contains(t))
        || LIMB_SUFFIX_TOKENS.iter().any(|t| lower.ends_with(t))
}

pub fn name_suggests_knee(name: &str) -> bool {
    let lower = name.to_lowercase();
    KNEE_TOKENS.iter().any(|t| lower.contains(t))
}

fn is_left_side(name: &str) -> bool {
    let lower = name.to_lowercase();
    LEFT_PREFIX_TOKENS.iter().any(|t| lower.starts_with(t))
}

/// 由骨骼到子骨骼的方向推导本地轴
///
/// 方向退化（零长度）时返回单位矩阵。
pub fn derive_axes(name: &str, origin: Vec3, child_origin: Vec3) -> Mat3 {
    let axis_x = (child_origin - origin).normalize_or_zero();
    if axis_x == Vec3::ZERO {
        return Mat3::IDENTITY;
    }

    let mut mirrored = axis_x;
    if is_left_side(name) {
        mirrored.y = -axis_x.y;
    } else {
        mirrored.x = -axis_x.x;
    }

    let axis_z = axis_x.cross(mirrored).normalize_or_zero();
    if axis_z == Vec3::ZERO {
        return Mat3::IDENTITY;
    }

    let mut tilted = axis_x;
    tilted.z = -axis_z.z;
    let axis_y = tilted.cross(-axis_x).normalize_or_zero();
    if axis_y == Vec3::ZERO {
        return Mat3::IDENTITY;
    }

    Mat3::from_cols(axis_x, axis_y, axis_z)
}
