//! 骨骼节点
//!
//! BoneLink 是骨骼层级中的单个节点。父/子/目标引用在全部骨骼创建后
//! 由 BoneSet 第二阶段解析，因此节点同时保存原始记录索引与解析后的索引。

use bitflags::bitflags;
use glam::{Mat3, Mat4, Quat, Vec3};

use super::local_axes;

/// 骨骼在扁平数组中的稳定索引
pub type BoneId = usize;

// ============================================================================
// 骨骼类型
// ============================================================================

/// PMD 骨骼类型编码
pub mod type_code {
    pub const ROTATE: u8 = 0;
    pub const ROTATE_AND_MOVE: u8 = 1;
    pub const IK_DESTINATION: u8 = 2;
    pub const UNKNOWN: u8 = 3;
    pub const UNDER_IK: u8 = 4;
    pub const UNDER_ROTATE: u8 = 5;
    pub const IK_TARGET: u8 = 6;
    pub const INVISIBLE: u8 = 7;
    pub const TWIST: u8 = 8;
    pub const FOLLOW_ROTATE: u8 = 9;
}

/// 骨骼行为（由类型编码与解析后的引用得出）
///
/// `perform_transform` 只对这个枚举做一次 match，能力判断也全部由它推导。
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BoneBehavior {
    RotateOnly,
    RotateAndMove,
    IkDestination,
    UnderIk,
    /// 附加目标骨骼的动画旋转
    UnderRotate { target: Option<BoneId> },
    IkTarget,
    /// 从单位旋转向自身旋转球面插值，系数 = 目标骨骼索引 * 0.01
    FollowRotate { coefficient: f32, child: Option<BoneId> },
    /// 扭转骨骼，只允许绕固定轴旋转
    FixedAxis { axis: Vec3 },
    Invisible,
    Unknown(u8),
}

impl BoneBehavior {
    /// 由类型编码和已解析引用构造
    pub fn resolve(
        code: u8,
        raw_target_index: i16,
        target: Option<BoneId>,
        child: Option<BoneId>,
        fixed_axis: Vec3,
    ) -> Self {
        match code {
            type_code::ROTATE => BoneBehavior::RotateOnly,
            type_code::ROTATE_AND_MOVE => BoneBehavior::RotateAndMove,
            type_code::IK_DESTINATION => BoneBehavior::IkDestination,
            type_code::UNDER_IK => BoneBehavior::UnderIk,
            type_code::UNDER_ROTATE => BoneBehavior::UnderRotate { target },
            type_code::IK_TARGET => BoneBehavior::IkTarget,
            type_code::INVISIBLE => BoneBehavior::Invisible,
            type_code::TWIST => BoneBehavior::FixedAxis { axis: fixed_axis },
            // 旧格式把目标索引当作权重使用，必须原样保留
            type_code::FOLLOW_ROTATE => BoneBehavior::FollowRotate {
                coefficient: raw_target_index as f32 * 0.01,
                child,
            },
            other => BoneBehavior::Unknown(other),
        }
    }

    /// 能力标志
    pub fn capabilities(&self) -> BoneFlags {
        let mut flags = BoneFlags::empty();
        match self {
            BoneBehavior::RotateOnly => flags |= BoneFlags::ROTATABLE | BoneFlags::INTERACTIVE,
            BoneBehavior::RotateAndMove => {
                flags |= BoneFlags::ROTATABLE | BoneFlags::MOVABLE | BoneFlags::INTERACTIVE
            }
            BoneBehavior::IkDestination => flags |= BoneFlags::IK,
            BoneBehavior::FixedAxis { .. } => flags |= BoneFlags::FIXED_AXIS,
            _ => {}
        }
        if !matches!(self, BoneBehavior::Invisible) {
            flags |= BoneFlags::VISIBLE;
        }
        flags
    }
}

bitflags! {
    /// 骨骼能力标志
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct BoneFlags: u32 {
        const ROTATABLE = 1 << 0;
        const MOVABLE = 1 << 1;
        const VISIBLE = 1 << 2;
        const INTERACTIVE = 1 << 3;
        const IK = 1 << 4;
        const FIXED_AXIS = 1 << 5;
    }
}

// ============================================================================
// IK 约束
// ============================================================================

/// IK 约束（归属于其根骨骼，即 IK 目的地骨骼）
#[derive(Clone, Debug, PartialEq)]
pub struct IkConstraint {
    /// 目的地骨骼（IK 骨骼本身，其位置就是求解目标点）
    pub root: BoneId,
    /// 链末端骨骼，求解时把它拉向 root 的位置
    pub target: BoneId,
    /// 参与旋转的链骨骼，按记录顺序处理（PMD 数据中从末端向根部）
    pub effectors: Vec<BoneId>,
    pub iterations: u32,
    /// 单次迭代最大旋转角（弧度）
    pub max_angle: f32,
}

// ============================================================================
// 骨骼节点
// ============================================================================

/// 骨骼节点
#[derive(Clone, Debug)]
pub struct BoneLink {
    // ========================================
    // 静态数据
    // ========================================
    pub name: String,
    pub english_name: String,
    pub(crate) index: BoneId,

    /// 原始记录中的索引（-1 表示无），写回时原样输出
    pub parent_index: i16,
    pub child_index: i16,
    pub target_index: i16,
    pub type_code: u8,

    pub(crate) parent: Option<BoneId>,
    pub(crate) child: Option<BoneId>,
    pub(crate) target: Option<BoneId>,
    pub(crate) behavior: BoneBehavior,
    pub(crate) flags: BoneFlags,

    /// 绑定姿态下的模型空间位置
    pub origin: Vec3,
    /// origin - parent.origin
    pub(crate) offset: Vec3,
    pub(crate) fixed_axis: Vec3,
    pub(crate) ik: Option<IkConstraint>,
    /// 显式本地轴，设置后优先于名称推断
    pub local_axes_override: Option<Mat3>,

    // ========================================
    // 动态数据（每帧更新）
    // ========================================
    pub local_position: Vec3,
    pub rotation: Quat,
    pub(crate) ik_rotation: Quat,
    pub(crate) world_transform: Mat4,
    pub(crate) local_transform: Mat4,
    pub(crate) simulated: bool,
}

impl BoneLink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            english_name: String::new(),
            index: 0,
            parent_index: -1,
            child_index: -1,
            target_index: -1,
            type_code: type_code::ROTATE,
            parent: None,
            child: None,
            target: None,
            behavior: BoneBehavior::RotateOnly,
            flags: BoneBehavior::RotateOnly.capabilities(),
            origin: Vec3::ZERO,
            offset: Vec3::ZERO,
            fixed_axis: Vec3::ZERO,
            ik: None,
            local_axes_override: None,
            local_position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            ik_rotation: Quat::IDENTITY,
            world_transform: Mat4::IDENTITY,
            local_transform: Mat4::IDENTITY,
            simulated: false,
        }
    }

    /// 以原始记录字段构造（第一阶段，引用尚未解析）
    pub fn with_record(
        name: impl Into<String>,
        parent_index: i16,
        child_index: i16,
        type_code: u8,
        target_index: i16,
        origin: Vec3,
    ) -> Self {
        let mut bone = Self::new(name);
        bone.parent_index = parent_index;
        bone.child_index = child_index;
        bone.type_code = type_code;
        bone.target_index = target_index;
        bone.origin = origin;
        bone.offset = origin;
        bone
    }

    // ========================================
    // 访问器
    // ========================================

    #[inline]
    pub fn index(&self) -> BoneId {
        self.index
    }

    #[inline]
    pub fn parent(&self) -> Option<BoneId> {
        self.parent
    }

    #[inline]
    pub fn child(&self) -> Option<BoneId> {
        self.child
    }

    #[inline]
    pub fn target(&self) -> Option<BoneId> {
        self.target
    }

    #[inline]
    pub fn behavior(&self) -> BoneBehavior {
        self.behavior
    }

    #[inline]
    pub fn offset(&self) -> Vec3 {
        self.offset
    }

    #[inline]
    pub fn fixed_axis(&self) -> Vec3 {
        self.fixed_axis
    }

    #[inline]
    pub fn ik_constraint(&self) -> Option<&IkConstraint> {
        self.ik.as_ref()
    }

    #[inline]
    pub fn ik_rotation(&self) -> Quat {
        self.ik_rotation
    }

    #[inline]
    pub fn world_transform(&self) -> Mat4 {
        self.world_transform
    }

    /// 以绑定姿态原点为基准的变换（蒙皮与刚体同步使用）
    #[inline]
    pub fn local_transform(&self) -> Mat4 {
        self.local_transform
    }

    #[inline]
    pub fn skinning_matrix(&self) -> Mat4 {
        self.local_transform
    }

    #[inline]
    pub fn world_position(&self) -> Vec3 {
        self.world_transform.w_axis.truncate()
    }

    #[inline]
    pub fn is_simulated(&self) -> bool {
        self.simulated
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    // ========================================
    // 变换计算
    // ========================================

    /// 重置动画状态
    pub fn reset_pose(&mut self) {
        self.local_position = Vec3::ZERO;
        self.rotation = Quat::IDENTITY;
        self.ik_rotation = Quat::IDENTITY;
    }

    /// 按骨骼行为选择旋转来源
    pub fn behavior_rotation(&self, target_rotation: Option<Quat>) -> Quat {
        match self.behavior {
            BoneBehavior::UnderRotate { target: Some(_) } => match target_rotation {
                Some(t) => self.rotation * t,
                None => self.rotation,
            },
            BoneBehavior::FollowRotate {
                coefficient,
                child: Some(_),
            } => Quat::IDENTITY.slerp(self.rotation, coefficient),
            _ => self.rotation,
        }
    }

    /// 计算世界变换，父骨骼必须已在本帧求值
    pub fn compose_world_transform(
        &self,
        parent_world: Option<Mat4>,
        target_rotation: Option<Quat>,
    ) -> Mat4 {
        let rotation = self.ik_rotation * self.behavior_rotation(target_rotation);
        let local = Mat4::from_rotation_translation(rotation, self.offset + self.local_position);
        match parent_world {
            Some(parent) => parent * local,
            None => local,
        }
    }

    /// world * Translate(-origin)
    #[inline]
    pub fn rebase_to_origin(&self, world: Mat4) -> Mat4 {
        world * Mat4::from_translation(-self.origin)
    }

    /// 写入世界变换并派生本地变换
    pub fn apply_world_transform(&mut self, world: Mat4) {
        self.world_transform = world;
        self.local_transform = self.rebase_to_origin(world);
    }

    /// 由物理回写本地变换，世界变换同步为 local * Translate(origin)
    pub fn apply_simulated_transform(&mut self, local: Mat4) {
        self.local_transform = local;
        self.world_transform = local * Mat4::from_translation(self.origin);
        self.simulated = true;
    }

    // ========================================
    // 能力判断
    // ========================================

    #[inline]
    pub fn flags(&self) -> BoneFlags {
        self.flags
    }

    #[inline]
    pub fn is_movable(&self) -> bool {
        self.flags.contains(BoneFlags::MOVABLE)
    }

    #[inline]
    pub fn is_rotatable(&self) -> bool {
        self.flags.contains(BoneFlags::ROTATABLE)
    }

    #[inline]
    pub fn is_visible(&self) -> bool {
        self.flags.contains(BoneFlags::VISIBLE)
    }

    #[inline]
    pub fn is_interactive(&self) -> bool {
        self.flags.contains(BoneFlags::INTERACTIVE)
    }

    #[inline]
    pub fn has_inverse_kinematics(&self) -> bool {
        self.flags.contains(BoneFlags::IK)
    }

    #[inline]
    pub fn has_fixed_axis(&self) -> bool {
        self.flags.contains(BoneFlags::FIXED_AXIS)
    }

    /// 是否拥有本地轴
    pub fn has_local_axes(&self) -> bool {
        self.local_axes_override.is_some() || local_axes::name_suggests_local_axes(&self.name)
    }

    /// 膝关节：IK 中只能绕本地 X 轴弯曲
    pub fn is_knee(&self) -> bool {
        local_axes::name_suggests_knee(&self.name)
    }

    /// 本地轴基（列向量依次为 X/Y/Z 轴）
    pub fn local_axes(&self, child_origin: Option<Vec3>) -> Mat3 {
        if let Some(axes) = self.local_axes_override {
            return axes;
        }
        if !local_axes::name_suggests_local_axes(&self.name) {
            return Mat3::IDENTITY;
        }
        match child_origin {
            Some(child) => local_axes::derive_axes(&self.name, self.origin, child),
            None => Mat3::IDENTITY,
        }
    }
}

impl Default for BoneLink {
    fn default() -> Self {
        Self::new(String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolved(code: u8, target: i16) -> BoneLink {
        let mut bone = BoneLink::with_record("bone", -1, -1, code, target, Vec3::new(0.0, 1.0, 0.0));
        bone.behavior = BoneBehavior::resolve(code, target, Some(1), Some(1), Vec3::Y);
        bone.flags = bone.behavior.capabilities();
        bone
    }

    #[test]
    fn test_capabilities_follow_type() {
        assert!(resolved(type_code::ROTATE_AND_MOVE, -1).is_movable());
        assert!(resolved(type_code::ROTATE_AND_MOVE, -1).is_rotatable());
        assert!(resolved(type_code::ROTATE, -1).is_rotatable());
        assert!(!resolved(type_code::ROTATE, -1).is_movable());
        assert!(!resolved(type_code::INVISIBLE, -1).is_visible());
        assert!(resolved(type_code::UNKNOWN, -1).is_visible());
        assert!(resolved(type_code::IK_DESTINATION, -1).has_inverse_kinematics());
        assert!(resolved(type_code::TWIST, -1).has_fixed_axis());
        assert!(!resolved(type_code::TWIST, -1).is_rotatable());
    }

    #[test]
    fn test_unknown_code_is_preserved() {
        let bone = resolved(42, -1);
        assert_eq!(bone.behavior(), BoneBehavior::Unknown(42));
        assert_eq!(bone.type_code, 42);
    }

    #[test]
    fn test_follow_rotate_uses_index_as_weight() {
        let mut bone = resolved(type_code::FOLLOW_ROTATE, 50);
        bone.rotation = Quat::from_rotation_y(1.0);
        let rotation = bone.behavior_rotation(None);
        let (_, angle) = rotation.to_axis_angle();
        assert!((angle - 0.5).abs() < 1e-5);
    }

    #[test]
    fn test_under_rotate_combines_target() {
        let mut bone = resolved(type_code::UNDER_ROTATE, 1);
        bone.rotation = Quat::from_rotation_x(0.3);
        let target = Quat::from_rotation_x(0.2);
        let rotation = bone.behavior_rotation(Some(target));
        assert!(rotation.abs_diff_eq(Quat::from_rotation_x(0.5), 1e-5));
    }

    #[test]
    fn test_local_transform_rebased_to_origin() {
        let mut bone = resolved(type_code::ROTATE, -1);
        let world = bone.compose_world_transform(None, None);
        bone.apply_world_transform(world);
        // 绑定姿态下本地变换为单位矩阵
        assert!(bone.local_transform().abs_diff_eq(Mat4::IDENTITY, 1e-6));
        assert!((bone.world_position() - Vec3::new(0.0, 1.0, 0.0)).length() < 1e-6);
    }
}
