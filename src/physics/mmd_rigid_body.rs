//! MMD 刚体封装
//!
//! 刚体与骨骼之间的双向同步：
//! - 运动学：world = boneLocal * rest，每步从骨骼拉取，不积累物理状态
//! - 动态：boneLocal = world * inverse(rest)，物理步进后回写骨骼
//! - 动态跟骨：与动态相同，但原点每步钉在骨骼位置，只有旋转由物理驱动

use glam::{Mat4, Quat, Vec3};
use rapier3d::math::{Isometry, Real};
use rapier3d::na::{Quaternion, Translation3, UnitQuaternion};
use rapier3d::prelude::*;

use super::config::PhysicsConfig;
use super::mmd_physics::MMDPhysics;
use crate::events::{PropertyEvent, PropertyEventHub};
use crate::skeleton::{BoneId, BoneSet};

// ============================================================================
// 类型定义
// ============================================================================

/// 刚体模式（持久化编码 0/1/2）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhysicsMode {
    /// 静态/运动学，骨骼驱动刚体
    FollowBone,
    /// 动态，刚体驱动骨骼
    Physics,
    /// 动态，但原点跟随骨骼（只有旋转由物理驱动）
    PhysicsWithBone,
}

impl PhysicsMode {
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => PhysicsMode::Physics,
            2 => PhysicsMode::PhysicsWithBone,
            _ => PhysicsMode::FollowBone,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            PhysicsMode::FollowBone => 0,
            PhysicsMode::Physics => 1,
            PhysicsMode::PhysicsWithBone => 2,
        }
    }

    #[inline]
    pub fn is_dynamic(self) -> bool {
        self != PhysicsMode::FollowBone
    }
}

/// 碰撞形状
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RigidBodyShape {
    Sphere,
    Box,
    Capsule,
    Unknown(u8),
}

impl RigidBodyShape {
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => RigidBodyShape::Sphere,
            1 => RigidBodyShape::Box,
            2 => RigidBodyShape::Capsule,
            other => RigidBodyShape::Unknown(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            RigidBodyShape::Sphere => 0,
            RigidBodyShape::Box => 1,
            RigidBodyShape::Capsule => 2,
            RigidBodyShape::Unknown(other) => other,
        }
    }
}

/// 当前生效的同步策略，激活切换时只重新选择、不重建刚体
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionState {
    /// 骨骼 → 刚体
    Kinematic,
    /// 刚体 → 骨骼
    Active,
}

/// 材质与碰撞过滤参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RigidBodyMaterial {
    pub mass: f32,
    pub linear_damping: f32,
    pub angular_damping: f32,
    pub restitution: f32,
    pub friction: f32,
    pub group: u8,
    pub mask: u16,
}

impl Default for RigidBodyMaterial {
    fn default() -> Self {
        Self {
            mass: 1.0,
            linear_damping: 0.0,
            angular_damping: 0.0,
            restitution: 0.0,
            friction: 0.5,
            group: 0,
            mask: 0xFFFF,
        }
    }
}

// ============================================================================
// MMD 刚体
// ============================================================================

/// MMD 刚体
#[derive(Debug, Clone)]
pub struct MmdRigidBody {
    name: String,
    index: usize,
    bone: Option<BoneId>,
    shape: RigidBodyShape,
    size: Vec3,
    /// 模型空间静止位置
    position: Vec3,
    /// 静止姿态欧拉角（ZYX 顺序应用）
    rotation: Vec3,
    material: RigidBodyMaterial,
    mode: PhysicsMode,

    rest_transform: Mat4,
    world_to_local: Mat4,
    motion_state: MotionState,

    body_handle: Option<RigidBodyHandle>,
    collider_handle: Option<ColliderHandle>,
    events: PropertyEventHub,
}

impl MmdRigidBody {
    /// 创建刚体描述（尚未加入物理世界）
    ///
    /// 质量非正或非有限的动态刚体降级为跟随骨骼模式。
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index: usize,
        name: impl Into<String>,
        bone: Option<BoneId>,
        shape: RigidBodyShape,
        size: Vec3,
        position: Vec3,
        rotation: Vec3,
        material: RigidBodyMaterial,
        mode: PhysicsMode,
    ) -> Self {
        let name = name.into();
        let mode = if mode.is_dynamic() && !(material.mass.is_finite() && material.mass > 0.0) {
            log::warn!(
                "[刚体] '{}' 质量无效 ({}), 降级为跟随骨骼",
                name,
                material.mass
            );
            PhysicsMode::FollowBone
        } else {
            mode
        };

        let rest_transform = Mat4::from_rotation_translation(euler_zyx(rotation), position);
        let world_to_local = rest_transform.inverse();

        Self {
            name,
            index,
            bone,
            shape,
            size,
            position,
            rotation,
            material,
            mode,
            rest_transform,
            world_to_local,
            motion_state: natural_motion_state(mode),
            body_handle: None,
            collider_handle: None,
            events: PropertyEventHub::default(),
        }
    }

    // ========================================
    // 访问器
    // ========================================

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn bone(&self) -> Option<BoneId> {
        self.bone
    }

    pub fn shape(&self) -> RigidBodyShape {
        self.shape
    }

    pub fn size(&self) -> Vec3 {
        self.size
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn rotation(&self) -> Vec3 {
        self.rotation
    }

    pub fn material(&self) -> &RigidBodyMaterial {
        &self.material
    }

    pub fn mode(&self) -> PhysicsMode {
        self.mode
    }

    pub fn motion_state(&self) -> MotionState {
        self.motion_state
    }

    pub fn rest_transform(&self) -> Mat4 {
        self.rest_transform
    }

    pub fn world_to_local(&self) -> Mat4 {
        self.world_to_local
    }

    pub fn body_handle(&self) -> Option<RigidBodyHandle> {
        self.body_handle
    }

    pub fn collider_handle(&self) -> Option<ColliderHandle> {
        self.collider_handle
    }

    pub fn is_in_world(&self) -> bool {
        self.body_handle.is_some()
    }

    pub(crate) fn set_events(&mut self, events: PropertyEventHub) {
        self.events = events;
    }

    /// 运动学策略下的世界变换
    #[inline]
    pub fn kinematic_world_transform(&self, bone_local: Mat4) -> Mat4 {
        bone_local * self.rest_transform
    }

    /// 动态策略下回写骨骼的本地变换
    #[inline]
    pub fn bone_local_from_world(&self, world: Mat4) -> Mat4 {
        world * self.world_to_local
    }

    fn bone_local(&self, bones: &BoneSet) -> Mat4 {
        self.bone
            .and_then(|id| bones.get(id))
            .map(|b| b.local_transform())
            .unwrap_or(Mat4::IDENTITY)
    }

    // ========================================
    // 形状与刚体构建
    // ========================================

    /// 碰撞形状；未知类型返回 None，此时刚体不会加入模拟
    pub fn create_shape(&self) -> Option<SharedShape> {
        match self.shape {
            RigidBodyShape::Sphere => Some(SharedShape::ball(self.size.x)),
            RigidBodyShape::Box => Some(SharedShape::cuboid(self.size.x, self.size.y, self.size.z)),
            // size.y 是圆柱部分的总高度
            RigidBodyShape::Capsule => Some(SharedShape::capsule_y(self.size.y * 0.5, self.size.x)),
            RigidBodyShape::Unknown(_) => None,
        }
    }

    fn interaction_groups(&self) -> InteractionGroups {
        InteractionGroups::new(
            Group::from_bits_truncate(1u32 << (self.material.group.min(15) as u32)),
            Group::from_bits_truncate(self.material.mask as u32),
        )
    }

    fn engine_body_type(&self) -> RigidBodyType {
        match self.motion_state {
            MotionState::Kinematic => RigidBodyType::KinematicPositionBased,
            MotionState::Active => RigidBodyType::Dynamic,
        }
    }

    fn build_collider(&self, shape: SharedShape, config: &PhysicsConfig) -> Collider {
        let groups = self.interaction_groups();
        let builder = ColliderBuilder::new(shape)
            .restitution(self.material.restitution)
            .friction(self.material.friction)
            .collision_groups(groups)
            .solver_groups(groups);
        let builder = if self.mode.is_dynamic() {
            builder.mass(self.material.mass * config.mass_scale)
        } else {
            builder.density(0.0)
        };
        builder.build()
    }

    // ========================================
    // 世界成员
    // ========================================

    /// 加入物理世界，初始位置取自骨骼当前姿态
    pub fn join_world(&mut self, physics: &mut MMDPhysics, bones: &BoneSet) -> bool {
        if self.body_handle.is_some() {
            return true;
        }
        let Some(shape) = self.create_shape() else {
            log::warn!(
                "[刚体] '{}' 形状未知 ({:?})，不加入物理世界",
                self.name,
                self.shape
            );
            return false;
        };

        let config = physics.config().clone();
        let world = self.kinematic_world_transform(self.bone_local(bones));
        let body = RigidBodyBuilder::new(self.engine_body_type())
            .position(mat4_to_isometry(world))
            .linear_damping(self.material.linear_damping * config.linear_damping_scale)
            .angular_damping(self.material.angular_damping * config.angular_damping_scale)
            .can_sleep(false)
            .ccd_enabled(false)
            .build();
        let collider = self.build_collider(shape, &config);
        let (body_handle, collider_handle) = physics.insert_body(body, collider);
        self.body_handle = Some(body_handle);
        self.collider_handle = Some(collider_handle);

        if config.debug_log {
            log::debug!(
                "[刚体] [{}] '{}': 模式={:?}, 骨骼={:?}, 质量={}",
                self.index,
                self.name,
                self.mode,
                self.bone,
                self.material.mass
            );
        }
        true
    }

    /// 离开物理世界（连同碰撞体与关节）
    pub fn leave_world(&mut self, physics: &mut MMDPhysics) {
        if let Some(handle) = self.body_handle.take() {
            physics.remove_body(handle);
        }
        self.collider_handle = None;
    }

    // ========================================
    // 同步
    // ========================================

    /// 切换同步策略
    ///
    /// 跟随骨骼的刚体始终保持运动学；其余刚体在运动学与动态之间切换，
    /// 同时切换物理引擎中的刚体类型（运动学刚体只推动他人，不会被推动）。
    pub fn set_activation(&mut self, physics: &mut MMDPhysics, active: bool) {
        if !self.mode.is_dynamic() {
            return;
        }
        let state = if active {
            MotionState::Active
        } else {
            MotionState::Kinematic
        };
        if state == self.motion_state {
            return;
        }
        self.motion_state = state;

        let body_type = self.engine_body_type();
        if let Some(rb) = self
            .body_handle
            .and_then(|h| physics.rigid_body_set.get_mut(h))
        {
            rb.set_body_type(body_type, true);
            rb.set_linvel(vector![0.0, 0.0, 0.0], true);
            rb.set_angvel(vector![0.0, 0.0, 0.0], true);
        }
    }

    /// 清除累积的力与速度，并清除宽相中的过期配对
    pub fn reset_body(&mut self, physics: &mut MMDPhysics) {
        let (Some(body), Some(collider)) = (self.body_handle, self.collider_handle) else {
            return;
        };
        if let Some(rb) = physics.rigid_body_set.get_mut(body) {
            rb.set_linvel(vector![0.0, 0.0, 0.0], true);
            rb.set_angvel(vector![0.0, 0.0, 0.0], true);
            rb.reset_forces(true);
            rb.reset_torques(true);
        }
        if let Some(handle) = physics.purge_collider_pairs(body, collider) {
            self.collider_handle = Some(handle);
        }
    }

    /// 把刚体瞬移到骨骼当前姿态对应的位置
    pub fn update_transform(&self, physics: &mut MMDPhysics, bones: &BoneSet) {
        let Some(rb) = self
            .body_handle
            .and_then(|h| physics.rigid_body_set.get_mut(h))
        else {
            return;
        };
        let iso = mat4_to_isometry(self.kinematic_world_transform(self.bone_local(bones)));
        rb.set_position(iso, true);
        if self.motion_state == MotionState::Kinematic {
            rb.set_next_kinematic_position(iso);
        }
    }

    /// 骨骼 → 刚体（运动学策略）
    pub fn push_from_bone(&self, physics: &mut MMDPhysics, bones: &BoneSet) {
        if self.motion_state != MotionState::Kinematic {
            return;
        }
        if let Some(rb) = self
            .body_handle
            .and_then(|h| physics.rigid_body_set.get_mut(h))
        {
            let world = self.kinematic_world_transform(self.bone_local(bones));
            rb.set_next_kinematic_position(mat4_to_isometry(world));
        }
    }

    /// 刚体 → 骨骼（动态策略）
    ///
    /// 物理结果含 NaN 时跳过本帧，骨骼保持原有变换。
    pub fn pull_to_bone(&self, physics: &mut MMDPhysics, bones: &mut BoneSet) {
        if self.motion_state != MotionState::Active {
            return;
        }
        let Some(bone) = self.bone else {
            return;
        };
        let Some(rb) = self
            .body_handle
            .and_then(|h| physics.rigid_body_set.get_mut(h))
        else {
            return;
        };

        let mut world = isometry_to_mat4(rb.position());
        if !world.is_finite() {
            log::warn!("[刚体] '{}' 物理变换无效，跳过本帧回写", self.name);
            return;
        }

        if self.mode == PhysicsMode::PhysicsWithBone {
            let pinned = self.kinematic_world_transform(self.bone_local(bones)).w_axis;
            world.w_axis = pinned;
            rb.set_translation(vector![pinned.x, pinned.y, pinned.z], true);
        }

        bones.set_local_transform_from_physics(bone, self.bone_local_from_world(world));
    }

    /// 把当前参数写入物理引擎中的刚体与碰撞体
    ///
    /// 属性设置只修改描述，已在世界中的刚体需要调用此函数才会生效。
    pub fn apply_parameters(&self, physics: &mut MMDPhysics) {
        let config = physics.config().clone();
        if let Some(rb) = self
            .body_handle
            .and_then(|h| physics.rigid_body_set.get_mut(h))
        {
            rb.set_linear_damping(self.material.linear_damping * config.linear_damping_scale);
            rb.set_angular_damping(self.material.angular_damping * config.angular_damping_scale);
        }
        let groups = self.interaction_groups();
        if let Some(collider) = self
            .collider_handle
            .and_then(|h| physics.collider_set.get_mut(h))
        {
            collider.set_friction(self.material.friction);
            collider.set_restitution(self.material.restitution);
            collider.set_collision_groups(groups);
            collider.set_solver_groups(groups);
            if self.mode.is_dynamic() {
                collider.set_mass(self.material.mass * config.mass_scale);
            }
        }
    }

    // ========================================
    // 属性设置（发出变更事件）
    // ========================================

    pub fn set_name(&mut self, name: impl Into<String>) {
        let name = name.into();
        self.events.emit(&PropertyEvent::RigidBodyNameWillChange {
            body: self.index,
            name: name.clone(),
        });
        self.name = name;
    }

    pub fn set_bone(&mut self, bone: Option<BoneId>) {
        self.events.emit(&PropertyEvent::RigidBodyBoneWillChange {
            body: self.index,
            bone,
        });
        self.bone = bone;
    }

    /// 动态刚体只接受正的有限质量，其余刚体接受非负有限质量
    pub fn set_mass(&mut self, value: f32) {
        let valid = value.is_finite() && (value > 0.0 || (value == 0.0 && !self.mode.is_dynamic()));
        if !valid {
            log::warn!("[刚体] '{}' 忽略无效质量 {}", self.name, value);
            return;
        }
        self.events.emit(&PropertyEvent::MassWillChange {
            body: self.index,
            value,
        });
        self.material.mass = value;
    }

    pub fn set_linear_damping(&mut self, value: f32) {
        self.events.emit(&PropertyEvent::LinearDampingWillChange {
            body: self.index,
            value,
        });
        self.material.linear_damping = value;
    }

    pub fn set_angular_damping(&mut self, value: f32) {
        self.events.emit(&PropertyEvent::AngularDampingWillChange {
            body: self.index,
            value,
        });
        self.material.angular_damping = value;
    }

    pub fn set_friction(&mut self, value: f32) {
        self.events.emit(&PropertyEvent::FrictionWillChange {
            body: self.index,
            value,
        });
        self.material.friction = value;
    }

    pub fn set_restitution(&mut self, value: f32) {
        self.events.emit(&PropertyEvent::RestitutionWillChange {
            body: self.index,
            value,
        });
        self.material.restitution = value;
    }

    pub fn set_collision_group(&mut self, group: u8) {
        self.events.emit(&PropertyEvent::CollisionGroupWillChange {
            body: self.index,
            group,
        });
        self.material.group = group;
    }

    pub fn set_collision_mask(&mut self, mask: u16) {
        self.events.emit(&PropertyEvent::CollisionMaskWillChange {
            body: self.index,
            mask,
        });
        self.material.mask = mask;
    }
}

fn natural_motion_state(mode: PhysicsMode) -> MotionState {
    if mode.is_dynamic() {
        MotionState::Active
    } else {
        MotionState::Kinematic
    }
}

/// Rz * Ry * Rx
pub fn euler_zyx(rotation: Vec3) -> Quat {
    Quat::from_rotation_z(rotation.z)
        * Quat::from_rotation_y(rotation.y)
        * Quat::from_rotation_x(rotation.x)
}

// ============================================================================
// glam ⇄ rapier 转换
// ============================================================================

/// 将 glam Mat4 转换为 Rapier Isometry（忽略缩放）
pub fn mat4_to_isometry(mat: Mat4) -> Isometry<Real> {
    let (_, rotation, translation) = mat.to_scale_rotation_translation();
    Isometry::from_parts(
        Translation3::new(translation.x, translation.y, translation.z),
        UnitQuaternion::from_quaternion(Quaternion::new(
            rotation.w, rotation.x, rotation.y, rotation.z,
        )),
    )
}

/// 将 Rapier Isometry 转换为 glam Mat4
pub fn isometry_to_mat4(iso: &Isometry<Real>) -> Mat4 {
    let t = iso.translation.vector;
    let q = iso.rotation.coords;
    Mat4::from_rotation_translation(
        Quat::from_xyzw(q[0], q[1], q[2], q[3]),
        Vec3::new(t.x, t.y, t.z),
    )
}
