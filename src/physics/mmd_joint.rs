//! MMD 关节（6DOF 弹簧约束）
//!
//! Bullet3 使用 btGeneric6DofSpringConstraint，这里用 Rapier 的
//! GenericJoint 配合 limits 和 motors 实现同样的约束。

use glam::{Mat4, Vec3};
use rapier3d::prelude::*;

use super::config::PhysicsConfig;
use super::mmd_physics::MMDPhysics;
use super::mmd_rigid_body::{euler_zyx, mat4_to_isometry, MmdRigidBody};

const LOCK_EPSILON: f32 = 1.0e-4;

/// 关节限制与弹簧参数
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct JointLimits {
    pub linear_lower: Vec3,
    pub linear_upper: Vec3,
    pub angular_lower: Vec3,
    pub angular_upper: Vec3,
    pub linear_spring: Vec3,
    pub angular_spring: Vec3,
}

/// MMD 关节
#[derive(Debug, Clone)]
pub struct MmdJoint {
    pub name: String,
    body_a: usize,
    body_b: usize,
    /// 模型空间位置
    position: Vec3,
    /// 欧拉角（ZYX 顺序应用）
    rotation: Vec3,
    limits: JointLimits,
    handle: Option<ImpulseJointHandle>,
}

impl MmdJoint {
    pub fn new(
        name: impl Into<String>,
        body_a: usize,
        body_b: usize,
        position: Vec3,
        rotation: Vec3,
        limits: JointLimits,
    ) -> Self {
        Self {
            name: name.into(),
            body_a,
            body_b,
            position,
            rotation,
            limits,
            handle: None,
        }
    }

    pub fn body_a(&self) -> usize {
        self.body_a
    }

    pub fn body_b(&self) -> usize {
        self.body_b
    }

    pub fn limits(&self) -> &JointLimits {
        &self.limits
    }

    pub fn handle(&self) -> Option<ImpulseJointHandle> {
        self.handle
    }

    /// 关节在模型空间的变换
    pub fn world_transform(&self) -> Mat4 {
        Mat4::from_rotation_translation(euler_zyx(self.rotation), self.position)
    }

    fn locked_linear_axes(&self) -> JointAxesMask {
        let l = &self.limits;
        let mut locked = JointAxesMask::empty();
        if (l.linear_upper.x - l.linear_lower.x).abs() < LOCK_EPSILON {
            locked |= JointAxesMask::LIN_X;
        }
        if (l.linear_upper.y - l.linear_lower.y).abs() < LOCK_EPSILON {
            locked |= JointAxesMask::LIN_Y;
        }
        if (l.linear_upper.z - l.linear_lower.z).abs() < LOCK_EPSILON {
            locked |= JointAxesMask::LIN_Z;
        }
        locked
    }

    /// 构建 GenericJoint
    ///
    /// - 线性轴 lower == upper 时锁定
    /// - lower <= upper 时设置限制，lower > upper 时该轴自由
    /// - 弹簧刚度用零目标的电机表示
    pub fn build_joint(&self, body_a_world: Mat4, body_b_world: Mat4, config: &PhysicsConfig) -> GenericJoint {
        let joint_world = self.world_transform();
        let frame_a = mat4_to_isometry(body_a_world.inverse() * joint_world);
        let frame_b = mat4_to_isometry(body_b_world.inverse() * joint_world);

        let locked = self.locked_linear_axes();
        let mut joint = GenericJointBuilder::new(locked)
            .local_frame1(frame_a)
            .local_frame2(frame_b)
            .build();
        joint.contacts_enabled = false;

        let l = &self.limits;
        let linear = [
            (JointAxis::LinX, JointAxesMask::LIN_X, l.linear_lower.x, l.linear_upper.x, l.linear_spring.x),
            (JointAxis::LinY, JointAxesMask::LIN_Y, l.linear_lower.y, l.linear_upper.y, l.linear_spring.y),
            (JointAxis::LinZ, JointAxesMask::LIN_Z, l.linear_lower.z, l.linear_upper.z, l.linear_spring.z),
        ];
        for (axis, mask, lower, upper, spring) in linear {
            if locked.contains(mask) {
                continue;
            }
            if lower <= upper {
                joint.set_limits(axis, [lower, upper]);
            }
            if spring != 0.0 {
                joint.set_motor(axis, 0.0, 0.0, spring * config.spring_stiffness_scale, 0.0);
            }
        }

        let angular = [
            (JointAxis::AngX, l.angular_lower.x, l.angular_upper.x, l.angular_spring.x),
            (JointAxis::AngY, l.angular_lower.y, l.angular_upper.y, l.angular_spring.y),
            (JointAxis::AngZ, l.angular_lower.z, l.angular_upper.z, l.angular_spring.z),
        ];
        for (axis, lower, upper, spring) in angular {
            if lower <= upper {
                joint.set_limits(axis, [lower, upper]);
            }
            if spring != 0.0 {
                joint.set_motor(axis, 0.0, 0.0, spring * config.spring_stiffness_scale, 0.0);
            }
        }

        joint
    }

    /// 在两个已加入世界的刚体之间创建关节
    ///
    /// 任一刚体不在世界中（例如形状未知）时跳过，返回 false。
    pub fn attach(&mut self, physics: &mut MMDPhysics, bodies: &[MmdRigidBody]) -> bool {
        if self.handle.is_some() {
            return true;
        }
        if !physics.config().joints_enabled {
            return false;
        }
        let handles = (
            bodies.get(self.body_a).and_then(|b| b.body_handle()),
            bodies.get(self.body_b).and_then(|b| b.body_handle()),
        );
        let (Some(handle_a), Some(handle_b)) = handles else {
            log::warn!("[关节] '{}' 连接的刚体不在物理世界中，跳过", self.name);
            return false;
        };
        let (Some(world_a), Some(world_b)) = (
            physics.body_world_transform(handle_a),
            physics.body_world_transform(handle_b),
        ) else {
            return false;
        };

        let joint = self.build_joint(world_a, world_b, physics.config());
        self.handle = Some(physics.insert_joint(handle_a, handle_b, joint));
        true
    }

    pub fn detach(&mut self, physics: &mut MMDPhysics) {
        if let Some(handle) = self.handle.take() {
            physics.remove_joint(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physics::mmd_rigid_body::{PhysicsMode, RigidBodyMaterial, RigidBodyShape};
    use crate::skeleton::{type_code, BoneLink, BoneSet};

    fn limits() -> JointLimits {
        JointLimits {
            linear_lower: Vec3::ZERO,
            linear_upper: Vec3::new(0.0, 0.5, 0.0),
            angular_lower: Vec3::splat(-0.3),
            angular_upper: Vec3::splat(0.3),
            linear_spring: Vec3::ZERO,
            angular_spring: Vec3::new(10.0, 0.0, 0.0),
        }
    }

    #[test]
    fn test_locked_axes_follow_equal_limits() {
        let joint = MmdJoint::new("j", 0, 1, Vec3::ZERO, Vec3::ZERO, limits());
        let locked = joint.locked_linear_axes();
        assert!(locked.contains(JointAxesMask::LIN_X));
        assert!(!locked.contains(JointAxesMask::LIN_Y));
        assert!(locked.contains(JointAxesMask::LIN_Z));
    }

    #[test]
    fn test_local_frames_meet_at_joint() {
        let joint = MmdJoint::new("j", 0, 1, Vec3::new(0.0, 1.0, 0.0), Vec3::ZERO, limits());
        let a = Mat4::from_translation(Vec3::new(0.0, 2.0, 0.0));
        let b = Mat4::from_translation(Vec3::new(0.0, 0.0, 0.0));
        let built = joint.build_joint(a, b, &PhysicsConfig::default());
        assert!(!built.contacts_enabled);
        assert!((built.local_frame1.translation.vector.y + 1.0).abs() < 1e-6);
        assert!((built.local_frame2.translation.vector.y - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_attach_and_detach() {
        let mut physics = MMDPhysics::with_config(PhysicsConfig::default());
        let bones = BoneSet::build(
            vec![BoneLink::with_record("b", -1, -1, type_code::ROTATE, -1, Vec3::ZERO)],
            Vec::new(),
        )
        .unwrap();
        let make = |i: usize, mode, y: f32| {
            MmdRigidBody::new(
                i,
                format!("rb{i}"),
                Some(0),
                RigidBodyShape::Sphere,
                Vec3::splat(0.5),
                Vec3::new(0.0, y, 0.0),
                Vec3::ZERO,
                RigidBodyMaterial::default(),
                mode,
            )
        };
        let mut bodies = vec![make(0, PhysicsMode::FollowBone, 5.0), make(1, PhysicsMode::Physics, 4.0)];
        for b in &mut bodies {
            assert!(b.join_world(&mut physics, &bones));
        }

        let mut joint = MmdJoint::new("j", 0, 1, Vec3::new(0.0, 4.5, 0.0), Vec3::ZERO, limits());
        assert!(joint.attach(&mut physics, &bodies));
        assert_eq!(physics.joint_count(), 1);
        joint.detach(&mut physics);
        assert_eq!(physics.joint_count(), 0);
        assert!(joint.handle().is_none());
    }
}
