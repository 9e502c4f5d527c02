//! 每帧更新编排
//!
//! 严格顺序：
//! 1. 动画求值 → 写入骨骼旋转/位移
//! 2. 骨骼层级变换（父先于子）
//! 3. IK 求解（受影响的子链重新求值）
//! 4. 运动学刚体：骨骼 → 刚体
//! 5. 物理步进
//! 6. 动态刚体：刚体 → 骨骼
//! 7. 被物理驱动的骨骼不再走第 2 步的父链求值（它们通常是约束图的叶子）
//!
//! 调用方负责避免重入 advance。

use std::collections::HashMap;

use glam::{Mat4, Quat, Vec3};

use crate::model::Model;
use crate::physics::{MMDPhysics, MmdRigidBody, PhysicsConfig};
use crate::skeleton::{BonePose, BoneSet};

/// 动画时间基准（帧/秒）
pub const MOTION_FPS: f32 = 30.0;

// ============================================================================
// 动画求值接口
// ============================================================================

/// 动画求值器：把某一帧的动画姿态写入骨骼
///
/// 关键帧插值不在本 crate 内实现。
pub trait MotionEvaluator {
    fn evaluate(&self, frame: f32, bones: &mut BoneSet);
}

impl<F> MotionEvaluator for F
where
    F: Fn(f32, &mut BoneSet),
{
    fn evaluate(&self, frame: f32, bones: &mut BoneSet) {
        self(frame, bones)
    }
}

/// 静态姿态（按骨骼名称），与帧号无关
#[derive(Clone, Debug, Default)]
pub struct PoseSnapshot {
    poses: HashMap<String, BonePose>,
}

impl PoseSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, bone: impl Into<String>, translation: Vec3, rotation: Quat) {
        self.poses
            .insert(bone.into(), BonePose::new(translation, rotation));
    }

    pub fn with(mut self, bone: impl Into<String>, translation: Vec3, rotation: Quat) -> Self {
        self.set(bone, translation, rotation);
        self
    }

    /// 记录骨骼当前的动画姿态（仅非绑定姿态的骨骼）
    pub fn capture(bones: &BoneSet) -> Self {
        let poses = bones
            .iter()
            .filter(|b| b.local_position != Vec3::ZERO || b.rotation != Quat::IDENTITY)
            .map(|b| (b.name.clone(), BonePose::new(b.local_position, b.rotation)))
            .collect();
        Self { poses }
    }

    pub fn get(&self, bone: &str) -> Option<&BonePose> {
        self.poses.get(bone)
    }

    pub fn len(&self) -> usize {
        self.poses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.poses.is_empty()
    }
}

impl MotionEvaluator for PoseSnapshot {
    fn evaluate(&self, _frame: f32, bones: &mut BoneSet) {
        for (name, pose) in &self.poses {
            if let Some(id) = bones.find_bone_by_name(name) {
                bones.set_bone_pose(id, pose.translation, pose.rotation);
            }
        }
    }
}

// ============================================================================
// 控制器
// ============================================================================

/// 场景控制器：持有模型与物理世界，驱动每帧更新
pub struct MotionController {
    model: Model,
    physics: MMDPhysics,
    motion: Option<Box<dyn MotionEvaluator>>,
    frame: f32,
    physics_enabled: bool,
}

impl MotionController {
    /// 创建物理世界，所有刚体在绑定姿态下加入世界，并创建关节
    pub fn new(model: Model, config: PhysicsConfig) -> Self {
        let mut controller = Self {
            model,
            physics: MMDPhysics::with_config(config),
            motion: None,
            frame: 0.0,
            physics_enabled: true,
        };
        controller.build_physics();
        controller
    }

    fn build_physics(&mut self) {
        let (bones, bodies, joints) = self.model.parts_mut();
        bones.reset_pose();
        bones.update_transforms();

        let mut joined = 0usize;
        for body in bodies.iter_mut() {
            if body.join_world(&mut self.physics, bones) {
                joined += 1;
            }
        }
        let mut attached = 0usize;
        for joint in joints.iter_mut() {
            if joint.attach(&mut self.physics, bodies) {
                attached += 1;
            }
        }
        log::info!(
            "[物理] 构建完成: 刚体 {}/{}, 关节 {}/{}",
            joined,
            bodies.len(),
            attached,
            joints.len()
        );
    }

    // ========================================
    // 访问器
    // ========================================

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut Model {
        &mut self.model
    }

    pub fn physics(&self) -> &MMDPhysics {
        &self.physics
    }

    pub fn physics_mut(&mut self) -> &mut MMDPhysics {
        &mut self.physics
    }

    pub fn frame(&self) -> f32 {
        self.frame
    }

    pub fn physics_enabled(&self) -> bool {
        self.physics_enabled
    }

    pub fn set_motion(&mut self, motion: Box<dyn MotionEvaluator>) {
        self.motion = Some(motion);
    }

    pub fn clear_motion(&mut self) {
        self.motion = None;
    }

    /// 蒙皮矩阵（每个骨骼的本地变换）
    pub fn skinning_matrices(&self) -> Vec<Mat4> {
        self.model.bones().skinning_matrices()
    }

    pub fn world_transforms(&self) -> Vec<Mat4> {
        self.model.bones().world_transforms()
    }

    // ========================================
    // 每帧更新
    // ========================================

    /// 推进一帧；负数/NaN 的经过时间按 0 处理
    pub fn advance(&mut self, elapsed_seconds: f32) {
        let elapsed = if elapsed_seconds.is_finite() && elapsed_seconds > 0.0 {
            elapsed_seconds
        } else {
            0.0
        };
        self.frame += elapsed * MOTION_FPS;

        self.evaluate_pose();
        if self.physics_enabled {
            self.push_kinematic_bodies();
            self.physics.step_simulation(elapsed);
            self.pull_dynamic_bodies();
        }
    }

    /// 跳到指定帧：重放 1~3 步，并重置所有刚体
    pub fn seek(&mut self, frame: f32) {
        self.frame = if frame.is_finite() { frame.max(0.0) } else { 0.0 };
        self.evaluate_pose();
        self.reset_bodies();
    }

    /// 关闭时跳过 4~6 步；重新开启时刚体瞬移到当前姿态
    pub fn set_physics_enabled(&mut self, enabled: bool) {
        if enabled && !self.physics_enabled {
            self.reset_bodies();
        }
        self.physics_enabled = enabled;
    }

    /// 切换全部刚体的激活状态（编辑器拖拽骨骼时临时切到运动学）
    pub fn set_bodies_active(&mut self, active: bool) {
        let (_, bodies, _) = self.model.parts_mut();
        for body in bodies.iter_mut() {
            body.set_activation(&mut self.physics, active);
        }
    }

    /// 修改刚体属性，并把新参数同步到物理世界
    pub fn update_rigid_body<R>(
        &mut self,
        index: usize,
        edit: impl FnOnce(&mut MmdRigidBody) -> R,
    ) -> Option<R> {
        let body = self.model.rigid_body_mut(index)?;
        let result = edit(body);
        body.apply_parameters(&mut self.physics);
        Some(result)
    }

    /// 1~3 步
    fn evaluate_pose(&mut self) {
        let bones = self.model.bones_mut();
        bones.reset_pose();
        if let Some(motion) = &self.motion {
            motion.evaluate(self.frame, bones);
        }
        bones.update_transforms();
        bones.solve_ik();
    }

    fn push_kinematic_bodies(&mut self) {
        let (bones, bodies, _) = self.model.parts_mut();
        for body in bodies.iter() {
            body.push_from_bone(&mut self.physics, bones);
        }
    }

    fn pull_dynamic_bodies(&mut self) {
        let (bones, bodies, _) = self.model.parts_mut();
        for body in bodies.iter() {
            body.pull_to_bone(&mut self.physics, bones);
        }
    }

    fn reset_bodies(&mut self) {
        let (bones, bodies, _) = self.model.parts_mut();
        for body in bodies.iter_mut() {
            body.update_transform(&mut self.physics, bones);
            body.reset_body(&mut self.physics);
        }
    }

    /// 从物理世界移除全部关节与刚体，交还模型
    pub fn into_model(mut self) -> Model {
        let (_, bodies, joints) = self.model.parts_mut();
        for joint in joints.iter_mut() {
            joint.detach(&mut self.physics);
        }
        for body in bodies.iter_mut() {
            body.leave_world(&mut self.physics);
        }
        self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::build_model;
    use crate::model::pmd::{BoneRecord, ModelRecords, RawName, RigidBodyRecord, NO_BONE};
    use crate::physics::MotionState;

    fn bone(name: &str, parent: i16, position: Vec3) -> BoneRecord {
        BoneRecord {
            name: RawName::encode(name),
            parent,
            child: -1,
            type_code: 1,
            target: -1,
            position,
        }
    }

    fn body(name: &str, bone: u16, mode: u8, position: Vec3) -> RigidBodyRecord {
        RigidBodyRecord {
            name: RawName::encode(name),
            bone,
            group: 0,
            mask: 0xFFFF,
            shape: 1,
            size: Vec3::splat(0.5),
            position,
            rotation: Vec3::ZERO,
            mass: 1.0,
            linear_damping: 0.0,
            angular_damping: 0.0,
            restitution: 0.0,
            friction: 0.5,
            mode,
        }
    }

    /// センター(运动学刚体) + 髪(动态刚体)
    fn controller() -> MotionController {
        let records = ModelRecords {
            bones: vec![
                bone("センター", -1, Vec3::new(0.0, 10.0, 0.0)),
                bone("髪", 0, Vec3::new(3.0, 10.0, 0.0)),
            ],
            iks: Vec::new(),
            rigid_bodies: vec![
                body("センター", 0, 0, Vec3::ZERO),
                body("髪", 1, 1, Vec3::ZERO),
                body("free", NO_BONE, 1, Vec3::new(-3.0, 10.0, 0.0)),
            ],
            joints: Vec::new(),
        };
        let model = build_model("scene", &records).unwrap();
        MotionController::new(model, PhysicsConfig::default())
    }

    #[test]
    fn test_frame_cursor() {
        let mut c = controller();
        c.advance(1.0);
        assert!((c.frame() - 30.0).abs() < 1e-4);
        c.advance(-1.0);
        c.advance(f32::NAN);
        assert!((c.frame() - 30.0).abs() < 1e-4);
        c.seek(f32::NAN);
        assert_eq!(c.frame(), 0.0);
    }

    #[test]
    fn test_kinematic_body_follows_animation() {
        let mut c = controller();
        let motion = PoseSnapshot::new().with(
            "センター",
            Vec3::new(1.0, 0.0, 0.0),
            Quat::from_rotation_y(0.5),
        );
        c.set_motion(Box::new(motion));
        c.advance(1.0 / 30.0);

        let bone_local = c.model().bones().get(0).unwrap().local_transform();
        let rb = &c.model().rigid_bodies()[0];
        let world = c
            .physics()
            .body_world_transform(rb.body_handle().unwrap())
            .unwrap();
        assert!(world.abs_diff_eq(bone_local * rb.rest_transform(), 1e-4));
    }

    #[test]
    fn test_dynamic_body_drives_bone() {
        let mut c = controller();
        for _ in 0..10 {
            c.advance(1.0 / 60.0);
        }
        let hair = c.model().bones().get(1).unwrap();
        assert!(hair.is_simulated());
        // 下落
        assert!(hair.world_position().y < 10.0);
    }

    #[test]
    fn test_disabled_physics_keeps_animation() {
        let mut c = controller();
        c.set_physics_enabled(false);
        for _ in 0..10 {
            c.advance(1.0 / 60.0);
        }
        let hair = c.model().bones().get(1).unwrap();
        assert!(!hair.is_simulated());
        assert!((hair.world_position() - Vec3::new(3.0, 10.0, 0.0)).length() < 1e-5);
    }

    #[test]
    fn test_seek_resets_bodies() {
        let mut c = controller();
        for _ in 0..20 {
            c.advance(1.0 / 60.0);
        }
        c.seek(0.0);
        let rb = &c.model().rigid_bodies()[1];
        let handle = rb.body_handle().unwrap();
        let world = c.physics().body_world_transform(handle).unwrap();
        assert!((world.w_axis.truncate() - Vec3::new(3.0, 10.0, 0.0)).length() < 1e-5);
        assert_eq!(c.physics().rigid_body_set[handle].linvel().norm(), 0.0);
    }

    #[test]
    fn test_bodies_deactivate_for_editing() {
        let mut c = controller();
        c.set_bodies_active(false);
        assert!(c
            .model()
            .rigid_bodies()
            .iter()
            .all(|b| b.motion_state() == MotionState::Kinematic));
        c.set_bodies_active(true);
        assert_eq!(c.model().rigid_bodies()[1].motion_state(), MotionState::Active);
    }

    #[test]
    fn test_capture_pose() {
        let mut c = controller();
        c.set_motion(Box::new(PoseSnapshot::new().with(
            "髪",
            Vec3::ZERO,
            Quat::from_rotation_x(0.3),
        )));
        c.set_physics_enabled(false);
        c.advance(1.0 / 30.0);
        let snapshot = PoseSnapshot::capture(c.model().bones());
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.get("センター").is_none());
        assert!(snapshot.get("髪").is_some());
    }

    #[test]
    fn test_rigid_body_edit_reaches_engine() {
        let mut c = controller();
        let friction = c.update_rigid_body(1, |rb| {
            rb.set_friction(0.2);
            rb.material().friction
        });
        assert_eq!(friction, Some(0.2));
        let handle = c.model().rigid_bodies()[1].collider_handle().unwrap();
        assert!((c.physics().collider_set[handle].friction() - 0.2).abs() < 1e-6);
        assert!(c.update_rigid_body(99, |_| ()).is_none());
    }

    #[test]
    fn test_into_model_leaves_world() {
        let c = controller();
        let model = c.into_model();
        assert!(model.rigid_bodies().iter().all(|b| !b.is_in_world()));
    }

    #[test]
    fn test_closure_evaluator_receives_frame() {
        let mut c = controller();
        c.set_motion(Box::new(|frame: f32, bones: &mut BoneSet| {
            bones.set_bone_pose(0, Vec3::new(frame, 0.0, 0.0), Quat::IDENTITY);
        }));
        c.advance(0.5);
        let center = c.model().bones().get(0).unwrap();
        assert!((center.world_position().x - 15.0).abs() < 1e-4);
    }
}
