//! MMD 物理世界管理器
//!
//! 使用 Rapier3D 实现，刚体与关节数据归模型所有，这里只持有物理世界本身。
//!
//! ## Bullet3 → Rapier 映射
//! | Bullet3 | Rapier |
//! |---------|--------|
//! | btDiscreteDynamicsWorld | PhysicsPipeline + RigidBodySet + ColliderSet + ImpulseJointSet |
//! | btDbvtBroadphase | DefaultBroadPhase |
//! | btCollisionDispatcher | NarrowPhase |
//! | cleanProxyFromPairs | 碰撞体移除后重新插入（新的宽相代理） |

use std::num::NonZeroUsize;

use glam::{Mat4, Vec3};
use rapier3d::math::{Real, Vector};
use rapier3d::prelude::*;

use super::config::{get_config, PhysicsConfig};
use super::mmd_rigid_body::isometry_to_mat4;

/// MMD 物理世界
pub struct MMDPhysics {
    pub physics_pipeline: PhysicsPipeline,
    pub integration_parameters: IntegrationParameters,
    pub island_manager: IslandManager,
    pub broad_phase: DefaultBroadPhase,
    pub narrow_phase: NarrowPhase,
    pub rigid_body_set: RigidBodySet,
    pub collider_set: ColliderSet,
    pub impulse_joint_set: ImpulseJointSet,
    pub multibody_joint_set: MultibodyJointSet,
    pub ccd_solver: CCDSolver,
    /// 地面刚体句柄
    pub ground_handle: Option<RigidBodyHandle>,
    gravity: Vector<Real>,
    config: PhysicsConfig,
    /// 未消化的累积时间（Bullet stepSimulation 的 localTime）
    local_time: f32,
}

impl MMDPhysics {
    /// 以全局配置创建
    pub fn new() -> Self {
        Self::with_config(get_config())
    }

    pub fn with_config(config: PhysicsConfig) -> Self {
        let mut rigid_body_set = RigidBodySet::new();
        let mut collider_set = ColliderSet::new();

        // 地面：上表面位于 y = 0 的大盒子
        let ground_handle = if config.ground_enabled {
            let ground = RigidBodyBuilder::fixed()
                .translation(vector![0.0, -50.0, 0.0])
                .build();
            let handle = rigid_body_set.insert(ground);
            let ground_collider = ColliderBuilder::cuboid(1000.0, 50.0, 1000.0).build();
            collider_set.insert_with_parent(ground_collider, handle, &mut rigid_body_set);
            Some(handle)
        } else {
            None
        };

        let mut integration_parameters = IntegrationParameters::default();
        integration_parameters.dt = config.fixed_time_step();
        integration_parameters.num_solver_iterations =
            NonZeroUsize::new(config.solver_iterations).unwrap_or(NonZeroUsize::MIN);

        if config.debug_log {
            log::info!(
                "[物理配置] FPS={}, 重力Y={}, 求解器迭代={}, 最大子步={}",
                config.physics_fps,
                config.gravity_y,
                config.solver_iterations,
                config.max_substep_count
            );
        }

        Self {
            physics_pipeline: PhysicsPipeline::new(),
            integration_parameters,
            island_manager: IslandManager::new(),
            broad_phase: DefaultBroadPhase::new(),
            narrow_phase: NarrowPhase::new(),
            rigid_body_set,
            collider_set,
            impulse_joint_set: ImpulseJointSet::new(),
            multibody_joint_set: MultibodyJointSet::new(),
            ccd_solver: CCDSolver::new(),
            ground_handle,
            gravity: vector![0.0, config.gravity_y, 0.0],
            config,
            local_time: 0.0,
        }
    }

    #[inline]
    pub fn config(&self) -> &PhysicsConfig {
        &self.config
    }

    pub fn set_gravity(&mut self, gravity: Vec3) {
        self.gravity = vector![gravity.x, gravity.y, gravity.z];
    }

    pub fn gravity(&self) -> Vec3 {
        Vec3::new(self.gravity.x, self.gravity.y, self.gravity.z)
    }

    pub fn set_fps(&mut self, fps: f32) {
        if fps > 0.0 && fps.is_finite() {
            self.config.physics_fps = fps;
            self.integration_parameters.dt = self.config.fixed_time_step();
        }
    }

    pub fn set_max_substep_count(&mut self, count: i32) {
        self.config.max_substep_count = count;
    }

    /// 世界中的刚体数量（含地面）
    pub fn body_count(&self) -> usize {
        self.rigid_body_set.len()
    }

    pub fn joint_count(&self) -> usize {
        self.impulse_joint_set.len()
    }

    // ========================================
    // 刚体/关节增删
    // ========================================

    pub fn insert_body(
        &mut self,
        body: RigidBody,
        collider: Collider,
    ) -> (RigidBodyHandle, ColliderHandle) {
        let body_handle = self.rigid_body_set.insert(body);
        let collider_handle =
            self.collider_set
                .insert_with_parent(collider, body_handle, &mut self.rigid_body_set);
        (body_handle, collider_handle)
    }

    /// 移除刚体及其碰撞体与关节
    pub fn remove_body(&mut self, handle: RigidBodyHandle) -> bool {
        self.rigid_body_set
            .remove(
                handle,
                &mut self.island_manager,
                &mut self.collider_set,
                &mut self.impulse_joint_set,
                &mut self.multibody_joint_set,
                true,
            )
            .is_some()
    }

    pub fn insert_joint(
        &mut self,
        body_a: RigidBodyHandle,
        body_b: RigidBodyHandle,
        joint: GenericJoint,
    ) -> ImpulseJointHandle {
        self.impulse_joint_set.insert(body_a, body_b, joint, true)
    }

    pub fn remove_joint(&mut self, handle: ImpulseJointHandle) -> bool {
        self.impulse_joint_set.remove(handle, true).is_some()
    }

    /// 清除宽相中引用该碰撞体的缓存配对
    ///
    /// 碰撞体被移除后重新挂到同一刚体上，返回新的碰撞体句柄。
    pub fn purge_collider_pairs(
        &mut self,
        body: RigidBodyHandle,
        collider: ColliderHandle,
    ) -> Option<ColliderHandle> {
        let removed = self.collider_set.remove(
            collider,
            &mut self.island_manager,
            &mut self.rigid_body_set,
            true,
        )?;
        Some(
            self.collider_set
                .insert_with_parent(removed, body, &mut self.rigid_body_set),
        )
    }

    pub fn body_world_transform(&self, handle: RigidBodyHandle) -> Option<Mat4> {
        self.rigid_body_set
            .get(handle)
            .map(|rb| isometry_to_mat4(rb.position()))
    }

    // ========================================
    // 步进
    // ========================================

    /// 推进物理模拟，返回实际执行的子步数
    ///
    /// 固定步长累积器：不足一步的时间留到下一帧，
    /// 超过最大子步数的部分直接丢弃。负数/NaN/零输入不做任何事。
    pub fn step_simulation(&mut self, delta_time: f32) -> u32 {
        if !delta_time.is_finite() || delta_time <= 0.0 {
            return 0;
        }

        let fixed_dt = self.config.fixed_time_step();
        self.local_time += delta_time;
        let mut steps = 0u32;
        if self.local_time >= fixed_dt {
            steps = (self.local_time / fixed_dt) as u32;
            self.local_time -= steps as f32 * fixed_dt;
        }
        let max_steps = self.config.max_substep_count.max(1) as u32;
        let steps = steps.min(max_steps);

        self.integration_parameters.dt = fixed_dt;
        for _ in 0..steps {
            self.step_once();
        }
        if steps > 0 {
            self.clamp_velocities();
        }
        steps
    }

    fn step_once(&mut self) {
        self.physics_pipeline.step(
            &self.gravity,
            &self.integration_parameters,
            &mut self.island_manager,
            &mut self.broad_phase,
            &mut self.narrow_phase,
            &mut self.rigid_body_set,
            &mut self.collider_set,
            &mut self.impulse_joint_set,
            &mut self.multibody_joint_set,
            &mut self.ccd_solver,
            None,
            &(),
            &(),
        );
    }

    /// 限制动态刚体速度，防止穿透后的恢复力导致爆炸
    fn clamp_velocities(&mut self) {
        let max_linear = self.config.max_linear_velocity;
        let max_angular = self.config.max_angular_velocity;

        for (_, rb) in self.rigid_body_set.iter_mut() {
            if !rb.is_dynamic() {
                continue;
            }
            let linvel = *rb.linvel();
            let linvel_mag = linvel.norm();
            if linvel_mag > max_linear {
                rb.set_linvel(linvel * (max_linear / linvel_mag), true);
            }
            let angvel = *rb.angvel();
            let angvel_mag = angvel.norm();
            if angvel_mag > max_angular {
                rb.set_angvel(angvel * (max_angular / angvel_mag), true);
            }
        }
    }
}

impl Default for MMDPhysics {
    fn default() -> Self {
        Self::new()
    }
}
