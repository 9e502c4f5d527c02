//! MMD 物理配置
//!
//! 所有参数扁平化。全局实例供运行时调试修改，
//! 也可以通过 `MMDPhysics::with_config` 传入独立配置。

use once_cell::sync::Lazy;
use std::sync::RwLock;

/// 物理配置（扁平化，不嵌套）
#[derive(Debug, Clone, PartialEq)]
pub struct PhysicsConfig {
    // ========== 重力 ==========
    /// 重力 Y 分量（负数向下），默认 -98.0（MMD 标准）
    pub gravity_y: f32,

    // ========== 模拟参数 ==========
    /// 物理 FPS（固定步长 = 1 / physics_fps），默认 60.0
    pub physics_fps: f32,
    /// 每帧最大子步数，超出部分的时间被丢弃，默认 5
    pub max_substep_count: i32,
    /// 求解器迭代次数，默认 8
    pub solver_iterations: usize,

    // ========== 刚体参数缩放 ==========
    /// 线性阻尼缩放（乘以模型原值），默认 1.0
    pub linear_damping_scale: f32,
    /// 角速度阻尼缩放（乘以模型原值），默认 1.0
    pub angular_damping_scale: f32,
    /// 质量缩放（乘以模型原值），默认 1.0
    pub mass_scale: f32,

    // ========== 6DOF 弹簧 ==========
    /// 弹簧刚度缩放因子，默认 1.0
    pub spring_stiffness_scale: f32,

    // ========== 速度限制 ==========
    /// 最大线速度，默认 100.0
    pub max_linear_velocity: f32,
    /// 最大角速度（rad/s），默认 50.0
    pub max_angular_velocity: f32,

    // ========== 场景 ==========
    /// 是否创建地面（y = 0 平面），默认 true
    pub ground_enabled: bool,
    /// 是否启用关节，默认 true
    pub joints_enabled: bool,

    // ========== 调试 ==========
    /// 是否输出逐刚体调试日志，默认 false
    pub debug_log: bool,
}

impl Default for PhysicsConfig {
    fn default() -> Self {
        Self {
            // MMD 模型的弹簧/质量/阻尼参数都是为此重力设计的
            gravity_y: -98.0,

            physics_fps: 60.0,
            max_substep_count: 5,
            solver_iterations: 8,

            linear_damping_scale: 1.0,
            angular_damping_scale: 1.0,
            mass_scale: 1.0,

            spring_stiffness_scale: 1.0,

            // 适配 -98 重力
            max_linear_velocity: 100.0,
            max_angular_velocity: 50.0,

            ground_enabled: true,
            joints_enabled: true,

            debug_log: false,
        }
    }
}

impl PhysicsConfig {
    /// 固定步长（秒）
    #[inline]
    pub fn fixed_time_step(&self) -> f32 {
        if self.physics_fps > 0.0 {
            1.0 / self.physics_fps
        } else {
            1.0 / 60.0
        }
    }
}

/// 全局配置实例
static PHYSICS_CONFIG: Lazy<RwLock<PhysicsConfig>> =
    Lazy::new(|| RwLock::new(PhysicsConfig::default()));

/// 获取当前配置（只读）
pub fn get_config() -> PhysicsConfig {
    PHYSICS_CONFIG.read().unwrap_or_else(|e| e.into_inner()).clone()
}

/// 手动设置配置（用于运行时调试）
pub fn set_config(config: PhysicsConfig) {
    *PHYSICS_CONFIG.write().unwrap_or_else(|e| e.into_inner()) = config;
}

/// 重置为默认配置
pub fn reset_config() {
    *PHYSICS_CONFIG.write().unwrap_or_else(|e| e.into_inner()) = PhysicsConfig::default();
}
