//! 物理系统
//!
//! Rapier3D 物理世界、MMD 刚体与 6DOF 弹簧关节。

pub mod config;
mod mmd_joint;
mod mmd_physics;
mod mmd_rigid_body;

pub use config::{get_config, reset_config, set_config, PhysicsConfig};
pub use mmd_joint::{JointLimits, MmdJoint};
pub use mmd_physics::MMDPhysics;
pub use mmd_rigid_body::{
    euler_zyx, isometry_to_mat4, mat4_to_isometry, MmdRigidBody, MotionState, PhysicsMode,
    RigidBodyMaterial, RigidBodyShape,
};
