//! MMD 运动核心 - 骨骼变换、IK 求解与刚体物理耦合
//!
//! 提供 MMD 兼容角色的运行时核心：
//! - 骨骼层级变换（旋转跟随、附加旋转、固定轴等骨骼类型）
//! - CCD IK 求解
//! - 刚体与骨骼的双向同步（运动学 / 动态 / 动态跟骨）
//! - 每帧更新顺序编排
//! - PMD 骨骼/IK/刚体/关节记录编解码

pub mod events;
pub mod model;
pub mod physics;
pub mod scene;
pub mod skeleton;

pub use events::{ListenerId, PropertyEvent, PropertyEventHub};
pub use model::{Model, ModelRecords};
pub use physics::{MMDPhysics, MmdJoint, MmdRigidBody, MotionState, PhysicsConfig, PhysicsMode};
pub use scene::{MotionController, MotionEvaluator, PoseSnapshot};
pub use skeleton::{Bone, BoneBehavior, BoneId, BonePose, BoneSet, IkConstraint, IkSolver};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MmdError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("PMD parse error: {0}")]
    PmdParse(String),

    #[error("truncated {section} record {index}")]
    Truncated { section: &'static str, index: usize },

    #[error("bone {bone}: {field} index {index} out of range (bone count {count})")]
    InvalidBoneIndex {
        bone: usize,
        field: &'static str,
        index: i32,
        count: usize,
    },

    #[error("{owner} {index}: rigid body index {body} out of range (body count {count})")]
    InvalidRigidBodyIndex {
        owner: &'static str,
        index: usize,
        body: i64,
        count: usize,
    },

    #[error("bone hierarchy contains a cycle through bone {0}")]
    CyclicHierarchy(usize),
}

pub type Result<T> = std::result::Result<T, MmdError>;
