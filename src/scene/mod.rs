//! 场景：动画求值 → 骨骼 → IK → 物理 → 骨骼 的每帧编排

mod controller;

pub use controller::{MotionController, MotionEvaluator, PoseSnapshot, MOTION_FPS};
