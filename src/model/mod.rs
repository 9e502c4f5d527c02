//! 模型
//!
//! - pmd: 骨骼/IK/刚体/关节记录编解码
//! - loader: 记录 → Model 的组装与结构校验

mod loader;
pub mod pmd;

pub use loader::{build_model, load_model, load_model_from_bytes};
pub use pmd::ModelRecords;

use crate::events::{ListenerId, PropertyEvent, PropertyEventHub};
use crate::physics::{MmdJoint, MmdRigidBody};
use crate::skeleton::BoneSet;

/// 已校验的模型：骨骼、刚体、关节均归模型独占
#[derive(Debug)]
pub struct Model {
    pub name: String,
    bones: BoneSet,
    rigid_bodies: Vec<MmdRigidBody>,
    joints: Vec<MmdJoint>,
    events: PropertyEventHub,
}

impl Model {
    pub(crate) fn from_parts(
        name: String,
        bones: BoneSet,
        rigid_bodies: Vec<MmdRigidBody>,
        joints: Vec<MmdJoint>,
        events: PropertyEventHub,
    ) -> Self {
        Self {
            name,
            bones,
            rigid_bodies,
            joints,
            events,
        }
    }

    pub fn bones(&self) -> &BoneSet {
        &self.bones
    }

    pub fn bones_mut(&mut self) -> &mut BoneSet {
        &mut self.bones
    }

    pub fn rigid_bodies(&self) -> &[MmdRigidBody] {
        &self.rigid_bodies
    }

    /// 只修改描述；已加入物理世界时用 `MotionController::update_rigid_body`
    pub fn rigid_body_mut(&mut self, index: usize) -> Option<&mut MmdRigidBody> {
        self.rigid_bodies.get_mut(index)
    }

    pub fn joints(&self) -> &[MmdJoint] {
        &self.joints
    }

    /// 同时借出各部分，供物理同步使用
    pub(crate) fn parts_mut(&mut self) -> (&mut BoneSet, &mut [MmdRigidBody], &mut [MmdJoint]) {
        (&mut self.bones, &mut self.rigid_bodies, &mut self.joints)
    }

    /// 订阅骨骼与刚体的属性变更
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&PropertyEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.events.unsubscribe(id)
    }
}
