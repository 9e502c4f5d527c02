//! 属性变更事件
//!
//! 编辑器可订阅骨骼与刚体的属性变更。事件在值写入之前发出。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use crate::skeleton::BoneId;

/// 属性变更事件
#[derive(Clone, Debug, PartialEq)]
pub enum PropertyEvent {
    BoneNameWillChange { bone: BoneId, name: String },
    RigidBodyNameWillChange { body: usize, name: String },
    RigidBodyBoneWillChange { body: usize, bone: Option<BoneId> },
    MassWillChange { body: usize, value: f32 },
    LinearDampingWillChange { body: usize, value: f32 },
    AngularDampingWillChange { body: usize, value: f32 },
    FrictionWillChange { body: usize, value: f32 },
    RestitutionWillChange { body: usize, value: f32 },
    CollisionGroupWillChange { body: usize, group: u8 },
    CollisionMaskWillChange { body: usize, mask: u16 },
}

pub type ListenerId = usize;
type Listener = Arc<dyn Fn(&PropertyEvent) + Send + Sync>;

/// 事件分发器，克隆后共享同一组监听器
#[derive(Clone, Default)]
pub struct PropertyEventHub {
    listeners: Arc<RwLock<Vec<(ListenerId, Listener)>>>,
    next_id: Arc<AtomicUsize>,
}

impl PropertyEventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&PropertyEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    pub fn emit(&self, event: &PropertyEvent) {
        // 复制一份再调用，监听器内可以安全地再订阅
        let snapshot: Vec<Listener> = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in snapshot {
            listener(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl std::fmt::Debug for PropertyEventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropertyEventHub")
            .field("listeners", &self.listener_count())
            .finish()
    }
}
