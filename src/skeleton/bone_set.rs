//! 骨骼集合
//!
//! 扁平数组存储全部骨骼，按父先于子的拓扑顺序求值世界变换。

use std::collections::HashMap;

use glam::{Mat3, Mat4, Quat, Vec3};

use super::bone_link::{BoneBehavior, BoneId, BoneLink, IkConstraint};
use super::ik_solver::IkSolver;
use crate::events::{PropertyEvent, PropertyEventHub};
use crate::{MmdError, Result};

/// IK 链描述（原始记录索引，构建时校验）
#[derive(Clone, Debug, PartialEq)]
pub struct IkChainDesc {
    pub root: i32,
    pub target: i32,
    pub effectors: Vec<i32>,
    pub iterations: u32,
    pub max_angle: f32,
}

/// 骨骼集合
#[derive(Debug, Default)]
pub struct BoneSet {
    bones: Vec<BoneLink>,
    name_to_index: HashMap<String, BoneId>,
    /// 父先于子的求值顺序
    sorted_indices: Vec<BoneId>,
    children_cache: Vec<Vec<BoneId>>,
    ik_solvers: Vec<IkSolver>,
    ik_enabled: bool,
    events: PropertyEventHub,
}

impl BoneSet {
    /// 两阶段构建：解析引用、建立求值顺序、挂接 IK
    pub fn build(bones: Vec<BoneLink>, chains: Vec<IkChainDesc>) -> Result<Self> {
        let mut set = Self {
            bones,
            ik_enabled: true,
            ..Default::default()
        };
        set.resolve_references()?;
        set.build_evaluation_order()?;
        set.attach_ik_chains(chains);
        set.name_to_index = set
            .bones
            .iter()
            .enumerate()
            .map(|(i, b)| (b.name.clone(), i))
            .collect();
        set.update_transforms();
        log::info!(
            "[骨骼] 构建完成: {} 个骨骼, {} 个 IK 链",
            set.bones.len(),
            set.ik_solvers.len()
        );
        Ok(set)
    }

    fn resolve_references(&mut self) -> Result<()> {
        let count = self.bones.len();
        let resolve = |bone: usize, field: &'static str, raw: i16| -> Result<Option<BoneId>> {
            if raw < 0 {
                Ok(None)
            } else if (raw as usize) < count {
                Ok(Some(raw as usize))
            } else {
                Err(MmdError::InvalidBoneIndex {
                    bone,
                    field,
                    index: raw as i32,
                    count,
                })
            }
        };

        for i in 0..count {
            let (parent_raw, child_raw, target_raw) = {
                let b = &self.bones[i];
                (b.parent_index, b.child_index, b.target_index)
            };
            let parent = resolve(i, "parent", parent_raw)?;
            let child = resolve(i, "child", child_raw)?;
            let target = resolve(i, "target", target_raw)?;

            let parent_origin = parent.map(|p| self.bones[p].origin);
            let child_origin = child.map(|c| self.bones[c].origin);

            let bone = &mut self.bones[i];
            bone.index = i;
            bone.parent = parent;
            bone.child = child;
            bone.target = target;
            bone.offset = match parent_origin {
                Some(origin) => bone.origin - origin,
                None => bone.origin,
            };
            bone.fixed_axis = child_origin
                .map(|c| (c - bone.origin).normalize_or_zero())
                .unwrap_or(Vec3::ZERO);
            bone.behavior =
                BoneBehavior::resolve(bone.type_code, target_raw, target, child, bone.fixed_axis);
            bone.flags = bone.behavior.capabilities();
        }
        Ok(())
    }

    fn build_evaluation_order(&mut self) -> Result<()> {
        let count = self.bones.len();
        let mut children = vec![Vec::new(); count];
        let mut roots = Vec::new();
        for (i, bone) in self.bones.iter().enumerate() {
            match bone.parent {
                Some(p) => children[p].push(i),
                None => roots.push(i),
            }
        }

        // 从根节点出发的深度优先遍历，环上的骨骼不可达
        let mut order = Vec::with_capacity(count);
        let mut stack: Vec<BoneId> = roots.into_iter().rev().collect();
        while let Some(idx) = stack.pop() {
            order.push(idx);
            stack.extend(children[idx].iter().rev().copied());
        }

        if order.len() != count {
            let mut visited = vec![false; count];
            for &i in &order {
                visited[i] = true;
            }
            let culprit = visited.iter().position(|v| !v).unwrap_or(0);
            return Err(MmdError::CyclicHierarchy(culprit));
        }

        self.sorted_indices = order;
        self.children_cache = children;
        Ok(())
    }

    fn attach_ik_chains(&mut self, chains: Vec<IkChainDesc>) {
        let count = self.bones.len();
        let valid = |i: i32| i >= 0 && (i as usize) < count;

        for chain in chains {
            if !valid(chain.root) || !valid(chain.target) || chain.root == chain.target {
                log::warn!(
                    "[IK] 丢弃无效 IK 链: root={}, target={}",
                    chain.root,
                    chain.target
                );
                continue;
            }
            if chain.effectors.is_empty() || !chain.effectors.iter().all(|&e| valid(e)) {
                log::warn!(
                    "[IK] 丢弃无效 IK 链: root={}, effectors={:?}",
                    chain.root,
                    chain.effectors
                );
                continue;
            }

            if !(chain.max_angle.is_finite() && chain.max_angle > 0.0) {
                log::warn!(
                    "[IK] 丢弃无效 IK 链: root={}, max_angle={}",
                    chain.root,
                    chain.max_angle
                );
                continue;
            }

            let constraint = IkConstraint {
                root: chain.root as usize,
                target: chain.target as usize,
                effectors: chain.effectors.iter().map(|&e| e as usize).collect(),
                iterations: chain.iterations,
                max_angle: chain.max_angle,
            };
            self.bones[constraint.root].ik = Some(constraint.clone());
            self.ik_solvers.push(IkSolver::new(constraint));
        }
    }

    // ========================================
    // 查询
    // ========================================

    #[inline]
    pub fn len(&self) -> usize {
        self.bones.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bones.is_empty()
    }

    #[inline]
    pub fn get(&self, id: BoneId) -> Option<&BoneLink> {
        self.bones.get(id)
    }

    #[inline]
    pub fn get_mut(&mut self, id: BoneId) -> Option<&mut BoneLink> {
        self.bones.get_mut(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BoneLink> {
        self.bones.iter()
    }

    pub fn bones(&self) -> &[BoneLink] {
        &self.bones
    }

    pub fn find_bone_by_name(&self, name: &str) -> Option<BoneId> {
        self.name_to_index.get(name).copied()
    }

    /// 父先于子的求值顺序
    pub fn evaluation_order(&self) -> &[BoneId] {
        &self.sorted_indices
    }

    pub fn children(&self, id: BoneId) -> &[BoneId] {
        self.children_cache.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn ik_solvers(&self) -> &[IkSolver] {
        &self.ik_solvers
    }

    pub fn events(&self) -> &PropertyEventHub {
        &self.events
    }

    pub(crate) fn set_events(&mut self, events: PropertyEventHub) {
        self.events = events;
    }

    /// 本地轴，子骨骼原点来自解析后的子引用
    pub fn local_axes(&self, id: BoneId) -> Mat3 {
        match self.bones.get(id) {
            Some(bone) => {
                let child_origin = bone.child.map(|c| self.bones[c].origin);
                bone.local_axes(child_origin)
            }
            None => Mat3::IDENTITY,
        }
    }

    /// 父骨骼原点（根骨骼为零点）
    pub fn destination_origin(&self, id: BoneId) -> Vec3 {
        self.bones
            .get(id)
            .and_then(|b| b.parent)
            .map(|p| self.bones[p].origin)
            .unwrap_or(Vec3::ZERO)
    }

    pub fn skinning_matrices(&self) -> Vec<Mat4> {
        self.bones.iter().map(|b| b.skinning_matrix()).collect()
    }

    pub fn world_transforms(&self) -> Vec<Mat4> {
        self.bones.iter().map(|b| b.world_transform).collect()
    }

    // ========================================
    // 姿态输入
    // ========================================

    /// 清空全部骨骼的动画状态
    pub fn reset_pose(&mut self) {
        for bone in &mut self.bones {
            bone.reset_pose();
            bone.simulated = false;
        }
    }

    pub fn set_bone_pose(&mut self, id: BoneId, local_position: Vec3, rotation: Quat) {
        if let Some(bone) = self.bones.get_mut(id) {
            bone.local_position = local_position;
            bone.rotation = rotation;
        }
    }

    pub fn set_bone_name(&mut self, id: BoneId, name: impl Into<String>) {
        let name = name.into();
        let Some(bone) = self.bones.get_mut(id) else {
            return;
        };
        self.events.emit(&PropertyEvent::BoneNameWillChange {
            bone: id,
            name: name.clone(),
        });
        if self.name_to_index.get(&bone.name) == Some(&id) {
            self.name_to_index.remove(&bone.name);
        }
        bone.name = name.clone();
        self.name_to_index.insert(name, id);
    }

    pub fn set_ik_enabled(&mut self, enabled: bool) {
        self.ik_enabled = enabled;
    }

    pub fn ik_enabled(&self) -> bool {
        self.ik_enabled
    }

    // ========================================
    // 求值
    // ========================================

    /// 按拓扑顺序计算全部骨骼的世界/本地变换
    pub fn update_transforms(&mut self) {
        for i in 0..self.sorted_indices.len() {
            let idx = self.sorted_indices[i];
            perform_transform(&mut self.bones, idx);
        }
    }

    /// 按记录顺序求解全部 IK 链
    pub fn solve_ik(&mut self) {
        if !self.ik_enabled {
            return;
        }
        for solver in &self.ik_solvers {
            solver.solve(&mut self.bones, &self.children_cache);
        }
    }

    /// 物理回写：直接设置本地变换，世界变换由此派生，不触发父链重算
    pub fn set_local_transform_from_physics(&mut self, id: BoneId, local: Mat4) {
        if let Some(bone) = self.bones.get_mut(id) {
            bone.apply_simulated_transform(local);
        }
    }
}

/// 单个骨骼的变换求值，父骨骼必须已完成本帧求值
pub(crate) fn perform_transform(bones: &mut [BoneLink], idx: BoneId) {
    let bone = &bones[idx];
    let parent_world = bone.parent.map(|p| bones[p].world_transform);
    let target_rotation = match bone.behavior {
        BoneBehavior::UnderRotate { target: Some(t) } => Some(bones[t].rotation),
        _ => None,
    };
    let world = bone.compose_world_transform(parent_world, target_rotation);
    bones[idx].apply_world_transform(world);
}

/// 行为旋转（不含 IK 叠加）
pub(crate) fn base_rotation(bones: &[BoneLink], idx: BoneId) -> Quat {
    let bone = &bones[idx];
    let target_rotation = match bone.behavior {
        BoneBehavior::UnderRotate { target: Some(t) } => Some(bones[t].rotation),
        _ => None,
    };
    bone.behavior_rotation(target_rotation)
}

/// 重新求值以 idx 为根的子树
pub(crate) fn update_subtree(bones: &mut [BoneLink], children: &[Vec<BoneId>], idx: BoneId) {
    let mut stack = vec![idx];
    while let Some(current) = stack.pop() {
        perform_transform(bones, current);
        stack.extend(children[current].iter().copied());
    }
}
