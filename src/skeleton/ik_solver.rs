//! IK 求解器 - CCD（循环坐标下降）
//!
//! - 链骨骼按记录顺序逐个旋转，使末端骨骼靠近目的地骨骼
//! - 单次旋转角受约束最大角限制
//! - 扭转骨骼只绕固定轴旋转，膝关节只绕本地 X 轴弯曲
//! - 某次迭代未能缩短距离时回退到最佳结果并提前结束

use std::f32::consts::PI;

use glam::{Quat, Vec3};

use super::bone_link::{BoneBehavior, BoneId, BoneLink, IkConstraint};
use super::bone_set::{base_rotation, update_subtree};

/// 距离小于该值视为已到达
pub const IK_DISTANCE_TOLERANCE: f32 = 1.0e-5;
const MIN_AXIS_LENGTH: f32 = 1.0e-6;
const MIN_STEP_ANGLE: f32 = 1.0e-5;

/// 膝关节弯曲范围（弧度）
const KNEE_MIN_ANGLE: f32 = -PI;
const KNEE_MAX_ANGLE: f32 = -0.5 * PI / 180.0;

// ============================================================================
// IK 链状态
// ============================================================================

#[derive(Clone, Debug)]
struct IkChainState {
    /// 单轴模式下的累积角度
    plane_mode_angle: f32,
    /// 最佳 IK 旋转（用于回退）
    best_ik_rotation: Quat,
}

impl Default for IkChainState {
    fn default() -> Self {
        Self {
            plane_mode_angle: 0.0,
            best_ik_rotation: Quat::IDENTITY,
        }
    }
}

/// 链骨骼的旋转约束
#[derive(Clone, Copy, Debug, PartialEq)]
enum LinkMode {
    Free,
    /// 绕固定轴（骨骼坐标系下）
    Axis(Vec3),
    /// 绕本地 X 轴并限制弯曲方向
    Knee,
}

// ============================================================================
// IK 求解器
// ============================================================================

/// IK 求解器
#[derive(Clone, Debug)]
pub struct IkSolver {
    pub constraint: IkConstraint,
    pub enabled: bool,
}

impl IkSolver {
    pub fn new(constraint: IkConstraint) -> Self {
        Self {
            constraint,
            enabled: true,
        }
    }

    /// 目的地骨骼（IK 骨骼本身）
    #[inline]
    pub fn bone_index(&self) -> BoneId {
        self.constraint.root
    }

    /// 末端到目的地的距离
    pub fn distance(&self, bones: &[BoneLink]) -> f32 {
        let destination = bones[self.constraint.root].world_position();
        let effector = bones[self.constraint.target].world_position();
        (effector - destination).length()
    }

    /// 求解 IK，返回最终距离
    ///
    /// 调用前本帧的世界变换必须已经求值。
    pub fn solve(&self, bones: &mut [BoneLink], children_cache: &[Vec<BoneId>]) -> f32 {
        let c = &self.constraint;
        if !self.enabled || !(c.max_angle.is_finite() && c.max_angle > 0.0) {
            return self.distance(bones);
        }

        let mut chain_states: Vec<IkChainState> =
            c.effectors.iter().map(|_| IkChainState::default()).collect();

        for &link in &c.effectors {
            bones[link].ik_rotation = Quat::IDENTITY;
            update_subtree(bones, children_cache, link);
        }

        let mut best_distance = self.distance(bones);
        for (state, &link) in chain_states.iter_mut().zip(&c.effectors) {
            state.best_ik_rotation = bones[link].ik_rotation;
        }

        for iteration in 0..c.iterations {
            if best_distance < IK_DISTANCE_TOLERANCE {
                break;
            }

            for chain_idx in 0..c.effectors.len() {
                let link = c.effectors[chain_idx];
                if link == c.target {
                    continue;
                }
                match Self::link_mode(&bones[link]) {
                    LinkMode::Knee => self.solve_knee(
                        bones,
                        children_cache,
                        link,
                        iteration,
                        &mut chain_states[chain_idx],
                    ),
                    mode => self.solve_link(bones, children_cache, link, mode),
                }
            }

            let distance = self.distance(bones);
            if distance < best_distance {
                best_distance = distance;
                for (state, &link) in chain_states.iter_mut().zip(&c.effectors) {
                    state.best_ik_rotation = bones[link].ik_rotation;
                }
            } else {
                // 恢复最佳结果并退出
                for (state, &link) in chain_states.iter().zip(&c.effectors) {
                    bones[link].ik_rotation = state.best_ik_rotation;
                    update_subtree(bones, children_cache, link);
                }
                break;
            }
        }

        best_distance
    }

    fn link_mode(bone: &BoneLink) -> LinkMode {
        if bone.is_knee() {
            return LinkMode::Knee;
        }
        match bone.behavior {
            BoneBehavior::FixedAxis { axis } if axis != Vec3::ZERO => LinkMode::Axis(axis),
            _ => LinkMode::Free,
        }
    }

    /// 链骨骼坐标系下指向末端与目的地的单位向量
    fn local_directions(&self, bones: &[BoneLink], link: BoneId) -> Option<(Vec3, Vec3)> {
        let destination = bones[self.constraint.root].world_position();
        let effector = bones[self.constraint.target].world_position();
        let inv_link = bones[link].world_transform.inverse();

        let to_effector = inv_link.transform_point3(effector).normalize_or_zero();
        let to_destination = inv_link.transform_point3(destination).normalize_or_zero();
        if to_effector == Vec3::ZERO || to_destination == Vec3::ZERO {
            return None;
        }
        Some((to_effector, to_destination))
    }

    /// 自由或固定轴求解
    fn solve_link(
        &self,
        bones: &mut [BoneLink],
        children_cache: &[Vec<BoneId>],
        link: BoneId,
        mode: LinkMode,
    ) {
        let Some((mut to_effector, mut to_destination)) = self.local_directions(bones, link) else {
            return;
        };

        if let LinkMode::Axis(axis) = mode {
            to_effector = (to_effector - axis * to_effector.dot(axis)).normalize_or_zero();
            to_destination = (to_destination - axis * to_destination.dot(axis)).normalize_or_zero();
            if to_effector == Vec3::ZERO || to_destination == Vec3::ZERO {
                return;
            }
        }

        let cross = to_effector.cross(to_destination);
        let sin = cross.length();
        if sin < MIN_AXIS_LENGTH {
            return;
        }
        let angle = sin.atan2(to_effector.dot(to_destination)).min(self.constraint.max_angle);
        if angle < MIN_STEP_ANGLE {
            return;
        }

        let axis = match mode {
            LinkMode::Axis(fixed) => fixed * cross.dot(fixed).signum(),
            _ => cross / sin,
        };
        let delta = Quat::from_axis_angle(axis, angle);

        let base = base_rotation(bones, link);
        let chain_rotation = (bones[link].ik_rotation * base * delta).normalize();
        bones[link].ik_rotation = (chain_rotation * base.inverse()).normalize();
        update_subtree(bones, children_cache, link);
    }

    /// 膝关节单轴求解
    fn solve_knee(
        &self,
        bones: &mut [BoneLink],
        children_cache: &[Vec<BoneId>],
        link: BoneId,
        iteration: u32,
        state: &mut IkChainState,
    ) {
        let Some((to_effector, to_destination)) = self.local_directions(bones, link) else {
            return;
        };

        let project = |v: Vec3| Vec3::new(0.0, v.y, v.z).normalize_or_zero();
        let (e, d) = (project(to_effector), project(to_destination));
        if e == Vec3::ZERO || d == Vec3::ZERO {
            return;
        }

        let step = Vec3::X.dot(e.cross(d)).atan2(e.dot(d));
        let step = step.clamp(-self.constraint.max_angle, self.constraint.max_angle);
        let mut new_angle = state.plane_mode_angle + step;

        // 第 0 次迭代允许翻转到合法方向
        if iteration == 0
            && !(KNEE_MIN_ANGLE..=KNEE_MAX_ANGLE).contains(&new_angle)
            && (KNEE_MIN_ANGLE..=KNEE_MAX_ANGLE).contains(&-new_angle)
        {
            new_angle = -new_angle;
        }
        new_angle = new_angle.clamp(KNEE_MIN_ANGLE, KNEE_MAX_ANGLE);
        state.plane_mode_angle = new_angle;

        let base = base_rotation(bones, link);
        bones[link].ik_rotation = (Quat::from_rotation_x(new_angle) * base.inverse()).normalize();
        update_subtree(bones, children_cache, link);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skeleton::bone_link::type_code;
    use crate::skeleton::bone_set::{BoneSet, IkChainDesc};

    /// base(0) - elbow(1) - tip(2)，目的地骨骼 3 位于 45° 方向 1.8 处
    fn arm(iterations: u32) -> BoneSet {
        let reach = 1.8 * std::f32::consts::FRAC_1_SQRT_2;
        let mut bones = vec![
            BoneLink::with_record("base", -1, 1, type_code::ROTATE, -1, Vec3::ZERO),
            BoneLink::with_record("elbow", 0, 2, type_code::ROTATE, -1, Vec3::X),
            BoneLink::with_record("tip", 1, -1, type_code::ROTATE, -1, Vec3::new(2.0, 0.0, 0.0)),
            BoneLink::with_record("goal", -1, -1, type_code::IK_DESTINATION, 2, Vec3::ZERO),
        ];
        bones[3].local_position = Vec3::new(reach, reach, 0.0);
        let chains = vec![IkChainDesc {
            root: 3,
            target: 2,
            effectors: vec![1, 0],
            iterations,
            max_angle: 30f32.to_radians(),
        }];
        let mut set = BoneSet::build(bones, chains).unwrap();
        set.set_bone_pose(3, Vec3::new(reach, reach, 0.0), Quat::IDENTITY);
        set.set_bone_pose(1, Vec3::ZERO, Quat::from_rotation_z(0.4));
        set
    }

    fn solve(set: &mut BoneSet) -> f32 {
        set.update_transforms();
        set.solve_ik();
        set.ik_solvers()[0].distance(set.bones())
    }

    #[test]
    fn test_ccd_converges() {
        let mut set = arm(20);
        let distance = solve(&mut set);
        assert!(distance < 1e-3, "distance {distance}");
    }

    #[test]
    fn test_more_iterations_never_worse() {
        let mut previous = f32::MAX;
        for n in 1..=20 {
            let mut set = arm(n);
            let distance = solve(&mut set);
            assert!(distance <= previous + 1e-6, "n={n}: {distance} > {previous}");
            previous = distance;
        }
    }

    #[test]
    fn test_disabled_solver_leaves_pose() {
        let mut set = arm(20);
        set.set_ik_enabled(false);
        set.update_transforms();
        let before = set.get(2).unwrap().world_position();
        set.solve_ik();
        assert_eq!(set.get(2).unwrap().world_position(), before);
    }

    /// 左足(0) - 左ひざ(1) - 左足首(2)，目的地 3 在膝前方
    fn leg(max_angle: f32) -> BoneSet {
        let bones = vec![
            BoneLink::with_record("左足", -1, 1, type_code::ROTATE, -1, Vec3::new(0.0, 2.0, 0.0)),
            BoneLink::with_record("左ひざ", 0, 2, type_code::ROTATE, -1, Vec3::new(0.0, 1.0, 0.0)),
            BoneLink::with_record("左足首", 1, -1, type_code::ROTATE, -1, Vec3::ZERO),
            BoneLink::with_record("左足ＩＫ", -1, -1, type_code::IK_DESTINATION, 2, Vec3::ZERO),
        ];
        let chains = vec![IkChainDesc {
            root: 3,
            target: 2,
            effectors: vec![1, 0],
            iterations: 40,
            max_angle,
        }];
        let mut set = BoneSet::build(bones, chains).unwrap();
        set.set_bone_pose(3, Vec3::new(0.0, 0.5, 0.3), Quat::IDENTITY);
        set
    }

    #[test]
    fn test_knee_bends_only_about_x() {
        let mut set = leg(2.0);
        set.update_transforms();
        let before = set.ik_solvers()[0].distance(set.bones());
        set.solve_ik();
        let after = set.ik_solvers()[0].distance(set.bones());
        assert!(after < before * 0.5, "distance {before} -> {after}");

        // 只绕 X 轴，且角度为负（不会反折）
        let knee = set.get(1).unwrap().ik_rotation();
        assert!(knee.y.abs() < 1e-5 && knee.z.abs() < 1e-5, "knee {knee:?}");
        assert!(knee.x * knee.w < 0.0, "knee bent backwards: {knee:?}");
    }

    #[test]
    fn test_invalid_max_angle_chain_is_dropped() {
        for max_angle in [-0.5, 0.0, f32::NAN] {
            let mut set = leg(max_angle);
            assert!(set.ik_solvers().is_empty(), "max_angle {max_angle}");
            set.update_transforms();
            set.solve_ik();
            assert_eq!(set.get(1).unwrap().ik_rotation(), Quat::IDENTITY);
        }
    }

    #[test]
    fn test_solver_with_invalid_max_angle_is_noop() {
        let mut set = leg(2.0);
        set.update_transforms();
        let mut solver = set.ik_solvers()[0].clone();
        solver.constraint.max_angle = -0.5;
        let mut bones = set.bones().to_vec();
        let children: Vec<Vec<BoneId>> = (0..bones.len()).map(|i| set.children(i).to_vec()).collect();
        let distance = solver.solve(&mut bones, &children);
        assert!((distance - solver.distance(set.bones())).abs() < 1e-6);
        assert_eq!(bones[1].ik_rotation(), Quat::IDENTITY);
    }

    /// 扭转骨骼 0 的固定轴由子骨骼 1 推出（X 轴），末端 2 需绕 X 转 90°
    #[test]
    fn test_twist_bone_rotates_about_fixed_axis() {
        let mut bones = vec![
            BoneLink::with_record("twist", -1, 1, type_code::TWIST, -1, Vec3::ZERO),
            BoneLink::with_record("arm", 0, 2, type_code::ROTATE, -1, Vec3::X),
            BoneLink::with_record("tip", 1, -1, type_code::ROTATE, -1, Vec3::new(1.0, 1.0, 0.0)),
            BoneLink::with_record("goal", -1, -1, type_code::IK_DESTINATION, 2, Vec3::ZERO),
        ];
        bones[3].local_position = Vec3::new(1.0, 0.0, 1.0);
        let chains = vec![IkChainDesc {
            root: 3,
            target: 2,
            effectors: vec![0],
            iterations: 10,
            max_angle: PI,
        }];
        let mut set = BoneSet::build(bones, chains).unwrap();
        assert_eq!(set.get(0).unwrap().fixed_axis(), Vec3::X);
        assert!(set.get(0).unwrap().has_fixed_axis());

        set.set_bone_pose(3, Vec3::new(1.0, 0.0, 1.0), Quat::IDENTITY);
        let distance = solve(&mut set);
        assert!(distance < 1e-4, "distance {distance}");

        let (axis, angle) = set.get(0).unwrap().ik_rotation().to_axis_angle();
        assert!((axis - Vec3::X).length() < 1e-4, "axis {axis:?}");
        assert!((angle - PI / 2.0).abs() < 1e-4, "angle {angle}");
    }
}
