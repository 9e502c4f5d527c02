//! 模型组装
//!
//! 把 PMD 记录转换为骨骼集合、刚体与关节，并做结构校验。
//! 任何索引越界都会让整个模型加载失败，不产生半成品。

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::events::PropertyEventHub;
use crate::physics::{JointLimits, MmdJoint, MmdRigidBody, PhysicsMode, RigidBodyMaterial, RigidBodyShape};
use crate::skeleton::{BoneLink, BoneSet, IkChainDesc};
use crate::{MmdError, Result};

use super::pmd::{ModelRecords, NO_BONE};
use super::Model;

/// 从文件加载模型
pub fn load_model<P: AsRef<Path>>(path: P) -> Result<Model> {
    let file = File::open(path.as_ref()).map_err(MmdError::Io)?;
    let mut reader = BufReader::new(file);
    let records = ModelRecords::read(&mut reader)?;
    let name = path
        .as_ref()
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    build_model(name, &records)
}

/// 从字节加载模型
pub fn load_model_from_bytes(name: impl Into<String>, bytes: &[u8]) -> Result<Model> {
    let records = ModelRecords::from_bytes(bytes)?;
    build_model(name, &records)
}

/// 由记录组装模型
pub fn build_model(name: impl Into<String>, records: &ModelRecords) -> Result<Model> {
    let name = name.into();
    let events = PropertyEventHub::new();

    // ========== 骨骼（两阶段：先创建，再由 BoneSet 解析引用） ==========
    let bones: Vec<BoneLink> = records
        .bones
        .iter()
        .map(|r| {
            BoneLink::with_record(
                r.name.decode(),
                r.parent,
                r.child,
                r.type_code,
                r.target,
                r.position,
            )
        })
        .collect();

    let chains: Vec<IkChainDesc> = records
        .iks
        .iter()
        .map(|ik| IkChainDesc {
            root: ik.root as i32,
            target: ik.target as i32,
            effectors: ik.effectors.iter().map(|&e| e as i32).collect(),
            iterations: ik.iterations as u32,
            max_angle: ik.angle,
        })
        .collect();

    let mut bone_set = BoneSet::build(bones, chains)?;
    bone_set.set_events(events.clone());
    let bone_count = bone_set.len();

    // ========== 刚体 ==========
    let mut rigid_bodies = Vec::with_capacity(records.rigid_bodies.len());
    for (i, r) in records.rigid_bodies.iter().enumerate() {
        let bone = if r.bone == NO_BONE {
            None
        } else if (r.bone as usize) < bone_count {
            Some(r.bone as usize)
        } else {
            return Err(MmdError::InvalidBoneIndex {
                bone: i,
                field: "rigid body bone",
                index: r.bone as i32,
                count: bone_count,
            });
        };

        // 记录中的位置相对于骨骼原点
        let origin = bone
            .and_then(|b| bone_set.get(b))
            .map(|b| b.origin)
            .unwrap_or_default();

        let material = RigidBodyMaterial {
            mass: r.mass,
            linear_damping: r.linear_damping,
            angular_damping: r.angular_damping,
            restitution: r.restitution,
            friction: r.friction,
            group: r.group,
            mask: r.mask,
        };
        let mut body = MmdRigidBody::new(
            i,
            r.name.decode(),
            bone,
            RigidBodyShape::from_code(r.shape),
            r.size,
            r.position + origin,
            r.rotation,
            material,
            PhysicsMode::from_code(r.mode),
        );
        body.set_events(events.clone());
        rigid_bodies.push(body);
    }

    // ========== 关节 ==========
    let body_count = rigid_bodies.len();
    let mut joints = Vec::with_capacity(records.joints.len());
    for (i, r) in records.joints.iter().enumerate() {
        for body in [r.body_a, r.body_b] {
            if body as usize >= body_count {
                return Err(MmdError::InvalidRigidBodyIndex {
                    owner: "joint",
                    index: i,
                    body: body as i64,
                    count: body_count,
                });
            }
        }
        if r.body_a == r.body_b {
            return Err(MmdError::PmdParse(format!(
                "joint {} connects rigid body {} to itself",
                i, r.body_a
            )));
        }

        let limits = JointLimits {
            linear_lower: r.linear_lower,
            linear_upper: r.linear_upper,
            angular_lower: r.angular_lower,
            angular_upper: r.angular_upper,
            linear_spring: r.linear_spring,
            angular_spring: r.angular_spring,
        };
        joints.push(MmdJoint::new(
            r.name.decode(),
            r.body_a as usize,
            r.body_b as usize,
            r.position,
            r.rotation,
            limits,
        ));
    }

    log::info!(
        "[模型] '{}' 加载完成: 骨骼 {}, IK {}, 刚体 {}, 关节 {}",
        name,
        bone_count,
        bone_set.ik_solvers().len(),
        rigid_bodies.len(),
        joints.len()
    );

    Ok(Model::from_parts(name, bone_set, rigid_bodies, joints, events))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::pmd::{BoneRecord, IkRecord, JointRecord, RawName, RigidBodyRecord};
    use glam::Vec3;

    fn bone(name: &str, parent: i16, position: Vec3) -> BoneRecord {
        BoneRecord {
            name: RawName::encode(name),
            parent,
            child: -1,
            type_code: 0,
            target: -1,
            position,
        }
    }

    fn body(name: &str, bone: u16, mode: u8) -> RigidBodyRecord {
        RigidBodyRecord {
            name: RawName::encode(name),
            bone,
            group: 0,
            mask: 0xFFFF,
            shape: 0,
            size: Vec3::splat(0.5),
            position: Vec3::new(0.0, 0.5, 0.0),
            rotation: Vec3::ZERO,
            mass: 1.0,
            linear_damping: 0.5,
            angular_damping: 0.5,
            restitution: 0.0,
            friction: 0.5,
            mode,
        }
    }

    fn joint(a: u32, b: u32) -> JointRecord {
        JointRecord {
            name: RawName::encode("j"),
            body_a: a,
            body_b: b,
            position: Vec3::ZERO,
            rotation: Vec3::ZERO,
            linear_lower: Vec3::ZERO,
            linear_upper: Vec3::ZERO,
            angular_lower: Vec3::ZERO,
            angular_upper: Vec3::ZERO,
            linear_spring: Vec3::ZERO,
            angular_spring: Vec3::ZERO,
        }
    }

    fn records() -> ModelRecords {
        ModelRecords {
            bones: vec![
                bone("センター", -1, Vec3::new(0.0, 8.0, 0.0)),
                bone("頭", 0, Vec3::new(0.0, 16.0, 0.0)),
            ],
            iks: vec![IkRecord {
                root: 1,
                target: 1,
                iterations: 10,
                angle: 1.0,
                effectors: vec![0],
            }],
            rigid_bodies: vec![body("頭", 1, 0), body("髪", 1, 1), body("free", NO_BONE, 1)],
            joints: vec![joint(0, 1)],
        }
    }

    #[test]
    fn test_build_model() {
        let model = build_model("test", &records()).unwrap();
        assert_eq!(model.bones().len(), 2);
        // root == target 的 IK 被丢弃
        assert!(model.bones().ik_solvers().is_empty());
        assert_eq!(model.rigid_bodies().len(), 3);
        // 位置加上骨骼原点
        assert_eq!(model.rigid_bodies()[0].position(), Vec3::new(0.0, 16.5, 0.0));
        assert_eq!(model.rigid_bodies()[2].bone(), None);
        assert_eq!(model.rigid_bodies()[2].position(), Vec3::new(0.0, 0.5, 0.0));
        assert_eq!(model.joints().len(), 1);
    }

    #[test]
    fn test_load_from_bytes() {
        let bytes = records().to_bytes().unwrap();
        let model = load_model_from_bytes("bytes", &bytes).unwrap();
        assert_eq!(model.bones().find_bone_by_name("頭"), Some(1));
    }

    #[test]
    fn test_invalid_parent_fails_load() {
        let mut r = records();
        r.bones[1].parent = 7;
        let err = build_model("bad", &r).unwrap_err();
        assert!(matches!(err, MmdError::InvalidBoneIndex { bone: 1, index: 7, .. }));
    }

    #[test]
    fn test_invalid_rigid_body_bone_fails_load() {
        let mut r = records();
        r.rigid_bodies[0].bone = 9;
        assert!(matches!(
            build_model("bad", &r),
            Err(MmdError::InvalidBoneIndex { field: "rigid body bone", .. })
        ));
    }

    #[test]
    fn test_invalid_joint_fails_load() {
        let mut r = records();
        r.joints[0].body_b = 5;
        assert!(matches!(
            build_model("bad", &r),
            Err(MmdError::InvalidRigidBodyIndex { owner: "joint", body: 5, .. })
        ));

        let mut r = records();
        r.joints[0].body_b = 0;
        assert!(matches!(build_model("bad", &r), Err(MmdError::PmdParse(_))));
    }
}
