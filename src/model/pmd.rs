//! PMD 骨骼/IK/刚体/关节记录编解码
//!
//! 定长小端结构，名称为 20 字节 Shift_JIS。读入后原样写回必须逐字节一致，
//! 因此名称保留原始字节（包括 NUL 之后的填充）。

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use glam::Vec3;

use crate::{MmdError, Result};

pub const NAME_SIZE: usize = 20;
/// 刚体未绑定骨骼
pub const NO_BONE: u16 = 0xFFFF;

pub const BONE_RECORD_SIZE: usize = 39;
pub const IK_RECORD_HEADER_SIZE: usize = 11;
pub const RIGID_BODY_RECORD_SIZE: usize = 83;
pub const JOINT_RECORD_SIZE: usize = 124;

// ============================================================================
// 名称
// ============================================================================

/// 定长名称字段
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RawName(pub [u8; NAME_SIZE]);

impl RawName {
    /// 编码为 Shift_JIS，不足补零；超长时在完整字符处截断
    pub fn encode(name: &str) -> Self {
        let mut raw = [0u8; NAME_SIZE];
        let mut len = 0;
        let mut buf = [0u8; 4];
        for ch in name.chars() {
            let (bytes, _, _) = encoding_rs::SHIFT_JIS.encode(ch.encode_utf8(&mut buf));
            if len + bytes.len() > NAME_SIZE {
                break;
            }
            raw[len..len + bytes.len()].copy_from_slice(&bytes);
            len += bytes.len();
        }
        Self(raw)
    }

    /// 解码到第一个 NUL
    pub fn decode(&self) -> String {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(NAME_SIZE);
        let (decoded, _, _) = encoding_rs::SHIFT_JIS.decode(&self.0[..end]);
        decoded.into_owned()
    }

    fn read<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut raw = [0u8; NAME_SIZE];
        reader.read_exact(&mut raw)?;
        Ok(Self(raw))
    }
}

impl Default for RawName {
    fn default() -> Self {
        Self([0u8; NAME_SIZE])
    }
}

impl std::fmt::Debug for RawName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.decode())
    }
}

fn read_vec3<R: Read>(reader: &mut R) -> io::Result<Vec3> {
    let x = reader.read_f32::<LittleEndian>()?;
    let y = reader.read_f32::<LittleEndian>()?;
    let z = reader.read_f32::<LittleEndian>()?;
    Ok(Vec3::new(x, y, z))
}

fn write_vec3<W: Write>(writer: &mut W, v: Vec3) -> io::Result<()> {
    writer.write_f32::<LittleEndian>(v.x)?;
    writer.write_f32::<LittleEndian>(v.y)?;
    writer.write_f32::<LittleEndian>(v.z)
}

/// 输入不足时转换为 Truncated，其他 IO 错误原样传递
fn truncated(section: &'static str, index: usize) -> impl FnOnce(io::Error) -> MmdError {
    move |e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            MmdError::Truncated { section, index }
        } else {
            MmdError::Io(e)
        }
    }
}

// ============================================================================
// 记录
// ============================================================================

/// 骨骼记录（39 字节）
#[derive(Clone, Debug, PartialEq)]
pub struct BoneRecord {
    pub name: RawName,
    pub parent: i16,
    pub child: i16,
    pub type_code: u8,
    pub target: i16,
    pub position: Vec3,
}

impl BoneRecord {
    pub fn read<R: Read>(reader: &mut R) -> io::Result<Self> {
        Ok(Self {
            name: RawName::read(reader)?,
            parent: reader.read_i16::<LittleEndian>()?,
            child: reader.read_i16::<LittleEndian>()?,
            type_code: reader.read_u8()?,
            target: reader.read_i16::<LittleEndian>()?,
            position: read_vec3(reader)?,
        })
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.name.0)?;
        writer.write_i16::<LittleEndian>(self.parent)?;
        writer.write_i16::<LittleEndian>(self.child)?;
        writer.write_u8(self.type_code)?;
        writer.write_i16::<LittleEndian>(self.target)?;
        write_vec3(writer, self.position)
    }
}

/// IK 记录（11 + 2n 字节）
#[derive(Clone, Debug, PartialEq)]
pub struct IkRecord {
    pub root: i16,
    pub target: i16,
    pub iterations: u16,
    pub angle: f32,
    pub effectors: Vec<u16>,
}

impl IkRecord {
    pub fn read<R: Read>(reader: &mut R) -> io::Result<Self> {
        let root = reader.read_i16::<LittleEndian>()?;
        let target = reader.read_i16::<LittleEndian>()?;
        let count = reader.read_u8()?;
        let iterations = reader.read_u16::<LittleEndian>()?;
        let angle = reader.read_f32::<LittleEndian>()?;
        let effectors = (0..count)
            .map(|_| reader.read_u16::<LittleEndian>())
            .collect::<io::Result<Vec<_>>>()?;
        Ok(Self {
            root,
            target,
            iterations,
            angle,
            effectors,
        })
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        let count = u8::try_from(self.effectors.len()).map_err(|_| {
            MmdError::PmdParse(format!("IK chain has {} effectors (max 255)", self.effectors.len()))
        })?;
        writer.write_i16::<LittleEndian>(self.root)?;
        writer.write_i16::<LittleEndian>(self.target)?;
        writer.write_u8(count)?;
        writer.write_u16::<LittleEndian>(self.iterations)?;
        writer.write_f32::<LittleEndian>(self.angle)?;
        for &e in &self.effectors {
            writer.write_u16::<LittleEndian>(e)?;
        }
        Ok(())
    }
}

/// 刚体记录（83 字节），位置相对于所绑定骨骼的原点
#[derive(Clone, Debug, PartialEq)]
pub struct RigidBodyRecord {
    pub name: RawName,
    pub bone: u16,
    pub group: u8,
    pub mask: u16,
    pub shape: u8,
    pub size: Vec3,
    pub position: Vec3,
    pub rotation: Vec3,
    pub mass: f32,
    pub linear_damping: f32,
    pub angular_damping: f32,
    pub restitution: f32,
    pub friction: f32,
    pub mode: u8,
}

impl RigidBodyRecord {
    pub fn read<R: Read>(reader: &mut R) -> io::Result<Self> {
        Ok(Self {
            name: RawName::read(reader)?,
            bone: reader.read_u16::<LittleEndian>()?,
            group: reader.read_u8()?,
            mask: reader.read_u16::<LittleEndian>()?,
            shape: reader.read_u8()?,
            size: read_vec3(reader)?,
            position: read_vec3(reader)?,
            rotation: read_vec3(reader)?,
            mass: reader.read_f32::<LittleEndian>()?,
            linear_damping: reader.read_f32::<LittleEndian>()?,
            angular_damping: reader.read_f32::<LittleEndian>()?,
            restitution: reader.read_f32::<LittleEndian>()?,
            friction: reader.read_f32::<LittleEndian>()?,
            mode: reader.read_u8()?,
        })
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.name.0)?;
        writer.write_u16::<LittleEndian>(self.bone)?;
        writer.write_u8(self.group)?;
        writer.write_u16::<LittleEndian>(self.mask)?;
        writer.write_u8(self.shape)?;
        write_vec3(writer, self.size)?;
        write_vec3(writer, self.position)?;
        write_vec3(writer, self.rotation)?;
        writer.write_f32::<LittleEndian>(self.mass)?;
        writer.write_f32::<LittleEndian>(self.linear_damping)?;
        writer.write_f32::<LittleEndian>(self.angular_damping)?;
        writer.write_f32::<LittleEndian>(self.restitution)?;
        writer.write_f32::<LittleEndian>(self.friction)?;
        writer.write_u8(self.mode)
    }
}

/// 关节记录（124 字节）
#[derive(Clone, Debug, PartialEq)]
pub struct JointRecord {
    pub name: RawName,
    pub body_a: u32,
    pub body_b: u32,
    pub position: Vec3,
    pub rotation: Vec3,
    pub linear_lower: Vec3,
    pub linear_upper: Vec3,
    pub angular_lower: Vec3,
    pub angular_upper: Vec3,
    pub linear_spring: Vec3,
    pub angular_spring: Vec3,
}

impl JointRecord {
    pub fn read<R: Read>(reader: &mut R) -> io::Result<Self> {
        Ok(Self {
            name: RawName::read(reader)?,
            body_a: reader.read_u32::<LittleEndian>()?,
            body_b: reader.read_u32::<LittleEndian>()?,
            position: read_vec3(reader)?,
            rotation: read_vec3(reader)?,
            linear_lower: read_vec3(reader)?,
            linear_upper: read_vec3(reader)?,
            angular_lower: read_vec3(reader)?,
            angular_upper: read_vec3(reader)?,
            linear_spring: read_vec3(reader)?,
            angular_spring: read_vec3(reader)?,
        })
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.name.0)?;
        writer.write_u32::<LittleEndian>(self.body_a)?;
        writer.write_u32::<LittleEndian>(self.body_b)?;
        for v in [
            self.position,
            self.rotation,
            self.linear_lower,
            self.linear_upper,
            self.angular_lower,
            self.angular_upper,
            self.linear_spring,
            self.angular_spring,
        ] {
            write_vec3(writer, v)?;
        }
        Ok(())
    }
}

// ============================================================================
// 段
// ============================================================================

/// 模型记录集合
///
/// 流布局：骨骼段（u16 数量）、IK 段（u16 数量）、刚体段（u32 数量）、关节段（u32 数量）。
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModelRecords {
    pub bones: Vec<BoneRecord>,
    pub iks: Vec<IkRecord>,
    pub rigid_bodies: Vec<RigidBodyRecord>,
    pub joints: Vec<JointRecord>,
}

impl ModelRecords {
    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let bone_count = reader
            .read_u16::<LittleEndian>()
            .map_err(truncated("bone count", 0))?;
        let bones = (0..bone_count as usize)
            .map(|i| BoneRecord::read(reader).map_err(truncated("bone", i)))
            .collect::<Result<Vec<_>>>()?;

        let ik_count = reader
            .read_u16::<LittleEndian>()
            .map_err(truncated("IK count", 0))?;
        let iks = (0..ik_count as usize)
            .map(|i| IkRecord::read(reader).map_err(truncated("IK", i)))
            .collect::<Result<Vec<_>>>()?;

        let body_count = reader
            .read_u32::<LittleEndian>()
            .map_err(truncated("rigid body count", 0))?;
        let rigid_bodies = (0..body_count as usize)
            .map(|i| RigidBodyRecord::read(reader).map_err(truncated("rigid body", i)))
            .collect::<Result<Vec<_>>>()?;

        let joint_count = reader
            .read_u32::<LittleEndian>()
            .map_err(truncated("joint count", 0))?;
        let joints = (0..joint_count as usize)
            .map(|i| JointRecord::read(reader).map_err(truncated("joint", i)))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            bones,
            iks,
            rigid_bodies,
            joints,
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::read(&mut io::Cursor::new(bytes))
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u16::<LittleEndian>(section_count(self.bones.len(), "bones")?)?;
        for bone in &self.bones {
            bone.write(writer)?;
        }

        writer.write_u16::<LittleEndian>(section_count(self.iks.len(), "IK chains")?)?;
        for ik in &self.iks {
            ik.write(writer)?;
        }

        writer.write_u32::<LittleEndian>(section_count(self.rigid_bodies.len(), "rigid bodies")?)?;
        for body in &self.rigid_bodies {
            body.write(writer)?;
        }

        writer.write_u32::<LittleEndian>(section_count(self.joints.len(), "joints")?)?;
        for joint in &self.joints {
            joint.write(writer)?;
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        self.write(&mut bytes)?;
        Ok(bytes)
    }
}

/// 段计数，超出计数字段宽度时报错
fn section_count<T: TryFrom<usize>>(len: usize, section: &str) -> Result<T> {
    T::try_from(len).map_err(|_| MmdError::PmdParse(format!("too many {}: {}", section, len)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn padded_name(prefix: &str) -> RawName {
        let mut name = RawName::encode(prefix);
        let end = name.0.iter().position(|&b| b == 0).unwrap();
        // NUL 之后的残留字节也必须保留
        for b in name.0.iter_mut().skip(end + 1) {
            *b = 0xFD;
        }
        name
    }

    fn sample() -> ModelRecords {
        ModelRecords {
            bones: vec![
                BoneRecord {
                    name: padded_name("センター"),
                    parent: -1,
                    child: 1,
                    type_code: 1,
                    target: -1,
                    position: Vec3::new(0.0, 8.0, 0.0),
                },
                BoneRecord {
                    name: padded_name("頭"),
                    parent: 0,
                    child: -1,
                    type_code: 42,
                    target: 0,
                    position: Vec3::new(0.0, 16.5, -0.25),
                },
            ],
            iks: vec![IkRecord {
                root: 1,
                target: 0,
                iterations: 40,
                angle: 0.5,
                effectors: vec![0, 1],
            }],
            rigid_bodies: vec![RigidBodyRecord {
                name: padded_name("頭"),
                bone: NO_BONE,
                group: 3,
                mask: 0xFFF7,
                shape: 2,
                size: Vec3::new(0.5, 1.0, 0.0),
                position: Vec3::new(0.0, 0.5, 0.0),
                rotation: Vec3::new(0.1, 0.0, 0.0),
                mass: 1.5,
                linear_damping: 0.5,
                angular_damping: 0.5,
                restitution: 0.0,
                friction: 0.5,
                mode: 1,
            }],
            joints: vec![JointRecord {
                name: padded_name("髪"),
                body_a: 0,
                body_b: 0,
                position: Vec3::ONE,
                rotation: Vec3::ZERO,
                linear_lower: Vec3::ZERO,
                linear_upper: Vec3::ZERO,
                angular_lower: Vec3::splat(-0.2),
                angular_upper: Vec3::splat(0.2),
                linear_spring: Vec3::ZERO,
                angular_spring: Vec3::new(50.0, 0.0, 0.0),
            }],
        }
    }

    #[test]
    fn test_record_sizes() {
        let records = sample();
        let mut buf = Vec::new();
        records.bones[0].write(&mut buf).unwrap();
        assert_eq!(buf.len(), BONE_RECORD_SIZE);
        buf.clear();
        records.iks[0].write(&mut buf).unwrap();
        assert_eq!(buf.len(), IK_RECORD_HEADER_SIZE + 2 * 2);
        buf.clear();
        records.rigid_bodies[0].write(&mut buf).unwrap();
        assert_eq!(buf.len(), RIGID_BODY_RECORD_SIZE);
        buf.clear();
        records.joints[0].write(&mut buf).unwrap();
        assert_eq!(buf.len(), JOINT_RECORD_SIZE);
    }

    #[test]
    fn test_bytes_round_trip_exactly() {
        let bytes = sample().to_bytes().unwrap();
        let parsed = ModelRecords::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.bones[0].name.decode(), "センター");
        assert_eq!(parsed.bones[1].type_code, 42);
        assert_eq!(parsed.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn test_truncated_input_is_rejected() {
        let bytes = sample().to_bytes().unwrap();
        // 第二个骨骼记录被截断
        let cut = 2 + BONE_RECORD_SIZE + 10;
        let err = ModelRecords::from_bytes(&bytes[..cut]).unwrap_err();
        assert!(matches!(err, MmdError::Truncated { section: "bone", index: 1 }));

        let err = ModelRecords::from_bytes(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, MmdError::Truncated { section: "joint", index: 0 }));

        let err = ModelRecords::from_bytes(&[]).unwrap_err();
        assert!(matches!(err, MmdError::Truncated { section: "bone count", .. }));
    }

    #[test]
    fn test_name_truncates_to_field_width() {
        let name = RawName::encode("あいうえおかきくけこさしすせそ");
        assert_eq!(name.decode(), "あいうえおかきくけこ");
    }

    #[test]
    fn test_name_truncation_keeps_whole_characters() {
        // 1 + 2 * 10 = 21 字节，最后一个汉字放不下
        let name = RawName::encode("a漢漢漢漢漢漢漢漢漢漢");
        assert_eq!(name.decode(), "a漢漢漢漢漢漢漢漢漢");
        assert_eq!(name.0[19], 0);
        assert!(!name.decode().contains('\u{FFFD}'));
    }

    #[test]
    fn test_too_many_bones_is_rejected() {
        let records = ModelRecords {
            bones: vec![sample().bones[0].clone(); u16::MAX as usize + 1],
            ..ModelRecords::default()
        };
        assert!(matches!(records.to_bytes(), Err(MmdError::PmdParse(_))));
        assert!(section_count::<u32>(u16::MAX as usize + 1, "joints").is_ok_and(|n| n == 65536));
    }
}
