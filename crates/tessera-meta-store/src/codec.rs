//! Entity codecs used for snapshot records
//!
//! Two encodings coexist so that a snapshot written by any version can be
//! read by any version:
//!
//! - **V1**: explicit big-endian layout. Each record is a length-prefixed
//!   key block followed by a length-prefixed value block. Extents are
//!   fixed 40-byte records.
//! - **V2**: compact `bincode` encoding of the whole record.
//!
//! The codec is picked by the tag stored in the snapshot header, never
//! by the partition's configuration.

use crate::error::{MetaStoreError, MetaStoreResult};
use bytes::{Buf, BufMut};
use tessera_common::{Dentry, ExtentKey, Inode, MarshalVersion};

/// Encoded size of one extent key in the V1 layout
pub const V1_EXTENT_SIZE: usize = 40;

/// Function table for one marshal version
#[derive(Debug)]
pub struct MarshalCodec {
    pub version: MarshalVersion,
    pub encode_inode: fn(&Inode, &mut Vec<u8>) -> MetaStoreResult<()>,
    pub decode_inode: fn(&[u8]) -> MetaStoreResult<Inode>,
    pub encode_dentry: fn(&Dentry, &mut Vec<u8>) -> MetaStoreResult<()>,
    pub decode_dentry: fn(&[u8]) -> MetaStoreResult<Dentry>,
}

static V1: MarshalCodec = MarshalCodec {
    version: MarshalVersion::V1,
    encode_inode: v1::encode_inode,
    decode_inode: v1::decode_inode,
    encode_dentry: v1::encode_dentry,
    decode_dentry: v1::decode_dentry,
};

static V2: MarshalCodec = MarshalCodec {
    version: MarshalVersion::V2,
    encode_inode: v2::encode,
    decode_inode: v2::decode,
    encode_dentry: v2::encode,
    decode_dentry: v2::decode,
};

/// Codec for a marshal version
#[must_use]
pub fn codec(version: MarshalVersion) -> &'static MarshalCodec {
    match version {
        MarshalVersion::V1 => &V1,
        MarshalVersion::V2 => &V2,
    }
}

/// Codec for a tag read from persisted data
pub fn codec_for_tag(tag: u32) -> MetaStoreResult<&'static MarshalCodec> {
    MarshalVersion::from_tag(tag)
        .map(codec)
        .ok_or(MetaStoreError::UnsupportedVersion(tag))
}

/// A record that can be written with any marshal codec
pub trait Record: Sized {
    fn marshal(&self, codec: &MarshalCodec, buf: &mut Vec<u8>) -> MetaStoreResult<()>;
    fn unmarshal(codec: &MarshalCodec, data: &[u8]) -> MetaStoreResult<Self>;
}

impl Record for Inode {
    fn marshal(&self, codec: &MarshalCodec, buf: &mut Vec<u8>) -> MetaStoreResult<()> {
        (codec.encode_inode)(self, buf)
    }

    fn unmarshal(codec: &MarshalCodec, data: &[u8]) -> MetaStoreResult<Self> {
        (codec.decode_inode)(data)
    }
}

impl Record for Dentry {
    fn marshal(&self, codec: &MarshalCodec, buf: &mut Vec<u8>) -> MetaStoreResult<()> {
        (codec.encode_dentry)(self, buf)
    }

    fn unmarshal(codec: &MarshalCodec, data: &[u8]) -> MetaStoreResult<Self> {
        (codec.decode_dentry)(data)
    }
}

mod v1 {
    use super::{
        Buf, BufMut, Dentry, ExtentKey, Inode, MetaStoreError, MetaStoreResult, V1_EXTENT_SIZE,
    };

    fn need(buf: &[u8], n: usize, what: &str) -> MetaStoreResult<()> {
        if buf.remaining() < n {
            return Err(MetaStoreError::decode(format!(
                "v1: {what} needs {n} bytes, {} left",
                buf.remaining()
            )));
        }
        Ok(())
    }

    fn get_u32(buf: &mut &[u8], what: &str) -> MetaStoreResult<u32> {
        need(buf, 4, what)?;
        Ok(buf.get_u32())
    }

    fn get_u64(buf: &mut &[u8], what: &str) -> MetaStoreResult<u64> {
        need(buf, 8, what)?;
        Ok(buf.get_u64())
    }

    fn get_i64(buf: &mut &[u8], what: &str) -> MetaStoreResult<i64> {
        need(buf, 8, what)?;
        Ok(buf.get_i64())
    }

    /// Split off a `[u32 len][bytes]` block
    fn take_block<'a>(buf: &mut &'a [u8], what: &str) -> MetaStoreResult<&'a [u8]> {
        let len = get_u32(buf, what)? as usize;
        need(buf, len, what)?;
        let (block, rest) = buf.split_at(len);
        *buf = rest;
        Ok(block)
    }

    fn finish(buf: &[u8], what: &str) -> MetaStoreResult<()> {
        if buf.is_empty() {
            Ok(())
        } else {
            Err(MetaStoreError::decode(format!(
                "v1: {} trailing bytes after {what}",
                buf.len()
            )))
        }
    }

    fn len_u32(len: usize, what: &str) -> MetaStoreResult<u32> {
        u32::try_from(len).map_err(|_| MetaStoreError::decode(format!("v1: {what} too long")))
    }

    fn put_block(buf: &mut Vec<u8>, block: &[u8], what: &str) -> MetaStoreResult<()> {
        buf.put_u32(len_u32(block.len(), what)?);
        buf.put_slice(block);
        Ok(())
    }

    fn put_extent(buf: &mut Vec<u8>, ek: &ExtentKey) {
        buf.put_u64(ek.file_offset);
        buf.put_u64(ek.partition_id);
        buf.put_u64(ek.extent_id);
        buf.put_u64(ek.extent_offset);
        buf.put_u32(ek.size);
        buf.put_u32(ek.crc);
    }

    fn get_extent(buf: &mut &[u8]) -> MetaStoreResult<ExtentKey> {
        need(buf, V1_EXTENT_SIZE, "extent key")?;
        Ok(ExtentKey {
            file_offset: buf.get_u64(),
            partition_id: buf.get_u64(),
            extent_id: buf.get_u64(),
            extent_offset: buf.get_u64(),
            size: buf.get_u32(),
            crc: buf.get_u32(),
        })
    }

    pub(super) fn encode_inode(ino: &Inode, buf: &mut Vec<u8>) -> MetaStoreResult<()> {
        put_block(buf, &ino.inode.to_be_bytes(), "inode key")?;

        let mut value =
            Vec::with_capacity(72 + ino.link_target.len() + ino.extents.len() * V1_EXTENT_SIZE);
        value.put_u32(ino.type_);
        value.put_u32(ino.uid);
        value.put_u32(ino.gid);
        value.put_u64(ino.size);
        value.put_u64(ino.generation);
        value.put_i64(ino.create_time);
        value.put_i64(ino.access_time);
        value.put_i64(ino.modify_time);
        value.put_u32(len_u32(ino.link_target.len(), "link target")?);
        value.put_slice(&ino.link_target);
        value.put_u32(ino.nlink);
        value.put_u32(ino.flag);
        value.put_u32(len_u32(ino.extents.len(), "extent list")?);
        for ek in &ino.extents {
            put_extent(&mut value, ek);
        }
        put_block(buf, &value, "inode value")
    }

    pub(super) fn decode_inode(data: &[u8]) -> MetaStoreResult<Inode> {
        let mut buf = data;
        let mut key = take_block(&mut buf, "inode key")?;
        let mut value = take_block(&mut buf, "inode value")?;
        finish(buf, "inode record")?;

        let inode = get_u64(&mut key, "inode number")?;
        finish(key, "inode key")?;

        let v = &mut value;
        let type_ = get_u32(v, "type")?;
        let uid = get_u32(v, "uid")?;
        let gid = get_u32(v, "gid")?;
        let size = get_u64(v, "size")?;
        let generation = get_u64(v, "generation")?;
        let create_time = get_i64(v, "create time")?;
        let access_time = get_i64(v, "access time")?;
        let modify_time = get_i64(v, "modify time")?;
        let link_target = take_block(v, "link target")?.to_vec();
        let nlink = get_u32(v, "nlink")?;
        let flag = get_u32(v, "flag")?;
        let count = get_u32(v, "extent count")? as usize;
        need(v, count.saturating_mul(V1_EXTENT_SIZE), "extent list")?;
        let mut extents = Vec::with_capacity(count);
        for _ in 0..count {
            extents.push(get_extent(v)?);
        }
        finish(value, "inode value")?;

        Ok(Inode {
            inode,
            type_,
            uid,
            gid,
            size,
            generation,
            create_time,
            access_time,
            modify_time,
            link_target,
            nlink,
            flag,
            extents,
        })
    }

    pub(super) fn encode_dentry(dentry: &Dentry, buf: &mut Vec<u8>) -> MetaStoreResult<()> {
        let mut key = Vec::with_capacity(8 + dentry.name.len());
        key.put_u64(dentry.parent_id);
        key.put_slice(dentry.name.as_bytes());
        put_block(buf, &key, "dentry key")?;

        let mut value = Vec::with_capacity(12);
        value.put_u64(dentry.inode);
        value.put_u32(dentry.type_);
        put_block(buf, &value, "dentry value")
    }

    pub(super) fn decode_dentry(data: &[u8]) -> MetaStoreResult<Dentry> {
        let mut buf = data;
        let mut key = take_block(&mut buf, "dentry key")?;
        let mut value = take_block(&mut buf, "dentry value")?;
        finish(buf, "dentry record")?;

        let parent_id = get_u64(&mut key, "parent id")?;
        let name = std::str::from_utf8(key)
            .map_err(|e| MetaStoreError::decode(format!("v1: dentry name: {e}")))?
            .to_string();

        let inode = get_u64(&mut value, "dentry inode")?;
        let type_ = get_u32(&mut value, "dentry type")?;
        finish(value, "dentry value")?;

        Ok(Dentry {
            parent_id,
            name,
            inode,
            type_,
        })
    }
}

mod v2 {
    use super::MetaStoreResult;
    use serde::{Serialize, de::DeserializeOwned};

    pub(super) fn encode<T: Serialize>(record: &T, buf: &mut Vec<u8>) -> MetaStoreResult<()> {
        bincode::serialize_into(buf, record)?;
        Ok(())
    }

    pub(super) fn decode<T: DeserializeOwned>(data: &[u8]) -> MetaStoreResult<T> {
        Ok(bincode::deserialize(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_common::{MODE_REGULAR, MODE_SYMLINK};

    fn sample_inode() -> Inode {
        let mut ino = Inode::new(4242, MODE_REGULAR | 0o644).with_time(1_700_000_000);
        ino.uid = 1000;
        ino.gid = 100;
        ino.flag = 3;
        for i in 0..3u64 {
            ino.append_extent(ExtentKey {
                file_offset: i * 8192,
                partition_id: 7,
                extent_id: 900 + i,
                extent_offset: i * 16,
                size: 8192,
                crc: 0xdead_beef,
            });
        }
        ino
    }

    fn encode<R: Record>(record: &R, version: MarshalVersion) -> Vec<u8> {
        let mut buf = Vec::new();
        record.marshal(codec(version), &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_v1_and_v2_decode_to_same_inode() {
        let ino = sample_inode();
        let decode = |v: MarshalVersion| Inode::unmarshal(codec(v), &encode(&ino, v)).unwrap();
        let from_v1 = decode(MarshalVersion::V1);
        let from_v2 = decode(MarshalVersion::V2);
        assert_eq!(from_v1, ino);
        assert_eq!(from_v1, from_v2);
    }

    #[test]
    fn test_symlink_target_survives_v1() {
        let mut ino = Inode::new(9, MODE_SYMLINK | 0o777);
        ino.link_target = b"../some/where".to_vec();
        let bytes = encode(&ino, MarshalVersion::V1);
        let decoded = Inode::unmarshal(codec(MarshalVersion::V1), &bytes).unwrap();
        assert_eq!(decoded.link_target, b"../some/where");
    }

    #[test]
    fn test_v1_inode_layout() {
        let ino = Inode::new(1, MODE_REGULAR);
        let buf = encode(&ino, MarshalVersion::V1);
        // key block: len 8, then the inode number
        assert_eq!(&buf[0..4], &8u32.to_be_bytes());
        assert_eq!(&buf[4..12], &1u64.to_be_bytes());
        // value block: fixed fields, empty link target, no extents
        let value_len = u32::from_be_bytes(buf[12..16].try_into().unwrap()) as usize;
        assert_eq!(value_len, 4 * 3 + 8 * 5 + 4 + 4 * 2 + 4);
        assert_eq!(buf.len(), 16 + value_len);
    }

    #[test]
    fn test_dentry_both_versions() {
        let dentry = Dentry::new(1, "hello.txt", 77, MODE_REGULAR);
        for version in [MarshalVersion::V1, MarshalVersion::V2] {
            let decoded = Dentry::unmarshal(codec(version), &encode(&dentry, version)).unwrap();
            assert_eq!(decoded, dentry);
        }
    }

    #[test]
    fn test_v1_rejects_truncated_record() {
        let buf = encode(&sample_inode(), MarshalVersion::V1);
        let err = Inode::unmarshal(codec(MarshalVersion::V1), &buf[..buf.len() - 3]).unwrap_err();
        assert!(matches!(err, MetaStoreError::Decode(_)));
    }

    #[test]
    fn test_v1_rejects_trailing_bytes() {
        let mut buf = encode(&Dentry::new(1, "a", 2, MODE_REGULAR), MarshalVersion::V1);
        buf.push(0);
        assert!(Dentry::unmarshal(codec(MarshalVersion::V1), &buf).is_err());
    }

    #[test]
    fn test_v2_rejects_garbage() {
        let err = Inode::unmarshal(codec(MarshalVersion::V2), &[0xff; 5]).unwrap_err();
        assert!(err.is_data_error());
    }

    #[test]
    fn test_codec_for_tag() {
        assert_eq!(codec_for_tag(1).unwrap().version, MarshalVersion::V1);
        assert_eq!(codec_for_tag(2).unwrap().version, MarshalVersion::V2);
        assert!(matches!(codec_for_tag(0), Err(MetaStoreError::UnsupportedVersion(0))));
    }
}
