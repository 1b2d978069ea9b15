//! Checkpoint encoding and decoding
//!
//! Layout after the fixed header:
//!
//! ```text
//! config      : config_len bytes of JSON
//! tensor × N  : name_len u16 | name | trainable u8 | rank u8 | dims u32 × rank | f32 × numel
//! trailer     : SHA-256 of every preceding byte
//! ```
//!
//! All integers and floats are little-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use proficio_core::{FusionConfig, FusionError, FusionResult};
use proficio_fusion::ModelSnapshot;
use proficio_nn::NamedTensor;
use sha2::{Digest, Sha256};

use crate::{CheckpointFlags, CheckpointHeader, HEADER_SIZE};

/// SHA-256 trailer size
pub const DIGEST_SIZE: usize = 32;

/// Smallest well-formed checkpoint (header + trailer)
pub const MIN_CHECKPOINT_SIZE: usize = HEADER_SIZE + DIGEST_SIZE;

/// Highest tensor rank the format stores
pub const MAX_RANK: usize = 4;

/// Serialize a snapshot
pub fn encode_snapshot(snapshot: &ModelSnapshot) -> FusionResult<Bytes> {
    let config = serde_json::to_vec(&snapshot.config)?;
    let tensor_count = u32::try_from(snapshot.tensors.len())
        .map_err(|_| FusionError::InvalidCheckpoint("too many tensors".into()))?;
    let config_len = u32::try_from(config.len())
        .map_err(|_| FusionError::InvalidCheckpoint("configuration too large".into()))?;

    let header = CheckpointHeader::new(
        CheckpointFlags::for_config(&snapshot.config),
        snapshot.step,
        tensor_count,
        config_len,
    );

    let payload: usize = snapshot
        .tensors
        .iter()
        .map(|t| 2 + t.name.len() + 2 + 4 * t.shape.len() + 4 * t.data.len())
        .sum();
    let mut buf = BytesMut::with_capacity(MIN_CHECKPOINT_SIZE + config.len() + payload);
    buf.put_slice(&header.to_bytes());
    buf.put_slice(&config);
    for tensor in &snapshot.tensors {
        put_tensor(&mut buf, tensor)?;
    }

    let digest = Sha256::digest(&buf);
    buf.put_slice(&digest);
    Ok(buf.freeze())
}

fn put_tensor(buf: &mut BytesMut, tensor: &NamedTensor) -> FusionResult<()> {
    let name_len = u16::try_from(tensor.name.len()).map_err(|_| {
        FusionError::InvalidCheckpoint(format!("tensor name too long: {}", tensor.name))
    })?;
    if tensor.shape.len() > MAX_RANK {
        return Err(FusionError::InvalidCheckpoint(format!(
            "tensor {} has rank {}",
            tensor.name,
            tensor.shape.len()
        )));
    }
    if tensor.numel() != tensor.data.len() {
        return Err(FusionError::TensorShape {
            name: tensor.name.clone(),
            expected: tensor.shape.clone(),
            actual: vec![tensor.data.len()],
        });
    }

    buf.put_u16_le(name_len);
    buf.put_slice(tensor.name.as_bytes());
    buf.put_u8(u8::from(tensor.trainable));
    buf.put_u8(tensor.shape.len() as u8);
    for &dim in &tensor.shape {
        let dim = u32::try_from(dim).map_err(|_| {
            FusionError::InvalidCheckpoint(format!("tensor {} dimension too large", tensor.name))
        })?;
        buf.put_u32_le(dim);
    }
    for &value in &tensor.data {
        buf.put_f32_le(value);
    }
    Ok(())
}

/// Parse and verify a checkpoint
pub fn decode_snapshot(buf: &[u8]) -> FusionResult<ModelSnapshot> {
    if buf.len() < MIN_CHECKPOINT_SIZE {
        return Err(FusionError::BufferTooShort {
            expected: MIN_CHECKPOINT_SIZE,
            actual: buf.len(),
        });
    }
    let header = CheckpointHeader::parse(buf)?;

    let (body, trailer) = buf.split_at(buf.len() - DIGEST_SIZE);
    if Sha256::digest(body).as_slice() != trailer {
        return Err(FusionError::ChecksumMismatch);
    }

    let mut cursor = &body[HEADER_SIZE..];
    let config_len = header.config_len as usize;
    need(cursor, config_len, "configuration")?;
    let config: FusionConfig = serde_json::from_slice(&cursor[..config_len])?;
    cursor.advance(config_len);
    config.validate()?;

    if CheckpointFlags::for_config(&config) != header.flags {
        return Err(FusionError::InvalidCheckpoint(
            "flags disagree with configuration".into(),
        ));
    }

    // every record is at least 4 bytes; cap the reservation by what is left
    let count = header.tensor_count as usize;
    let mut tensors = Vec::with_capacity(count.min(cursor.remaining() / 4));
    for _ in 0..count {
        tensors.push(get_tensor(&mut cursor)?);
    }
    if cursor.has_remaining() {
        return Err(FusionError::InvalidCheckpoint(format!(
            "{} trailing bytes after tensors",
            cursor.remaining()
        )));
    }

    Ok(ModelSnapshot {
        config,
        step: header.step,
        tensors,
    })
}

fn need(buf: &[u8], len: usize, what: &str) -> FusionResult<()> {
    if buf.len() < len {
        return Err(FusionError::InvalidCheckpoint(format!(
            "truncated {}: need {} bytes, have {}",
            what,
            len,
            buf.len()
        )));
    }
    Ok(())
}

fn get_tensor(buf: &mut &[u8]) -> FusionResult<NamedTensor> {
    need(buf, 2, "tensor name length")?;
    let name_len = buf.get_u16_le() as usize;
    need(buf, name_len, "tensor name")?;
    let name = std::str::from_utf8(&buf[..name_len])
        .map_err(|_| FusionError::InvalidCheckpoint("tensor name is not UTF-8".into()))?
        .to_string();
    buf.advance(name_len);

    need(buf, 2, "tensor flags")?;
    let trainable = match buf.get_u8() {
        0 => false,
        1 => true,
        other => {
            return Err(FusionError::InvalidCheckpoint(format!(
                "tensor {}: bad trainable byte {}",
                name, other
            )))
        }
    };
    let rank = buf.get_u8() as usize;
    if rank > MAX_RANK {
        return Err(FusionError::InvalidCheckpoint(format!(
            "tensor {}: rank {}",
            name, rank
        )));
    }

    need(buf, 4 * rank, "tensor shape")?;
    let shape: Vec<usize> = (0..rank).map(|_| buf.get_u32_le() as usize).collect();
    let numel = shape
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .and_then(|n| n.checked_mul(4).map(|bytes| (n, bytes)));
    let (numel, data_len) = numel.ok_or_else(|| {
        FusionError::InvalidCheckpoint(format!("tensor {}: shape overflows", name))
    })?;

    need(buf, data_len, "tensor data")?;
    let data = (0..numel).map(|_| buf.get_f32_le()).collect();

    Ok(NamedTensor::new(name, shape, data, trainable))
}
