use arrayref::array_ref;
use byteorder::{ByteOrder, LittleEndian};
use rkyv::{from_bytes, to_bytes, AlignedVec};

use crate::{
    error::{CodecError, Result},
    plan::PartitionPlan,
};

/// Every frame starts with these bytes.
pub const MAGIC: [u8; 4] = *b"CLVP";

/// Encodes one partition plan as a frame:
///
/// `MAGIC | partition id (u32 LE) | varint len | zstd(archived plan)`
pub fn encode_partition(plan: &PartitionPlan, level: i32) -> Result<Vec<u8>> {
    let archived =
        to_bytes::<_, 4096>(plan).map_err(|_| CodecError::Archive)?;
    let compressed =
        zstd::encode_all(&archived[..], level).map_err(CodecError::from)?;

    let mut len_buf = unsigned_varint::encode::usize_buffer();
    let len = unsigned_varint::encode::usize(compressed.len(), &mut len_buf);

    let mut buf = Vec::with_capacity(4 + 4 + len.len() + compressed.len());
    buf.extend_from_slice(&MAGIC);
    let mut id = [0u8; 4];
    LittleEndian::write_u32(&mut id, plan.id);
    buf.extend_from_slice(&id);
    buf.extend_from_slice(len);
    buf.extend_from_slice(&compressed);
    Ok(buf)
}

/// Decodes the frame at the start of `buf`, returning the plan and the
/// number of bytes the frame occupied.
pub fn decode_partition(buf: &[u8]) -> Result<(PartitionPlan, usize)> {
    if buf.len() < 8 {
        Err(CodecError::Truncated {
            needed: 8,
            available: buf.len(),
        })?
    }
    if *array_ref![buf, 0, 4] != MAGIC {
        Err(CodecError::BadMagic)?
    }
    let id = LittleEndian::read_u32(&buf[4..8]);
    let (len, rest) = unsigned_varint::decode::usize(&buf[8..])
        .map_err(|_| CodecError::Varint)?;
    if rest.len() < len {
        Err(CodecError::Truncated {
            needed: len,
            available: rest.len(),
        })?
    }
    let header = buf.len() - rest.len();

    let archived =
        zstd::decode_all(&rest[..len]).map_err(CodecError::from)?;
    let mut aligned = AlignedVec::with_capacity(archived.len());
    aligned.extend_from_slice(&archived);
    let plan: PartitionPlan =
        from_bytes(&aligned).map_err(|_| CodecError::InvalidArchive)?;
    if plan.id != id {
        Err(CodecError::InvalidArchive)?
    }
    Ok((plan, header + len))
}

/// Decodes back-to-back frames until `buf` is exhausted.
pub fn decode_partitions(mut buf: &[u8]) -> Result<Vec<PartitionPlan>> {
    let mut plans = Vec::new();
    while !buf.is_empty() {
        let (plan, used) = decode_partition(buf)?;
        plans.push(plan);
        buf = &buf[used..];
    }
    Ok(plans)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::Error,
        lower::{OpRecord, OpTag, Operand},
        plan::SignalEntry,
        signal::Dtype,
    };

    fn plan(id: u32) -> PartitionPlan {
        PartitionPlan {
            id,
            ops: vec![
                OpRecord {
                    tag: OpTag::Wait,
                    operands: vec![Operand::Signal(7)],
                },
                OpRecord {
                    tag: OpTag::LinearFilter,
                    operands: vec![
                        Operand::Signal(3),
                        Operand::Signal(7),
                        Operand::Coefficients(vec![0.18]),
                        Operand::Coefficients(vec![-0.82]),
                    ],
                },
            ],
            signals: vec![SignalEntry {
                key: 7,
                label: "filtered".into(),
                dtype: Dtype::Float64,
                shape: vec![1, 1],
                data: vec![0.25],
            }],
        }
    }

    #[test]
    fn frames_concatenate() {
        let mut stream = encode_partition(&plan(0), 3).unwrap();
        stream.extend(encode_partition(&plan(1), 3).unwrap());
        assert_eq!(&stream[..4], b"CLVP");

        let plans = decode_partitions(&stream).unwrap();
        assert_eq!(plans, vec![plan(0), plan(1)]);
    }

    #[test]
    fn damaged_frames_are_rejected() {
        let frame = encode_partition(&plan(2), 1).unwrap();

        let mut bad_magic = frame.clone();
        bad_magic[0] = b'X';
        assert!(matches!(
            decode_partition(&bad_magic),
            Err(Error::Codec(CodecError::BadMagic))
        ));

        assert!(matches!(
            decode_partition(&frame[..frame.len() - 1]),
            Err(Error::Codec(CodecError::Truncated { .. }))
        ));

        let mut wrong_id = frame;
        wrong_id[4] = 9;
        assert!(matches!(
            decode_partition(&wrong_id),
            Err(Error::Codec(CodecError::InvalidArchive))
        ));
    }
}
