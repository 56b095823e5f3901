//! Data block codec.
//!
//! Records stream through an optional compression encoder into a block
//! buffer. At flush time the payload is padded with zeros to the next
//! multiple of the alignment unit and hashed with xxhash64 over the final
//! on-disk bytes.

use std::io::Write;

use bytes::Bytes;
use lz4_flex::frame::{FrameDecoder, FrameEncoder};

use super::{BlockStat, CompressionCodec, Row, SegmentError, RECORD_HEADER_LEN};

/// Accumulates one block's records, compressing as they arrive.
pub(crate) struct BlockEncoder {
    sink: EncoderSink,
    uncompressed_len: u64,
}

enum EncoderSink {
    Plain(Vec<u8>),
    Zstd(zstd::Encoder<'static, Vec<u8>>),
    Lz4(Box<FrameEncoder<Vec<u8>>>),
}

impl BlockEncoder {
    pub(crate) fn new(codec: CompressionCodec, zstd_level: i32) -> Result<Self, SegmentError> {
        let sink = match codec {
            CompressionCodec::None => EncoderSink::Plain(Vec::new()),
            CompressionCodec::Zstd => EncoderSink::Zstd(
                zstd::Encoder::new(Vec::new(), zstd_level)
                    .map_err(|e| SegmentError::Io("create zstd encoder", e))?,
            ),
            CompressionCodec::Lz4 => EncoderSink::Lz4(Box::new(FrameEncoder::new(Vec::new()))),
        };
        Ok(Self {
            sink,
            uncompressed_len: 0,
        })
    }

    pub(crate) fn push_row(&mut self, key: &[u8], value: &[u8]) -> Result<(), SegmentError> {
        let mut header = [0u8; RECORD_HEADER_LEN];
        header[0..2].copy_from_slice(&(key.len() as u16).to_le_bytes());
        header[2..6].copy_from_slice(&(value.len() as u32).to_le_bytes());

        let writer: &mut dyn Write = match &mut self.sink {
            EncoderSink::Plain(buf) => buf,
            EncoderSink::Zstd(enc) => enc,
            EncoderSink::Lz4(enc) => enc.as_mut(),
        };
        writer
            .write_all(&header)
            .and_then(|_| writer.write_all(key))
            .and_then(|_| writer.write_all(value))
            .map_err(|e| SegmentError::Io("encode block record", e))?;

        self.uncompressed_len += (RECORD_HEADER_LEN + key.len() + value.len()) as u64;
        Ok(())
    }

    /// Total encoded record bytes so far, before compression. The writer's
    /// flush threshold applies to this figure so block row counts do not
    /// depend on the codec.
    pub(crate) fn uncompressed_len(&self) -> u64 {
        self.uncompressed_len
    }

    /// Closes the compression stream and returns `(payload, compressed_len)`
    /// where `compressed_len` is 0 for raw blocks.
    pub(crate) fn finish(self) -> Result<(Vec<u8>, u64), SegmentError> {
        match self.sink {
            EncoderSink::Plain(buf) => Ok((buf, 0)),
            EncoderSink::Zstd(enc) => {
                let buf = enc
                    .finish()
                    .map_err(|e| SegmentError::Io("finish zstd block", e))?;
                let len = buf.len() as u64;
                Ok((buf, len))
            }
            EncoderSink::Lz4(enc) => {
                let buf = enc
                    .finish()
                    .map_err(|e| SegmentError::Io("finish lz4 block", std::io::Error::other(e)))?;
                let len = buf.len() as u64;
                Ok((buf, len))
            }
        }
    }
}

/// Pads `payload` with zeros so its length is a multiple of `align`.
pub(crate) fn pad_to_alignment(payload: &mut Vec<u8>, align: u64) {
    let align = align.max(1) as usize;
    let remainder = payload.len() % align;
    if remainder > 0 {
        payload.resize(payload.len() + (align - remainder), 0);
    }
}

/// Decodes a block's on-disk bytes (already hash-verified) into rows.
pub(crate) fn decode(
    stat: &BlockStat,
    codec: CompressionCodec,
    on_disk: &[u8],
) -> Result<Vec<Row>, SegmentError> {
    let payload: Vec<u8>;
    let records: &[u8] = match codec {
        CompressionCodec::None => {
            let len = stat.uncompressed_len as usize;
            on_disk
                .get(..len)
                .ok_or(SegmentError::CorruptBlock("payload shorter than recorded"))?
        }
        CompressionCodec::Zstd => {
            let len = stat.compressed_len as usize;
            let compressed = on_disk
                .get(..len)
                .ok_or(SegmentError::CorruptBlock("payload shorter than recorded"))?;
            payload = zstd::stream::decode_all(compressed)
                .map_err(|e| SegmentError::Io("decompress zstd block", e))?;
            &payload
        }
        CompressionCodec::Lz4 => {
            let len = stat.compressed_len as usize;
            let compressed = on_disk
                .get(..len)
                .ok_or(SegmentError::CorruptBlock("payload shorter than recorded"))?;
            let mut out = Vec::with_capacity(stat.uncompressed_len as usize);
            std::io::Read::read_to_end(&mut FrameDecoder::new(compressed), &mut out)
                .map_err(|e| SegmentError::Io("decompress lz4 block", e))?;
            payload = out;
            &payload
        }
    };

    if records.len() as u64 != stat.uncompressed_len {
        return Err(SegmentError::CorruptBlock("decompressed length mismatch"));
    }

    let mut rows = Vec::new();
    let mut pos = 0usize;
    while pos < records.len() {
        if pos + RECORD_HEADER_LEN > records.len() {
            return Err(SegmentError::CorruptBlock("truncated record header"));
        }
        let key_len = u16::from_le_bytes([records[pos], records[pos + 1]]) as usize;
        let val_len = u32::from_le_bytes([
            records[pos + 2],
            records[pos + 3],
            records[pos + 4],
            records[pos + 5],
        ]) as usize;
        pos += RECORD_HEADER_LEN;

        if pos + key_len + val_len > records.len() {
            return Err(SegmentError::CorruptBlock("truncated record body"));
        }
        let key = Bytes::copy_from_slice(&records[pos..pos + key_len]);
        pos += key_len;
        let value = Bytes::copy_from_slice(&records[pos..pos + val_len]);
        pos += val_len;

        if key.is_empty() {
            return Err(SegmentError::CorruptBlock("empty record key"));
        }
        rows.push(Row { key, value });
    }

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat_for(payload_len: u64, compressed_len: u64) -> BlockStat {
        BlockStat {
            first_key: Bytes::from_static(b"a"),
            offset: 0,
            block_len: 4096,
            uncompressed_len: payload_len,
            compressed_len,
            hash: 0,
        }
    }

    #[test]
    fn records_round_trip_uncompressed() {
        let mut enc = BlockEncoder::new(CompressionCodec::None, 0).expect("encoder");
        enc.push_row(b"alpha", b"1").expect("push");
        enc.push_row(b"beta", b"").expect("push");
        enc.push_row(b"gamma", b"33").expect("push");
        let raw_len = enc.uncompressed_len();
        assert_eq!(raw_len, (6 + 5 + 1) + (6 + 4) + (6 + 5 + 2));

        let (mut payload, compressed_len) = enc.finish().expect("finish");
        assert_eq!(compressed_len, 0);
        assert_eq!(payload.len() as u64, raw_len);

        pad_to_alignment(&mut payload, 4096);
        assert_eq!(payload.len(), 4096);

        let rows = decode(&stat_for(raw_len, 0), CompressionCodec::None, &payload).expect("decode");
        assert_eq!(
            rows,
            vec![
                Row::new(&b"alpha"[..], &b"1"[..]),
                Row::new(&b"beta"[..], &b""[..]),
                Row::new(&b"gamma"[..], &b"33"[..]),
            ]
        );
    }

    #[test]
    fn records_round_trip_compressed() {
        for codec in [CompressionCodec::Zstd, CompressionCodec::Lz4] {
            let mut enc = BlockEncoder::new(codec, 1).expect("encoder");
            for i in 0..100 {
                let key = format!("key{i:03}");
                let value = format!("value{i:03}");
                enc.push_row(key.as_bytes(), value.as_bytes()).expect("push");
            }
            let raw_len = enc.uncompressed_len();

            let (mut payload, compressed_len) = enc.finish().expect("finish");
            assert_eq!(compressed_len, payload.len() as u64);
            assert!(compressed_len > 0);
            assert!(compressed_len < raw_len, "repetitive data should shrink");

            pad_to_alignment(&mut payload, 4096);
            assert_eq!(payload.len() % 4096, 0);

            let rows = decode(&stat_for(raw_len, compressed_len), codec, &payload).expect("decode");
            assert_eq!(rows.len(), 100);
            assert_eq!(rows[0], Row::new(&b"key000"[..], &b"value000"[..]));
            assert_eq!(rows[99], Row::new(&b"key099"[..], &b"value099"[..]));
        }
    }

    #[test]
    fn alignment_is_idempotent_on_aligned_input() {
        let mut payload = vec![1u8; 8192];
        pad_to_alignment(&mut payload, 4096);
        assert_eq!(payload.len(), 8192);
    }

    #[test]
    fn decode_rejects_truncated_records() {
        let mut enc = BlockEncoder::new(CompressionCodec::None, 0).expect("encoder");
        enc.push_row(b"alpha", b"value").expect("push");
        let raw_len = enc.uncompressed_len();
        let (payload, _) = enc.finish().expect("finish");

        // Claim more payload than exists.
        let stat = stat_for(raw_len + 4, 0);
        assert!(matches!(
            decode(&stat, CompressionCodec::None, &payload),
            Err(SegmentError::CorruptBlock(_))
        ));
    }
}
