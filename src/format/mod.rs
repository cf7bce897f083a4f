//! Streamable splat container
//!
//! A plain binary envelope around JSON metadata: `SPL0` magic + u32
//! length + header, then a sequence of chunks, each `SPLC` magic + u32
//! length + chunk metadata + payload. The header carries a chunk table
//! with absolute offsets so clients can Range-request chunks as soon as
//! the header parses; the header's byte size is not known in advance,
//! so clients probe with escalating ranges. All multi-byte fields are
//! little-endian. Chunk 0 is the root and carries the LoD skeleton.
//!
//! Payload sections (packed splat words, SH bands, LoD tree nodes) are
//! individually lz4-compressed with a prepended size; the declared
//! byte counts plus the lz4 size check are the chunk's integrity check.

use serde::{Deserialize, Serialize};

use crate::core::{Error, Result};
use crate::splat::packed::PACKED_WORDS;
use crate::splat::sh::{SH1_WORDS, SH2_WORDS, SH3_WORDS};
use crate::splat::{ChunkSplats, PackedSplats, SplatEncoding};

/// Container magic, "SPL0" little-endian.
pub const CONTAINER_MAGIC: u32 = 0x304c_5053;
/// Chunk magic, "SPLC" little-endian.
pub const CHUNK_MAGIC: u32 = 0x434c_5053;
/// Splats per chunk; one chunk fills one cache page.
pub const CHUNK_SPLATS: usize = crate::core::PAGE_SIZE as usize;
/// Escalating byte ranges clients use to probe for the full header.
pub const HEADER_PROBE_SIZES: [usize; 3] = [64 << 10, 256 << 10, 1 << 20];

const FORMAT_VERSION: u32 = 1;

/// Byte extent of one chunk within the container.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkRange {
    pub offset: u64,
    pub bytes: u64,
    /// First splat covered by this chunk
    pub base: u64,
    pub count: u64,
}

/// Self-describing container header.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContainerHeader {
    pub version: u32,
    pub count: u64,
    #[serde(rename = "maxSh")]
    pub max_sh: u32,
    #[serde(rename = "lodTree")]
    pub lod_tree: bool,
    #[serde(rename = "chunkSize")]
    pub chunk_size: u32,
    #[serde(rename = "splatEncoding")]
    pub splat_encoding: SplatEncoding,
    pub chunks: Vec<ChunkRange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionKind {
    Packed,
    Sh1,
    Sh2,
    Sh3,
    LodTree,
}

/// One compressed section within a chunk payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkSection {
    pub kind: SectionKind,
    /// Offset within the payload
    pub offset: u64,
    pub bytes: u64,
}

/// Per-chunk metadata.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkMeta {
    pub version: u32,
    pub base: u64,
    pub count: u64,
    #[serde(rename = "payloadBytes")]
    pub payload_bytes: u64,
    pub sections: Vec<ChunkSection>,
}

/// A decoded chunk: splat data plus the LoD tree nodes covering it.
#[derive(Debug, Default)]
pub struct DecodedChunk {
    pub base: u64,
    pub splats: ChunkSplats,
    /// Node words for this chunk's slice of the tree, when present
    pub lod_words: Option<Vec<u32>>,
}

fn words_to_le(words: &[u32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(words.len() * 4);
    for word in words {
        bytes.extend(word.to_le_bytes());
    }
    bytes
}

fn le_to_words(bytes: &[u8]) -> Result<Vec<u32>> {
    if bytes.len() % 4 != 0 {
        return Err(Error::Format(format!(
            "section length {} is not word aligned",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

fn compress_section(words: &[u32]) -> Vec<u8> {
    lz4_flex::compress_prepend_size(&words_to_le(words))
}

fn decompress_section(bytes: &[u8]) -> Result<Vec<u32>> {
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| Error::Format(format!("lz4: {e}")))?;
    le_to_words(&raw)
}

/// Encode one chunk (magic + meta + payload) into `out`, returning its
/// byte extent.
fn encode_chunk(
    out: &mut Vec<u8>,
    base: usize,
    count: usize,
    splats: &PackedSplats,
    lod_words: Option<&[u32]>,
) -> ChunkRange {
    let offset = out.len() as u64;

    let mut payload = Vec::new();
    let mut sections = Vec::new();
    let mut push_section = |kind: SectionKind, words: &[u32], payload: &mut Vec<u8>| {
        let compressed = compress_section(words);
        sections.push(ChunkSection {
            kind,
            offset: payload.len() as u64,
            bytes: compressed.len() as u64,
        });
        payload.extend(compressed);
    };

    push_section(
        SectionKind::Packed,
        &splats.words[base * PACKED_WORDS..(base + count) * PACKED_WORDS],
        &mut payload,
    );
    if let Some(sh1) = &splats.sh1 {
        push_section(SectionKind::Sh1, &sh1[base * SH1_WORDS..(base + count) * SH1_WORDS], &mut payload);
    }
    if let Some(sh2) = &splats.sh2 {
        push_section(SectionKind::Sh2, &sh2[base * SH2_WORDS..(base + count) * SH2_WORDS], &mut payload);
    }
    if let Some(sh3) = &splats.sh3 {
        push_section(SectionKind::Sh3, &sh3[base * SH3_WORDS..(base + count) * SH3_WORDS], &mut payload);
    }
    if let Some(lod) = lod_words {
        push_section(
            SectionKind::LodTree,
            &lod[base * crate::lod::NODE_WORDS..(base + count) * crate::lod::NODE_WORDS],
            &mut payload,
        );
    }

    let meta = ChunkMeta {
        version: FORMAT_VERSION,
        base: base as u64,
        count: count as u64,
        payload_bytes: payload.len() as u64,
        sections,
    };
    let meta_bytes = serde_json::to_vec(&meta).expect("chunk meta serializes");

    out.extend(CHUNK_MAGIC.to_le_bytes());
    out.extend((meta_bytes.len() as u32).to_le_bytes());
    out.extend(&meta_bytes);
    out.extend(&payload);

    ChunkRange {
        offset,
        bytes: out.len() as u64 - offset,
        base: base as u64,
        count: count as u64,
    }
}

/// Serialize a complete container. `lod_words` must cover every splat
/// when present (4 words each); chunk 0 then carries the root skeleton.
pub fn encode_container(splats: &PackedSplats, lod_words: Option<&[u32]>) -> Result<Vec<u8>> {
    if let Some(lod) = lod_words {
        if lod.len() != splats.num_splats * crate::lod::NODE_WORDS {
            return Err(Error::InvalidArgument(format!(
                "lod tree has {} words for {} splats",
                lod.len(),
                splats.num_splats
            )));
        }
    }

    // Chunks are encoded first so the header can carry their offsets;
    // offsets are then rebased past the header.
    let mut body = Vec::new();
    let mut chunks = Vec::new();
    let mut base = 0;
    while base < splats.num_splats {
        let count = (splats.num_splats - base).min(CHUNK_SPLATS);
        chunks.push(encode_chunk(&mut body, base, count, splats, lod_words));
        base += count;
    }

    let mut header = ContainerHeader {
        version: FORMAT_VERSION,
        count: splats.num_splats as u64,
        max_sh: splats.max_sh_level(),
        lod_tree: lod_words.is_some(),
        chunk_size: CHUNK_SPLATS as u32,
        splat_encoding: splats.encoding.clone(),
        chunks,
        comment: None,
    };

    // Chunk offsets are absolute, so the header length feeds back into
    // its own JSON encoding; iterate to the fixed point (offset digit
    // counts only ever grow).
    let body_offsets: Vec<u64> = header.chunks.iter().map(|c| c.offset).collect();
    let mut header_len = 0usize;
    let meta_bytes = loop {
        for (range, &rel) in header.chunks.iter_mut().zip(&body_offsets) {
            range.offset = rel + header_len as u64;
        }
        let meta_bytes = serde_json::to_vec(&header).expect("header serializes");
        if 8 + meta_bytes.len() == header_len {
            break meta_bytes;
        }
        header_len = 8 + meta_bytes.len();
    };

    let mut out = Vec::with_capacity(header_len + body.len());
    out.extend(CONTAINER_MAGIC.to_le_bytes());
    out.extend((meta_bytes.len() as u32).to_le_bytes());
    out.extend(&meta_bytes);
    out.extend(&body);
    Ok(out)
}

/// Parse the container header from a byte prefix. Returns `Ok(None)`
/// when the prefix is too short; fetch a larger probe range and retry.
pub fn probe_header(bytes: &[u8]) -> Result<Option<(ContainerHeader, u64)>> {
    if bytes.len() < 8 {
        return Ok(None);
    }
    let magic = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    if magic != CONTAINER_MAGIC {
        return Err(Error::Format(format!("bad container magic {magic:#10x}")));
    }
    let meta_len = u32::from_le_bytes(bytes[4..8].try_into().unwrap()) as usize;
    if bytes.len() < 8 + meta_len {
        return Ok(None);
    }
    let header: ContainerHeader = serde_json::from_slice(&bytes[8..8 + meta_len])
        .map_err(|e| Error::Format(format!("header: {e}")))?;
    if header.version != FORMAT_VERSION {
        return Err(Error::Format(format!("unsupported version {}", header.version)));
    }
    Ok(Some((header, (8 + meta_len) as u64)))
}

/// Decode one chunk from its full byte range.
pub fn decode_chunk(bytes: &[u8]) -> Result<DecodedChunk> {
    if bytes.len() < 8 {
        return Err(Error::Format("chunk shorter than its envelope".into()));
    }
    let magic = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    if magic != CHUNK_MAGIC {
        return Err(Error::Format(format!("bad chunk magic {magic:#10x}")));
    }
    let meta_len = u32::from_le_bytes(bytes[4..8].try_into().unwrap()) as usize;
    if bytes.len() < 8 + meta_len {
        return Err(Error::Format("chunk metadata truncated".into()));
    }
    let meta: ChunkMeta = serde_json::from_slice(&bytes[8..8 + meta_len])
        .map_err(|e| Error::Format(format!("chunk meta: {e}")))?;

    let payload = &bytes[8 + meta_len..];
    if payload.len() as u64 != meta.payload_bytes {
        return Err(Error::Format(format!(
            "chunk payload is {} bytes, expected {}",
            payload.len(),
            meta.payload_bytes
        )));
    }

    let mut chunk = DecodedChunk {
        base: meta.base,
        splats: ChunkSplats { count: meta.count as usize, ..Default::default() },
        lod_words: None,
    };

    for section in &meta.sections {
        let start = section.offset as usize;
        let end = start + section.bytes as usize;
        if end > payload.len() {
            return Err(Error::Format(format!(
                "section {:?} extends past the payload",
                section.kind
            )));
        }
        let words = decompress_section(&payload[start..end])?;
        let expect = |per_splat: usize| -> Result<()> {
            if words.len() != meta.count as usize * per_splat {
                return Err(Error::Format(format!(
                    "section {:?} has {} words for {} splats",
                    section.kind,
                    words.len(),
                    meta.count
                )));
            }
            Ok(())
        };
        match section.kind {
            SectionKind::Packed => {
                expect(PACKED_WORDS)?;
                chunk.splats.packed = words;
            }
            SectionKind::Sh1 => {
                expect(SH1_WORDS)?;
                chunk.splats.sh1 = Some(words);
            }
            SectionKind::Sh2 => {
                expect(SH2_WORDS)?;
                chunk.splats.sh2 = Some(words);
            }
            SectionKind::Sh3 => {
                expect(SH3_WORDS)?;
                chunk.splats.sh3 = Some(words);
            }
            SectionKind::LodTree => {
                expect(crate::lod::NODE_WORDS)?;
                chunk.lod_words = Some(words);
            }
        }
    }

    if chunk.splats.packed.is_empty() {
        return Err(Error::Format("chunk has no packed splat section".into()));
    }
    Ok(chunk)
}
