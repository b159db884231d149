//! JPEG frame-header probe.
//!
//! Walks the marker segments up to the first start-of-frame and reports
//! what a hardware decoder needs to decide whether it can take the image:
//! frame kind, precision, component count and sampling factors.

use decodepool_core::{ChromaSubsampling, ImageInfo, MAX_COMPONENTS};

use crate::codec::CodecStatus;

const SOI: u8 = 0xD8;
const EOI: u8 = 0xD9;
const SOS: u8 = 0xDA;
const TEM: u8 = 0x01;

/// Coding process declared by the SOF marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Baseline,
    ExtendedSequential,
    Progressive,
    Lossless,
    Hierarchical,
    Arithmetic,
}

impl FrameKind {
    fn from_marker(marker: u8) -> Option<Self> {
        match marker {
            0xC0 => Some(FrameKind::Baseline),
            0xC1 => Some(FrameKind::ExtendedSequential),
            0xC2 => Some(FrameKind::Progressive),
            0xC3 => Some(FrameKind::Lossless),
            0xC5..=0xC7 => Some(FrameKind::Hierarchical),
            0xC9..=0xCB | 0xCD..=0xCF => Some(FrameKind::Arithmetic),
            _ => None,
        }
    }

    /// Huffman-coded sequential DCT, the only kind the hardware path takes.
    pub fn is_sequential_huffman(&self) -> bool {
        matches!(self, FrameKind::Baseline | FrameKind::ExtendedSequential)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameComponent {
    pub id: u8,
    pub h_sampling: u8,
    pub v_sampling: u8,
}

/// Parsed SOF segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: FrameKind,
    pub precision: u8,
    pub width: u32,
    pub height: u32,
    pub components: Vec<FrameComponent>,
}

impl FrameHeader {
    pub fn subsampling(&self) -> ChromaSubsampling {
        match self.components.as_slice() {
            [_] => ChromaSubsampling::Gray,
            [y, cb, cr] if cb.h_sampling == cr.h_sampling && cb.v_sampling == cr.v_sampling => {
                if cb.h_sampling == 0 || cb.v_sampling == 0 {
                    return ChromaSubsampling::Unknown;
                }
                let h = y.h_sampling / cb.h_sampling;
                let v = y.v_sampling / cb.v_sampling;
                if y.h_sampling % cb.h_sampling != 0 || y.v_sampling % cb.v_sampling != 0 {
                    return ChromaSubsampling::Unknown;
                }
                match (h, v) {
                    (1, 1) => ChromaSubsampling::Css444,
                    (2, 1) => ChromaSubsampling::Css422,
                    (2, 2) => ChromaSubsampling::Css420,
                    (1, 2) => ChromaSubsampling::Css440,
                    (4, 1) => ChromaSubsampling::Css411,
                    (4, 2) => ChromaSubsampling::Css410,
                    _ => ChromaSubsampling::Unknown,
                }
            }
            _ => ChromaSubsampling::Unknown,
        }
    }

    /// Per-component plane sizes, scaled by sampling factors.
    pub fn image_info(&self) -> ImageInfo {
        let h_max = self.components.iter().map(|c| c.h_sampling).max().unwrap_or(1).max(1) as u32;
        let v_max = self.components.iter().map(|c| c.v_sampling).max().unwrap_or(1).max(1) as u32;

        let mut widths = [0u32; MAX_COMPONENTS];
        let mut heights = [0u32; MAX_COMPONENTS];
        for (i, c) in self.components.iter().take(MAX_COMPONENTS).enumerate() {
            widths[i] = (self.width * c.h_sampling as u32).div_ceil(h_max);
            heights[i] = (self.height * c.v_sampling as u32).div_ceil(v_max);
        }

        ImageInfo {
            components: self.components.len().min(MAX_COMPONENTS) as u8,
            subsampling: self.subsampling(),
            widths,
            heights,
        }
    }
}

/// Parse markers up to the frame header.
pub fn probe_jpeg(data: &[u8]) -> Result<FrameHeader, CodecStatus> {
    if data.len() < 4 || data[0] != 0xFF || data[1] != SOI {
        return Err(CodecStatus::BadStream("missing SOI marker".into()));
    }

    let mut pos = 2;
    loop {
        // Markers may be preceded by any number of 0xFF fill bytes.
        if data.get(pos) != Some(&0xFF) {
            return Err(CodecStatus::BadStream(format!(
                "expected marker at offset {pos}"
            )));
        }
        while data.get(pos) == Some(&0xFF) {
            pos += 1;
        }
        let marker = *data
            .get(pos)
            .ok_or_else(|| CodecStatus::BadStream("truncated before frame header".into()))?;
        pos += 1;

        match marker {
            TEM | 0xD0..=0xD7 => continue,
            SOI => return Err(CodecStatus::BadStream("nested SOI marker".into())),
            SOS | EOI => {
                return Err(CodecStatus::BadStream(
                    "no frame header before scan data".into(),
                ))
            }
            _ => {}
        }

        let length = read_u16(data, pos)? as usize;
        if length < 2 || pos + length > data.len() {
            return Err(CodecStatus::BadStream(format!(
                "segment 0xFF{marker:02X} overruns the stream"
            )));
        }
        let segment = &data[pos + 2..pos + length];

        if let Some(kind) = FrameKind::from_marker(marker) {
            return parse_frame(kind, segment);
        }
        pos += length;
    }
}

fn parse_frame(kind: FrameKind, segment: &[u8]) -> Result<FrameHeader, CodecStatus> {
    if segment.len() < 6 {
        return Err(CodecStatus::BadStream("short frame header".into()));
    }
    let precision = segment[0];
    let height = u16::from_be_bytes([segment[1], segment[2]]) as u32;
    let width = u16::from_be_bytes([segment[3], segment[4]]) as u32;
    let count = segment[5] as usize;

    if width == 0 || height == 0 {
        return Err(CodecStatus::Unsupported(format!(
            "frame size {width}x{height} (DNL-defined height is not supported)"
        )));
    }
    if count == 0 || segment.len() < 6 + 3 * count {
        return Err(CodecStatus::BadStream(format!(
            "frame header declares {count} components"
        )));
    }

    let components = segment[6..6 + 3 * count]
        .chunks_exact(3)
        .map(|c| FrameComponent {
            id: c[0],
            h_sampling: c[1] >> 4,
            v_sampling: c[1] & 0x0F,
        })
        .collect();

    Ok(FrameHeader {
        kind,
        precision,
        width,
        height,
        components,
    })
}

fn read_u16(data: &[u8], pos: usize) -> Result<u16, CodecStatus> {
    match data.get(pos..pos + 2) {
        Some(b) => Ok(u16::from_be_bytes([b[0], b[1]])),
        None => Err(CodecStatus::BadStream("truncated segment length".into())),
    }
}
