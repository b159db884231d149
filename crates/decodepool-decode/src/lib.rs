pub mod codec;
pub mod decoder;
pub mod host_codec;
pub mod image;
pub mod jpeg;
#[cfg(feature = "nvjpeg")]
pub mod nvjpeg;

pub use codec::{CodecFactory, CodecStatus, DecodeParams, HardwareCodec};
pub use decoder::{DecodePath, Decoder, DecoderStats, FallbackReason};
pub use host_codec::{HostJpegCodec, HostJpegCodecFactory};
pub use self::image::SoftwareDecoder;
pub use jpeg::{probe_jpeg, FrameHeader, FrameKind};
#[cfg(feature = "nvjpeg")]
pub use nvjpeg::{NvJpegCodec, NvJpegCodecFactory};
