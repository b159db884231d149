//! nvJPEG hybrid-backend codec.
//!
//! Raw FFI to `libnvjpeg`, wrapped in a [`HardwareCodec`] that owns one
//! codec handle, one decoder with its state, one device buffer and two
//! (JPEG stream, pinned buffer) pages used in alternation. The host phase
//! of image `n + 1` parses into the page image `n` is not using, so it
//! never races the transfer of image `n`.
//!
//! Only device outputs are supported. Host targets are refused up front
//! through [`HardwareCodec::supports_output`] and decoded in software.

use std::ffi::{c_int, c_uint, c_void};
use std::ptr;

use decodepool_core::{
    ChromaSubsampling, DecodeError, ImageInfo, MemoryPadding, MemorySpace, Result, MAX_COMPONENTS,
};
use decodepool_gpu::{DeviceContext, StagingRing, Tensor};

use crate::codec::{CodecFactory, CodecStatus, DecodeParams, HardwareCodec};

#[allow(non_camel_case_types)]
mod ffi {
    use super::*;

    pub type nvjpegStatus_t = c_int;
    pub type nvjpegHandle_t = *mut c_void;
    pub type nvjpegJpegState_t = *mut c_void;
    pub type nvjpegJpegDecoder_t = *mut c_void;
    pub type nvjpegDecodeParams_t = *mut c_void;
    pub type nvjpegJpegStream_t = *mut c_void;
    pub type nvjpegBufferPinned_t = *mut c_void;
    pub type nvjpegBufferDevice_t = *mut c_void;
    pub type cudaStream_t = *mut c_void;

    pub const NVJPEG_STATUS_SUCCESS: nvjpegStatus_t = 0;
    pub const NVJPEG_STATUS_INVALID_PARAMETER: nvjpegStatus_t = 2;
    pub const NVJPEG_STATUS_BAD_JPEG: nvjpegStatus_t = 3;
    pub const NVJPEG_STATUS_JPEG_NOT_SUPPORTED: nvjpegStatus_t = 4;
    pub const NVJPEG_STATUS_ALLOCATOR_FAILURE: nvjpegStatus_t = 5;
    pub const NVJPEG_STATUS_EXECUTION_FAILED: nvjpegStatus_t = 6;
    pub const NVJPEG_STATUS_IMPLEMENTATION_NOT_SUPPORTED: nvjpegStatus_t = 9;

    pub const NVJPEG_BACKEND_HYBRID: c_int = 1;
    pub const NVJPEG_OUTPUT_RGBI: c_int = 5;

    #[repr(C)]
    pub struct nvjpegImage_t {
        pub channel: [*mut u8; 4],
        pub pitch: [usize; 4],
    }

    #[link(name = "nvjpeg")]
    extern "C" {
        pub fn nvjpegCreateEx(
            backend: c_int,
            dev_allocator: *mut c_void,
            pinned_allocator: *mut c_void,
            flags: c_uint,
            handle: *mut nvjpegHandle_t,
        ) -> nvjpegStatus_t;
        pub fn nvjpegDestroy(handle: nvjpegHandle_t) -> nvjpegStatus_t;
        pub fn nvjpegSetPinnedMemoryPadding(padding: usize, handle: nvjpegHandle_t) -> nvjpegStatus_t;
        pub fn nvjpegSetDeviceMemoryPadding(padding: usize, handle: nvjpegHandle_t) -> nvjpegStatus_t;

        pub fn nvjpegGetImageInfo(
            handle: nvjpegHandle_t,
            data: *const u8,
            length: usize,
            n_components: *mut c_int,
            subsampling: *mut c_int,
            widths: *mut c_int,
            heights: *mut c_int,
        ) -> nvjpegStatus_t;

        pub fn nvjpegJpegStreamCreate(handle: nvjpegHandle_t, stream: *mut nvjpegJpegStream_t) -> nvjpegStatus_t;
        pub fn nvjpegJpegStreamDestroy(stream: nvjpegJpegStream_t) -> nvjpegStatus_t;
        pub fn nvjpegJpegStreamParse(
            handle: nvjpegHandle_t,
            data: *const u8,
            length: usize,
            save_metadata: c_int,
            save_stream: c_int,
            stream: nvjpegJpegStream_t,
        ) -> nvjpegStatus_t;

        pub fn nvjpegDecodeParamsCreate(handle: nvjpegHandle_t, params: *mut nvjpegDecodeParams_t) -> nvjpegStatus_t;
        pub fn nvjpegDecodeParamsDestroy(params: nvjpegDecodeParams_t) -> nvjpegStatus_t;
        pub fn nvjpegDecodeParamsSetOutputFormat(params: nvjpegDecodeParams_t, format: c_int) -> nvjpegStatus_t;
        pub fn nvjpegDecodeParamsSetROI(
            params: nvjpegDecodeParams_t,
            offset_x: c_int,
            offset_y: c_int,
            width: c_int,
            height: c_int,
        ) -> nvjpegStatus_t;

        pub fn nvjpegDecoderCreate(
            handle: nvjpegHandle_t,
            backend: c_int,
            decoder: *mut nvjpegJpegDecoder_t,
        ) -> nvjpegStatus_t;
        pub fn nvjpegDecoderDestroy(decoder: nvjpegJpegDecoder_t) -> nvjpegStatus_t;
        pub fn nvjpegDecoderStateCreate(
            handle: nvjpegHandle_t,
            decoder: nvjpegJpegDecoder_t,
            state: *mut nvjpegJpegState_t,
        ) -> nvjpegStatus_t;
        pub fn nvjpegJpegStateDestroy(state: nvjpegJpegState_t) -> nvjpegStatus_t;

        pub fn nvjpegBufferPinnedCreate(
            handle: nvjpegHandle_t,
            allocator: *mut c_void,
            buffer: *mut nvjpegBufferPinned_t,
        ) -> nvjpegStatus_t;
        pub fn nvjpegBufferPinnedDestroy(buffer: nvjpegBufferPinned_t) -> nvjpegStatus_t;
        pub fn nvjpegBufferDeviceCreate(
            handle: nvjpegHandle_t,
            allocator: *mut c_void,
            buffer: *mut nvjpegBufferDevice_t,
        ) -> nvjpegStatus_t;
        pub fn nvjpegBufferDeviceDestroy(buffer: nvjpegBufferDevice_t) -> nvjpegStatus_t;
        pub fn nvjpegStateAttachPinnedBuffer(
            state: nvjpegJpegState_t,
            buffer: nvjpegBufferPinned_t,
        ) -> nvjpegStatus_t;
        pub fn nvjpegStateAttachDeviceBuffer(
            state: nvjpegJpegState_t,
            buffer: nvjpegBufferDevice_t,
        ) -> nvjpegStatus_t;

        pub fn nvjpegDecodeJpegHost(
            handle: nvjpegHandle_t,
            decoder: nvjpegJpegDecoder_t,
            state: nvjpegJpegState_t,
            params: nvjpegDecodeParams_t,
            stream: nvjpegJpegStream_t,
        ) -> nvjpegStatus_t;
        pub fn nvjpegDecodeJpegTransferToDevice(
            handle: nvjpegHandle_t,
            decoder: nvjpegJpegDecoder_t,
            state: nvjpegJpegState_t,
            stream: nvjpegJpegStream_t,
            cuda_stream: cudaStream_t,
        ) -> nvjpegStatus_t;
        pub fn nvjpegDecodeJpegDevice(
            handle: nvjpegHandle_t,
            decoder: nvjpegJpegDecoder_t,
            state: nvjpegJpegState_t,
            destination: *mut nvjpegImage_t,
            cuda_stream: cudaStream_t,
        ) -> nvjpegStatus_t;
    }
}

fn check(status: ffi::nvjpegStatus_t, call: &str) -> std::result::Result<(), CodecStatus> {
    let message = || format!("{call} returned {status}");
    match status {
        ffi::NVJPEG_STATUS_SUCCESS => Ok(()),
        ffi::NVJPEG_STATUS_BAD_JPEG => Err(CodecStatus::BadStream(message())),
        ffi::NVJPEG_STATUS_JPEG_NOT_SUPPORTED | ffi::NVJPEG_STATUS_IMPLEMENTATION_NOT_SUPPORTED => {
            Err(CodecStatus::Unsupported(message()))
        }
        ffi::NVJPEG_STATUS_INVALID_PARAMETER => Err(CodecStatus::InvalidParameter(message())),
        ffi::NVJPEG_STATUS_ALLOCATOR_FAILURE => Err(CodecStatus::AllocationFailed(message())),
        ffi::NVJPEG_STATUS_EXECUTION_FAILED => Err(CodecStatus::ExecutionFailed(message())),
        _ => Err(CodecStatus::Internal(message())),
    }
}

fn check_init(status: ffi::nvjpegStatus_t, call: &str) -> Result<()> {
    check(status, call).map_err(|e| DecodeError::Codec(e.to_string()))
}

fn subsampling_from_raw(raw: c_int) -> ChromaSubsampling {
    match raw {
        0 => ChromaSubsampling::Css444,
        1 => ChromaSubsampling::Css422,
        2 => ChromaSubsampling::Css420,
        3 => ChromaSubsampling::Css440,
        4 => ChromaSubsampling::Css411,
        5 => ChromaSubsampling::Css410,
        6 => ChromaSubsampling::Gray,
        _ => ChromaSubsampling::Unknown,
    }
}

/// One half of the double buffer.
struct Page {
    stream: ffi::nvjpegJpegStream_t,
    pinned: ffi::nvjpegBufferPinned_t,
}

impl Page {
    fn null() -> Self {
        Self {
            stream: ptr::null_mut(),
            pinned: ptr::null_mut(),
        }
    }
}

pub struct NvJpegCodec {
    handle: ffi::nvjpegHandle_t,
    decoder: ffi::nvjpegJpegDecoder_t,
    state: ffi::nvjpegJpegState_t,
    params: ffi::nvjpegDecodeParams_t,
    device_buffer: ffi::nvjpegBufferDevice_t,
    pages: StagingRing<Page>,
    /// Page filled by the last successful host phase.
    staged: Option<usize>,
}

// Handles are only touched by the owning worker thread.
unsafe impl Send for NvJpegCodec {}

impl NvJpegCodec {
    pub fn new(padding: MemoryPadding) -> Result<Self> {
        let mut codec = Self {
            handle: ptr::null_mut(),
            decoder: ptr::null_mut(),
            state: ptr::null_mut(),
            params: ptr::null_mut(),
            device_buffer: ptr::null_mut(),
            pages: StagingRing::try_from_fn(2, |_| Ok(Page::null()))?,
            staged: None,
        };
        codec.init(padding)?;
        Ok(codec)
    }

    // Every handle is stored in `self` as soon as it exists, so `Drop`
    // releases whatever was created before a failure.
    fn init(&mut self, padding: MemoryPadding) -> Result<()> {
        unsafe {
            check_init(
                ffi::nvjpegCreateEx(
                    ffi::NVJPEG_BACKEND_HYBRID,
                    ptr::null_mut(),
                    ptr::null_mut(),
                    0,
                    &mut self.handle,
                ),
                "nvjpegCreateEx",
            )?;
            if padding.host > 0 {
                check_init(
                    ffi::nvjpegSetPinnedMemoryPadding(padding.host, self.handle),
                    "nvjpegSetPinnedMemoryPadding",
                )?;
            }
            if padding.device > 0 {
                check_init(
                    ffi::nvjpegSetDeviceMemoryPadding(padding.device, self.handle),
                    "nvjpegSetDeviceMemoryPadding",
                )?;
            }
            check_init(
                ffi::nvjpegDecodeParamsCreate(self.handle, &mut self.params),
                "nvjpegDecodeParamsCreate",
            )?;
            check_init(
                ffi::nvjpegDecoderCreate(self.handle, ffi::NVJPEG_BACKEND_HYBRID, &mut self.decoder),
                "nvjpegDecoderCreate",
            )?;
            check_init(
                ffi::nvjpegDecoderStateCreate(self.handle, self.decoder, &mut self.state),
                "nvjpegDecoderStateCreate",
            )?;
            check_init(
                ffi::nvjpegBufferDeviceCreate(self.handle, ptr::null_mut(), &mut self.device_buffer),
                "nvjpegBufferDeviceCreate",
            )?;

            for page in self.pages.iter_mut() {
                check_init(
                    ffi::nvjpegJpegStreamCreate(self.handle, &mut page.stream),
                    "nvjpegJpegStreamCreate",
                )?;
                check_init(
                    ffi::nvjpegBufferPinnedCreate(self.handle, ptr::null_mut(), &mut page.pinned),
                    "nvjpegBufferPinnedCreate",
                )?;
            }
        }
        Ok(())
    }
}

impl HardwareCodec for NvJpegCodec {
    fn name(&self) -> &str {
        "nvjpeg"
    }

    fn supports_output(&self, space: MemorySpace) -> bool {
        matches!(space, MemorySpace::Device(_))
    }

    fn image_info(&mut self, data: &[u8]) -> std::result::Result<ImageInfo, CodecStatus> {
        let mut components: c_int = 0;
        let mut subsampling: c_int = -1;
        let mut widths = [0 as c_int; MAX_COMPONENTS];
        let mut heights = [0 as c_int; MAX_COMPONENTS];
        check(
            unsafe {
                ffi::nvjpegGetImageInfo(
                    self.handle,
                    data.as_ptr(),
                    data.len(),
                    &mut components,
                    &mut subsampling,
                    widths.as_mut_ptr(),
                    heights.as_mut_ptr(),
                )
            },
            "nvjpegGetImageInfo",
        )?;

        let subsampling = subsampling_from_raw(subsampling);
        if subsampling == ChromaSubsampling::Unknown {
            return Err(CodecStatus::Unsupported("unknown chroma subsampling".into()));
        }
        Ok(ImageInfo {
            components: components.clamp(0, MAX_COMPONENTS as c_int) as u8,
            subsampling,
            widths: widths.map(|w| w.max(0) as u32),
            heights: heights.map(|h| h.max(0) as u32),
        })
    }

    fn decode_host(
        &mut self,
        data: &[u8],
        params: &DecodeParams,
    ) -> std::result::Result<(), CodecStatus> {
        self.staged = None;
        let (x, y, w, h) = match params.roi {
            Some(roi) => (roi.x as c_int, roi.y as c_int, roi.width as c_int, roi.height as c_int),
            // Width/height of -1 clear a previously set ROI.
            None => (0, 0, -1, -1),
        };
        let (index, page) = self.pages.advance();
        unsafe {
            check(
                ffi::nvjpegDecodeParamsSetOutputFormat(self.params, ffi::NVJPEG_OUTPUT_RGBI),
                "nvjpegDecodeParamsSetOutputFormat",
            )?;
            check(
                ffi::nvjpegDecodeParamsSetROI(self.params, x, y, w, h),
                "nvjpegDecodeParamsSetROI",
            )?;
            check(
                ffi::nvjpegJpegStreamParse(self.handle, data.as_ptr(), data.len(), 0, 0, page.stream),
                "nvjpegJpegStreamParse",
            )?;
            check(
                ffi::nvjpegStateAttachPinnedBuffer(self.state, page.pinned),
                "nvjpegStateAttachPinnedBuffer",
            )?;
            check(
                ffi::nvjpegDecodeJpegHost(self.handle, self.decoder, self.state, self.params, page.stream),
                "nvjpegDecodeJpegHost",
            )?;
        }
        self.staged = Some(index);
        Ok(())
    }

    fn decode_device(
        &mut self,
        ctx: &DeviceContext,
        out: &mut Tensor,
    ) -> std::result::Result<(), CodecStatus> {
        let index = self
            .staged
            .take()
            .ok_or_else(|| CodecStatus::InvalidParameter("device phase without host phase".into()))?;
        let Some(dst) = out.device_ptr() else {
            return Err(CodecStatus::Unsupported("host output tensor".into()));
        };
        let stream = self
            .pages
            .get(index)
            .map(|page| page.stream)
            .ok_or_else(|| CodecStatus::Internal(format!("page {index} missing")))?;

        let mut image = ffi::nvjpegImage_t {
            channel: [dst as *mut u8, ptr::null_mut(), ptr::null_mut(), ptr::null_mut()],
            pitch: [out.pitch(), 0, 0, 0],
        };
        unsafe {
            check(
                ffi::nvjpegStateAttachDeviceBuffer(self.state, self.device_buffer),
                "nvjpegStateAttachDeviceBuffer",
            )?;
            check(
                ffi::nvjpegDecodeJpegTransferToDevice(
                    self.handle,
                    self.decoder,
                    self.state,
                    stream,
                    ptr::null_mut(),
                ),
                "nvjpegDecodeJpegTransferToDevice",
            )?;
            check(
                ffi::nvjpegDecodeJpegDevice(
                    self.handle,
                    self.decoder,
                    self.state,
                    &mut image,
                    ptr::null_mut(),
                ),
                "nvjpegDecodeJpegDevice",
            )?;
        }
        ctx.synchronize()
            .map_err(|e| CodecStatus::ExecutionFailed(e.to_string()))
    }
}

impl Drop for NvJpegCodec {
    fn drop(&mut self) {
        unsafe {
            for page in self.pages.iter_mut() {
                if !page.stream.is_null() {
                    ffi::nvjpegJpegStreamDestroy(page.stream);
                }
                if !page.pinned.is_null() {
                    ffi::nvjpegBufferPinnedDestroy(page.pinned);
                }
            }
            if !self.params.is_null() {
                ffi::nvjpegDecodeParamsDestroy(self.params);
            }
            if !self.state.is_null() {
                ffi::nvjpegJpegStateDestroy(self.state);
            }
            if !self.decoder.is_null() {
                ffi::nvjpegDecoderDestroy(self.decoder);
            }
            if !self.device_buffer.is_null() {
                ffi::nvjpegBufferDeviceDestroy(self.device_buffer);
            }
            // The handle goes last.
            if !self.handle.is_null() {
                ffi::nvjpegDestroy(self.handle);
            }
        }
    }
}

/// Builds one [`NvJpegCodec`] per worker, after the worker has bound the
/// device context to its thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct NvJpegCodecFactory;

impl CodecFactory for NvJpegCodecFactory {
    fn name(&self) -> &str {
        "nvjpeg"
    }

    fn create(&self, ctx: &DeviceContext, padding: MemoryPadding) -> Result<Box<dyn HardwareCodec>> {
        if !ctx.has_device() {
            return Err(DecodeError::DeviceUnavailable(ctx.device_space()));
        }
        Ok(Box::new(NvJpegCodec::new(padding)?))
    }
}
