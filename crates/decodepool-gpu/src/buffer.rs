#[cfg(feature = "cuda")]
use cudarc::driver::{CudaSlice, DevicePtr};

use decodepool_core::{DecodeError, MemorySpace, Result, OUTPUT_CHANNELS};

use crate::context::DeviceContext;

/// A decoded image: `[height, width, 3]` interleaved RGB bytes in host or
/// device memory.
pub struct Tensor {
    shape: [usize; 3],
    space: MemorySpace,
    storage: Storage,
}

enum Storage {
    Host(Vec<u8>),
    /// Owned by cudarc (freed on drop).
    #[cfg(feature = "cuda")]
    Device(CudaSlice<u8>),
}

impl Tensor {
    /// Allocate a zeroed `[height, width, 3]` tensor in `space`.
    pub fn alloc(ctx: &DeviceContext, space: MemorySpace, height: u32, width: u32) -> Result<Self> {
        if height == 0 || width == 0 {
            return Err(DecodeError::InvalidInput(format!(
                "cannot allocate an empty {width}x{height} tensor"
            )));
        }
        ctx.check_space(space)?;

        let shape = [height as usize, width as usize, OUTPUT_CHANNELS];
        let len = shape.iter().product();
        let storage = match space {
            MemorySpace::Host => Storage::Host(vec![0u8; len]),
            MemorySpace::Device(_) => Self::alloc_device(ctx, space, len)?,
        };

        Ok(Self {
            shape,
            space,
            storage,
        })
    }

    #[cfg(feature = "cuda")]
    fn alloc_device(ctx: &DeviceContext, space: MemorySpace, len: usize) -> Result<Storage> {
        let slice = ctx
            .require_device(space)?
            .alloc_zeros::<u8>(len)
            .map_err(|e| DecodeError::Cuda(format!("tensor alloc failed: {e}")))?;
        Ok(Storage::Device(slice))
    }

    #[cfg(not(feature = "cuda"))]
    fn alloc_device(_ctx: &DeviceContext, space: MemorySpace, _len: usize) -> Result<Storage> {
        Err(DecodeError::DeviceUnavailable(space))
    }

    /// Wrap already-decoded host pixels.
    pub fn from_host(data: Vec<u8>, height: u32, width: u32) -> Result<Self> {
        let shape = [height as usize, width as usize, OUTPUT_CHANNELS];
        let expected: usize = shape.iter().product();
        if data.len() != expected || expected == 0 {
            return Err(DecodeError::InvalidInput(format!(
                "host buffer of {} bytes does not match shape {width}x{height}x{OUTPUT_CHANNELS}",
                data.len()
            )));
        }
        Ok(Self {
            shape,
            space: MemorySpace::Host,
            storage: Storage::Host(data),
        })
    }

    /// `[height, width, channels]`.
    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    pub fn height(&self) -> usize {
        self.shape[0]
    }

    pub fn width(&self) -> usize {
        self.shape[1]
    }

    pub fn channels(&self) -> usize {
        self.shape[2]
    }

    /// Number of bytes.
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes per row.
    pub fn pitch(&self) -> usize {
        self.shape[1] * self.shape[2]
    }

    pub fn space(&self) -> MemorySpace {
        self.space
    }

    /// Host pixels, if the tensor lives in host memory.
    pub fn host_data(&self) -> Option<&[u8]> {
        match &self.storage {
            Storage::Host(data) => Some(data),
            #[cfg(feature = "cuda")]
            Storage::Device(_) => None,
        }
    }

    pub fn host_data_mut(&mut self) -> Option<&mut [u8]> {
        match &mut self.storage {
            Storage::Host(data) => Some(data),
            #[cfg(feature = "cuda")]
            Storage::Device(_) => None,
        }
    }

    /// Raw device pointer, if the tensor lives in device memory.
    #[cfg(feature = "cuda")]
    pub fn device_ptr(&self) -> Option<u64> {
        match &self.storage {
            Storage::Host(_) => None,
            Storage::Device(slice) => Some(*DevicePtr::device_ptr(slice)),
        }
    }

    /// Fill the tensor from host pixels of exactly `len()` bytes.
    pub fn copy_from_host(&mut self, ctx: &DeviceContext, src: &[u8]) -> Result<()> {
        if src.len() != self.len() {
            return Err(DecodeError::InvalidInput(format!(
                "copy of {} bytes into a tensor of {} bytes",
                src.len(),
                self.len()
            )));
        }
        let _ = ctx;
        #[cfg(feature = "cuda")]
        let space = self.space;
        match &mut self.storage {
            Storage::Host(data) => {
                data.copy_from_slice(src);
                Ok(())
            }
            #[cfg(feature = "cuda")]
            Storage::Device(slice) => ctx
                .require_device(space)?
                .htod_sync_copy_into(src, slice)
                .map_err(|e| DecodeError::Cuda(format!("htod copy failed: {e}"))),
        }
    }

    /// Copy the pixels back to host memory.
    pub fn to_host(&self, ctx: &DeviceContext) -> Result<Vec<u8>> {
        let _ = ctx;
        match &self.storage {
            Storage::Host(data) => Ok(data.clone()),
            #[cfg(feature = "cuda")]
            Storage::Device(slice) => ctx
                .require_device(self.space)?
                .dtoh_sync_copy(slice)
                .map_err(|e| DecodeError::Cuda(format!("dtoh copy failed: {e}"))),
        }
    }
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("space", &self.space)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_alloc_and_copy() {
        let ctx = DeviceContext::host_only();
        let mut t = Tensor::alloc(&ctx, MemorySpace::Host, 2, 3).unwrap();
        assert_eq!(t.shape(), [2, 3, 3]);
        assert_eq!(t.pitch(), 9);

        let pixels: Vec<u8> = (0..18).collect();
        t.copy_from_host(&ctx, &pixels).unwrap();
        assert_eq!(t.host_data().unwrap(), pixels.as_slice());
        assert_eq!(t.to_host(&ctx).unwrap(), pixels);
    }

    #[test]
    fn test_rejects_mismatched_copy() {
        let ctx = DeviceContext::host_only();
        let mut t = Tensor::alloc(&ctx, MemorySpace::Host, 2, 2).unwrap();
        assert!(t.copy_from_host(&ctx, &[0u8; 5]).is_err());
        assert!(Tensor::alloc(&ctx, MemorySpace::Host, 0, 2).is_err());
    }

    #[test]
    fn test_from_host_checks_shape() {
        assert!(Tensor::from_host(vec![0u8; 12], 2, 2).is_ok());
        assert!(Tensor::from_host(vec![0u8; 11], 2, 2).is_err());
    }
}
