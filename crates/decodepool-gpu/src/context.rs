#[cfg(feature = "cuda")]
use std::sync::Arc;

#[cfg(feature = "cuda")]
use cudarc::driver::CudaDevice;

use decodepool_core::{DecodeError, MemorySpace, Result};

/// Device binding for one decode pool.
///
/// Created once per pool from the caller's local rank and shared by every
/// worker. Without the `cuda` feature, or when the device cannot be opened,
/// the context is host-only and device allocations are rejected.
pub struct DeviceContext {
    #[cfg(feature = "cuda")]
    device: Option<Arc<CudaDevice>>,
    device_ordinal: usize,
}

/// Configuration for device context initialization.
#[derive(Debug, Clone)]
pub struct DeviceContextConfig {
    /// Device ordinal, normally the process's local rank.
    pub device_ordinal: usize,
    /// Fail instead of degrading to host-only when the device is missing.
    pub require_device: bool,
}

impl Default for DeviceContextConfig {
    fn default() -> Self {
        Self {
            device_ordinal: 0,
            require_device: false,
        }
    }
}

impl DeviceContext {
    pub fn new(config: DeviceContextConfig) -> Result<Self> {
        tracing::info!(
            device = config.device_ordinal,
            require_device = config.require_device,
            "initializing device context"
        );

        Self::open(config)
    }

    #[cfg(feature = "cuda")]
    fn open(config: DeviceContextConfig) -> Result<Self> {
        match CudaDevice::new(config.device_ordinal) {
            Ok(device) => Ok(Self {
                device: Some(device),
                device_ordinal: config.device_ordinal,
            }),
            Err(e) if config.require_device => {
                Err(DecodeError::Cuda(format!("device init failed: {e}")))
            }
            Err(e) => {
                tracing::warn!(
                    device = config.device_ordinal,
                    error = %e,
                    "device unavailable, decoding to host memory only"
                );
                Ok(Self::host_only_on(config.device_ordinal))
            }
        }
    }

    #[cfg(not(feature = "cuda"))]
    fn open(config: DeviceContextConfig) -> Result<Self> {
        if config.require_device {
            return Err(DecodeError::DeviceUnavailable(MemorySpace::Device(
                config.device_ordinal,
            )));
        }
        Ok(Self::host_only_on(config.device_ordinal))
    }

    /// A context that can only place tensors in host memory.
    pub fn host_only() -> Self {
        Self::host_only_on(0)
    }

    fn host_only_on(device_ordinal: usize) -> Self {
        Self {
            #[cfg(feature = "cuda")]
            device: None,
            device_ordinal,
        }
    }

    pub fn device_ordinal(&self) -> usize {
        self.device_ordinal
    }

    #[cfg(feature = "cuda")]
    pub fn has_device(&self) -> bool {
        self.device.is_some()
    }

    #[cfg(not(feature = "cuda"))]
    pub fn has_device(&self) -> bool {
        false
    }

    /// The memory space device tensors from this context are placed in.
    pub fn device_space(&self) -> MemorySpace {
        MemorySpace::Device(self.device_ordinal)
    }

    /// Check that tensors can be allocated in `space` through this context.
    pub fn check_space(&self, space: MemorySpace) -> Result<()> {
        match space {
            MemorySpace::Host => Ok(()),
            MemorySpace::Device(ordinal) if ordinal != self.device_ordinal => {
                Err(DecodeError::InvalidInput(format!(
                    "tensor requested on device {ordinal} but the pool is bound to device {}",
                    self.device_ordinal
                )))
            }
            MemorySpace::Device(_) if !self.has_device() => {
                Err(DecodeError::DeviceUnavailable(space))
            }
            MemorySpace::Device(_) => Ok(()),
        }
    }

    /// Make this context's device current on the calling thread.
    pub fn bind_to_thread(&self) -> Result<()> {
        #[cfg(feature = "cuda")]
        if let Some(device) = &self.device {
            device
                .bind_to_thread()
                .map_err(|e| DecodeError::Cuda(format!("bind to thread failed: {e}")))?;
        }
        Ok(())
    }

    /// Wait for all outstanding device work.
    pub fn synchronize(&self) -> Result<()> {
        #[cfg(feature = "cuda")]
        if let Some(device) = &self.device {
            device
                .synchronize()
                .map_err(|e| DecodeError::Cuda(format!("device sync failed: {e}")))?;
        }
        Ok(())
    }

    #[cfg(feature = "cuda")]
    pub(crate) fn require_device(&self, space: MemorySpace) -> Result<&Arc<CudaDevice>> {
        self.device
            .as_ref()
            .ok_or(DecodeError::DeviceUnavailable(space))
    }
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("device_ordinal", &self.device_ordinal)
            .field("has_device", &self.has_device())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_only_rejects_device_space() {
        let ctx = DeviceContext::host_only();
        assert!(ctx.check_space(MemorySpace::Host).is_ok());
        assert!(ctx.check_space(MemorySpace::Device(1)).is_err());
        if !ctx.has_device() {
            assert!(matches!(
                ctx.check_space(MemorySpace::Device(0)),
                Err(DecodeError::DeviceUnavailable(_))
            ));
        }
    }

    #[test]
    fn test_optional_device_degrades() {
        let ctx = DeviceContext::new(DeviceContextConfig {
            device_ordinal: 3,
            require_device: false,
        })
        .expect("non-required device never fails");
        assert_eq!(ctx.device_ordinal(), 3);
        assert!(ctx.bind_to_thread().is_ok());
    }
}
