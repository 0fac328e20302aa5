//! Process-wide cache of hardware-acceleration device contexts.
//!
//! Encoder and decoder share one device context per accelerator; the cache
//! hands out extra `AVBufferRef` references so the underlying device lives
//! exactly as long as its longest holder. The registry is constructed once
//! at startup and injected, not reached through a hidden static.

use std::collections::HashMap;
use std::ffi::CString;
use std::ptr;
use std::sync::Mutex;

use ffmpeg_next::ffi;
use log::{debug, warn};

/// An owned reference to a hardware device context. Cloning takes another
/// `av_buffer_ref`; dropping releases it.
#[derive(Debug)]
pub struct DeviceContext {
    buf: *mut ffi::AVBufferRef,
}

// AVBufferRef reference counting is thread-safe in FFmpeg; the wrapper only
// ever touches the ref count.
unsafe impl Send for DeviceContext {}
unsafe impl Sync for DeviceContext {}

impl DeviceContext {
    /// Takes ownership of an existing reference.
    unsafe fn from_owned(buf: *mut ffi::AVBufferRef) -> Self {
        Self { buf }
    }

    pub fn as_ptr(&self) -> *mut ffi::AVBufferRef {
        self.buf
    }

    /// A fresh reference suitable for handing to a codec context, which
    /// will unref it on free.
    pub fn new_ref(&self) -> *mut ffi::AVBufferRef {
        unsafe { ffi::av_buffer_ref(self.buf) }
    }
}

impl Clone for DeviceContext {
    fn clone(&self) -> Self {
        unsafe { Self::from_owned(ffi::av_buffer_ref(self.buf)) }
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        unsafe {
            let mut buf = self.buf;
            ffi::av_buffer_unref(&mut buf);
        }
    }
}

/// Cache of device contexts keyed by accelerator name (`qsv`, `cuda`,
/// `videotoolbox`, …). Lookups are allocation-free on a hit.
#[derive(Debug, Default)]
pub struct HwContextRegistry {
    contexts: Mutex<HashMap<String, DeviceContext>>,
}

impl HwContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a reference to the device context for `accel`, creating it on
    /// first use. `None` when the accelerator is unknown to this build or
    /// the device cannot be opened.
    pub fn device(&self, accel: &str) -> Option<DeviceContext> {
        let mut cache = self.contexts.lock().ok()?;
        if let Some(existing) = cache.get(accel) {
            return Some(existing.clone());
        }

        let created = create_device(accel)?;
        debug!("created shared hardware device context for {accel}");
        cache.insert(accel.to_string(), created.clone());
        Some(created)
    }

    /// Accelerator names with a live cached context.
    pub fn cached(&self) -> Vec<String> {
        self.contexts
            .lock()
            .map(|cache| cache.keys().cloned().collect())
            .unwrap_or_default()
    }
}

fn create_device(accel: &str) -> Option<DeviceContext> {
    let name = CString::new(accel).ok()?;
    unsafe {
        let device_type = ffi::av_hwdevice_find_type_by_name(name.as_ptr());
        if device_type == ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_NONE {
            debug!("hardware device type not found: {accel}");
            return None;
        }
        let mut buf: *mut ffi::AVBufferRef = ptr::null_mut();
        let mut ret =
            ffi::av_hwdevice_ctx_create(&mut buf, device_type, ptr::null(), ptr::null_mut(), 0);
        if ret < 0 && accel == "qsv" {
            // QSV sometimes needs an explicit child device selector.
            let auto = CString::new("auto").ok()?;
            ret = ffi::av_hwdevice_ctx_create(
                &mut buf,
                device_type,
                auto.as_ptr(),
                ptr::null_mut(),
                0,
            );
        }
        if ret < 0 {
            warn!("failed to create hardware device context {accel}: error {ret}");
            return None;
        }
        Some(DeviceContext::from_owned(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_accelerator_yields_none() {
        let registry = HwContextRegistry::new();
        assert!(registry.device("definitely-not-an-accel").is_none());
        assert!(registry.cached().is_empty());
    }
}
