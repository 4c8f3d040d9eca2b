//! Surfaceless OpenGL 4.5 context on a DRM render node.

use std::ffi::CStr;
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::Path;
use std::ptr;

use glow::HasContext;
use tracing::{debug, info};
use wgprobe_core::error::{ProbeError, Result};

use crate::sys::{self, EGLConfig, EGLContext, EGLDisplay, EglApi, GbmApi};

/// Default render node, as found on single-GPU Intel machines.
pub const DEFAULT_RENDER_NODE: &str = "/dev/dri/renderD128";

const REQUIRED_EGL_EXTENSIONS: [&str; 2] = ["EGL_KHR_create_context", "EGL_KHR_surfaceless_context"];

pub struct GlContext {
    pub gl: glow::Context,
    pub egl: &'static EglApi,
    gbm: &'static GbmApi,
    gbm_device: *mut std::ffi::c_void,
    display: EGLDisplay,
    context: EGLContext,
    _render_node: File,
}

impl std::fmt::Debug for GlContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlContext")
            .field("display", &self.display)
            .field("context", &self.context)
            .finish()
    }
}

fn egl_failure(egl: &EglApi, call: &'static str) -> ProbeError {
    // SAFETY: eglGetError has no preconditions.
    let code = unsafe { (egl.get_error)() };
    ProbeError::Device(format!("{call} failed: EGL error 0x{code:x}"))
}

/// Partially built context; torn down in reverse on error.
struct Bootstrap {
    egl: &'static EglApi,
    gbm: &'static GbmApi,
    gbm_device: *mut std::ffi::c_void,
    display: EGLDisplay,
    context: EGLContext,
}

impl Bootstrap {
    fn teardown(&mut self) {
        // SAFETY: each handle is released at most once and only if created.
        unsafe {
            if !self.context.is_null() {
                (self.egl.make_current)(self.display, ptr::null_mut(), ptr::null_mut(), ptr::null_mut());
                (self.egl.destroy_context)(self.display, self.context);
                self.context = ptr::null_mut();
            }
            if !self.display.is_null() {
                (self.egl.terminate)(self.display);
                self.display = ptr::null_mut();
            }
            if !self.gbm_device.is_null() {
                (self.gbm.device_destroy)(self.gbm_device);
                self.gbm_device = ptr::null_mut();
            }
        }
    }
}

impl GlContext {
    /// Open `render_node`, create a GBM device on it and make a 4.5 context
    /// current on this thread without any surface.
    pub fn new(render_node: &Path) -> Result<Self> {
        let egl = sys::egl().map_err(ProbeError::Loader)?;
        let gbm = sys::gbm().map_err(ProbeError::Loader)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(render_node)
            .map_err(|e| ProbeError::Device(format!("open {}: {e}", render_node.display())))?;

        let mut boot = Bootstrap {
            egl,
            gbm,
            gbm_device: ptr::null_mut(),
            display: ptr::null_mut(),
            context: ptr::null_mut(),
        };
        match Self::bring_up(&mut boot, &file) {
            Ok(gl) => Ok(Self {
                gl,
                egl,
                gbm,
                gbm_device: boot.gbm_device,
                display: boot.display,
                context: boot.context,
                _render_node: file,
            }),
            Err(err) => {
                boot.teardown();
                Err(err)
            }
        }
    }

    fn bring_up(boot: &mut Bootstrap, file: &File) -> Result<glow::Context> {
        let egl = boot.egl;
        // SAFETY: the fd stays open for the lifetime of the GBM device.
        boot.gbm_device = unsafe { (boot.gbm.create_device)(file.as_raw_fd()) };
        if boot.gbm_device.is_null() {
            return Err(ProbeError::Device("gbm_create_device failed".into()));
        }

        // SAFETY: gbm_device is a valid native display for the GBM platform.
        boot.display = unsafe {
            (egl.get_platform_display)(sys::EGL_PLATFORM_GBM_MESA, boot.gbm_device, ptr::null())
        };
        if boot.display.is_null() {
            return Err(egl_failure(egl, "eglGetPlatformDisplay"));
        }
        // SAFETY: display was just obtained; version outputs are optional.
        if unsafe { (egl.initialize)(boot.display, ptr::null_mut(), ptr::null_mut()) } != sys::EGL_TRUE {
            return Err(egl_failure(egl, "eglInitialize"));
        }

        // SAFETY: display is initialized; EGL owns the returned string.
        let extensions = unsafe {
            let p = (egl.query_string)(boot.display, sys::EGL_EXTENSIONS);
            if p.is_null() {
                String::new()
            } else {
                CStr::from_ptr(p).to_string_lossy().into_owned()
            }
        };
        for required in REQUIRED_EGL_EXTENSIONS {
            if !extensions.split_ascii_whitespace().any(|ext| ext == required) {
                return Err(ProbeError::MissingExtension(required.into()));
            }
        }

        let config_attrs = [sys::EGL_RENDERABLE_TYPE, sys::EGL_OPENGL_BIT, sys::EGL_NONE];
        let mut config: EGLConfig = ptr::null_mut();
        let mut count = 0;
        // SAFETY: attrs is EGL_NONE-terminated; room for one config.
        let chosen = unsafe {
            (egl.choose_config)(boot.display, config_attrs.as_ptr(), &mut config, 1, &mut count)
        };
        if chosen != sys::EGL_TRUE || count < 1 {
            return Err(egl_failure(egl, "eglChooseConfig"));
        }
        // SAFETY: no preconditions.
        if unsafe { (egl.bind_api)(sys::EGL_OPENGL_API) } != sys::EGL_TRUE {
            return Err(egl_failure(egl, "eglBindAPI"));
        }

        let context_attrs = [
            sys::EGL_CONTEXT_MAJOR_VERSION,
            4,
            sys::EGL_CONTEXT_MINOR_VERSION,
            5,
            sys::EGL_NONE,
        ];
        // SAFETY: config came from eglChooseConfig on this display.
        boot.context = unsafe {
            (egl.create_context)(boot.display, config, ptr::null_mut(), context_attrs.as_ptr())
        };
        if boot.context.is_null() {
            return Err(egl_failure(egl, "eglCreateContext"));
        }
        // SAFETY: surfaceless is allowed by EGL_KHR_surfaceless_context.
        let current = unsafe {
            (egl.make_current)(boot.display, ptr::null_mut(), ptr::null_mut(), boot.context)
        };
        if current != sys::EGL_TRUE {
            return Err(egl_failure(egl, "eglMakeCurrent"));
        }

        // SAFETY: the context is current on this thread; EGL resolves names.
        let gl = unsafe {
            glow::Context::from_loader_function_cstr(|name| {
                egl.proc_address(name).unwrap_or(ptr::null())
            })
        };
        // SAFETY: the context is current.
        unsafe {
            info!(
                renderer = %gl.get_parameter_string(glow::RENDERER),
                version = %gl.get_parameter_string(glow::VERSION),
                "GL context current"
            );
        }
        debug!(egl_extensions = %extensions, "EGL display initialized");
        Ok(gl)
    }

    pub fn has_extension(&self, name: &str) -> bool {
        self.gl.supported_extensions().contains(name)
    }
}

impl Drop for GlContext {
    fn drop(&mut self) {
        let mut boot = Bootstrap {
            egl: self.egl,
            gbm: self.gbm,
            gbm_device: self.gbm_device,
            display: self.display,
            context: self.context,
        };
        boot.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore = "requires a Mesa driver and a DRM render node"]
    fn surfaceless_context_comes_up() {
        let ctx = GlContext::new(Path::new(DEFAULT_RENDER_NODE)).expect("GL context");
        // SAFETY: the context is current on this thread.
        let version = unsafe { ctx.gl.get_parameter_string(glow::VERSION) };
        assert!(!version.is_empty());
    }
}
