//! Runtime-loaded EGL, GBM and `GL_INTEL_performance_query` entry points.

use std::ffi::{CStr, CString, c_char, c_void};
use std::sync::OnceLock;

pub type EGLDisplay = *mut c_void;
pub type EGLConfig = *mut c_void;
pub type EGLContext = *mut c_void;
pub type EGLSurface = *mut c_void;
pub type EGLBoolean = u32;
pub type EGLint = i32;
pub type EGLenum = u32;
pub type EGLAttrib = isize;

pub const EGL_TRUE: EGLBoolean = 1;
pub const EGL_NONE: EGLint = 0x3038;
pub const EGL_EXTENSIONS: EGLint = 0x3055;
pub const EGL_RENDERABLE_TYPE: EGLint = 0x3040;
pub const EGL_OPENGL_BIT: EGLint = 0x0008;
pub const EGL_OPENGL_API: EGLenum = 0x30A2;
pub const EGL_CONTEXT_MAJOR_VERSION: EGLint = 0x3098;
pub const EGL_CONTEXT_MINOR_VERSION: EGLint = 0x30FB;
pub const EGL_PLATFORM_GBM_MESA: EGLenum = 0x31D7;

pub const GL_PERFQUERY_WAIT_INTEL: u32 = 0x83FB;
pub const GL_PERFQUERY_COUNTER_EVENT_INTEL: u32 = 0x94F0;
pub const GL_PERFQUERY_COUNTER_DURATION_NORM_INTEL: u32 = 0x94F1;
pub const GL_PERFQUERY_COUNTER_DURATION_RAW_INTEL: u32 = 0x94F2;
pub const GL_PERFQUERY_COUNTER_THROUGHPUT_INTEL: u32 = 0x94F3;
pub const GL_PERFQUERY_COUNTER_RAW_INTEL: u32 = 0x94F4;
pub const GL_PERFQUERY_COUNTER_TIMESTAMP_INTEL: u32 = 0x94F5;
pub const GL_PERFQUERY_COUNTER_DATA_UINT32_INTEL: u32 = 0x94F8;
pub const GL_PERFQUERY_COUNTER_DATA_UINT64_INTEL: u32 = 0x94F9;
pub const GL_PERFQUERY_COUNTER_DATA_FLOAT_INTEL: u32 = 0x94FA;
pub const GL_PERFQUERY_COUNTER_DATA_DOUBLE_INTEL: u32 = 0x94FB;
pub const GL_PERFQUERY_COUNTER_DATA_BOOL32_INTEL: u32 = 0x94FC;

unsafe extern "C" {
    fn dlopen(filename: *const c_char, flags: i32) -> *mut c_void;
    fn dlerror() -> *const c_char;
    fn dlsym(handle: *mut c_void, symbol: *const c_char) -> *mut c_void;
}

const RTLD_NOW: i32 = 2;

fn dl_error(fallback: &str) -> String {
    // SAFETY: dlerror returns a thread-local string or null.
    unsafe {
        let p = dlerror();
        if p.is_null() {
            fallback.to_string()
        } else {
            CStr::from_ptr(p).to_string_lossy().to_string()
        }
    }
}

fn open_library(candidates: &[&str]) -> Result<*mut c_void, String> {
    let mut last_err = "unknown dlopen error".to_string();
    for candidate in candidates {
        let soname = CString::new(*candidate).map_err(|_| format!("invalid soname: {candidate}"))?;
        // SAFETY: static soname and valid flags.
        let handle = unsafe { dlopen(soname.as_ptr(), RTLD_NOW) };
        if !handle.is_null() {
            return Ok(handle);
        }
        last_err = dl_error("unknown dlopen error");
    }
    Err(format!("dlopen({}) failed: {last_err}", candidates.join("|")))
}

fn load_symbol<T>(handle: *mut c_void, name: &'static str) -> Result<T, String> {
    let cname = CString::new(name).map_err(|_| format!("invalid symbol name: {name}"))?;
    // SAFETY: handle is a dlopen handle and cname is NUL-terminated.
    let ptr = unsafe { dlsym(handle, cname.as_ptr()) };
    if ptr.is_null() {
        Err(format!("dlsym({name}) failed: {}", dl_error("unknown dlsym error")))
    } else {
        // SAFETY: ptr points to a function symbol with signature T.
        Ok(unsafe { std::mem::transmute_copy(&ptr) })
    }
}

// ── EGL ──────────────────────────────────────────────────────────────

pub struct EglApi {
    pub get_platform_display:
        unsafe extern "C" fn(EGLenum, *mut c_void, *const EGLAttrib) -> EGLDisplay,
    pub initialize: unsafe extern "C" fn(EGLDisplay, *mut EGLint, *mut EGLint) -> EGLBoolean,
    pub query_string: unsafe extern "C" fn(EGLDisplay, EGLint) -> *const c_char,
    pub choose_config: unsafe extern "C" fn(
        EGLDisplay,
        *const EGLint,
        *mut EGLConfig,
        EGLint,
        *mut EGLint,
    ) -> EGLBoolean,
    pub bind_api: unsafe extern "C" fn(EGLenum) -> EGLBoolean,
    pub create_context:
        unsafe extern "C" fn(EGLDisplay, EGLConfig, EGLContext, *const EGLint) -> EGLContext,
    pub make_current:
        unsafe extern "C" fn(EGLDisplay, EGLSurface, EGLSurface, EGLContext) -> EGLBoolean,
    pub destroy_context: unsafe extern "C" fn(EGLDisplay, EGLContext) -> EGLBoolean,
    pub terminate: unsafe extern "C" fn(EGLDisplay) -> EGLBoolean,
    pub get_proc_address: unsafe extern "C" fn(*const c_char) -> *const c_void,
    pub get_error: unsafe extern "C" fn() -> EGLint,
}

static EGL: OnceLock<Result<EglApi, String>> = OnceLock::new();

fn init_egl() -> Result<EglApi, String> {
    let handle = open_library(&["libEGL.so.1", "libEGL.so"])?;
    Ok(EglApi {
        get_platform_display: load_symbol(handle, "eglGetPlatformDisplay")?,
        initialize: load_symbol(handle, "eglInitialize")?,
        query_string: load_symbol(handle, "eglQueryString")?,
        choose_config: load_symbol(handle, "eglChooseConfig")?,
        bind_api: load_symbol(handle, "eglBindAPI")?,
        create_context: load_symbol(handle, "eglCreateContext")?,
        make_current: load_symbol(handle, "eglMakeCurrent")?,
        destroy_context: load_symbol(handle, "eglDestroyContext")?,
        terminate: load_symbol(handle, "eglTerminate")?,
        get_proc_address: load_symbol(handle, "eglGetProcAddress")?,
        get_error: load_symbol(handle, "eglGetError")?,
    })
}

pub fn egl() -> Result<&'static EglApi, String> {
    EGL.get_or_init(init_egl).as_ref().map_err(Clone::clone)
}

impl EglApi {
    /// Resolve a GL entry point for the current context. `None` when the
    /// driver does not export it.
    pub fn proc_address(&self, name: &CStr) -> Option<*const c_void> {
        // SAFETY: name is NUL-terminated; EGL returns null for unknown names.
        let ptr = unsafe { (self.get_proc_address)(name.as_ptr()) };
        (!ptr.is_null()).then_some(ptr)
    }
}

// ── GBM ──────────────────────────────────────────────────────────────

pub struct GbmApi {
    pub create_device: unsafe extern "C" fn(i32) -> *mut c_void,
    pub device_destroy: unsafe extern "C" fn(*mut c_void),
}

static GBM: OnceLock<Result<GbmApi, String>> = OnceLock::new();

fn init_gbm() -> Result<GbmApi, String> {
    let handle = open_library(&["libgbm.so.1", "libgbm.so"])?;
    Ok(GbmApi {
        create_device: load_symbol(handle, "gbm_create_device")?,
        device_destroy: load_symbol(handle, "gbm_device_destroy")?,
    })
}

pub fn gbm() -> Result<&'static GbmApi, String> {
    GBM.get_or_init(init_gbm).as_ref().map_err(Clone::clone)
}

// ── GL_INTEL_performance_query ───────────────────────────────────────

/// Per-context INTEL entry points.
#[derive(Clone, Copy)]
pub struct IntelPerfQuery {
    pub get_query_id_by_name: unsafe extern "C" fn(*mut c_char, *mut u32),
    pub get_query_info: unsafe extern "C" fn(
        u32,
        u32,
        *mut c_char,
        *mut u32,
        *mut u32,
        *mut u32,
        *mut u32,
    ),
    pub get_counter_info: unsafe extern "C" fn(
        u32,
        u32,
        u32,
        *mut c_char,
        u32,
        *mut c_char,
        *mut u32,
        *mut u32,
        *mut u32,
        *mut u32,
        *mut u64,
    ),
    pub create_query: unsafe extern "C" fn(u32, *mut u32),
    pub begin_query: unsafe extern "C" fn(u32),
    pub end_query: unsafe extern "C" fn(u32),
    pub get_query_data: unsafe extern "C" fn(u32, u32, i32, *mut c_void, *mut u32),
    pub delete_query: unsafe extern "C" fn(u32),
}

fn gl_symbol<T>(egl: &EglApi, name: &'static CStr) -> Result<T, String> {
    let ptr = egl
        .proc_address(name)
        .ok_or_else(|| format!("eglGetProcAddress({}) returned null", name.to_string_lossy()))?;
    // SAFETY: ptr is the driver's entry point with signature T.
    Ok(unsafe { std::mem::transmute_copy(&ptr) })
}

impl IntelPerfQuery {
    pub fn load(egl: &EglApi) -> Result<Self, String> {
        Ok(Self {
            get_query_id_by_name: gl_symbol(egl, c"glGetPerfQueryIdByNameINTEL")?,
            get_query_info: gl_symbol(egl, c"glGetPerfQueryInfoINTEL")?,
            get_counter_info: gl_symbol(egl, c"glGetPerfCounterInfoINTEL")?,
            create_query: gl_symbol(egl, c"glCreatePerfQueryINTEL")?,
            begin_query: gl_symbol(egl, c"glBeginPerfQueryINTEL")?,
            end_query: gl_symbol(egl, c"glEndPerfQueryINTEL")?,
            get_query_data: gl_symbol(egl, c"glGetPerfQueryDataINTEL")?,
            delete_query: gl_symbol(egl, c"glDeletePerfQueryINTEL")?,
        })
    }
}

/// `glDispatchComputeGroupSizeARB`: group counts then group size.
pub type DispatchGroupSizeFn = unsafe extern "C" fn(u32, u32, u32, u32, u32, u32);

pub fn load_dispatch_group_size(egl: &EglApi) -> Result<DispatchGroupSizeFn, String> {
    gl_symbol(egl, c"glDispatchComputeGroupSizeARB")
}
