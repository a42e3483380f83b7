//! Thin RAII layer over the codec library. Wrappers release their handle on
//! every exit path and expose the raw pointer for the call sites; all
//! library calls return the raw error code untouched so callers decide how
//! to recover.

use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::ptr;

use ffmpeg_sys_next::{
    av_channel_layout_copy, av_channel_layout_default, av_channel_layout_describe,
    av_channel_layout_from_string, av_channel_layout_uninit, av_dict_free, av_dict_set,
    av_dict_set_int, av_frame_alloc, av_frame_clone, av_frame_free, av_freep, av_malloc,
    av_packet_alloc, av_packet_clone, av_packet_free, av_strerror, avcodec_free_context,
    avcodec_parameters_alloc, avcodec_parameters_copy, avcodec_parameters_free,
    avcodec_parameters_from_context,
    avfilter_graph_alloc, avfilter_graph_free, avformat_close_input, avformat_free_context,
    avio_closep, avio_context_free, AVChannelLayout, AVCodecContext, AVCodecParameters,
    AVDictionary, AVFilterGraph, AVFormatContext, AVFrame, AVIOContext, AVPacket, AVFMT_NOFILE,
};

/// Human readable text for a codec library error code.
pub fn err_str(code: i32) -> String {
    const BUF_SIZE: usize = 512;
    let mut buf = [0 as c_char; BUF_SIZE];
    unsafe {
        av_strerror(code, buf.as_mut_ptr(), BUF_SIZE);
        CStr::from_ptr(buf.as_ptr()).to_string_lossy().into_owned()
    }
}

/// NUL-terminated copy of `s` for library calls. Interior NULs collapse to
/// an empty string rather than panicking.
pub fn cstring(s: &str) -> CString {
    CString::new(s).unwrap_or_default()
}

// packet
//-----------------------------------------------------------------------------

pub struct Packet {
    ptr: *mut AVPacket,
}

unsafe impl Send for Packet {}

impl Packet {
    pub fn new() -> Self {
        Self {
            ptr: unsafe { av_packet_alloc() },
        }
    }

    /// New reference to `src` sharing the underlying buffers.
    pub fn clone_from_raw(src: *const AVPacket) -> Option<Self> {
        let ptr = unsafe { av_packet_clone(src) };
        if ptr.is_null() {
            None
        } else {
            Some(Self { ptr })
        }
    }

    pub fn as_ptr(&self) -> *const AVPacket {
        self.ptr
    }

    pub fn as_mut_ptr(&mut self) -> *mut AVPacket {
        self.ptr
    }

    pub fn stream_index(&self) -> i32 {
        unsafe { (*self.ptr).stream_index }
    }

    pub fn pts(&self) -> i64 {
        unsafe { (*self.ptr).pts }
    }

    pub fn dts(&self) -> i64 {
        unsafe { (*self.ptr).dts }
    }
}

impl Default for Packet {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        unsafe { av_packet_free(&mut self.ptr) }
    }
}

// frame
//-----------------------------------------------------------------------------

pub struct Frame {
    ptr: *mut AVFrame,
}

unsafe impl Send for Frame {}

impl Frame {
    pub fn new() -> Self {
        Self {
            ptr: unsafe { av_frame_alloc() },
        }
    }

    /// New reference to `src` sharing the underlying buffers.
    pub fn clone_from_raw(src: *const AVFrame) -> Option<Self> {
        let ptr = unsafe { av_frame_clone(src) };
        if ptr.is_null() {
            None
        } else {
            Some(Self { ptr })
        }
    }

    pub fn as_ptr(&self) -> *const AVFrame {
        self.ptr
    }

    pub fn as_mut_ptr(&mut self) -> *mut AVFrame {
        self.ptr
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        unsafe { av_frame_free(&mut self.ptr) }
    }
}

// dictionary
//-----------------------------------------------------------------------------

pub struct Dictionary {
    ptr: *mut AVDictionary,
}

impl Dictionary {
    pub fn new() -> Self {
        Self {
            ptr: ptr::null_mut(),
        }
    }

    pub fn set(&mut self, key: &str, value: &str) -> i32 {
        let key = cstring(key);
        let value = cstring(value);
        unsafe { av_dict_set(&mut self.ptr, key.as_ptr(), value.as_ptr(), 0) }
    }

    pub fn set_int(&mut self, key: &str, value: i64) -> i32 {
        let key = cstring(key);
        unsafe { av_dict_set_int(&mut self.ptr, key.as_ptr(), value, 0) }
    }

    /// Pointer-to-pointer handle expected by open-style library calls; the
    /// library may replace or consume the dictionary through it.
    pub fn as_mut_ref(&mut self) -> *mut *mut AVDictionary {
        &mut self.ptr
    }
}

impl Default for Dictionary {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Dictionary {
    fn drop(&mut self) {
        unsafe { av_dict_free(&mut self.ptr) }
    }
}

// format contexts
//-----------------------------------------------------------------------------

/// Opened demuxer context. Constructed only after a successful open; a
/// failed open is cleaned up by the library itself.
pub struct InputContext {
    ptr: *mut AVFormatContext,
}

unsafe impl Send for InputContext {}

impl InputContext {
    /// Takes ownership of a context returned by a successful input open.
    pub unsafe fn from_raw(ptr: *mut AVFormatContext) -> Self {
        Self { ptr }
    }

    pub fn as_ptr(&self) -> *mut AVFormatContext {
        self.ptr
    }
}

impl Drop for InputContext {
    fn drop(&mut self) {
        unsafe {
            (*self.ptr).interrupt_callback.callback = None;
            (*self.ptr).interrupt_callback.opaque = ptr::null_mut();
            avformat_close_input(&mut self.ptr);
        }
    }
}

/// How the muxer context's byte output is backed, which decides who closes
/// it on drop.
pub enum OutputIo {
    /// `avio_open`-style file handle owned by the context.
    File,
    /// Caller-owned custom IO; detached before the context is freed.
    Custom,
    /// Nothing attached yet.
    None,
}

pub struct OutputContext {
    ptr: *mut AVFormatContext,
    io: OutputIo,
}

unsafe impl Send for OutputContext {}

impl OutputContext {
    /// Takes ownership of a freshly allocated muxer context.
    pub unsafe fn from_raw(ptr: *mut AVFormatContext) -> Self {
        Self {
            ptr,
            io: OutputIo::None,
        }
    }

    pub fn set_io(&mut self, io: OutputIo) {
        self.io = io;
    }

    pub fn as_ptr(&self) -> *mut AVFormatContext {
        self.ptr
    }
}

impl Drop for OutputContext {
    fn drop(&mut self) {
        unsafe {
            match self.io {
                OutputIo::File => {
                    if !(*self.ptr).pb.is_null()
                        && !(*self.ptr).oformat.is_null()
                        && (*(*self.ptr).oformat).flags & AVFMT_NOFILE == 0
                    {
                        avio_closep(&mut (*self.ptr).pb);
                    }
                }
                OutputIo::Custom | OutputIo::None => {
                    (*self.ptr).pb = ptr::null_mut();
                }
            }
            avformat_free_context(self.ptr);
        }
    }
}

// codec context
//-----------------------------------------------------------------------------

pub struct CodecContext {
    ptr: *mut AVCodecContext,
}

unsafe impl Send for CodecContext {}

impl CodecContext {
    /// Takes ownership of an allocated codec context.
    pub unsafe fn from_raw(ptr: *mut AVCodecContext) -> Self {
        Self { ptr }
    }

    pub fn as_ptr(&self) -> *mut AVCodecContext {
        self.ptr
    }
}

impl Drop for CodecContext {
    fn drop(&mut self) {
        unsafe { avcodec_free_context(&mut self.ptr) }
    }
}

// codec parameters snapshot
//-----------------------------------------------------------------------------

/// Owned copy of a stream's codec parameters, safe to read from writer
/// threads after the demuxer has moved on.
pub struct CodecParameters {
    ptr: *mut AVCodecParameters,
}

unsafe impl Send for CodecParameters {}
unsafe impl Sync for CodecParameters {}

impl CodecParameters {
    pub fn copy_from(src: *const AVCodecParameters) -> Option<Self> {
        unsafe {
            let ptr = avcodec_parameters_alloc();
            if ptr.is_null() {
                return None;
            }
            if avcodec_parameters_copy(ptr, src) < 0 {
                let mut ptr = ptr;
                avcodec_parameters_free(&mut ptr);
                return None;
            }
            Some(Self { ptr })
        }
    }

    /// Snapshot of an open codec context's parameters.
    pub fn from_context(ctx: *const AVCodecContext) -> Option<Self> {
        unsafe {
            let ptr = avcodec_parameters_alloc();
            if ptr.is_null() {
                return None;
            }
            if avcodec_parameters_from_context(ptr, ctx) < 0 {
                let mut ptr = ptr;
                avcodec_parameters_free(&mut ptr);
                return None;
            }
            Some(Self { ptr })
        }
    }

    pub fn as_ptr(&self) -> *const AVCodecParameters {
        self.ptr
    }
}

impl Drop for CodecParameters {
    fn drop(&mut self) {
        unsafe { avcodec_parameters_free(&mut self.ptr) }
    }
}

// filter graph
//-----------------------------------------------------------------------------

pub struct FilterGraph {
    ptr: *mut AVFilterGraph,
}

unsafe impl Send for FilterGraph {}

impl FilterGraph {
    pub fn new() -> Self {
        Self {
            ptr: unsafe { avfilter_graph_alloc() },
        }
    }

    pub fn as_ptr(&self) -> *mut AVFilterGraph {
        self.ptr
    }
}

impl Default for FilterGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FilterGraph {
    fn drop(&mut self) {
        unsafe { avfilter_graph_free(&mut self.ptr) }
    }
}

// channel layout
//-----------------------------------------------------------------------------

/// Owned audio channel layout; custom orders carry an allocated map that is
/// released on drop.
pub struct ChannelLayout {
    inner: AVChannelLayout,
}

unsafe impl Send for ChannelLayout {}
unsafe impl Sync for ChannelLayout {}

impl ChannelLayout {
    pub fn copy_from(src: *const AVChannelLayout) -> Self {
        let mut inner: AVChannelLayout = unsafe { std::mem::zeroed() };
        unsafe { av_channel_layout_copy(&mut inner, src) };
        Self { inner }
    }

    pub fn default_for(channels: i32) -> Self {
        let mut inner: AVChannelLayout = unsafe { std::mem::zeroed() };
        unsafe { av_channel_layout_default(&mut inner, channels) };
        Self { inner }
    }

    pub fn from_string(desc: &str) -> Option<Self> {
        let mut inner: AVChannelLayout = unsafe { std::mem::zeroed() };
        let desc = cstring(desc);
        let ret = unsafe { av_channel_layout_from_string(&mut inner, desc.as_ptr()) };
        if ret == 0 {
            Some(Self { inner })
        } else {
            None
        }
    }

    pub fn describe(&self) -> String {
        let mut buf = [0 as c_char; 64];
        unsafe {
            av_channel_layout_describe(&self.inner, buf.as_mut_ptr(), buf.len());
            CStr::from_ptr(buf.as_ptr()).to_string_lossy().into_owned()
        }
    }

    pub fn as_ptr(&self) -> *const AVChannelLayout {
        &self.inner
    }

    pub fn nb_channels(&self) -> i32 {
        self.inner.nb_channels
    }
}

impl Clone for ChannelLayout {
    fn clone(&self) -> Self {
        Self::copy_from(self.as_ptr())
    }
}

impl Drop for ChannelLayout {
    fn drop(&mut self) {
        unsafe { av_channel_layout_uninit(&mut self.inner) }
    }
}

// custom write IO
//-----------------------------------------------------------------------------

pub type WriteCallback = unsafe extern "C" fn(*mut c_void, *const u8, c_int) -> c_int;

/// Memory-buffer IO context that forwards written bytes to a callback.
pub struct IoWriteContext {
    ptr: *mut AVIOContext,
}

unsafe impl Send for IoWriteContext {}

impl IoWriteContext {
    pub fn new(buffer_size: usize, opaque: *mut c_void, callback: WriteCallback) -> Option<Self> {
        unsafe {
            let buffer = av_malloc(buffer_size) as *mut u8;
            if buffer.is_null() {
                return None;
            }
            let ptr = ffmpeg_sys_next::avio_alloc_context(
                buffer,
                buffer_size as c_int,
                1,
                opaque,
                None,
                Some(callback),
                None,
            );
            if ptr.is_null() {
                av_freep(&buffer as *const _ as *mut c_void);
                return None;
            }
            Some(Self { ptr })
        }
    }

    pub fn as_ptr(&self) -> *mut AVIOContext {
        self.ptr
    }
}

impl Drop for IoWriteContext {
    fn drop(&mut self) {
        unsafe {
            if !(*self.ptr).buffer.is_null() {
                av_freep(&mut (*self.ptr).buffer as *mut _ as *mut c_void);
            }
            avio_context_free(&mut self.ptr);
        }
    }
}
