use std::collections::HashMap;
use std::mem::transmute;
use std::ptr;

use ffmpeg_sys_next::{
    av_frame_copy_props, av_frame_get_buffer, sws_freeContext, sws_getContext, sws_scale,
    AVPixelFormat, SwsContext, AVERROR_INVALIDDATA, SWS_FAST_BILINEAR,
};
use log::info;

use crate::error::{Error, Result};
use crate::ffi::Frame;

/// Aspect-preserving width for a target height, forced even.
pub fn calc_width(src_w: i32, src_h: i32, dest_h: i32) -> i32 {
    let mut dest_w = ((src_w as f64 / src_h as f64) * dest_h as f64) as i32;
    if dest_w % 2 == 1 {
        dest_w -= 1;
    }
    dest_w
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct ScaleKey {
    src_w: i32,
    src_h: i32,
    src_pixel_fmt: i32,
    dest_w: i32,
    dest_h: i32,
    dest_pixel_fmt: i32,
}

struct SwsHandle(*mut SwsContext);

unsafe impl Send for SwsHandle {}

impl Drop for SwsHandle {
    fn drop(&mut self) {
        unsafe { sws_freeContext(self.0) }
    }
}

/// Video rescaler with one cached context per (input dims/format, output
/// dims/format) pair.
pub struct Scaler {
    contexts: HashMap<ScaleKey, SwsHandle>,
    source_name: String,
}

impl Scaler {
    pub fn new(source_name: &str) -> Self {
        Self {
            contexts: HashMap::new(),
            source_name: source_name.to_string(),
        }
    }

    fn initialize(&mut self, key: ScaleKey) -> Result<()> {
        if self.contexts.contains_key(&key) {
            return Ok(());
        }
        unsafe {
            let ctx = sws_getContext(
                key.src_w,
                key.src_h,
                transmute::<i32, AVPixelFormat>(key.src_pixel_fmt),
                key.dest_w,
                key.dest_h,
                transmute::<i32, AVPixelFormat>(key.dest_pixel_fmt),
                SWS_FAST_BILINEAR,
                ptr::null_mut(),
                ptr::null_mut(),
                ptr::null(),
            );
            if ctx.is_null() {
                return Err(Error::Codec(AVERROR_INVALIDDATA));
            }
            info!(
                "scaler config: src: {} {}x{} => {}x{}",
                self.source_name, key.src_w, key.src_h, key.dest_w, key.dest_h
            );
            self.contexts.insert(key, SwsHandle(ctx));
        }
        Ok(())
    }

    /// Scales `frm` to `height`, deriving an aspect-preserving width when
    /// `width` is -1. Webcam frames are normalized to YUV420P since many
    /// drivers deliver formats encoders reject.
    pub fn perform_scale(
        &mut self,
        frm: &Frame,
        width: i32,
        mut height: i32,
        is_webcam: bool,
    ) -> Result<Frame> {
        unsafe {
            let src = frm.as_ptr();
            if height % 2 == 1 {
                height -= 1;
            }
            let dest_w = if width == -1 {
                calc_width((*src).width, (*src).height, height)
            } else {
                width
            };
            let dest_format = if is_webcam {
                AVPixelFormat::AV_PIX_FMT_YUV420P as i32
            } else {
                (*src).format
            };
            let key = ScaleKey {
                src_w: (*src).width,
                src_h: (*src).height,
                src_pixel_fmt: (*src).format,
                dest_w,
                dest_h: height,
                dest_pixel_fmt: dest_format,
            };
            self.initialize(key)?;

            let mut result = Frame::new();
            let r = result.as_mut_ptr();
            (*r).width = dest_w;
            (*r).height = key.dest_h;
            (*r).format = key.dest_pixel_fmt;
            let ret = av_frame_get_buffer(r, 0);
            if ret < 0 {
                return Err(Error::Codec(AVERROR_INVALIDDATA));
            }

            av_frame_copy_props(r, src);
            (*r).width = dest_w;
            (*r).height = key.dest_h;

            let ctx = self.contexts.get(&key).unwrap().0;
            let ret = sws_scale(
                ctx,
                (*src).data.as_ptr() as *const *const u8,
                (*src).linesize.as_ptr(),
                0,
                key.src_h,
                (*r).data.as_ptr() as *const *mut u8,
                (*r).linesize.as_ptr(),
            );
            if ret == 0 {
                return Err(Error::Codec(AVERROR_INVALIDDATA));
            }

            (*r).pts = (*src).pts;
            (*r).pkt_dts = (*src).pkt_dts;
            (*r).flags = (*src).flags;
            (*r).duration = (*src).duration;
            (*r).time_base = (*src).time_base;
            (*r).pict_type = (*src).pict_type;
            (*r).format = key.dest_pixel_fmt;

            Ok(result)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn width_preserves_aspect_and_parity() {
        assert_eq!(calc_width(1920, 1080, 720), 1280);
        assert_eq!(calc_width(1280, 720, 480), 852);
        // odd results round down to even
        assert_eq!(calc_width(854, 480, 360) % 2, 0);
    }
}
