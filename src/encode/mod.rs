use std::collections::HashMap;
use std::ffi::c_void;
use std::ptr;

use ffmpeg_sys_next::{
    av_get_sample_fmt, av_inv_q, av_opt_set_int, avcodec_alloc_context3,
    avcodec_find_encoder_by_name, avcodec_open2, avcodec_receive_packet, avcodec_send_frame,
    AVCodec, AVCodecID, AVFormatContext, AVPixelFormat, AVRational, AVSampleFormat, AVERROR,
    AVERROR_EOF, AVERROR_ENCODER_NOT_FOUND, AVERROR_INVALIDDATA, AVFMT_GLOBALHEADER,
    AV_CODEC_FLAG_GLOBAL_HEADER, AV_NOPTS_VALUE, AV_OPT_SEARCH_CHILDREN, AV_TIME_BASE,
};
use libc::EAGAIN;
use log::error;
use parking_lot::Mutex;

use crate::decode::{AudioDecodeParams, VideoDecodeParams};
use crate::encoding::{Codec, Encoding};
use crate::error::{Error, Result};
use crate::ffi::{cstring, ChannelLayout, CodecContext, CodecParameters, Frame, Packet};
use crate::resample::AudioSide;
use crate::scale::calc_width;
use crate::utils::ElapsedTimer;

/// Output height giving a reasonable picture for a bandwidth budget (kbit/s).
pub fn height_for_bitrate(bitrate: u64) -> i32 {
    if bitrate >= 16000 {
        2160
    } else if bitrate >= 4000 {
        1080
    } else if bitrate >= 2000 {
        720
    } else if bitrate >= 1000 {
        480
    } else if bitrate >= 500 {
        360
    } else if bitrate >= 250 {
        240
    } else if bitrate >= 120 {
        144
    } else {
        90
    }
}

/// Fills in output resolution from the configured height (or the bandwidth
/// ladder) clamped to the input size, both dimensions forced even.
pub fn init_resolution(enc: &mut Encoding, input_width: i32, input_height: i32) {
    let input_width = if input_width > 0 { input_width } else { 15360 };
    let input_height = if input_height > 0 { input_height } else { 8640 };

    let mut out_height = if enc.height > 0 {
        enc.height
    } else {
        height_for_bitrate(enc.max_bandwidth)
    }
    .min(input_height);
    if out_height % 2 == 1 {
        out_height -= 1;
    }
    enc.width = calc_width(input_width, input_height, out_height);
    enc.height = out_height;
}

fn find_encoder_by_names(names: &[&str]) -> *const AVCodec {
    for name in names {
        let name = cstring(name);
        let enc = unsafe { avcodec_find_encoder_by_name(name.as_ptr()) };
        if !enc.is_null() {
            return enc;
        }
    }
    ptr::null()
}

/// Encoder implementation for a codec, hardware-flavored names first on
/// platforms that expose them, then software fallbacks in fixed order.
pub fn find_encoder(codec: Codec) -> *const AVCodec {
    match codec {
        Codec::H264 => {
            #[cfg(target_os = "windows")]
            {
                find_encoder_by_names(&["h264_mf", "libx264"])
            }
            #[cfg(not(target_os = "windows"))]
            {
                find_encoder_by_names(&["libx264"])
            }
        }
        Codec::Hevc => find_encoder_by_names(&["libx265"]),
        Codec::Av1 => find_encoder_by_names(&["libsvtav1", "librav1e", "libaom-av1"]),
        Codec::Vp9 => find_encoder_by_names(&["libvpx-vp9"]),
        Codec::Ac3 => find_encoder_by_names(&["ac3", "ac3_fixed"]),
        Codec::Mp2 => find_encoder_by_names(&["mp2", "mp2fixed", "libtwolame"]),
        Codec::Mp3 => find_encoder_by_names(&["libshine", "libmp3lame"]),
        Codec::Aac => find_encoder_by_names(&["aac"]),
        Codec::Unknown => ptr::null(),
    }
}

/// Codec id the muxer sees for an encoding, if an encoder exists at all.
pub fn encoder_codec_id(codec: Codec) -> Option<AVCodecID> {
    let enc = find_encoder(codec);
    if enc.is_null() {
        None
    } else {
        Some(unsafe { (*enc).id })
    }
}

unsafe fn check_sample_fmt(codec: *const AVCodec, sample_fmt: AVSampleFormat) -> bool {
    let mut p = (*codec).sample_fmts;
    if p.is_null() {
        return false;
    }
    while *p != AVSampleFormat::AV_SAMPLE_FMT_NONE {
        if *p == sample_fmt {
            return true;
        }
        p = p.add(1);
    }
    false
}

/// Preferred sample rate when supported, otherwise the supported rate
/// closest to 44100.
unsafe fn select_sample_rate(codec: *const AVCodec, preferred: i32) -> i32 {
    let preferred = if preferred > 0 { preferred } else { 44100 };
    if (*codec).supported_samplerates.is_null() {
        return 44100;
    }
    let mut best = 0;
    let mut p = (*codec).supported_samplerates;
    while *p != 0 {
        if *p == preferred {
            return preferred;
        }
        if *p > preferred && *p == 44100 {
            return *p;
        }
        if best == 0 || (44100 - *p).abs() < (44100 - best).abs() {
            best = *p;
        }
        p = p.add(1);
    }
    best
}

/// Preferred layout when supported, otherwise the supported layout with the
/// highest channel count (stereo when the encoder lists nothing).
unsafe fn select_channel_layout(
    codec: *const AVCodec,
    preferred: &ChannelLayout,
) -> ChannelLayout {
    if (*codec).ch_layouts.is_null() {
        return ChannelLayout::default_for(2);
    }
    let mut best: *const ffmpeg_sys_next::AVChannelLayout = ptr::null();
    let mut best_channels = 0;
    let mut p = (*codec).ch_layouts;
    while (*p).nb_channels != 0 {
        if (*p).order == (*preferred.as_ptr()).order
            && (*p).nb_channels == (*preferred.as_ptr()).nb_channels
        {
            return ChannelLayout::copy_from(p);
        }
        if (*p).nb_channels > best_channels {
            best = p;
            best_channels = (*p).nb_channels;
        }
        p = p.add(1);
    }
    if best.is_null() {
        return ChannelLayout::default_for(2);
    }
    ChannelLayout::copy_from(best)
}

/// Snapshot of an encoder context for building output streams.
pub struct EncoderStreamParams {
    pub params: CodecParameters,
    pub time_base: AVRational,
}

struct EncoderEntry {
    ctx: CodecContext,
    is_audio: bool,
    /// whether decoder-derived settings were available at open time;
    /// without them encoded packets inherit the frame timing
    had_decoder: bool,
    used: ElapsedTimer,
}

/// Decoder-derived inputs for opening an encoder.
pub struct EncoderDeps {
    pub video: Option<VideoDecodeParams>,
    pub audio: Option<AudioDecodeParams>,
    pub is_webcam: bool,
}

/// Lazy encoder cache keyed by the full `Encoding` value. Guarded by its
/// own lock: viewer setup and packet dispatch may race on initialization.
pub struct EncoderPool {
    inner: Mutex<HashMap<Encoding, EncoderEntry>>,
    source_name: String,
}

impl EncoderPool {
    pub fn new(source_name: &str) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            source_name: source_name.to_string(),
        }
    }

    pub fn reset(&self) {
        self.inner.lock().clear();
    }

    /// Opens an encoder for `config` against the muxer `octx`. Idempotent
    /// per key.
    pub fn initialize(
        &self,
        config: &Encoding,
        octx: *mut AVFormatContext,
        deps: &EncoderDeps,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.contains_key(config) {
            return Ok(());
        }
        let encoder = find_encoder(config.codec);
        if encoder.is_null() {
            error!("encoder not found: src: {}", self.source_name);
            return Err(Error::Codec(AVERROR_INVALIDDATA));
        }
        unsafe {
            let raw = avcodec_alloc_context3(encoder);
            if raw.is_null() {
                error!(
                    "failed to allocate encoder context: src: {}",
                    self.source_name
                );
                return Err(Error::Codec(AVERROR(libc::ENOMEM)));
            }
            let ctx = CodecContext::from_raw(raw);

            let is_audio = config.is_audio();
            let had_decoder = if is_audio {
                self.set_audio_settings(config, ctx.as_ptr(), encoder, deps)
            } else {
                self.set_video_settings(config, ctx.as_ptr(), deps)
            };

            if !(*octx).oformat.is_null()
                && (*(*octx).oformat).flags & AVFMT_GLOBALHEADER != 0
            {
                (*ctx.as_ptr()).flags |= AV_CODEC_FLAG_GLOBAL_HEADER as i32;
            }

            let ret = avcodec_open2(ctx.as_ptr(), encoder, ptr::null_mut());
            if ret < 0 {
                error!(
                    "failed opening encoder: src: {} err: {}, {}",
                    self.source_name,
                    ret,
                    crate::ffi::err_str(ret)
                );
                return Err(Error::Codec(ret));
            }

            inner.insert(
                config.clone(),
                EncoderEntry {
                    ctx,
                    is_audio,
                    had_decoder,
                    used: ElapsedTimer::new(),
                },
            );
        }
        Ok(())
    }

    unsafe fn set_video_settings(
        &self,
        config: &Encoding,
        ctx: *mut ffmpeg_sys_next::AVCodecContext,
        deps: &EncoderDeps,
    ) -> bool {
        let max_bitrate = (config.max_bandwidth * 1000) as i64;
        let buf_size = max_bitrate * 2;
        let obj = ctx as *mut c_void;
        for (key, value) in [
            ("b", max_bitrate / if deps.is_webcam { 4 } else { 2 }),
            ("maxrate", max_bitrate),
            ("minrate", 1_000_000),
            ("bufsize", buf_size),
        ] {
            let key_c = cstring(key);
            let ret = av_opt_set_int(obj, key_c.as_ptr(), value, AV_OPT_SEARCH_CHILDREN);
            if ret != 0 {
                error!(
                    "failed setting encoder parameter <{}> err:{}, {}",
                    key,
                    ret,
                    crate::ffi::err_str(ret)
                );
            }
        }

        (*ctx).width = config.width;
        (*ctx).height = config.height;
        (*ctx).pix_fmt = AVPixelFormat::AV_PIX_FMT_YUV420P;

        match deps.video {
            Some(dec) => {
                (*ctx).sample_aspect_ratio = dec.sample_aspect_ratio;
                (*ctx).time_base = if dec.framerate.num > 0 {
                    av_inv_q(dec.framerate)
                } else {
                    fallback_video_time_base(config.frame_rate)
                };
                true
            }
            None => {
                (*ctx).sample_aspect_ratio = AVRational { num: 0, den: 1 };
                (*ctx).time_base = fallback_video_time_base(config.frame_rate);
                false
            }
        }
    }

    unsafe fn set_audio_settings(
        &self,
        config: &Encoding,
        ctx: *mut ffmpeg_sys_next::AVCodecContext,
        encoder: *const AVCodec,
        deps: &EncoderDeps,
    ) -> bool {
        let Some(dec) = deps.audio.as_ref() else {
            (*ctx).sample_rate = select_sample_rate(encoder, config.sample_rate);
            (*ctx).time_base = AVRational {
                num: 1,
                den: (*ctx).sample_rate,
            };
            return false;
        };

        let preferred_rate = if config.sample_rate > 0 {
            config.sample_rate
        } else {
            dec.sample_rate
        };
        (*ctx).sample_rate = select_sample_rate(encoder, preferred_rate);

        let mut layout_set = false;
        if !config.channel_layout.is_empty() {
            if let Some(preferred) = ChannelLayout::from_string(&config.channel_layout) {
                let selected = select_channel_layout(encoder, &preferred);
                // only honored when the preferred one was actually usable
                if (*selected.as_ptr()).order == (*preferred.as_ptr()).order
                    && selected.nb_channels() == preferred.nb_channels()
                {
                    ffmpeg_sys_next::av_channel_layout_copy(
                        &mut (*ctx).ch_layout,
                        selected.as_ptr(),
                    );
                    layout_set = true;
                }
            }
        }
        if !layout_set {
            let selected = select_channel_layout(encoder, &dec.ch_layout);
            let ret =
                ffmpeg_sys_next::av_channel_layout_copy(&mut (*ctx).ch_layout, selected.as_ptr());
            if ret < 0 {
                error!(
                    "failed to select encoder audio channel layout err:{}, {}",
                    ret,
                    crate::ffi::err_str(ret)
                );
            }
        }

        (*ctx).sample_fmt = AVSampleFormat::AV_SAMPLE_FMT_NONE;
        if !config.sample_fmt.is_empty() {
            let name = cstring(&config.sample_fmt);
            let fmt = av_get_sample_fmt(name.as_ptr());
            if fmt != AVSampleFormat::AV_SAMPLE_FMT_NONE && check_sample_fmt(encoder, fmt) {
                (*ctx).sample_fmt = fmt;
            }
        }
        if (*ctx).sample_fmt == AVSampleFormat::AV_SAMPLE_FMT_NONE
            && check_sample_fmt(encoder, dec.sample_fmt)
        {
            (*ctx).sample_fmt = dec.sample_fmt;
        }
        if (*ctx).sample_fmt == AVSampleFormat::AV_SAMPLE_FMT_NONE
            && !(*encoder).sample_fmts.is_null()
        {
            (*ctx).sample_fmt = *(*encoder).sample_fmts;
        }

        (*ctx).time_base = AVRational {
            num: 1,
            den: (*ctx).sample_rate,
        };
        true
    }

    /// Encodes `frm` with the encoder for `config`, appending the produced
    /// packets. Audio packets are retagged with the source audio stream
    /// index so writers can map them.
    pub fn encode_packets(
        &self,
        config: &Encoding,
        frm: &Frame,
        audio_stream_index: i32,
        packets: &mut Vec<Packet>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.get_mut(config) else {
            return Err(Error::Codec(AVERROR_ENCODER_NOT_FOUND));
        };
        entry.used.start();

        unsafe {
            let ctx = entry.ctx.as_ptr();
            let mut ret = avcodec_send_frame(ctx, frm.as_ptr());
            if ret < 0 && ret != AVERROR(EAGAIN) {
                error!(
                    "encoding failed: src: {} err: {}, {}",
                    self.source_name,
                    ret,
                    crate::ffi::err_str(ret)
                );
                return Err(Error::Codec(ret));
            }

            loop {
                let mut pkt = Packet::new();
                let p = pkt.as_mut_ptr();
                ret = avcodec_receive_packet(ctx, p);
                if ret == AVERROR_EOF || ret == AVERROR(EAGAIN) {
                    break;
                } else if ret < 0 {
                    return Err(Error::Codec(ret));
                }

                let f = frm.as_ptr();
                if entry.is_audio || !entry.had_decoder {
                    (*p).pts = (*f).pts;
                    (*p).dts = (*p).pts;
                    (*p).duration = if entry.is_audio {
                        (*f).duration
                    } else {
                        AV_NOPTS_VALUE
                    };
                    (*p).time_base = (*f).time_base;
                }
                if entry.is_audio {
                    (*p).stream_index = audio_stream_index;
                }
                packets.push(pkt);
            }
        }
        Ok(())
    }

    /// Codec parameters + time base of the open encoder for `config`, for
    /// wiring output streams.
    pub fn stream_params(&self, config: &Encoding) -> Option<EncoderStreamParams> {
        let inner = self.inner.lock();
        let entry = inner.get(config)?;
        unsafe {
            let params = CodecParameters::from_context(entry.ctx.as_ptr())?;
            Some(EncoderStreamParams {
                params,
                time_base: (*entry.ctx.as_ptr()).time_base,
            })
        }
    }

    /// Audio side of the open encoder for `config`, as the resampler's
    /// conversion target.
    pub fn audio_target(&self, config: &Encoding) -> Option<(AudioSide, i32)> {
        let inner = self.inner.lock();
        let entry = inner.get(config)?;
        if !entry.is_audio {
            return None;
        }
        unsafe {
            let ctx = entry.ctx.as_ptr();
            Some((
                AudioSide {
                    sample_fmt: (*ctx).sample_fmt,
                    sample_rate: (*ctx).sample_rate,
                    ch_layout: ChannelLayout::copy_from(&(*ctx).ch_layout),
                    time_base: (*ctx).time_base,
                },
                (*ctx).frame_size,
            ))
        }
    }

    /// Removes encoders idle for more than ten seconds.
    pub fn prune(&self) {
        self.inner.lock().retain(|_, e| e.used.seconds() <= 10);
    }
}

fn fallback_video_time_base(frame_rate: i32) -> AVRational {
    if frame_rate > 1 {
        AVRational {
            num: AV_TIME_BASE / (frame_rate / 2),
            den: AV_TIME_BASE,
        }
    } else {
        AVRational { num: 1, den: 25 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitrate_ladder() {
        assert_eq!(height_for_bitrate(20000), 2160);
        assert_eq!(height_for_bitrate(4000), 1080);
        assert_eq!(height_for_bitrate(2000), 720);
        assert_eq!(height_for_bitrate(1000), 480);
        assert_eq!(height_for_bitrate(500), 360);
        assert_eq!(height_for_bitrate(250), 240);
        assert_eq!(height_for_bitrate(120), 144);
        assert_eq!(height_for_bitrate(1), 90);
    }

    #[test]
    fn resolution_seeding() {
        let mut enc = Encoding {
            codec: Codec::H264,
            max_bandwidth: 2000,
            ..Default::default()
        };
        init_resolution(&mut enc, 1920, 1080);
        assert_eq!(enc.height, 720);
        assert_eq!(enc.width, 1280);

        // configured height wins over the ladder and clamps to the input
        let mut enc = Encoding {
            codec: Codec::H264,
            height: 4320,
            max_bandwidth: 2000,
            ..Default::default()
        };
        init_resolution(&mut enc, 1280, 720);
        assert_eq!(enc.height, 720);

        // odd heights round down to even
        let mut enc = Encoding {
            codec: Codec::H264,
            height: 479,
            ..Default::default()
        };
        init_resolution(&mut enc, 1920, 1080);
        assert_eq!(enc.height, 478);
        assert_eq!(enc.width % 2, 0);
    }

    #[test]
    fn fallback_time_base_handles_unset_rate() {
        let tb = fallback_video_time_base(30);
        assert_eq!(tb.num, AV_TIME_BASE / 15);
        assert_eq!(tb.den, AV_TIME_BASE);
        let tb = fallback_video_time_base(-1);
        assert!(tb.num > 0 && tb.den > 0);
    }
}
