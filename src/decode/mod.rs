use std::ptr;
use std::time::Duration;

use ffmpeg_sys_next::{
    av_rescale_delta, avcodec_alloc_context3, avcodec_find_decoder, avcodec_open2,
    avcodec_parameters_to_context, avcodec_receive_frame, avcodec_send_packet, AVRational,
    AVSampleFormat, AVERROR, AVERROR_EOF, AV_NOPTS_VALUE, AV_TIME_BASE,
};
use libc::EAGAIN;

use crate::demux::StreamInfo;
use crate::error::{Error, Result};
use crate::ffi::{ChannelLayout, CodecContext, Frame, Packet};
use crate::utils::ElapsedTimer;

/// Decoder-side video parameters the encoder settings derive from.
#[derive(Clone, Copy)]
pub struct VideoDecodeParams {
    pub framerate: AVRational,
    pub sample_aspect_ratio: AVRational,
}

/// Decoder-side audio parameters used by encoder setup and the resampler.
#[derive(Clone)]
pub struct AudioDecodeParams {
    pub sample_rate: i32,
    pub sample_fmt: AVSampleFormat,
    pub ch_layout: ChannelLayout,
    pub time_base: AVRational,
}

/// Lazy per-stream decoder: one video and one audio context, opened the
/// first time a packet for that stream arrives.
pub struct Decoder {
    video: Option<CodecContext>,
    audio: Option<CodecContext>,
    audio_rescale_last: i64,
    idle: ElapsedTimer,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            video: None,
            audio: None,
            audio_rescale_last: AV_NOPTS_VALUE,
            idle: ElapsedTimer::new(),
        }
    }

    pub fn reset(&mut self) {
        self.video = None;
        self.audio = None;
        self.audio_rescale_last = AV_NOPTS_VALUE;
    }

    /// Opens the decoder for `info`'s stream if not already open.
    pub fn initialize(&mut self, info: &StreamInfo) -> Result<()> {
        let is_video = matches!(info.kind, crate::demux::MediaKind::Video);
        if (is_video && self.video.is_some()) || (!is_video && self.audio.is_some()) {
            return Ok(());
        }
        unsafe {
            let dec = avcodec_find_decoder(info.codec_id);
            if dec.is_null() {
                return Err(Error::Codec(ffmpeg_sys_next::AVERROR_DECODER_NOT_FOUND));
            }
            let ctx = avcodec_alloc_context3(dec);
            if ctx.is_null() {
                return Err(Error::Codec(AVERROR(libc::ENOMEM)));
            }
            let ctx = CodecContext::from_raw(ctx);
            let ret = avcodec_parameters_to_context(ctx.as_ptr(), info.params.as_ptr());
            if ret < 0 {
                return Err(Error::Codec(ret));
            }
            (*ctx.as_ptr()).pkt_timebase = info.time_base;
            if is_video {
                (*ctx.as_ptr()).framerate = info.guessed_framerate;
            }
            let ret = avcodec_open2(ctx.as_ptr(), dec, ptr::null_mut());
            if ret < 0 {
                return Err(Error::Codec(ret));
            }
            if is_video {
                self.video = Some(ctx);
            } else {
                self.audio = Some(ctx);
            }
        }
        Ok(())
    }

    pub fn video_params(&self) -> Option<VideoDecodeParams> {
        self.video.as_ref().map(|ctx| unsafe {
            VideoDecodeParams {
                framerate: (*ctx.as_ptr()).framerate,
                sample_aspect_ratio: (*ctx.as_ptr()).sample_aspect_ratio,
            }
        })
    }

    pub fn audio_params(&self) -> Option<AudioDecodeParams> {
        self.audio.as_ref().map(|ctx| unsafe {
            AudioDecodeParams {
                sample_rate: (*ctx.as_ptr()).sample_rate,
                sample_fmt: (*ctx.as_ptr()).sample_fmt,
                ch_layout: ChannelLayout::copy_from(&(*ctx.as_ptr()).ch_layout),
                time_base: (*ctx.as_ptr()).time_base,
            }
        })
    }

    /// Decodes `pkt` into zero or more frames, opening the stream's decoder
    /// on first use. Video frames take the best-effort timestamp and stream
    /// time base; audio PTS is normalized against the sample clock.
    pub fn decode_frames(&mut self, pkt: &Packet, info: &StreamInfo) -> Result<Vec<Frame>> {
        let is_video = matches!(info.kind, crate::demux::MediaKind::Video);
        if (is_video && self.video.is_none()) || (!is_video && self.audio.is_none()) {
            self.initialize(info)?;
        }
        let ctx = if is_video {
            self.video.as_ref().unwrap().as_ptr()
        } else {
            self.audio.as_ref().unwrap().as_ptr()
        };

        let mut frames = Vec::new();
        unsafe {
            let mut ret = avcodec_send_packet(ctx, pkt.as_ptr());
            if ret < 0 {
                return Err(Error::Codec(ret));
            }
            while ret >= 0 {
                let mut frm = Frame::new();
                let f = frm.as_mut_ptr();
                ret = avcodec_receive_frame(ctx, f);
                if ret == AVERROR_EOF || ret == AVERROR(EAGAIN) {
                    break;
                } else if ret < 0 {
                    return Err(Error::Codec(ret));
                }

                if is_video {
                    (*f).pts = (*f).best_effort_timestamp;
                    (*f).time_base = info.time_base;
                } else {
                    // a long gap means the rescale state carries an offset
                    // from a different play segment
                    if self.idle.elapsed() > Duration::from_secs(5) {
                        self.audio_rescale_last = AV_NOPTS_VALUE;
                    }
                    self.idle.start();

                    let decoded_frame_tb;
                    if (*f).pts != AV_NOPTS_VALUE {
                        decoded_frame_tb = info.time_base;
                    } else if (*pkt.as_ptr()).pts != AV_NOPTS_VALUE {
                        (*f).pts = (*pkt.as_ptr()).pts;
                        decoded_frame_tb = info.time_base;
                    } else {
                        (*f).pts = (*pkt.as_ptr()).dts;
                        decoded_frame_tb = AVRational {
                            num: 1,
                            den: AV_TIME_BASE,
                        };
                    }
                    if (*f).pts != AV_NOPTS_VALUE {
                        let sample_tb = AVRational {
                            num: 1,
                            den: (*f).sample_rate,
                        };
                        (*f).pts = av_rescale_delta(
                            decoded_frame_tb,
                            (*f).pts,
                            sample_tb,
                            (*f).nb_samples,
                            &mut self.audio_rescale_last,
                            sample_tb,
                        );
                    }
                    (*f).time_base = AVRational {
                        num: 1,
                        den: (*f).sample_rate,
                    };
                }
                frames.push(frm);
            }
        }
        Ok(frames)
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
