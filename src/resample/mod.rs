use std::collections::HashMap;
use std::ffi::CStr;
use std::ptr;

use ffmpeg_sys_next::{
    av_buffersink_get_frame, av_buffersink_get_time_base, av_buffersrc_add_frame_flags,
    av_get_sample_fmt_name, avfilter_graph_config, avfilter_graph_get_filter,
    avfilter_graph_parse2, AVChannelOrder, AVFilterContext, AVFilterInOut, AVRational,
    AVSampleFormat, AVERROR, AVERROR_EOF, AV_BUFFERSRC_FLAG_KEEP_REF, AV_BUFFERSRC_FLAG_PUSH,
};
use libc::EAGAIN;
use log::{error, trace};

use crate::ffi::{cstring, err_str, ChannelLayout, FilterGraph, Frame};
use crate::utils::ElapsedTimer;

/// One side of an audio conversion.
pub struct AudioSide {
    pub sample_fmt: AVSampleFormat,
    pub sample_rate: i32,
    pub ch_layout: ChannelLayout,
    pub time_base: AVRational,
}

/// Source and target formats for conforming decoded audio to an encoder.
pub struct AudioConform {
    pub src: AudioSide,
    pub dst: AudioSide,
    /// fixed frame size the target encoder expects
    pub dst_frame_size: i32,
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct ResampleKey {
    src_fmt: i32,
    src_rate: i32,
    src_layout: String,
    dst_fmt: i32,
    dst_rate: i32,
    dst_layout: String,
}

struct FilterData {
    graph: FilterGraph,
    buffersrc: *mut AVFilterContext,
    buffersink: *mut AVFilterContext,
    first_pts: i64,
    used: ElapsedTimer,
}

unsafe impl Send for FilterData {}

fn sample_fmt_name(fmt: AVSampleFormat) -> String {
    unsafe {
        let name = av_get_sample_fmt_name(fmt);
        if name.is_null() {
            String::new()
        } else {
            CStr::from_ptr(name).to_string_lossy().into_owned()
        }
    }
}

/// Audio conformance through a cached filter graph per format pair:
/// reformat, re-chunk to the encoder frame size and regenerate PTS from the
/// sample count.
pub struct Resampler {
    filters: HashMap<ResampleKey, FilterData>,
    source_name: String,
}

impl Resampler {
    pub fn new(source_name: &str) -> Self {
        Self {
            filters: HashMap::new(),
            source_name: source_name.to_string(),
        }
    }

    fn build_description(conform: &AudioConform) -> String {
        // an unspecified source order gets the default layout for its count
        let src_layout = if unsafe { (*conform.src.ch_layout.as_ptr()).order }
            == AVChannelOrder::AV_CHANNEL_ORDER_UNSPEC
        {
            ChannelLayout::default_for(conform.src.ch_layout.nb_channels()).describe()
        } else {
            conform.src.ch_layout.describe()
        };
        let dst_layout = conform.dst.ch_layout.describe();

        format!(
            "abuffer=time_base={}/{}:sample_rate={}:sample_fmt={}:channel_layout={} [in]; \
             [in] aformat=sample_rates={}:sample_fmts={}:channel_layouts={} [aformat_out]; \
             [aformat_out] asetnsamples=n={} [asetnsamples_out]; \
             [asetnsamples_out] asetpts=N/SR/TB [asetpts_out]; \
             [asetpts_out] abuffersink",
            conform.src.time_base.num,
            conform.src.time_base.den,
            conform.src.sample_rate,
            sample_fmt_name(conform.src.sample_fmt),
            src_layout,
            conform.dst.sample_rate,
            sample_fmt_name(conform.dst.sample_fmt),
            dst_layout,
            conform.dst_frame_size,
        )
    }

    fn init_filters(&mut self, key: &ResampleKey, conform: &AudioConform) -> i32 {
        let description = Self::build_description(conform);
        trace!(
            "resample graph: src: {} {}",
            self.source_name,
            description
        );

        let fd = self.filters.get_mut(key).unwrap();
        fd.graph = FilterGraph::new();
        let graph = fd.graph.as_ptr();
        if graph.is_null() {
            return AVERROR(libc::ENOMEM);
        }

        unsafe {
            let desc = cstring(&description);
            let mut unlinked_inputs: *mut AVFilterInOut = ptr::null_mut();
            let mut unlinked_outputs: *mut AVFilterInOut = ptr::null_mut();
            let ret = avfilter_graph_parse2(
                graph,
                desc.as_ptr(),
                &mut unlinked_inputs,
                &mut unlinked_outputs,
            );
            ffmpeg_sys_next::avfilter_inout_free(&mut unlinked_inputs);
            ffmpeg_sys_next::avfilter_inout_free(&mut unlinked_outputs);
            if ret < 0 {
                return ret;
            }

            let ret = avfilter_graph_config(graph, ptr::null_mut());
            if ret < 0 {
                error!(
                    "resample: invalid filter graph: src: {} err:{}, {}",
                    self.source_name,
                    ret,
                    err_str(ret)
                );
                return ret;
            }

            for i in 0..(*graph).nb_filters {
                let f = *(*graph).filters.add(i as usize);
                let filter_name = CStr::from_ptr((*(*f).filter).name).to_string_lossy();
                if filter_name == "abuffer" {
                    fd.buffersrc = avfilter_graph_get_filter(graph, (*f).name);
                } else if filter_name == "abuffersink" {
                    fd.buffersink = avfilter_graph_get_filter(graph, (*f).name);
                }
            }
        }
        0
    }

    /// Pushes `src` through the graph for `conform` and drains the sink.
    /// Output PTS is rebased so the first produced frame lines up with the
    /// source frame; later frames keep the sample-count spacing.
    pub fn make_frames(&mut self, src: &Frame, conform: &AudioConform) -> Vec<Frame> {
        let key = ResampleKey {
            src_fmt: conform.src.sample_fmt as i32,
            src_rate: conform.src.sample_rate,
            src_layout: conform.src.ch_layout.describe(),
            dst_fmt: conform.dst.sample_fmt as i32,
            dst_rate: conform.dst.sample_rate,
            dst_layout: conform.dst.ch_layout.describe(),
        };
        if !self.filters.contains_key(&key) {
            self.filters.insert(
                key.clone(),
                FilterData {
                    graph: FilterGraph::new(),
                    buffersrc: ptr::null_mut(),
                    buffersink: ptr::null_mut(),
                    first_pts: 0,
                    used: ElapsedTimer::new(),
                },
            );
        }

        if self.filters[&key].buffersink.is_null() {
            let ret = self.init_filters(&key, conform);
            if ret < 0 {
                error!(
                    "resample: failed to initialize filters: src: {} err:{}",
                    self.source_name, ret
                );
                return Vec::new();
            }
        }

        let fd = self.filters.get_mut(&key).unwrap();
        fd.used.start();

        unsafe {
            let ret = av_buffersrc_add_frame_flags(
                fd.buffersrc,
                src.as_ptr() as *mut _,
                (AV_BUFFERSRC_FLAG_PUSH | AV_BUFFERSRC_FLAG_KEEP_REF) as i32,
            );
            if ret < 0 {
                error!(
                    "resample: failed to push frame: src: {} err:{}, {}",
                    self.source_name,
                    ret,
                    err_str(ret)
                );
                return Vec::new();
            }

            let mut frames = Vec::new();
            loop {
                let mut frm = Frame::new();
                let ret = av_buffersink_get_frame(fd.buffersink, frm.as_mut_ptr());
                if ret == AVERROR(EAGAIN) || ret == AVERROR_EOF || ret < 0 {
                    break;
                }
                if fd.first_pts <= 0 {
                    fd.first_pts = (*src.as_ptr()).pts;
                }
                let f = frm.as_mut_ptr();
                (*f).pts += fd.first_pts;
                (*f).duration = (*f).nb_samples as i64;
                (*f).time_base = av_buffersink_get_time_base(fd.buffersink);
                frames.push(frm);
            }
            frames
        }
    }

    /// Drops filter graphs idle for more than five seconds.
    pub fn prune(&mut self) {
        self.filters.retain(|_, fd| fd.used.seconds() <= 5);
    }
}
