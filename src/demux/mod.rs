use std::ffi::{c_int, c_void};
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ffmpeg_sys_next::{
    av_find_best_stream, av_find_input_format, av_guess_frame_rate, av_q2d, av_read_frame,
    av_rescale_q, av_seek_frame, avformat_alloc_context, avformat_find_stream_info,
    avformat_open_input, AVCodecID, AVFormatContext, AVMediaType, AVRational, AVSEEK_FLAG_BACKWARD,
    AVFMT_FLAG_FLUSH_PACKETS, AVFMT_FLAG_GENPTS, AV_NOPTS_VALUE, AV_PKT_FLAG_CORRUPT,
    AV_TIME_BASE,
};
use log::{error, trace};
use parking_lot::Mutex;

use crate::encoding::SourceArgs;
use crate::error::{Error, Result};
use crate::ffi::{cstring, CodecParameters, InputContext, Packet};
use crate::utils::ElapsedTimer;

/// Unblocks the codec library's blocking I/O when the pipeline stops or no
/// packet has arrived within the timeout. The callback may fire from library
/// internals on a foreign thread, so the flag is atomic and the timer is
/// written only by the demuxing thread.
pub struct InterruptHandler {
    running: AtomicBool,
    count: AtomicU64,
    last_packet: Mutex<Instant>,
    timeout: Duration,
}

impl InterruptHandler {
    pub fn new(timeout: Duration) -> Self {
        Self {
            running: AtomicBool::new(true),
            count: AtomicU64::new(0),
            last_packet: Mutex::new(Instant::now()),
            timeout,
        }
    }

    /// Wires the handler into a format context about to block on I/O.
    ///
    /// The opaque pointer borrows from the `Arc`; the owner must keep the
    /// handler alive for as long as the context can invoke callbacks.
    pub unsafe fn install(this: &Arc<Self>, ctx: *mut AVFormatContext) {
        this.running.store(true, Ordering::SeqCst);
        this.count.store(0, Ordering::SeqCst);
        *this.last_packet.lock() = Instant::now();
        (*ctx).interrupt_callback.callback = Some(interrupt_callback);
        (*ctx).interrupt_callback.opaque = Arc::as_ptr(this) as *mut c_void;
    }

    pub fn on_packet(&self) {
        *self.last_packet.lock() = Instant::now();
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

unsafe extern "C" fn interrupt_callback(opaque: *mut c_void) -> c_int {
    if opaque.is_null() {
        return 1;
    }
    let handler = &*(opaque as *const InterruptHandler);
    let count = handler.count.fetch_add(1, Ordering::Relaxed) + 1;
    if !handler.running.load(Ordering::Relaxed) {
        return 1;
    }
    // elapsed check is comparatively costly, do it every tenth call
    if count % 10 == 0 && handler.last_packet.lock().elapsed() > handler.timeout {
        return 1;
    }
    0
}

/// Media classes a source stream can map to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
    Other,
}

/// Immutable per-stream description captured right after stream discovery,
/// safe to read from writer threads while the demuxer keeps running.
pub struct StreamInfo {
    pub index: i32,
    pub kind: MediaKind,
    pub codec_id: AVCodecID,
    pub time_base: AVRational,
    pub guessed_framerate: AVRational,
    pub params: CodecParameters,
}

pub struct StreamSnapshot {
    pub streams: Vec<StreamInfo>,
    pub video_index: i32,
    pub audio_index: i32,
}

impl StreamSnapshot {
    pub fn stream(&self, index: i32) -> Option<&StreamInfo> {
        self.streams.iter().find(|s| s.index == index)
    }

    pub fn video(&self) -> Option<&StreamInfo> {
        self.stream(self.video_index)
    }

    pub fn audio(&self) -> Option<&StreamInfo> {
        self.stream(self.audio_index)
    }
}

/// Per input-stream demux bookkeeping, reset on every pipeline restart.
pub struct StreamData {
    pub stream_idx: i32,
    pub frames: i64,
    /// synthetic per-frame duration in stream time base units
    pub duration: i64,
    pub last_pts: i64,
    pub last_dts: i64,
    pub last_pts_diff: i64,
    pub first_dts: i64,
    pub dts_offset: i64,
    pub last_speed: f64,
    pub time_base: AVRational,
}

impl StreamData {
    fn new() -> Self {
        Self {
            stream_idx: -1,
            frames: 0,
            duration: 0,
            last_pts: 0,
            last_dts: 0,
            last_pts_diff: 0,
            first_dts: 0,
            dts_offset: 0,
            last_speed: 1.0,
            time_base: AVRational { num: 0, den: 1 },
        }
    }
}

/// Wall-clock pacing state for local file playback.
pub struct LocalFileData {
    pub last_dts_us: i64,
    pub seek_dts_us: i64,
    pub seeked: bool,
    pub first_pkt_pos: i64,
    pub elapsed: ElapsedTimer,
}

impl LocalFileData {
    fn new() -> Self {
        Self {
            last_dts_us: 0,
            seek_dts_us: 0,
            seeked: false,
            first_pkt_pos: 0,
            elapsed: ElapsedTimer::new(),
        }
    }
}

/// Demux-thread state: the sole writer is the source worker; external
/// commands only touch the seek/speed atomics owned by the source.
pub struct DemuxData {
    pub is_local: bool,
    pub video_stream: StreamData,
    pub audio_stream: StreamData,
    pub local_file: LocalFileData,
    /// When set, audio packets use their own stream's speed-rewrite state
    /// instead of sharing the video clock.
    pub per_stream_speed: bool,
}

impl DemuxData {
    pub fn new() -> Self {
        Self {
            is_local: false,
            video_stream: StreamData::new(),
            audio_stream: StreamData::new(),
            local_file: LocalFileData::new(),
            per_stream_speed: false,
        }
    }

    pub fn reset(&mut self) {
        self.is_local = false;
        self.video_stream = StreamData::new();
        self.audio_stream = StreamData::new();
        self.local_file = LocalFileData::new();
    }

    /// Local files are paced to wall time: hold the next packet back while
    /// its rewritten timestamps run ahead of the clock.
    pub fn should_wait_to_present(&self) -> bool {
        self.is_local
            && (self.local_file.last_dts_us - self.local_file.seek_dts_us)
                > self.local_file.elapsed.microseconds() as i64
    }

    pub fn should_present_faster(&self) -> bool {
        self.is_local
            && (self.local_file.last_dts_us - self.local_file.seek_dts_us)
                < self.local_file.elapsed.microseconds() as i64
    }

    /// Analyzes a freshly read packet. Returns false when the packet is
    /// corrupt or belongs to a stream nobody consumes.
    pub fn on_packet(
        &mut self,
        pkt: &mut Packet,
        speed: f64,
        interrupt: &InterruptHandler,
    ) -> bool {
        interrupt.on_packet();
        unsafe {
            let p = pkt.as_mut_ptr();
            if (*p).flags & AV_PKT_FLAG_CORRUPT != 0 {
                return false;
            }
            if (*p).stream_index == self.video_stream.stream_idx {
                if self.is_local {
                    Self::apply_speed(&mut self.video_stream, p, speed);
                }
                Self::analyze(&mut self.video_stream, p);
                if self.is_local {
                    let tb = self.video_stream.time_base;
                    self.parse_local_file_packet(p, tb);
                }
            } else if (*p).stream_index == self.audio_stream.stream_idx {
                if self.is_local {
                    let sd = if self.per_stream_speed {
                        &mut self.audio_stream
                    } else {
                        &mut self.video_stream
                    };
                    Self::apply_speed(sd, p, speed);
                }
                Self::analyze(&mut self.audio_stream, p);
            } else {
                return false;
            }
        }
        true
    }

    unsafe fn analyze(sd: &mut StreamData, pkt: *mut ffmpeg_sys_next::AVPacket) {
        sd.frames += 1;
        if (*pkt).pts == AV_NOPTS_VALUE && sd.duration > 0 {
            (*pkt).pts = sd.frames * sd.duration;
            (*pkt).dts = (*pkt).pts;
            (*pkt).duration = sd.duration;
        }
        sd.last_pts_diff = (*pkt).pts - sd.last_pts;
        sd.last_pts = (*pkt).pts;
        sd.last_dts = (*pkt).dts;
    }

    unsafe fn apply_speed(sd: &mut StreamData, pkt: *mut ffmpeg_sys_next::AVPacket, speed: f64) {
        if (*pkt).dts < 0 {
            (*pkt).dts = (*pkt).pts;
        }
        if sd.last_speed != speed {
            sd.dts_offset = sd.last_dts;
            sd.first_dts = (*pkt).dts;
            sd.last_speed = speed;
        }
        let cts = (*pkt).pts - (*pkt).dts;
        (*pkt).dts = sd.dts_offset + (((*pkt).dts - sd.first_dts) as f64 * (1.0 / speed)) as i64;
        if (*pkt).dts != AV_NOPTS_VALUE && (*pkt).dts <= sd.last_dts {
            (*pkt).dts = sd.last_dts + 1;
        }
        (*pkt).pts = (*pkt).dts + cts;
        (*pkt).duration = 0;
    }

    unsafe fn parse_local_file_packet(
        &mut self,
        pkt: *const ffmpeg_sys_next::AVPacket,
        time_base: AVRational,
    ) {
        if self.local_file.first_pkt_pos <= 0 && (*pkt).pos > 0 {
            self.local_file.first_pkt_pos = (*pkt).pos;
        }
        let ts = if (*pkt).dts != AV_NOPTS_VALUE {
            (*pkt).dts
        } else {
            (*pkt).pts
        };
        self.local_file.last_dts_us =
            av_rescale_q(ts, time_base, AVRational { num: 1, den: 1_000_000 });
        if self.local_file.seeked {
            self.local_file.seek_dts_us = self.local_file.last_dts_us;
            self.local_file.seeked = false;
            self.local_file.elapsed.start();
        }
    }
}

impl Default for DemuxData {
    fn default() -> Self {
        Self::new()
    }
}

/// How a source URL is consumed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UrlKind {
    Network,
    LocalFile,
    Webcam { framework: String, device: String },
}

fn preferred_video_framework() -> &'static str {
    #[cfg(target_os = "linux")]
    {
        "video4linux2"
    }
    #[cfg(any(target_os = "macos", target_os = "freebsd"))]
    {
        "avfoundation"
    }
    #[cfg(target_os = "windows")]
    {
        "dshow"
    }
    #[cfg(not(any(
        target_os = "linux",
        target_os = "macos",
        target_os = "freebsd",
        target_os = "windows"
    )))]
    {
        ""
    }
}

/// Classifies a source URL: `avdevice:[<framework>]:video=<name>` webcams,
/// paths resolving to regular files, anything else network.
pub fn classify_url(url: &str) -> UrlKind {
    if let Some(rest) = url.strip_prefix("avdevice:") {
        let (framework, device) = match rest.split_once(':') {
            Some((fw, dev)) => (fw.to_string(), dev.to_string()),
            None => (String::new(), rest.to_string()),
        };
        let framework = if framework.is_empty() {
            preferred_video_framework().to_string()
        } else {
            framework
        };
        return UrlKind::Webcam {
            framework,
            device,
        };
    }
    if Path::new(url).is_file() {
        return UrlKind::LocalFile;
    }
    UrlKind::Network
}

/// Opened input pipeline of one source; lives for a single demuxer run.
pub struct Demuxer {
    input: InputContext,
    pub is_local: bool,
    pub is_webcam: bool,
}

impl Demuxer {
    /// Opens the source input, classifying webcam / local-file / network
    /// URLs and wiring the interrupt handler before any blocking call.
    pub fn open(args: &SourceArgs, interrupt: &Arc<InterruptHandler>) -> Result<Self> {
        unsafe {
            let mut ctx = avformat_alloc_context();
            if ctx.is_null() {
                return Err(Error::Codec(ffmpeg_sys_next::AVERROR(libc::ENOMEM)));
            }

            let kind = classify_url(&args.url);
            let mut open_url = args.url.clone();
            let mut input_format = ptr::null();
            let mut is_webcam = false;
            let mut options = crate::ffi::Dictionary::new();

            match &kind {
                UrlKind::Webcam { framework, device } => {
                    let fw = cstring(framework);
                    input_format = av_find_input_format(fw.as_ptr());
                    if input_format.is_null() {
                        error!(
                            "webcam unknown format: src: {} format: {}",
                            args.name, framework
                        );
                    }
                    open_url = device.clone();
                    is_webcam = true;
                    trace!("webcam detected: src: {}", args.name);
                }
                UrlKind::LocalFile => {
                    trace!("local file detected: src: {}", args.name);
                }
                UrlKind::Network => {
                    options.set_int("threads", 1);
                    if open_url.to_lowercase().starts_with("rtsp:") {
                        options.set("rtsp_flags", "prefer_tcp");
                    }
                }
            }

            InterruptHandler::install(interrupt, ctx);

            let url = cstring(&open_url);
            let ret = avformat_open_input(&mut ctx, url.as_ptr(), input_format, options.as_mut_ref());
            if ret != 0 {
                // the library frees the context on a failed open
                return Err(Error::Codec(ret));
            }
            (*ctx).flags |= AVFMT_FLAG_GENPTS | AVFMT_FLAG_FLUSH_PACKETS;

            Ok(Self {
                input: InputContext::from_raw(ctx),
                is_local: kind == UrlKind::LocalFile,
                is_webcam,
            })
        }
    }

    pub fn as_ptr(&self) -> *mut AVFormatContext {
        self.input.as_ptr()
    }

    /// Discovers streams, fills the per-type demux state and captures the
    /// parameter snapshot used by writers. Fails with `NotSupported` when
    /// the input has neither audio nor video.
    pub fn find_info(&mut self, data: &mut DemuxData) -> Result<StreamSnapshot> {
        unsafe {
            let ctx = self.input.as_ptr();
            avformat_find_stream_info(ctx, ptr::null_mut());

            let fill = |sd: &mut StreamData, idx: i32| {
                let stream = *(*ctx).streams.add(idx as usize);
                sd.stream_idx = idx;
                sd.time_base = (*stream).time_base;
                if (*stream).time_base.den != 0 && (*stream).r_frame_rate.den != 0 {
                    let d = av_q2d((*stream).r_frame_rate) * av_q2d((*stream).time_base);
                    if d != 0.0 {
                        sd.duration = (1.0 / d) as i64;
                    }
                }
            };

            let video_index =
                av_find_best_stream(ctx, AVMediaType::AVMEDIA_TYPE_VIDEO, -1, -1, ptr::null_mut(), 0);
            if video_index >= 0 {
                fill(&mut data.video_stream, video_index);
            }
            let audio_index =
                av_find_best_stream(ctx, AVMediaType::AVMEDIA_TYPE_AUDIO, -1, -1, ptr::null_mut(), 0);
            if audio_index >= 0 {
                fill(&mut data.audio_stream, audio_index);
            }
            if video_index < 0 && audio_index < 0 {
                return Err(Error::NotSupported);
            }

            let mut streams = Vec::new();
            for i in 0..(*ctx).nb_streams.min(crate::egress::MAX_STREAMS as u32) {
                let stream = *(*ctx).streams.add(i as usize);
                let par = (*stream).codecpar;
                let kind = match (*par).codec_type {
                    AVMediaType::AVMEDIA_TYPE_VIDEO => MediaKind::Video,
                    AVMediaType::AVMEDIA_TYPE_AUDIO => MediaKind::Audio,
                    _ => MediaKind::Other,
                };
                let params = match CodecParameters::copy_from(par) {
                    Some(p) => p,
                    None => return Err(Error::Codec(ffmpeg_sys_next::AVERROR(libc::ENOMEM))),
                };
                streams.push(StreamInfo {
                    index: (*stream).index,
                    kind,
                    codec_id: (*par).codec_id,
                    time_base: (*stream).time_base,
                    guessed_framerate: if kind == MediaKind::Video {
                        av_guess_frame_rate(ctx, stream, ptr::null_mut())
                    } else {
                        AVRational { num: 0, den: 1 }
                    },
                    params,
                });
            }

            data.is_local = self.is_local;
            Ok(StreamSnapshot {
                streams,
                video_index,
                audio_index,
            })
        }
    }

    /// Reads the next packet; returns the raw library code.
    pub fn read_packet(&mut self, pkt: &mut Packet) -> i32 {
        unsafe { av_read_frame(self.input.as_ptr(), pkt.as_mut_ptr()) }
    }

    /// Seeks a local file to `time` seconds, expressed as a fraction of the
    /// total duration so container quirks cancel out.
    pub fn seek_to(&mut self, time: i64, data: &mut DemuxData) -> bool {
        unsafe {
            let ctx = self.input.as_ptr();
            let duration = (*ctx).duration;
            let duration_seconds = av_rescale_q(
                duration,
                AVRational {
                    num: 1,
                    den: AV_TIME_BASE,
                },
                AVRational { num: 1, den: 1 },
            );
            let pos = (time.max(0) as f64) / duration_seconds.max(1) as f64;
            let p = (pos * duration as f64) as i64;
            // seeks to the nearest preceding I-frame
            let ret = av_seek_frame(ctx, -1, p, AVSEEK_FLAG_BACKWARD);
            data.local_file.seeked = true;
            ret >= 0
        }
    }
}

/// Playback speed factor shared between API threads and the demuxer.
pub struct SpeedControl(AtomicU64);

impl SpeedControl {
    pub fn new() -> Self {
        Self(AtomicU64::new(1f64.to_bits()))
    }

    pub fn set(&self, speed: f64) {
        let speed = if speed > 0.0 { speed } else { 1.0 };
        self.0.store(speed.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

impl Default for SpeedControl {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkt_with(pts: i64, dts: i64, stream: i32) -> Packet {
        let mut pkt = Packet::new();
        unsafe {
            let p = pkt.as_mut_ptr();
            (*p).pts = pts;
            (*p).dts = dts;
            (*p).stream_index = stream;
        }
        pkt
    }

    #[test]
    fn classify_webcam_urls() {
        match classify_url("avdevice::video=Integrated Camera") {
            UrlKind::Webcam { framework, device } => {
                assert_eq!(framework, preferred_video_framework());
                assert_eq!(device, "video=Integrated Camera");
            }
            other => panic!("unexpected: {:?}", other),
        }
        match classify_url("avdevice:dshow:video=cam") {
            UrlKind::Webcam { framework, device } => {
                assert_eq!(framework, "dshow");
                assert_eq!(device, "video=cam");
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(classify_url("rtsp://host/stream"), UrlKind::Network);
        assert_eq!(classify_url("/nonexistent/file.mp4"), UrlKind::Network);
    }

    #[test]
    fn classify_local_file() {
        let f = tempfile::NamedTempFile::new().unwrap();
        assert_eq!(
            classify_url(f.path().to_str().unwrap()),
            UrlKind::LocalFile
        );
    }

    #[test]
    fn analyze_synthesizes_missing_pts() {
        let mut data = DemuxData::new();
        data.video_stream.stream_idx = 0;
        data.video_stream.duration = 3600;
        let interrupt = Arc::new(InterruptHandler::new(Duration::from_secs(20)));

        let mut pkt = pkt_with(AV_NOPTS_VALUE, AV_NOPTS_VALUE, 0);
        assert!(data.on_packet(&mut pkt, 1.0, &interrupt));
        assert_eq!(pkt.pts(), 3600);
        assert_eq!(pkt.dts(), 3600);
        assert_eq!(data.video_stream.last_pts, 3600);

        let mut pkt = pkt_with(AV_NOPTS_VALUE, AV_NOPTS_VALUE, 0);
        assert!(data.on_packet(&mut pkt, 1.0, &interrupt));
        assert_eq!(pkt.pts(), 7200);
    }

    #[test]
    fn corrupt_and_unknown_packets_are_dropped() {
        let mut data = DemuxData::new();
        data.video_stream.stream_idx = 0;
        let interrupt = Arc::new(InterruptHandler::new(Duration::from_secs(20)));

        let mut pkt = pkt_with(1, 1, 0);
        unsafe { (*pkt.as_mut_ptr()).flags |= AV_PKT_FLAG_CORRUPT };
        assert!(!data.on_packet(&mut pkt, 1.0, &interrupt));

        let mut pkt = pkt_with(1, 1, 7);
        assert!(!data.on_packet(&mut pkt, 1.0, &interrupt));
    }

    #[test]
    fn speed_rewrite_keeps_dts_monotonic() {
        let mut data = DemuxData::new();
        data.is_local = true;
        data.video_stream.stream_idx = 0;
        let interrupt = Arc::new(InterruptHandler::new(Duration::from_secs(20)));

        // establish a baseline at normal speed
        for i in 1..=3 {
            let mut pkt = pkt_with(i * 1000, i * 1000, 0);
            assert!(data.on_packet(&mut pkt, 1.0, &interrupt));
        }
        let base_dts = data.video_stream.last_dts;

        // doubling the speed halves the timestamp progression
        let mut last = base_dts;
        for i in 4..=6 {
            let mut pkt = pkt_with(i * 1000, i * 1000, 0);
            assert!(data.on_packet(&mut pkt, 2.0, &interrupt));
            let dts = pkt.dts();
            assert!(dts > last, "dts must stay strictly increasing");
            last = dts;
        }
        // three packets at 2x advance ~half of 3 * 1000
        assert!(last - base_dts < 2000, "2x speed should compress dts");
    }

    #[test]
    fn audio_follows_video_clock_unless_per_stream() {
        let interrupt = Arc::new(InterruptHandler::new(Duration::from_secs(20)));

        let mut unified = DemuxData::new();
        unified.is_local = true;
        unified.video_stream.stream_idx = 0;
        unified.audio_stream.stream_idx = 1;

        let mut pkt = pkt_with(1000, 1000, 0);
        unified.on_packet(&mut pkt, 2.0, &interrupt);
        let mut pkt = pkt_with(1500, 1500, 1);
        unified.on_packet(&mut pkt, 2.0, &interrupt);
        // audio rewrite advanced the shared (video) stream state
        assert_eq!(unified.video_stream.last_speed, 2.0);
        assert_eq!(unified.audio_stream.last_speed, 1.0);

        let mut split = DemuxData::new();
        split.is_local = true;
        split.per_stream_speed = true;
        split.video_stream.stream_idx = 0;
        split.audio_stream.stream_idx = 1;

        let mut pkt = pkt_with(1500, 1500, 1);
        split.on_packet(&mut pkt, 2.0, &interrupt);
        assert_eq!(split.audio_stream.last_speed, 2.0);
        assert_eq!(split.video_stream.last_speed, 1.0);
    }

    #[test]
    fn pacing_waits_while_media_runs_ahead() {
        let mut data = DemuxData::new();
        data.is_local = true;
        // a minute of media seen right after start
        data.local_file.last_dts_us = 60_000_000;
        assert!(data.should_wait_to_present());
        assert!(!data.should_present_faster());

        // media behind wall clock after a seek rebase
        data.local_file.seek_dts_us = 60_000_000;
        assert!(!data.should_wait_to_present());
        assert!(data.should_present_faster());
    }

    #[test]
    fn speed_control_round_trip() {
        let s = SpeedControl::new();
        assert_eq!(s.get(), 1.0);
        s.set(2.5);
        assert_eq!(s.get(), 2.5);
        s.set(0.0);
        assert_eq!(s.get(), 1.0);
    }
}
