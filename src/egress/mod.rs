use std::collections::VecDeque;
use std::mem::transmute;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ffmpeg_sys_next::{
    av_interleaved_write_frame, av_packet_rescale_ts, av_rescale_q, av_rescale_q_rnd,
    avcodec_parameters_copy, avformat_new_stream, AVMediaType, AVRational, AVRounding, AVERROR,
    AVFMT_AVOID_NEG_TS_AUTO, AV_NOPTS_VALUE, FF_COMPLIANCE_EXPERIMENTAL, FF_COMPLIANCE_NORMAL,
};
use libc::ETIMEDOUT;
use log::error;
use parking_lot::{Condvar, Mutex};

use crate::demux::{MediaKind, StreamSnapshot};
use crate::encode::{encoder_codec_id, EncoderPool};
use crate::encoding::{Codec, EncoderConfig};
use crate::ffi::{OutputContext, Packet};
use crate::utils::ElapsedTimer;

pub mod recorder;
pub mod viewer;

pub const MAX_STREAMS: usize = 16;

/// What a writer produces, deciding its timestamp rewrite policy.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum WriterKind {
    View,
    Record,
}

/// Shared muxing state of viewer and recorder writers: input→output stream
/// mapping, timestamp rewrite and the interleaved write.
pub struct WriterBase {
    pub kind: WriterKind,
    pub output: OutputContext,
    pub snapshot: Arc<StreamSnapshot>,
    pub encoding: EncoderConfig,
    pub source_name: String,
    out_stream_map: [i32; MAX_STREAMS],
    first_ptses: [i64; MAX_STREAMS],
    last_dtses: [i64; MAX_STREAMS],
    last_write_time: ElapsedTimer,
}

fn rescale_remux(pkt: *mut ffmpeg_sys_next::AVPacket, inb: AVRational, out: AVRational) {
    unsafe {
        let rnd: AVRounding = transmute(
            AVRounding::AV_ROUND_NEAR_INF as u32 | AVRounding::AV_ROUND_PASS_MINMAX as u32,
        );
        if (*pkt).pts != AV_NOPTS_VALUE {
            (*pkt).pts = av_rescale_q_rnd((*pkt).pts, inb, out, rnd);
        }
        if (*pkt).dts != AV_NOPTS_VALUE {
            (*pkt).dts = av_rescale_q_rnd((*pkt).dts, inb, out, rnd);
        }
        if (*pkt).duration > 0 {
            (*pkt).duration = av_rescale_q((*pkt).duration, inb, out);
        }
    }
}

impl WriterBase {
    pub fn new(
        kind: WriterKind,
        output: OutputContext,
        snapshot: Arc<StreamSnapshot>,
        encoding: EncoderConfig,
        source_name: &str,
    ) -> Self {
        Self {
            kind,
            output,
            snapshot,
            encoding,
            source_name: source_name.to_string(),
            out_stream_map: [-1; MAX_STREAMS],
            first_ptses: [-1; MAX_STREAMS],
            last_dtses: [-1; MAX_STREAMS],
            last_write_time: ElapsedTimer::new(),
        }
    }

    /// Creates one output stream per mappable input stream (≤ 16). A media
    /// type with a disabled encoding is remuxed by copying the input codec
    /// parameters; an enabled one copies the encoder's parameters and
    /// adopts its time base.
    pub fn make_output_streams(&mut self, pool: &EncoderPool) -> bool {
        self.out_stream_map = [-1; MAX_STREAMS];
        self.first_ptses = [-1; MAX_STREAMS];
        self.last_dtses = [-1; MAX_STREAMS];

        let mut out_stream_counter = 0;
        for info in self.snapshot.streams.iter() {
            let idx = info.index as usize;
            if idx >= MAX_STREAMS {
                continue;
            }
            let is_video = matches!(info.kind, MediaKind::Video);
            let is_audio = matches!(info.kind, MediaKind::Audio);
            if !is_video && !is_audio {
                continue;
            }

            self.out_stream_map[idx] = out_stream_counter;
            out_stream_counter += 1;
            unsafe {
                let stream = avformat_new_stream(self.output.as_ptr(), ptr::null());
                if stream.is_null() {
                    error!(
                        "failed to create output stream: src: {} stream: {}",
                        self.source_name, idx
                    );
                    return false;
                }

                let enc = if is_video {
                    &self.encoding.video
                } else {
                    &self.encoding.audio
                };
                if !enc.is_valid() {
                    // remux: carry the input parameters over verbatim
                    let ret = avcodec_parameters_copy((*stream).codecpar, info.params.as_ptr());
                    if ret < 0 {
                        error!(
                            "failed to copy input codec parameters to output stream: src: {} stream: {}",
                            self.source_name, idx
                        );
                        return false;
                    }
                    (*(*stream).codecpar).codec_tag = 0;
                    (*stream).start_time = 0;
                } else {
                    let Some(params) = pool.stream_params(enc) else {
                        error!(
                            "missing encoder for output stream: src: {} stream: {}",
                            self.source_name, idx
                        );
                        return false;
                    };
                    let ret = avcodec_parameters_copy((*stream).codecpar, params.params.as_ptr());
                    if ret < 0 {
                        error!(
                            "failed to copy encoder codec parameters to output stream: src: {} stream: {}",
                            self.source_name, idx
                        );
                        return false;
                    }
                    (*stream).time_base = params.time_base;
                }
            }
        }

        unsafe {
            (*self.output.as_ptr()).avoid_negative_ts = AVFMT_AVOID_NEG_TS_AUTO;
        }
        true
    }

    /// Remaps, rewrites timestamps and interleaved-writes one packet.
    /// Returns the raw library code, `ETIMEDOUT` when no write made
    /// progress for 15 seconds.
    pub fn write_packet(&mut self, src: &Packet) -> i32 {
        if self.last_write_time.seconds() > 15 {
            return AVERROR(ETIMEDOUT);
        }

        let in_idx = src.stream_index() as usize;
        if in_idx >= MAX_STREAMS {
            return 0;
        }
        let out_idx = self.out_stream_map[in_idx];
        if out_idx == -1 {
            return 0;
        }

        unsafe {
            let out_stream = *(*self.output.as_ptr()).streams.add(out_idx as usize);
            let in_time_base = match self.snapshot.stream(src.stream_index()) {
                Some(info) => {
                    if (*(*out_stream).codecpar).codec_type != AVMediaType::AVMEDIA_TYPE_VIDEO
                        && self.encoding.audio.is_valid()
                    {
                        // re-encoded audio carries its own time base
                        (*src.as_ptr()).time_base
                    } else {
                        info.time_base
                    }
                }
                None => (*src.as_ptr()).time_base,
            };

            let Some(mut pkt) = Packet::clone_from_raw(src.as_ptr()) else {
                return AVERROR(libc::ENOMEM);
            };
            let p = pkt.as_mut_ptr();
            (*p).stream_index = out_idx;

            rewrite_timestamps(
                self.kind,
                p,
                in_time_base,
                (*out_stream).time_base,
                &mut self.first_ptses[in_idx],
                &mut self.last_dtses[in_idx],
            );

            let ret = av_interleaved_write_frame(self.output.as_ptr(), p);
            self.last_write_time.start();
            ret
        }
    }

    /// Output stream time base for a mapped input stream index.
    pub fn output_time_base(&self, in_idx: usize) -> Option<AVRational> {
        if in_idx >= MAX_STREAMS {
            return None;
        }
        let out_idx = self.out_stream_map[in_idx];
        if out_idx == -1 {
            return None;
        }
        unsafe {
            let out_stream = *(*self.output.as_ptr()).streams.add(out_idx as usize);
            Some((*out_stream).time_base)
        }
    }

    pub fn write_trailer(&mut self) -> i32 {
        unsafe { ffmpeg_sys_next::av_write_trailer(self.output.as_ptr()) }
    }
}

/// Timestamp rewrite shared by both writer kinds. View writers rescale to
/// the output time base; record writers additionally rebase each input's
/// PTS to zero and leave DTS to the muxer. Output DTS is repaired to stay
/// strictly increasing and PTS never falls below DTS.
pub(crate) fn rewrite_timestamps(
    kind: WriterKind,
    p: *mut ffmpeg_sys_next::AVPacket,
    in_time_base: AVRational,
    out_time_base: AVRational,
    first_pts: &mut i64,
    last_dts: &mut i64,
) {
    unsafe {
        match kind {
            WriterKind::View => {
                av_packet_rescale_ts(p, in_time_base, out_time_base);
            }
            WriterKind::Record => {
                // timestamps already synthesized from the wall clock pass
                // through untouched
                let synthesized =
                    (*p).pts >= 0 && (*p).dts == AV_NOPTS_VALUE && (*p).duration == 0;
                if !synthesized {
                    rescale_remux(p, in_time_base, out_time_base);
                    if *first_pts == -1 {
                        *first_pts = (*p).pts;
                    }
                    (*p).pts -= *first_pts;
                    (*p).dts = AV_NOPTS_VALUE;
                    if (*p).pts < 0 {
                        (*p).pts = 0;
                    }
                }
            }
        }

        if (*p).dts != AV_NOPTS_VALUE && (*p).dts <= *last_dts {
            (*p).dts = *last_dts + 1;
        }
        if (*p).dts != AV_NOPTS_VALUE && (*p).pts < (*p).dts {
            (*p).pts = (*p).dts;
        }
        *last_dts = (*p).dts;
    }
}

/// A compatible audio codec for the writer's container: `Unknown` when the
/// source audio already satisfies normal compliance (no switch needed),
/// otherwise the first of `{ac3, mp2, mp3, aac}` the muxer accepts under
/// experimental compliance.
pub fn alternate_proper_audio_codec(
    output: &OutputContext,
    snapshot: &StreamSnapshot,
) -> Codec {
    unsafe {
        let oformat = (*output.as_ptr()).oformat;
        for info in snapshot.streams.iter() {
            if !matches!(info.kind, MediaKind::Audio) {
                continue;
            }
            if ffmpeg_sys_next::avformat_query_codec(oformat, info.codec_id, FF_COMPLIANCE_NORMAL)
                == 1
            {
                return Codec::Unknown;
            }
        }
        for codec in [Codec::Ac3, Codec::Mp2, Codec::Mp3, Codec::Aac] {
            let Some(id) = encoder_codec_id(codec) else {
                continue;
            };
            if ffmpeg_sys_next::avformat_query_codec(oformat, id, FF_COMPLIANCE_EXPERIMENTAL) == 1 {
                return codec;
            }
        }
    }
    Codec::Unknown
}

/// Bounded handoff between the dispatching source thread and a writer
/// thread. Producers drop on overflow; consumers block on the condvar.
pub struct PacketQueue {
    inner: Mutex<VecDeque<Packet>>,
    cond: Condvar,
    capacity: usize,
    closed: AtomicBool,
}

impl PacketQueue {
    pub const DEFAULT_CAPACITY: usize = 256;

    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            capacity,
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueues a packet, silently dropping it when the queue is full.
    pub fn push(&self, pkt: Packet) {
        {
            let mut q = self.inner.lock();
            if q.len() < self.capacity {
                q.push_back(pkt);
            }
        }
        self.cond.notify_all();
    }

    /// Blocks until a packet is available or the queue is closed. `None`
    /// means closed and drained.
    pub fn wait_pop(&self) -> Option<Packet> {
        let mut q = self.inner.lock();
        loop {
            if let Some(pkt) = q.pop_front() {
                return Some(pkt);
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            self.cond.wait(&mut q);
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn make_packet(stream: i32, pts: i64) -> Packet {
        let mut pkt = Packet::new();
        unsafe {
            let p = pkt.as_mut_ptr();
            (*p).stream_index = stream;
            (*p).pts = pts;
            (*p).dts = pts;
        }
        pkt
    }

    #[test]
    fn queue_drops_on_overflow() {
        let q = PacketQueue::new(2);
        q.push(make_packet(0, 1));
        q.push(make_packet(0, 2));
        q.push(make_packet(0, 3)); // dropped
        assert_eq!(q.wait_pop().unwrap().pts(), 1);
        assert_eq!(q.wait_pop().unwrap().pts(), 2);
        q.close();
        assert!(q.wait_pop().is_none());
    }

    #[test]
    fn queue_close_unblocks_waiter() {
        let q = Arc::new(PacketQueue::new(4));
        let q2 = q.clone();
        let t = std::thread::spawn(move || q2.wait_pop());
        std::thread::sleep(Duration::from_millis(50));
        q.close();
        assert!(t.join().unwrap().is_none());
    }

    const TB: AVRational = AVRational { num: 1, den: 90_000 };

    #[test]
    fn view_rewrite_is_idempotent_for_monotonic_streams() {
        let mut first_pts = -1i64;
        let mut last_dts = -1i64;
        for ts in [0i64, 3000, 6000, 9000] {
            let mut pkt = make_packet(0, ts);
            rewrite_timestamps(
                WriterKind::View,
                pkt.as_mut_ptr(),
                TB,
                TB,
                &mut first_pts,
                &mut last_dts,
            );
            // same time base, already monotonic: nothing to repair
            assert_eq!(pkt.pts(), ts);
            assert_eq!(pkt.dts(), ts);
        }
    }

    #[test]
    fn dts_stays_strictly_increasing_and_pts_at_least_dts() {
        let mut first_pts = -1i64;
        let mut last_dts = -1i64;

        let mut pkt = make_packet(0, 100);
        rewrite_timestamps(
            WriterKind::View,
            pkt.as_mut_ptr(),
            TB,
            TB,
            &mut first_pts,
            &mut last_dts,
        );
        assert_eq!(pkt.dts(), 100);

        // a repeated dts is repaired to last + 1
        let mut pkt = make_packet(0, 100);
        rewrite_timestamps(
            WriterKind::View,
            pkt.as_mut_ptr(),
            TB,
            TB,
            &mut first_pts,
            &mut last_dts,
        );
        assert_eq!(pkt.dts(), 101);
        assert!(pkt.pts() >= pkt.dts());

        // a backwards dts is repaired too
        let mut pkt = make_packet(0, 50);
        rewrite_timestamps(
            WriterKind::View,
            pkt.as_mut_ptr(),
            TB,
            TB,
            &mut first_pts,
            &mut last_dts,
        );
        assert_eq!(pkt.dts(), 102);
        assert!(pkt.pts() >= pkt.dts());
    }

    #[test]
    fn record_rewrite_rebases_to_zero() {
        let mut first_pts = -1i64;
        let mut last_dts = -1i64;

        let mut pkt = make_packet(0, 5000);
        unsafe { (*pkt.as_mut_ptr()).duration = 10 };
        rewrite_timestamps(
            WriterKind::Record,
            pkt.as_mut_ptr(),
            TB,
            TB,
            &mut first_pts,
            &mut last_dts,
        );
        // first packet starts the file at zero, dts left for the muxer
        assert_eq!(pkt.pts(), 0);
        assert_eq!(pkt.dts(), AV_NOPTS_VALUE);

        let mut pkt = make_packet(0, 8000);
        unsafe { (*pkt.as_mut_ptr()).duration = 10 };
        rewrite_timestamps(
            WriterKind::Record,
            pkt.as_mut_ptr(),
            TB,
            TB,
            &mut first_pts,
            &mut last_dts,
        );
        assert_eq!(pkt.pts(), 3000);
    }
}
