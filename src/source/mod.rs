use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use ffmpeg_sys_next::{AVERROR, AVERROR_EOF, AVFormatContext};
use libc::EAGAIN;
use log::{error, info, trace, warn};
use parking_lot::{Mutex, RwLock};

use crate::decode::Decoder;
use crate::demux::{DemuxData, Demuxer, InterruptHandler, SpeedControl, StreamSnapshot};
use crate::egress::recorder::Recorder;
use crate::egress::viewer::Viewer;
use crate::encode::{init_resolution, EncoderDeps, EncoderPool};
use crate::encoding::{Codec, Container, EncoderConfig, RecordOptions, SourceArgs};
use crate::error::{Error, Result};
use crate::ffi::Packet;
use crate::resample::Resampler;
use crate::scale::Scaler;
use crate::transcode::Transcoder;
use crate::utils::ElapsedTimer;

const DEMUX_TIMEOUT: Duration = Duration::from_secs(20);
const IDLE_SLEEP: Duration = Duration::from_secs(2);
const VIEWLESS_STALL_SECS: u64 = 30;

pub(crate) struct WriteTargets {
    pub viewers: Vec<Viewer>,
    pub recorder: Option<Recorder>,
}

/// State of one source shared between its worker, writer threads, the HTTP
/// layer and the public API. Viewers and the recorder are only touched
/// under the `targets` lock; demux state stays private to the worker and is
/// commanded through atomics.
pub(crate) struct SourceShared {
    pub name: String,
    pub args: RwLock<SourceArgs>,
    pub running: AtomicBool,
    pub demuxing: AtomicBool,
    pub recording: AtomicBool,
    pub demuxer_initialized: AtomicBool,
    pub is_webcam: AtomicBool,
    pub record_options: Mutex<RecordOptions>,
    pub seek_time: AtomicI64,
    pub speed: SpeedControl,
    pub interrupt: Arc<InterruptHandler>,
    pub container: Mutex<Container>,
    pub view_encoding: Mutex<EncoderConfig>,
    pub record_encoding: Mutex<EncoderConfig>,
    pub snapshot: Mutex<Option<Arc<StreamSnapshot>>>,
    pub decoder: Mutex<Decoder>,
    pub encoder: EncoderPool,
    pub targets: Mutex<WriteTargets>,
}

impl SourceShared {
    fn new(args: SourceArgs) -> Self {
        let name = args.name.clone();
        Self {
            encoder: EncoderPool::new(&name),
            name,
            args: RwLock::new(args),
            running: AtomicBool::new(false),
            demuxing: AtomicBool::new(false),
            recording: AtomicBool::new(false),
            demuxer_initialized: AtomicBool::new(false),
            is_webcam: AtomicBool::new(false),
            record_options: Mutex::new(RecordOptions::default()),
            seek_time: AtomicI64::new(-1),
            speed: SpeedControl::new(),
            interrupt: Arc::new(InterruptHandler::new(DEMUX_TIMEOUT)),
            container: Mutex::new(Container::Unknown),
            view_encoding: Mutex::new(EncoderConfig::default()),
            record_encoding: Mutex::new(EncoderConfig::default()),
            snapshot: Mutex::new(None),
            decoder: Mutex::new(Decoder::new()),
            targets: Mutex::new(WriteTargets {
                viewers: Vec::new(),
                recorder: None,
            }),
        }
    }
}

/// Initializes the decoders an encoding set needs and opens its encoders
/// against `octx`. Used by viewer and recorder setup.
pub(crate) fn ensure_encoders(
    shared: &Arc<SourceShared>,
    snapshot: &StreamSnapshot,
    cfg: &EncoderConfig,
    octx: *mut AVFormatContext,
) -> Result<()> {
    let is_webcam = shared.is_webcam.load(Ordering::Relaxed);
    if cfg.video.is_valid() {
        if let Some(info) = snapshot.video() {
            if let Err(e) = shared.decoder.lock().initialize(info) {
                warn!("failed to open video decoder: src: {} err: {}", shared.name, e);
            }
        }
        let deps = EncoderDeps {
            video: shared.decoder.lock().video_params(),
            audio: None,
            is_webcam,
        };
        shared.encoder.initialize(&cfg.video, octx, &deps)?;
    }
    if cfg.audio.is_valid() {
        if let Some(info) = snapshot.audio() {
            if let Err(e) = shared.decoder.lock().initialize(info) {
                warn!("failed to open audio decoder: src: {} err: {}", shared.name, e);
            }
        }
        let deps = EncoderDeps {
            video: None,
            audio: shared.decoder.lock().audio_params(),
            is_webcam,
        };
        shared.encoder.initialize(&cfg.audio, octx, &deps)?;
    }
    Ok(())
}

/// A named input pipeline: owns the worker thread that demuxes the source
/// and fans packets out to viewers and the recorder.
pub(crate) struct Source {
    pub shared: Arc<SourceShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Source {
    pub fn new(args: SourceArgs) -> Self {
        Self {
            shared: Arc::new(SourceShared::new(args)),
            worker: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    pub fn auth_session(&self) -> String {
        self.shared.args.read().auth_session.clone()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Launches the worker thread. The worker idles until demuxing or
    /// recording is requested, then runs the pipeline to completion and
    /// retries after two seconds.
    pub fn start(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        self.shared.running.store(true, Ordering::SeqCst);
        self.started.store(true, Ordering::SeqCst);
        let shared = self.shared.clone();
        let name = shared.name.clone();
        *worker = Some(
            std::thread::Builder::new()
                .name(format!("source:{}", name))
                .spawn(move || {
                    while shared.running.load(Ordering::SeqCst) {
                        if shared.demuxing.load(Ordering::SeqCst)
                            || shared.recording.load(Ordering::SeqCst)
                        {
                            run_pipeline(&shared);
                        }
                        let slept = Instant::now();
                        while shared.running.load(Ordering::SeqCst)
                            && slept.elapsed() < IDLE_SLEEP
                        {
                            std::thread::sleep(Duration::from_millis(100));
                        }
                    }
                })
                .expect("spawn source worker"),
        );
    }

    pub fn start_recording(&self, options: RecordOptions) -> Result<()> {
        if self.shared.recording.load(Ordering::SeqCst) {
            return Err(Error::AlreadyDone);
        }
        *self.shared.record_options.lock() = options;
        self.shared.recording.store(true, Ordering::SeqCst);
        self.shared.demuxing.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn stop_recording(&self) -> Result<()> {
        if !self.shared.recording.load(Ordering::SeqCst) {
            return Err(Error::AlreadyDone);
        }
        self.shared.recording.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub fn seek(&self, time: i64) {
        self.shared.seek_time.store(time, Ordering::SeqCst);
    }

    pub fn set_speed(&self, speed: f64) {
        self.shared.speed.set(speed);
    }

    /// Inserts a viewer under the targets lock. If the pipeline is already
    /// up the viewer starts immediately, otherwise it starts from the
    /// pipeline-open callback.
    pub fn add_viewer(&self, viewer: Viewer) {
        let shared = &self.shared;
        let mut targets = shared.targets.lock();
        if shared.demuxing.load(Ordering::SeqCst)
            && shared.demuxer_initialized.load(Ordering::SeqCst)
        {
            viewer.start();
        }
        targets.viewers.push(viewer);
        shared.demuxing.store(true, Ordering::SeqCst);
    }
}

impl Drop for Source {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.demuxing.store(false, Ordering::SeqCst);
        self.shared.interrupt.stop();
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                warn!("source failed to join: src: {}", self.shared.name);
            }
        }
        let mut targets = self.shared.targets.lock();
        targets.viewers.clear();
        targets.recorder = None;
    }
}

/// One demuxer run: open, discover, dispatch until stopped, tear down.
fn run_pipeline(shared: &Arc<SourceShared>) {
    let args = shared.args.read().clone();
    let mut demuxer = match Demuxer::open(&args, &shared.interrupt) {
        Ok(d) => d,
        Err(e) => {
            error!("failed to open stream: src: {} err: {}", shared.name, e);
            return;
        }
    };
    shared
        .is_webcam
        .store(demuxer.is_webcam, Ordering::Relaxed);

    let mut demux_data = DemuxData::new();
    let snapshot = match demuxer.find_info(&mut demux_data) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(
                "failed to find info for streams: src: {} err: {}",
                shared.name, e
            );
            return;
        }
    };
    *shared.snapshot.lock() = Some(snapshot.clone());
    shared.demuxer_initialized.store(true, Ordering::SeqCst);
    on_open(shared, &snapshot);

    let mut scaler = Scaler::new(&shared.name);
    let mut resampler = Resampler::new(&shared.name);
    let mut run_elapsed = ElapsedTimer::new();
    let mut viewless = ElapsedTimer::new();
    let mut result = 0;

    while shared.running.load(Ordering::SeqCst) && shared.demuxing.load(Ordering::SeqCst) {
        if demuxer.is_local {
            let time = shared.seek_time.load(Ordering::Relaxed);
            if time > -1 {
                demuxer.seek_to(time, &mut demux_data);
                shared.seek_time.store(-1, Ordering::Relaxed);
            }
        }

        let time_point = Instant::now();
        if demux_data.should_wait_to_present() {
            std::thread::sleep(Duration::from_millis(5));
            continue;
        }

        let mut pkt = Packet::new();
        let nret = demuxer.read_packet(&mut pkt);
        if nret == 0 {
            if demux_data.on_packet(&mut pkt, shared.speed.get(), &shared.interrupt) {
                on_packet(
                    shared,
                    &pkt,
                    &snapshot,
                    demuxer.is_webcam,
                    &mut scaler,
                    &mut resampler,
                    &mut run_elapsed,
                    &mut viewless,
                );
            }
            if !demux_data.should_present_faster() {
                sleep_until(time_point + Duration::from_millis(2));
            }
        } else if nret == AVERROR(EAGAIN) {
            sleep_until(time_point + Duration::from_millis(5));
        } else {
            if nret == AVERROR_EOF && demuxer.is_local {
                info!("local file reached to end: src: {}", shared.name);
            } else {
                error!(
                    "failed to read packet: src: {} err: {}, {}",
                    shared.name,
                    nret,
                    crate::ffi::err_str(nret)
                );
            }
            result = nret;
            break;
        }
    }

    shared.interrupt.stop();
    info!(
        "finished demuxing: src: {} err: {}",
        shared.name,
        if result == 0 {
            "none".to_string()
        } else {
            crate::ffi::err_str(result)
        }
    );

    {
        let mut targets = shared.targets.lock();
        targets.viewers.clear();
        targets.recorder = None;
    }
    shared.demuxer_initialized.store(false, Ordering::SeqCst);
    *shared.snapshot.lock() = None;
    shared.decoder.lock().reset();
    shared.encoder.reset();
}

fn sleep_until(deadline: Instant) {
    let now = Instant::now();
    if deadline > now {
        std::thread::sleep(deadline - now);
    }
}

/// Seeds the view and record encoding sets from the source arguments once
/// input streams are known, then starts viewers attached while the
/// pipeline was still opening.
fn on_open(shared: &Arc<SourceShared>, snapshot: &StreamSnapshot) {
    let args = shared.args.read().clone();
    let is_webcam = shared.is_webcam.load(Ordering::Relaxed);

    let input_dims = snapshot.video().map(|v| unsafe {
        (
            (*v.params.as_ptr()).width,
            (*v.params.as_ptr()).height,
        )
    });

    let seed = |video_args: &crate::encoding::Encoding,
                audio_args: &crate::encoding::Encoding,
                allow_webcam: bool| {
        let mut cfg = EncoderConfig::default();
        if video_args.is_video() || (allow_webcam && is_webcam) {
            cfg.video.codec = if video_args.codec.is_video() {
                video_args.codec
            } else {
                Codec::H264
            };
            cfg.video.height = video_args.height;
            cfg.video.max_bandwidth = if video_args.max_bandwidth > 0 {
                video_args.max_bandwidth
            } else {
                2000
            };
            cfg.video.frame_rate = video_args.frame_rate;
            if let Some((w, h)) = input_dims {
                init_resolution(&mut cfg.video, w, h);
            }
        }
        if audio_args.is_audio() {
            cfg.audio.codec = audio_args.codec;
            cfg.audio.sample_rate = audio_args.sample_rate;
            cfg.audio.sample_fmt = audio_args.sample_fmt.clone();
            cfg.audio.channel_layout = audio_args.channel_layout.clone();
        }
        cfg
    };

    *shared.view_encoding.lock() = seed(
        &args.video_encoding_view,
        &args.audio_encoding_view,
        true,
    );
    *shared.record_encoding.lock() = seed(
        &args.video_encoding_rec,
        &args.audio_encoding_rec,
        false,
    );

    for viewer in shared.targets.lock().viewers.iter() {
        viewer.start();
    }
}

/// Packet fan-out under the targets lock: recorder first, then every
/// viewer, then the five-second maintenance tick.
#[allow(clippy::too_many_arguments)]
fn on_packet(
    shared: &Arc<SourceShared>,
    pkt: &Packet,
    snapshot: &Arc<StreamSnapshot>,
    is_webcam: bool,
    scaler: &mut Scaler,
    resampler: &mut Resampler,
    run_elapsed: &mut ElapsedTimer,
    viewless: &mut ElapsedTimer,
) {
    let mut targets = shared.targets.lock();
    let is_audio_pkt = pkt.stream_index() == snapshot.audio_index;

    {
        let mut tc = Transcoder::new(
            &shared.decoder,
            &shared.encoder,
            scaler,
            resampler,
            snapshot.as_ref(),
            is_webcam,
            pkt,
            None,
        );

        if shared.recording.load(Ordering::SeqCst) {
            let mut recorder_failed = false;
            if let Some(recorder) = targets.recorder.as_ref() {
                let record_audio = shared.record_options.lock().record_audio;
                if !is_audio_pkt || record_audio {
                    let cfg = shared.record_encoding.lock().clone();
                    let enc = if is_audio_pkt { cfg.audio } else { cfg.video };
                    for p in tc.make_packets(&enc) {
                        if recorder.write_packet(p) < 0 {
                            recorder_failed = true;
                            break;
                        }
                    }
                }
            }
            if recorder_failed {
                // dropped here, rebuilt by the next maintenance tick
                targets.recorder = None;
            }
        }

        let cfg = shared.view_encoding.lock().clone();
        let enc = if is_audio_pkt { cfg.audio } else { cfg.video };
        targets.viewers.retain(|viewer| {
            for p in tc.make_packets(&enc) {
                if viewer.write_packet(p) < 0 {
                    return false;
                }
            }
            true
        });
    }

    if run_elapsed.seconds() > 5 {
        if shared.recording.load(Ordering::SeqCst) {
            let needs_recorder = match targets.recorder.as_ref() {
                None => true,
                Some(r) => !r.is_running(),
            };
            if needs_recorder {
                targets.recorder = Some(Recorder::start(shared.clone()));
            }
        } else if targets.recorder.is_some() {
            targets.recorder = None;
        }

        if targets.viewers.is_empty() {
            if viewless.seconds() > VIEWLESS_STALL_SECS
                && !shared.recording.load(Ordering::SeqCst)
            {
                shared.demuxing.store(false, Ordering::SeqCst);
                trace!(
                    "source stalled due to not having any viewer: src: {}",
                    shared.name
                );
            }
        } else {
            viewless.start();
        }

        shared.encoder.prune();
        resampler.prune();
        run_elapsed.start();
    }
}
