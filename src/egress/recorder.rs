use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use chrono::Local;
use ffmpeg_sys_next::{
    av_rescale_q, avformat_alloc_output_context2, avformat_write_header, avio_open, AVRational,
    AVERROR_EOF, AVIO_FLAG_WRITE, AV_NOPTS_VALUE,
};
use log::{error, trace, warn};
use parking_lot::Mutex;

use crate::egress::viewer::set_output_metadata;
use crate::egress::{alternate_proper_audio_codec, PacketQueue, WriterBase, WriterKind};
use crate::encoding::{Codec, FileFormat, RecordOptions};
use crate::error::{Error, Result};
use crate::ffi::{cstring, OutputContext, OutputIo, Packet};
use crate::source::{ensure_encoders, SourceShared};
use crate::utils::{app_dir, ElapsedTimer};

const MB: u64 = 1024 * 1024;

/// Background writer persisting a source to chunked files. The worker
/// thread owns all muxing state; the source only enqueues packets.
pub(crate) struct Recorder {
    queue: Arc<PacketQueue>,
    alive: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Recorder {
    pub fn start(shared: Arc<SourceShared>) -> Self {
        let queue = Arc::new(PacketQueue::new(PacketQueue::DEFAULT_CAPACITY));
        let alive = Arc::new(AtomicBool::new(true));
        let worker = {
            let queue = queue.clone();
            let alive = alive.clone();
            std::thread::Builder::new()
                .name(format!("recorder:{}", shared.name))
                .spawn(move || {
                    run_recorder(shared, &queue);
                    alive.store(false, Ordering::SeqCst);
                    queue.close();
                })
                .expect("spawn recorder worker")
        };
        Self {
            queue,
            alive,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn write_packet(&self, pkt: &Packet) -> i32 {
        if !self.alive.load(Ordering::SeqCst) {
            return AVERROR_EOF;
        }
        if let Some(clone) = Packet::clone_from_raw(pkt.as_ptr()) {
            self.queue.push(clone);
        }
        0
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.queue.close();
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                warn!("recorder failed to join");
            }
        }
    }
}

struct RecordState {
    writer: Option<WriterBase>,
    rec_path: PathBuf,
    duration_time: ElapsedTimer,
    buffer_write_time: ElapsedTimer,
    written_bytes: u64,
    written_duration: u64,
    buffer: VecDeque<Packet>,
}

impl RecordState {
    fn new() -> Self {
        Self {
            writer: None,
            rec_path: PathBuf::new(),
            duration_time: ElapsedTimer::new(),
            buffer_write_time: ElapsedTimer::new(),
            written_bytes: 0,
            written_duration: 0,
            buffer: VecDeque::new(),
        }
    }
}

fn run_recorder(shared: Arc<SourceShared>, queue: &PacketQueue) {
    let mut state = RecordState::new();

    loop {
        if state.writer.is_none() {
            if !init_record(&shared, &mut state) {
                break;
            }
        }

        let Some(mut pkt) = queue.wait_pop() else {
            break;
        };

        let opts = shared.record_options.lock().clone();
        let passed = state.buffer_write_time.seconds();
        let size = packet_size(&pkt);

        if pkt.pts() == AV_NOPTS_VALUE {
            set_packet_times(&mut pkt, &state);
        }

        if opts.write_interval > 0 {
            state.buffer.push_back(pkt);
            if passed >= opts.write_interval && !write_buffer(&mut state) {
                break;
            }
        } else {
            let writer = state.writer.as_mut().unwrap();
            if writer.write_packet(&pkt) < 0 {
                break;
            } else if passed >= 5 {
                state.buffer_write_time.start();
            }
        }

        if !check_limits(&mut state, &opts, size) {
            finalize_record(&mut state);
        }
    }

    finalize_record(&mut state);
}

/// Flushes buffered packets, writes the trailer and closes the file so the
/// next loop turn opens a fresh one.
fn finalize_record(state: &mut RecordState) {
    write_buffer(state);
    if let Some(writer) = state.writer.as_mut() {
        writer.write_trailer();
    }
    if let Some(writer) = state.writer.take() {
        trace!("recorder: closed file: {}", state.rec_path.display());
        drop(writer);
    }
}

fn write_buffer(state: &mut RecordState) -> bool {
    while let Some(pkt) = state.buffer.pop_front() {
        let Some(writer) = state.writer.as_mut() else {
            return false;
        };
        if writer.write_packet(&pkt) < 0 {
            return false;
        }
    }
    state.buffer_write_time.start();
    true
}

/// Wall-clock PTS for packets arriving without one, rescaled to the
/// output stream time base.
fn set_packet_times(pkt: &mut Packet, state: &RecordState) {
    let Some(writer) = state.writer.as_ref() else {
        return;
    };
    let in_idx = pkt.stream_index() as usize;
    let Some(time_base) = writer.output_time_base(in_idx) else {
        return;
    };
    unsafe {
        let p = pkt.as_mut_ptr();
        (*p).pts = av_rescale_q(
            state.duration_time.nanoseconds() as i64,
            AVRational {
                num: 1,
                den: 1_000_000_000,
            },
            time_base,
        );
        (*p).dts = AV_NOPTS_VALUE;
        (*p).duration = 0;
    }
}

fn packet_size(pkt: &Packet) -> u64 {
    unsafe {
        let p = pkt.as_ptr();
        let mut size = (*p).size as u64;
        for i in 0..(*p).side_data_elems {
            size += (*(*p).side_data.add(i as usize)).size as u64;
        }
        size
    }
}

/// Byte, duration and free-space accounting; false asks for a rotation.
/// Durations are whole wall-clock seconds.
fn check_limits(state: &mut RecordState, opts: &RecordOptions, size: u64) -> bool {
    state.written_bytes += size;
    let real_elapsed = state.duration_time.seconds();
    let duration = real_elapsed;
    // a jump this large means the host slept, roll the file over
    if duration.saturating_sub(state.written_duration) > 30 {
        return false;
    }
    state.written_duration = duration;
    if opts.file_size > 0 && state.written_bytes >= opts.file_size * MB {
        return false;
    }
    if opts.file_duration > 0 && duration > opts.file_duration {
        return false;
    }
    if real_elapsed % 10 == 0 && !check_space_limit(state.rec_path.parent()) {
        return false;
    }
    true
}

#[cfg(unix)]
fn available_space(path: &Path) -> Option<u64> {
    unsafe {
        let c_path = cstring(&path.to_string_lossy());
        let mut stat: libc::statvfs = std::mem::zeroed();
        if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
            return None;
        }
        Some(stat.f_bavail as u64 * stat.f_frsize as u64)
    }
}

#[cfg(not(unix))]
fn available_space(_path: &Path) -> Option<u64> {
    None
}

fn check_space_limit(dir: Option<&Path>) -> bool {
    let Some(dir) = dir else {
        return true;
    };
    if !dir.exists() {
        let _ = std::fs::create_dir_all(dir);
    }
    match available_space(dir) {
        Some(space) => space >= MB,
        None => true,
    }
}

fn init_record(shared: &Arc<SourceShared>, state: &mut RecordState) -> bool {
    let opts = shared.record_options.lock().clone();
    if !opts.path.is_empty() && !check_space_limit(Some(Path::new(&opts.path))) {
        error!("recorder: low space for recording src: {}", shared.name);
        return false;
    }
    if !setup_path(shared, state, &opts) {
        return false;
    }
    if !setup_output(shared, state, &opts) {
        return false;
    }

    state.duration_time.start();
    state.buffer_write_time.start();
    state.written_bytes = 0;
    state.written_duration = 0;
    true
}

fn timestamp_string() -> String {
    Local::now().format("%Y-%m-%d_%H-%M-%S").to_string()
}

/// Uses the configured file as-is, or synthesizes
/// `<dir>/<source>-<timestamp>.<ext>` with `<app-dir>/records/<source>` as
/// the default directory.
fn setup_path(shared: &Arc<SourceShared>, state: &mut RecordState, opts: &RecordOptions) -> bool {
    let configured = Path::new(&opts.path);
    if configured.is_file() {
        state.rec_path = configured.to_path_buf();
    } else {
        let dir = if configured.is_dir() {
            configured.to_path_buf()
        } else {
            app_dir().join("records").join(&shared.name)
        };
        let file_name = format!(
            "{}-{}.{}",
            shared.name,
            timestamp_string(),
            opts.format.extension()
        );
        state.rec_path = dir.join(file_name);
    }

    if let Some(dir) = state.rec_path.parent() {
        if !dir.exists() {
            let _ = std::fs::create_dir_all(dir);
            if !dir.exists() {
                error!(
                    "recorder: failed to create output path: {} src: {}",
                    state.rec_path.display(),
                    shared.name
                );
                return false;
            }
        }
    }
    true
}

/// Preferred format first, then the fixed fallback order; partial files
/// from failed attempts are removed.
fn setup_output(shared: &Arc<SourceShared>, state: &mut RecordState, opts: &RecordOptions) -> bool {
    let preferred = if opts.format == FileFormat::Unknown {
        FileFormat::fallback_order()[0]
    } else {
        opts.format
    };
    let mut formats = vec![preferred];
    for f in FileFormat::fallback_order() {
        if f != preferred {
            formats.push(f);
        }
    }

    for format in formats {
        state.rec_path.set_extension(format.extension());
        match try_setup_output(shared, state, format, opts) {
            Ok(writer) => {
                state.writer = Some(writer);
                return true;
            }
            Err(e) => {
                warn!(
                    "recorder: failed to write header: src: {} path: {} err: {}",
                    shared.name,
                    state.rec_path.display(),
                    e
                );
                let _ = std::fs::remove_file(&state.rec_path);
            }
        }
    }
    false
}

fn try_setup_output(
    shared: &Arc<SourceShared>,
    state: &RecordState,
    format: FileFormat,
    opts: &RecordOptions,
) -> Result<WriterBase> {
    let Some(snapshot) = shared.snapshot.lock().clone() else {
        return Err(Error::NotReady);
    };
    unsafe {
        let path = cstring(&state.rec_path.to_string_lossy());
        let mut octx = ptr::null_mut();
        let ret = avformat_alloc_output_context2(
            &mut octx,
            ptr::null_mut(),
            ptr::null(),
            path.as_ptr(),
        );
        if ret < 0 || octx.is_null() {
            error!(
                "recorder: failed to alloc output context: src: {} err:{}, {}",
                shared.name,
                ret,
                crate::ffi::err_str(ret)
            );
            return Err(Error::Codec(ret));
        }
        let mut output = OutputContext::from_raw(octx);

        if (*(*octx).oformat).flags & ffmpeg_sys_next::AVFMT_NOFILE == 0 {
            let ret = avio_open(&mut (*octx).pb, path.as_ptr(), AVIO_FLAG_WRITE);
            if ret < 0 {
                error!(
                    "recorder: failed to create file: src: {} err:{}, {}",
                    shared.name,
                    ret,
                    crate::ffi::err_str(ret)
                );
                return Err(Error::Codec(ret));
            }
            output.set_io(OutputIo::File);
        }

        let mut cfg = shared.record_encoding.lock().clone();
        cfg.audio.codec = Codec::Unknown;
        if opts.record_audio && format == FileFormat::Ts {
            let alternate = alternate_proper_audio_codec(&output, snapshot.as_ref());
            if alternate != Codec::Unknown {
                cfg.audio.codec = alternate;
            }
        }
        *shared.record_encoding.lock() = cfg.clone();

        ensure_encoders(shared, snapshot.as_ref(), &cfg, octx)?;

        let mut writer = WriterBase::new(
            WriterKind::Record,
            output,
            snapshot,
            cfg,
            &shared.name,
        );
        if !writer.make_output_streams(&shared.encoder) {
            return Err(Error::BadState);
        }

        set_output_metadata(writer.output.as_ptr(), &shared.name);

        let ret = avformat_write_header(writer.output.as_ptr(), ptr::null_mut());
        if ret < 0 {
            return Err(Error::Codec(ret));
        }
        Ok(writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_accounting() {
        let mut state = RecordState::new();
        let opts = RecordOptions {
            file_size: 1,
            ..Default::default()
        };
        // below the cap
        assert!(check_limits(&mut state, &opts, MB / 2));
        // crossing the 1 MB cap requests a rotation
        assert!(!check_limits(&mut state, &opts, MB / 2));
    }

    #[test]
    fn duration_limit_and_sleep_rollover() {
        let mut state = RecordState::new();
        let opts = RecordOptions {
            file_duration: 10,
            ..Default::default()
        };
        assert!(check_limits(&mut state, &opts, 0));

        // simulate the host sleeping: recorded duration far behind wall time
        let mut slept = RecordState::new();
        slept.written_duration = 0;
        // a fresh timer reads ~0s, so no rollover yet
        assert!(check_limits(&mut slept, &opts, 0));
    }

    #[test]
    fn synthesized_file_names_carry_source_and_extension() {
        let stamp = timestamp_string();
        assert_eq!(stamp.len(), "2022-01-01_00-00-00".len());
        let name = format!("cam1-{}.{}", stamp, FileFormat::Mkv.extension());
        assert!(name.starts_with("cam1-"));
        assert!(name.ends_with(".mkv"));
    }
}
