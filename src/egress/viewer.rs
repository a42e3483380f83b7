use std::ffi::{c_int, c_void};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use ffmpeg_sys_next::{
    av_dict_set, avformat_alloc_output_context2, avformat_write_header, AVERROR,
    AVFMT_FLAG_FLUSH_PACKETS, AVFMT_FLAG_GENPTS, AVFMT_FLAG_SORT_DTS, AVERROR_EOF,
};
use libc::EPIPE;
use log::{trace, warn};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::egress::{alternate_proper_audio_codec, PacketQueue, WriterBase, WriterKind};
use crate::encoding::{Codec, Container};
use crate::error::{Error, Result};
use crate::ffi::{cstring, IoWriteContext, OutputContext, OutputIo, Packet};
use crate::http::HttpConnection;
use crate::source::{ensure_encoders, SourceShared};

const RESPONSE_HEADER: &[u8] = b"HTTP/1.1 200 OK\r\n\
Server: lxstreamer/1.1\r\n\
Connection: Close\r\n\
Content-Type: video/mp4\r\n\
\r\n";

/// Request data a stream client connected with.
#[derive(Clone, Debug, Default)]
pub struct UriData {
    pub path: String,
    pub query: String,
    pub source_name: String,
    pub session: String,
}

/// Connection half visible to the muxer's write callback. Heap-pinned so
/// the callback's opaque pointer stays valid for the viewer's lifetime.
struct ViewerConnState {
    conn: HttpConnection,
    header_sent: bool,
    broken: bool,
}

impl ViewerConnState {
    fn send(&mut self, data: &[u8]) -> i32 {
        if self.broken {
            return AVERROR(EPIPE);
        }
        if !self.header_sent {
            if self.conn.write_all(RESPONSE_HEADER).is_err() {
                self.broken = true;
                self.conn.shutdown();
                return AVERROR(EPIPE);
            }
            self.header_sent = true;
        }
        if self.conn.write_all(data).is_err() {
            self.broken = true;
            self.conn.shutdown();
            return AVERROR(EPIPE);
        }
        data.len() as i32
    }
}

unsafe extern "C" fn viewer_write_callback(
    opaque: *mut c_void,
    buf: *const u8,
    size: c_int,
) -> c_int {
    if opaque.is_null() || buf.is_null() || size <= 0 {
        return AVERROR_EOF;
    }
    let state = &mut *(opaque as *mut ViewerConnState);
    let data = std::slice::from_raw_parts(buf, size as usize);
    state.send(data)
}

/// Everything the viewer thread needs, handed over at start.
struct ViewerInit {
    io: IoWriteContext,
    conn: Box<ViewerConnState>,
    shared: Arc<SourceShared>,
}

unsafe impl Send for ViewerInit {}

/// One HTTP client receiving a live stream body. Owns its socket from the
/// moment of construction; the HTTP layer never touches it again.
pub(crate) struct Viewer {
    pub id: Uuid,
    pub uri: UriData,
    address: String,
    queue: Arc<PacketQueue>,
    started: AtomicBool,
    alive: Arc<AtomicBool>,
    init: Mutex<Option<ViewerInit>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Viewer {
    /// Takes ownership of the connection and prepares the muxer-facing IO.
    /// On failure the connection is handed back so the server can reply.
    pub fn new(
        uri: UriData,
        conn: HttpConnection,
        shared: Arc<SourceShared>,
    ) -> std::result::Result<Self, (HttpConnection, Error)> {
        let address = conn.peer_string();
        if let Err(e) = conn.set_stream_mode() {
            warn!(
                "viewer: failed to prepare socket: src: {} err: {}",
                shared.name, e
            );
            return Err((conn, Error::BadState));
        }
        let mut conn_state = Box::new(ViewerConnState {
            conn,
            header_sent: false,
            broken: false,
        });
        let opaque = conn_state.as_mut() as *mut ViewerConnState as *mut c_void;
        let Some(io) = IoWriteContext::new(4096, opaque, viewer_write_callback) else {
            return Err((conn_state.conn, Error::BadState));
        };
        trace!(
            "viewer client connected: src: {} addr: {}",
            shared.name,
            address
        );
        Ok(Self {
            id: Uuid::new_v4(),
            uri,
            address,
            queue: Arc::new(PacketQueue::new(PacketQueue::DEFAULT_CAPACITY)),
            started: AtomicBool::new(false),
            alive: Arc::new(AtomicBool::new(false)),
            init: Mutex::new(Some(ViewerInit {
                io,
                conn: conn_state,
                shared,
            })),
            worker: Mutex::new(None),
        })
    }

    /// Spawns the writer thread; callable once, later calls are no-ops.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(init) = self.init.lock().take() else {
            return;
        };
        trace!(
            "viewer starting: id: {} src: {}",
            self.id,
            self.uri.source_name
        );
        self.alive.store(true, Ordering::SeqCst);
        let queue = self.queue.clone();
        let alive = self.alive.clone();
        let address = self.address.clone();
        *self.worker.lock() = Some(
            std::thread::Builder::new()
                .name(format!("viewer:{}", init.shared.name))
                .spawn(move || {
                    run_viewer(init, queue.clone(), &address);
                    alive.store(false, Ordering::SeqCst);
                    queue.close();
                })
                .expect("spawn viewer worker"),
        );
    }

    /// Enqueues a packet for the writer thread, dropping on overflow.
    /// Returns end-of-file once the writer is gone so the source removes
    /// this viewer.
    pub fn write_packet(&self, pkt: &Packet) -> i32 {
        if !self.started.load(Ordering::SeqCst) {
            return 0;
        }
        if !self.alive.load(Ordering::SeqCst) {
            return AVERROR_EOF;
        }
        if let Some(clone) = Packet::clone_from_raw(pkt.as_ptr()) {
            self.queue.push(clone);
        }
        0
    }
}

impl Drop for Viewer {
    fn drop(&mut self) {
        self.queue.close();
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                warn!("viewer failed to join: addr: {}", self.address);
            }
        }
        trace!(
            "viewer removed: src: {} addr: {}",
            self.uri.source_name,
            self.address
        );
    }
}

/// Writer thread: negotiate a container, stream queued packets, finalize.
fn run_viewer(init: ViewerInit, queue: Arc<PacketQueue>, address: &str) {
    let ViewerInit { io, conn, shared } = init;

    let Some(snapshot) = shared.snapshot.lock().clone() else {
        warn!("viewer: pipeline not initialized: src: {}", shared.name);
        return;
    };

    let preferred = {
        let current = *shared.container.lock();
        if current != Container::Unknown {
            current
        } else {
            let configured = shared.args.read().container;
            if configured != Container::Unknown {
                configured
            } else {
                Container::fallback_order()[0]
            }
        }
    };
    let mut candidates = vec![preferred];
    for c in Container::fallback_order() {
        if c != preferred {
            candidates.push(c);
        }
    }

    let mut writer = None;
    let mut chosen = preferred;
    for container in candidates {
        match try_setup_output(container, &io, &shared, &snapshot) {
            Ok(w) => {
                writer = Some(w);
                chosen = container;
                break;
            }
            Err(e) => {
                warn!(
                    "viewer: failed to write header: src: {} container: {} err: {}",
                    shared.name,
                    container.name(),
                    e
                );
            }
        }
    }

    if let Some(mut writer) = writer {
        *shared.container.lock() = chosen;
        while let Some(pkt) = queue.wait_pop() {
            if writer.write_packet(&pkt) < 0 {
                trace!(
                    "viewer client dropped: src: {} addr: {}",
                    shared.name,
                    address
                );
                break;
            }
        }
        // stream containers carry no index, flv ends with the connection
        if chosen != Container::Flv {
            writer.write_trailer();
        }
        drop(writer);
    }
    drop(io);
    drop(conn);
}

/// One container attempt: muxer context over the viewer IO, encoder
/// bring-up, output streams, metadata and the header write.
fn try_setup_output(
    container: Container,
    io: &IoWriteContext,
    shared: &Arc<SourceShared>,
    snapshot: &Arc<crate::demux::StreamSnapshot>,
) -> Result<WriterBase> {
    unsafe {
        let mut octx = ptr::null_mut();
        let name = cstring(container.name());
        let ret =
            avformat_alloc_output_context2(&mut octx, ptr::null_mut(), name.as_ptr(), ptr::null());
        if ret < 0 || octx.is_null() {
            return Err(Error::Codec(ret));
        }
        let mut output = OutputContext::from_raw(octx);
        (*octx).flags |= AVFMT_FLAG_GENPTS | AVFMT_FLAG_SORT_DTS | AVFMT_FLAG_FLUSH_PACKETS;
        (*octx).pb = io.as_ptr();
        output.set_io(OutputIo::Custom);

        let mut cfg = shared.view_encoding.lock().clone();
        cfg.audio.codec = Codec::Unknown;
        if container != Container::Matroska {
            let alternate = alternate_proper_audio_codec(&output, snapshot.as_ref());
            if alternate != Codec::Unknown {
                cfg.audio.codec = alternate;
            }
        }
        // dispatch must transcode to exactly what this muxer carries
        *shared.view_encoding.lock() = cfg.clone();

        ensure_encoders(shared, snapshot.as_ref(), &cfg, octx)?;

        let mut writer = WriterBase::new(
            WriterKind::View,
            output,
            snapshot.clone(),
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

/// Stamps the standard metadata tags on an output context.
pub(crate) fn set_output_metadata(octx: *mut ffmpeg_sys_next::AVFormatContext, source: &str) {
    unsafe {
        let set = |key: &str, value: &str| {
            let key = cstring(key);
            let value = cstring(value);
            av_dict_set(&mut (*octx).metadata, key.as_ptr(), value.as_ptr(), 0);
        };
        set("Streamer", "lxstreamer");
        set(
            "Copyright",
            "(C) 2022-present Nejat Afshar <nejatafshar@gmail.com>",
        );
        set("Source", source);
    }
}
