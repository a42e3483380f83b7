//! Light-weight HTTP/HTTPS media streamer: named A/V sources are demuxed on
//! worker threads, transcoded on demand per output encoding, fanned out to
//! any number of stream clients and optionally recorded to chunked files.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::thread::JoinHandle;

use parking_lot::Mutex;

mod decode;
mod demux;
mod egress;
mod encode;
pub mod encoding;
mod error;
mod ffi;
mod http;
mod logging;
mod resample;
mod scale;
mod source;
mod transcode;
mod utils;

pub use encoding::{Codec, Container, Encoding, FileFormat, RecordOptions, SourceArgs};
pub use error::{Error, Result};
pub use log::{Level, LevelFilter};
pub use logging::{set_log_callback, set_log_level, set_log_to_stdout};

use source::Source;

static CODEC_INIT: Once = Once::new();

pub(crate) struct StreamerInner {
    pub port: u16,
    pub https: bool,
    pub running: AtomicBool,
    pub ssl_paths: Mutex<(String, String)>,
    pub sources: Mutex<HashMap<String, Source>>,
}

/// Streaming service facade: a source registry plus the HTTP/HTTPS server
/// answering `GET /stream?source=<name>&session=<token>`.
pub struct Streamer {
    inner: Arc<StreamerInner>,
    server: Mutex<Option<JoinHandle<()>>>,
}

impl Streamer {
    /// Creates a streamer that will listen on `port`, optionally with TLS.
    pub fn new(port: u16, https: bool) -> Self {
        logging::init();
        CODEC_INIT.call_once(|| unsafe {
            ffmpeg_sys_next::avdevice_register_all();
        });
        Self {
            inner: Arc::new(StreamerInner {
                port,
                https,
                running: AtomicBool::new(false),
                ssl_paths: Mutex::new((String::new(), String::new())),
                sources: Mutex::new(HashMap::new()),
            }),
            server: Mutex::new(None),
        }
    }

    /// Starts the server and every registered source.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.server.lock() = Some(http::start(self.inner.clone()));
        for source in self.inner.sources.lock().values() {
            source.start();
        }
    }

    /// Sets the PEM certificate and key paths used for HTTPS.
    pub fn set_ssl_cert_path(&self, cert: &str, key: &str) {
        *self.inner.ssl_paths.lock() = (cert.to_string(), key.to_string());
    }

    /// Registers a source. Its pipeline stays idle until a viewer connects
    /// or recording starts.
    pub fn add_source(&self, args: SourceArgs) -> Result<()> {
        if args.name.is_empty() || args.url.is_empty() {
            return Err(Error::InvalidArgument);
        }
        let mut sources = self.inner.sources.lock();
        if sources.contains_key(&args.name) {
            return Err(Error::AlreadyExists);
        }
        let name = args.name.clone();
        let source = Source::new(args);
        if self.inner.running.load(Ordering::SeqCst) {
            source.start();
        }
        sources.insert(name, source);
        Ok(())
    }

    /// Removes a source, tearing down its pipeline, viewers and recorder.
    pub fn remove_source(&self, name: &str) -> Result<()> {
        match self.inner.sources.lock().remove(name) {
            Some(_) => Ok(()),
            None => Err(Error::NotFound),
        }
    }

    /// Names of all registered sources.
    pub fn sources(&self) -> Vec<String> {
        self.inner.sources.lock().keys().cloned().collect()
    }

    /// Starts recording `name` with `options`.
    pub fn start_recording(&self, name: &str, options: RecordOptions) -> Result<()> {
        let sources = self.inner.sources.lock();
        match sources.get(name) {
            Some(source) => source.start_recording(options),
            None => Err(Error::NotFound),
        }
    }

    /// Stops recording `name`.
    pub fn stop_recording(&self, name: &str) -> Result<()> {
        let sources = self.inner.sources.lock();
        match sources.get(name) {
            Some(source) => source.stop_recording(),
            None => Err(Error::NotFound),
        }
    }

    /// Seeks a file-backed source to `seconds`.
    pub fn seek(&self, name: &str, seconds: i64) -> Result<()> {
        let sources = self.inner.sources.lock();
        match sources.get(name) {
            Some(source) => {
                source.seek(seconds);
                Ok(())
            }
            None => Err(Error::NotFound),
        }
    }

    /// Sets the playback speed factor of a file-backed source.
    pub fn set_speed(&self, name: &str, factor: f64) -> Result<()> {
        let sources = self.inner.sources.lock();
        match sources.get(name) {
            Some(source) => {
                source.set_speed(factor);
                Ok(())
            }
            None => Err(Error::NotFound),
        }
    }
}

impl Drop for Streamer {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::SeqCst);
        if let Some(server) = self.server.lock().take() {
            let _ = server.join();
        }
        self.inner.sources.lock().clear();
    }
}
