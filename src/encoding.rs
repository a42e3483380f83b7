use serde::{Deserialize, Serialize};

/// Codecs selectable for an output encoding. Video codecs sort before the
/// audio ones; `Unknown` disables encoding for that media type.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub enum Codec {
    H264,
    Hevc,
    Av1,
    Vp9,
    Ac3,
    Mp2,
    Mp3,
    Aac,
    #[default]
    Unknown,
}

impl Codec {
    pub fn is_valid(self) -> bool {
        self != Codec::Unknown
    }

    pub fn is_video(self) -> bool {
        matches!(self, Codec::H264 | Codec::Hevc | Codec::Av1 | Codec::Vp9)
    }

    pub fn is_audio(self) -> bool {
        matches!(self, Codec::Ac3 | Codec::Mp2 | Codec::Mp3 | Codec::Aac)
    }
}

/// Output encoding description. Doubles as the cache key for encoder,
/// scaler and resampler state, so equality and hashing cover every field.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Encoding {
    pub codec: Codec,
    // video only
    pub width: i32,
    pub height: i32,
    /// kbit/s
    pub max_bandwidth: u64,
    pub frame_rate: i32,
    // audio only
    pub sample_rate: i32,
    pub sample_fmt: String,
    pub channel_layout: String,
}

impl Default for Encoding {
    fn default() -> Self {
        Self {
            codec: Codec::Unknown,
            width: 0,
            height: 0,
            max_bandwidth: 0,
            frame_rate: -1,
            sample_rate: -1,
            sample_fmt: String::new(),
            channel_layout: String::new(),
        }
    }
}

impl Encoding {
    pub fn is_valid(&self) -> bool {
        self.codec.is_valid()
    }

    pub fn is_video(&self) -> bool {
        self.codec.is_video()
    }

    pub fn is_audio(&self) -> bool {
        self.codec.is_audio()
    }
}

/// Video + audio encodings a writer muxes; either half may be disabled.
#[derive(Clone, Debug, Default)]
pub struct EncoderConfig {
    pub video: Encoding,
    pub audio: Encoding,
}

/// Stream containers tried for viewer output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Container {
    Matroska,
    Mpegts,
    Flv,
    #[default]
    Unknown,
}

impl Container {
    pub fn name(self) -> &'static str {
        match self {
            Container::Matroska => "matroska",
            Container::Mpegts => "mpegts",
            Container::Flv => "flv",
            Container::Unknown => "",
        }
    }

    /// Viewer preference order when no container is configured.
    pub fn fallback_order() -> [Container; 3] {
        [Container::Matroska, Container::Mpegts, Container::Flv]
    }
}

/// File formats tried for recording output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum FileFormat {
    Mp4,
    Ts,
    Mkv,
    Avi,
    Flv,
    Mov,
    Webm,
    #[default]
    Unknown,
}

impl FileFormat {
    pub fn extension(self) -> &'static str {
        match self {
            FileFormat::Mp4 => "mp4",
            FileFormat::Ts => "ts",
            FileFormat::Mkv => "mkv",
            FileFormat::Avi => "avi",
            FileFormat::Flv => "flv",
            FileFormat::Mov => "mov",
            FileFormat::Webm => "webm",
            FileFormat::Unknown => "",
        }
    }

    /// Recorder preference order when the configured format fails.
    pub fn fallback_order() -> [FileFormat; 7] {
        [
            FileFormat::Mkv,
            FileFormat::Ts,
            FileFormat::Mp4,
            FileFormat::Avi,
            FileFormat::Mov,
            FileFormat::Flv,
            FileFormat::Webm,
        ]
    }
}

/// Arguments for a source to be added.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SourceArgs {
    /// unique name for the source
    pub name: String,
    /// source url: network url, local file path or
    /// `avdevice:[<framework>]:video=<name>` for webcams
    pub url: String,
    /// token that viewers must present in the `session` query field
    pub auth_session: String,
    /// optional video encoding for streaming
    pub video_encoding_view: Encoding,
    /// optional audio encoding for streaming
    pub audio_encoding_view: Encoding,
    /// optional video encoding for recording
    pub video_encoding_rec: Encoding,
    /// optional audio encoding for recording
    pub audio_encoding_rec: Encoding,
    /// preferred container, negotiated automatically when unset
    pub container: Container,
}

/// Recording options for a source.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecordOptions {
    /// output directory or an explicit file path; empty picks
    /// `<app-dir>/records/<source>`
    pub path: String,
    /// preferred file format, negotiated automatically when unset
    pub format: FileFormat,
    /// rotate when a file reaches this many megabytes (0 = unlimited)
    pub file_size: u64,
    /// rotate when a file spans this many seconds (0 = unlimited)
    pub file_duration: u64,
    /// buffer packets and flush every this many seconds (0 = write through)
    pub write_interval: u64,
    /// also record audio streams
    pub record_audio: bool,
}

impl Default for RecordOptions {
    fn default() -> Self {
        Self {
            path: String::new(),
            format: FileFormat::Unknown,
            file_size: 0,
            file_duration: 0,
            write_interval: 0,
            record_audio: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn codec_partition() {
        assert!(Codec::H264.is_video() && !Codec::H264.is_audio());
        assert!(Codec::Vp9.is_video());
        assert!(Codec::Ac3.is_audio() && !Codec::Ac3.is_video());
        assert!(Codec::Aac.is_audio());
        assert!(!Codec::Unknown.is_valid());
        assert!(!Codec::Unknown.is_video() && !Codec::Unknown.is_audio());
    }

    #[test]
    fn encoding_keys_mix_every_field() {
        let base = Encoding {
            codec: Codec::H264,
            width: 1280,
            height: 720,
            max_bandwidth: 2000,
            frame_rate: 30,
            sample_rate: -1,
            sample_fmt: String::new(),
            channel_layout: String::new(),
        };
        let mut map: HashMap<Encoding, u32> = HashMap::new();
        map.insert(base.clone(), 1);

        // identical value hits the same entry
        assert!(map.contains_key(&base));

        // differing only in bitrate is a distinct output
        let mut other = base.clone();
        other.max_bandwidth = 4000;
        assert!(!map.contains_key(&other));

        // textual fields count too
        let mut other = base.clone();
        other.sample_fmt = "fltp".into();
        assert!(!map.contains_key(&other));
        let mut other = base;
        other.channel_layout = "stereo".into();
        assert!(!map.contains_key(&other));
    }

    #[test]
    fn fallback_orders() {
        assert_eq!(
            Container::fallback_order(),
            [Container::Matroska, Container::Mpegts, Container::Flv]
        );
        assert_eq!(FileFormat::fallback_order()[0], FileFormat::Mkv);
        assert_eq!(FileFormat::Mkv.extension(), "mkv");
    }
}
