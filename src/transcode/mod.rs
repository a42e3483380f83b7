use std::collections::HashMap;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::decode::Decoder;
use crate::demux::StreamSnapshot;
use crate::encode::EncoderPool;
use crate::encoding::Encoding;
use crate::ffi::{Frame, Packet};
use crate::resample::{AudioConform, Resampler};
use crate::scale::Scaler;

/// Per-packet transcode unit. Holds the unchanged input for passthrough,
/// decodes lazily, and caches produced packets per target encoding so
/// several writers asking for the same encoding share one encode.
pub struct Transcoder<'a> {
    decoder: &'a Mutex<Decoder>,
    encoder: &'a EncoderPool,
    scaler: &'a mut Scaler,
    resampler: &'a mut Resampler,
    snapshot: &'a StreamSnapshot,
    is_webcam: bool,
    packet: &'a Packet,
    is_audio_packet: bool,
    has_input_frame: bool,
    unchanged: Vec<Packet>,
    frames: Vec<Frame>,
    packets: HashMap<Encoding, Vec<Packet>>,
}

impl<'a> Transcoder<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        decoder: &'a Mutex<Decoder>,
        encoder: &'a EncoderPool,
        scaler: &'a mut Scaler,
        resampler: &'a mut Resampler,
        snapshot: &'a StreamSnapshot,
        is_webcam: bool,
        packet: &'a Packet,
        frame: Option<Frame>,
    ) -> Self {
        let is_audio_packet = packet.stream_index() == snapshot.audio_index;
        let unchanged = Packet::clone_from_raw(packet.as_ptr())
            .map(|p| vec![p])
            .unwrap_or_default();
        let has_input_frame = frame.is_some();
        Self {
            decoder,
            encoder,
            scaler,
            resampler,
            snapshot,
            is_webcam,
            packet,
            is_audio_packet,
            has_input_frame,
            unchanged,
            frames: frame.into_iter().collect(),
            packets: HashMap::new(),
        }
    }

    /// Packets for the target encoding: transcoded when the encoding applies
    /// to this packet's media type, the unchanged input otherwise.
    pub fn make_packets(&mut self, config: &Encoding) -> &[Packet] {
        let applies = (config.is_video() && (self.has_input_frame || !self.is_audio_packet))
            || (config.is_audio() && self.is_audio_packet);
        if !applies {
            return &self.unchanged;
        }

        if self.frames.is_empty() {
            self.decode_input();
        }
        if !self.packets.contains_key(config) {
            let produced = self.encode(config);
            self.packets.insert(config.clone(), produced);
        }
        &self.packets[config]
    }

    fn decode_input(&mut self) {
        let Some(info) = self.snapshot.stream(self.packet.stream_index()) else {
            return;
        };
        match self.decoder.lock().decode_frames(self.packet, info) {
            Ok(frames) => self.frames = frames,
            Err(e) => debug!("transcode: decode failed: {}", e),
        }
    }

    fn encode(&mut self, config: &Encoding) -> Vec<Packet> {
        let audio_index = self.snapshot.audio_index;
        let mut out = Vec::new();

        if !self.is_audio_packet {
            for f in &self.frames {
                let frame_height = unsafe { (*f.as_ptr()).height };
                // downscale, and always normalize webcam frames
                let result = if config.height < frame_height || self.is_webcam {
                    match self
                        .scaler
                        .perform_scale(f, -1, config.height, self.is_webcam)
                    {
                        Ok(scaled) => {
                            self.encoder
                                .encode_packets(config, &scaled, audio_index, &mut out)
                        }
                        Err(e) => {
                            warn!("transcode: scale failed: {}", e);
                            continue;
                        }
                    }
                } else {
                    self.encoder.encode_packets(config, f, audio_index, &mut out)
                };
                if let Err(e) = result {
                    debug!("transcode: video encode failed: {}", e);
                }
            }
        } else {
            let src = self.decoder.lock().audio_params();
            let target = self.encoder.audio_target(config);
            let (Some(src), Some((dst, frame_size))) = (src, target) else {
                return out;
            };
            let conform = AudioConform {
                src: crate::resample::AudioSide {
                    sample_fmt: src.sample_fmt,
                    sample_rate: src.sample_rate,
                    ch_layout: src.ch_layout,
                    time_base: src.time_base,
                },
                dst,
                dst_frame_size: frame_size,
            };
            for f in &self.frames {
                for conformed in self.resampler.make_frames(f, &conform) {
                    if let Err(e) =
                        self.encoder
                            .encode_packets(config, &conformed, audio_index, &mut out)
                    {
                        debug!("transcode: audio encode failed: {}", e);
                    }
                }
            }
        }
        out
    }
}
