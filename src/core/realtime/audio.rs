//! Outbound audio buffering.
//!
//! Raw input audio accumulates in an [`AudioBufferManager`] and leaves it in
//! fixed-size `input_audio_buffer.append` chunks, strictly in append order.
//! Each transmitted chunk yields one input level sample in `[0, 1]`.

use bytes::BytesMut;

use super::base::{ClientEventSink, RealtimeResult};
use super::config::{AUDIO_CHUNK_SIZE, AudioFormat};
use super::messages::ClientEvent;

/// What an append or commit transmitted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AudioFlush {
    pub chunks_sent: usize,
    /// One RMS level per transmitted chunk
    pub levels: Vec<f32>,
    pub committed: bool,
}

pub struct AudioBufferManager {
    buffer: BytesMut,
    chunk_size: usize,
    format: AudioFormat,
    /// Bytes transmitted since the last commit or clear
    uncommitted: usize,
}

impl AudioBufferManager {
    pub fn new(format: AudioFormat) -> Self {
        Self::with_chunk_size(format, AUDIO_CHUNK_SIZE)
    }

    pub fn with_chunk_size(format: AudioFormat, chunk_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(chunk_size * 2),
            chunk_size: chunk_size.max(1),
            format,
            uncommitted: 0,
        }
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn set_format(&mut self, format: AudioFormat) {
        self.format = format;
    }

    /// Bytes waiting for a full chunk.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Append raw audio and transmit every complete chunk.
    ///
    /// A chunk leaves the buffer only after the sink accepted it, so a failed
    /// send keeps the bytes for the next attempt.
    pub async fn append(
        &mut self,
        data: &[u8],
        sink: &dyn ClientEventSink,
    ) -> RealtimeResult<AudioFlush> {
        self.buffer.extend_from_slice(data);

        let mut flush = AudioFlush::default();
        while self.buffer.len() >= self.chunk_size {
            let level = self.send_chunk(self.chunk_size, sink).await?;
            flush.chunks_sent += 1;
            flush.levels.push(level);
        }
        Ok(flush)
    }

    /// Flush the remainder and commit the input buffer.
    ///
    /// No-op when nothing was appended since the last commit.
    pub async fn commit(&mut self, sink: &dyn ClientEventSink) -> RealtimeResult<AudioFlush> {
        let mut flush = AudioFlush::default();
        if self.buffer.is_empty() && self.uncommitted == 0 {
            return Ok(flush);
        }

        if !self.buffer.is_empty() {
            let level = self.send_chunk(self.buffer.len(), sink).await?;
            flush.chunks_sent = 1;
            flush.levels.push(level);
        }

        sink.send_event(ClientEvent::InputAudioBufferCommit).await?;
        self.uncommitted = 0;
        flush.committed = true;
        Ok(flush)
    }

    /// Drop buffered bytes locally and on the server.
    pub async fn clear(&mut self, sink: &dyn ClientEventSink) -> RealtimeResult<()> {
        self.reset();
        sink.send_event(ClientEvent::InputAudioBufferClear).await
    }

    /// Drop buffered bytes without notifying the server.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.uncommitted = 0;
    }

    async fn send_chunk(&mut self, len: usize, sink: &dyn ClientEventSink) -> RealtimeResult<f32> {
        let chunk = &self.buffer[..len];
        let level = audio_level(chunk, self.format);
        sink.send_event(ClientEvent::audio_append(chunk)).await?;
        let _ = self.buffer.split_to(len);
        self.uncommitted += len;
        Ok(level)
    }
}

/// RMS amplitude of `chunk` normalized to `[0, 1]`.
pub fn audio_level(chunk: &[u8], format: AudioFormat) -> f32 {
    let (sum, count) = match format {
        AudioFormat::Pcm16 => chunk
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .fold((0f64, 0usize), accumulate),
        AudioFormat::G711Ulaw => chunk
            .iter()
            .map(|&byte| ulaw_to_linear(byte))
            .fold((0f64, 0usize), accumulate),
        AudioFormat::G711Alaw => chunk
            .iter()
            .map(|&byte| alaw_to_linear(byte))
            .fold((0f64, 0usize), accumulate),
    };

    if count == 0 {
        return 0.0;
    }
    ((sum / count as f64).sqrt() as f32).clamp(0.0, 1.0)
}

fn accumulate((sum, count): (f64, usize), sample: i16) -> (f64, usize) {
    let normalized = sample as f64 / 32768.0;
    (sum + normalized * normalized, count + 1)
}

/// Expand a G.711 μ-law byte to 16-bit linear PCM.
pub fn ulaw_to_linear(byte: u8) -> i16 {
    let value = !byte;
    let sign = value & 0x80;
    let exponent = (value >> 4) & 0x07;
    let mantissa = (value & 0x0F) as i32;
    let magnitude = (((mantissa << 3) + 0x84) << exponent) - 0x84;
    if sign != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

/// Expand a G.711 A-law byte to 16-bit linear PCM.
pub fn alaw_to_linear(byte: u8) -> i16 {
    let value = byte ^ 0x55;
    let sign = value & 0x80;
    let exponent = (value >> 4) & 0x07;
    let mantissa = (value & 0x0F) as i32;
    let mut magnitude = (mantissa << 4) + 8;
    if exponent != 0 {
        magnitude = (magnitude + 0x100) << (exponent - 1);
    }
    if sign != 0 {
        magnitude as i16
    } else {
        -magnitude as i16
    }
}
