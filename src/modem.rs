//! 4-FSK modem: bytes to voice-band tones and back.
//!
//! Each symbol carries 2 bits on one of four mark tones; a byte is four
//! symbols, low bit pair first. The modulator keeps one continuous phase
//! accumulator across symbol boundaries so the waveform never clicks. The
//! demodulator collects fixed symbol-length windows and picks the tone with
//! the strongest Goertzel power; windows below the power threshold are
//! treated as silence and discarded. There is no symbol timing recovery:
//! the host is expected to deliver sample-aligned audio.

use std::f32::consts::PI;

/// Modem parameters. The defaults put all four tones inside the telephone
/// voice band with an integer number of cycles per symbol.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FskConfig {
    pub sample_rate: u32,
    pub symbol_rate: u32,
    /// Mark tone per 2-bit symbol, in Hz.
    pub tones: [u32; 4],
    /// Peak amplitude of generated tones (out of 32767).
    pub amplitude: i16,
    /// Minimum Goertzel power for a window to count as a symbol.
    pub power_threshold: f32,
}

impl Default for FskConfig {
    fn default() -> Self {
        Self {
            sample_rate: 8000,
            symbol_rate: 100,
            tones: [1200, 1600, 2000, 2400],
            amplitude: 16000,
            power_threshold: 1e6,
        }
    }
}

impl FskConfig {
    pub fn samples_per_symbol(&self) -> usize {
        (self.sample_rate / self.symbol_rate) as usize
    }

    /// PCM samples produced when modulating `byte_count` bytes.
    pub fn samples_for_bytes(&self, byte_count: usize) -> usize {
        byte_count * 4 * self.samples_per_symbol()
    }
}

/// Modulator and demodulator state for one session.
pub struct FskModem {
    config: FskConfig,
    samples_per_symbol: usize,
    goertzel_coeff: [f32; 4],
    tx_phase: f32,
    rx_window: Vec<i16>,
    rx_byte: u8,
    rx_symbol_count: u8,
}

impl FskModem {
    pub fn new(config: FskConfig) -> Self {
        let n = config.samples_per_symbol();
        let mut goertzel_coeff = [0.0f32; 4];
        for (coeff, &tone) in goertzel_coeff.iter_mut().zip(&config.tones) {
            // Standard Goertzel: c = 2*cos(2*pi*k/N) with bin k = f*N/Fs.
            let k = (tone * n as u32) as f32 / config.sample_rate as f32;
            *coeff = 2.0 * (2.0 * PI * k / n as f32).cos();
        }
        Self {
            config,
            samples_per_symbol: n,
            goertzel_coeff,
            tx_phase: 0.0,
            rx_window: Vec::with_capacity(n),
            rx_byte: 0,
            rx_symbol_count: 0,
        }
    }

    pub fn config(&self) -> &FskConfig {
        &self.config
    }

    /// Clear phase and partial-symbol state for a fresh session.
    pub fn reset(&mut self) {
        self.tx_phase = 0.0;
        self.rx_window.clear();
        self.rx_byte = 0;
        self.rx_symbol_count = 0;
    }

    fn modulate_symbol(&mut self, symbol: u8, out: &mut Vec<i16>) {
        let freq = self.config.tones[(symbol & 0x03) as usize];
        let phase_inc = 2.0 * PI * freq as f32 / self.config.sample_rate as f32;
        let amplitude = self.config.amplitude as f32;
        for _ in 0..self.samples_per_symbol {
            out.push((amplitude * self.tx_phase.sin()) as i16);
            self.tx_phase += phase_inc;
            if self.tx_phase >= 2.0 * PI {
                self.tx_phase -= 2.0 * PI;
            }
        }
    }

    /// Modulate one byte into four symbols, low bit pair first.
    pub fn modulate_byte(&mut self, byte: u8, out: &mut Vec<i16>) {
        for i in 0..4 {
            self.modulate_symbol((byte >> (i * 2)) & 0x03, out);
        }
    }

    /// Modulate a byte slice into PCM tones.
    pub fn modulate(&mut self, data: &[u8]) -> Vec<i16> {
        let mut out = Vec::with_capacity(self.config.samples_for_bytes(data.len()));
        for &byte in data {
            self.modulate_byte(byte, &mut out);
        }
        out
    }

    fn goertzel_power(&self, tone_index: usize) -> f32 {
        let coeff = self.goertzel_coeff[tone_index];
        let mut s1 = 0.0f32;
        let mut s2 = 0.0f32;
        for &sample in &self.rx_window {
            let s0 = sample as f32 + coeff * s1 - s2;
            s2 = s1;
            s1 = s0;
        }
        s1 * s1 + s2 * s2 - coeff * s1 * s2
    }

    /// Strongest tone in the current window, or None below the threshold.
    fn detect_symbol(&self) -> Option<u8> {
        let mut best = 0usize;
        let mut best_power = 0.0f32;
        for i in 0..4 {
            let power = self.goertzel_power(i);
            if power > best_power {
                best_power = power;
                best = i;
            }
        }
        (best_power >= self.config.power_threshold).then_some(best as u8)
    }

    /// Feed received PCM; returns any bytes completed by these samples.
    pub fn demodulate(&mut self, pcm: &[i16]) -> Vec<u8> {
        let mut out = Vec::new();
        for &sample in pcm {
            self.rx_window.push(sample);
            if self.rx_window.len() < self.samples_per_symbol {
                continue;
            }
            if let Some(symbol) = self.detect_symbol() {
                self.rx_byte |= symbol << (self.rx_symbol_count * 2);
                self.rx_symbol_count += 1;
                if self.rx_symbol_count == 4 {
                    out.push(self.rx_byte);
                    self.rx_byte = 0;
                    self.rx_symbol_count = 0;
                }
            }
            self.rx_window.clear();
        }
        out
    }
}
