//! End-to-end session scenarios: two engines wired back to back.

use anyhow::Result;
use nade_core::{NadeConfig, NadeIdentity, NadeSession, AUDIO_FRAME_SAMPLES};

/// 440 Hz test tone generator with phase carried across frames.
struct ToneGen {
    phase: f32,
}

impl ToneGen {
    fn new() -> Self {
        Self { phase: 0.0 }
    }

    fn frame(&mut self) -> Vec<i16> {
        let step = 2.0 * std::f32::consts::PI * 440.0 / 8000.0;
        (0..AUDIO_FRAME_SAMPLES)
            .map(|_| {
                let sample = (8000.0 * self.phase.sin()) as i16;
                self.phase += step;
                if self.phase > 2.0 * std::f32::consts::PI {
                    self.phase -= 2.0 * std::f32::consts::PI;
                }
                sample
            })
            .collect()
    }
}

fn rms(samples: &[i16]) -> f64 {
    let acc: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (acc / samples.len() as f64).sqrt()
}

/// Move pending wire bytes in both directions once.
fn pump(a: &NadeSession, b: &NadeSession) {
    let mut wire = [0u8; 8192];
    let n = a.generate_outgoing(&mut wire);
    if n > 0 {
        b.handle_incoming(&wire[..n]).unwrap();
    }
    let n = b.generate_outgoing(&mut wire);
    if n > 0 {
        a.handle_incoming(&wire[..n]).unwrap();
    }
}

/// Pump with audio in both directions until both sides acknowledge.
fn establish(a: &NadeSession, b: &NadeSession, gen_a: &mut ToneGen, gen_b: &mut ToneGen) {
    for _ in 0..20 {
        if a.is_established() && b.is_established() {
            return;
        }
        a.feed_mic(&gen_a.frame()).unwrap();
        b.feed_mic(&gen_b.frame()).unwrap();
        pump(a, b);
    }
    panic!("handshake did not complete");
}

fn drain_speaker(session: &NadeSession) {
    let mut sink = [0i16; 4096];
    while session.pull_speaker(&mut sink) > 0 {}
}

fn paired_sessions() -> (NadeSession, NadeSession) {
    let a = NadeSession::new(NadeIdentity::from_seed([0x02; 32]));
    let b = NadeSession::new(NadeIdentity::from_seed([0x03; 32]));
    (a, b)
}

#[test]
fn handshake_and_first_audio() -> Result<()> {
    let (a, b) = paired_sessions();
    a.start_session_client(Some(b.public_key()))?;
    b.start_session_server(Some(a.public_key()))?;
    let mut gen_a = ToneGen::new();
    let mut gen_b = ToneGen::new();
    establish(&a, &b, &mut gen_a, &mut gen_b);

    drain_speaker(&b);
    let frame = gen_a.frame();
    a.feed_mic(&frame)?;
    pump(&a, &b);
    let mut out = [0i16; 1024];
    let pulled = b.pull_speaker(&mut out);
    assert!(pulled >= AUDIO_FRAME_SAMPLES, "only {pulled} samples decoded");
    let input_rms = rms(&frame);
    let output_rms = rms(&out[..pulled]);
    let deviation = (input_rms - output_rms).abs() / input_rms;
    assert!(deviation < 0.10, "rms off by {:.1}%", deviation * 100.0);
    Ok(())
}

#[test]
fn tampered_cipher_frame_is_dropped_without_desync() -> Result<()> {
    let (a, b) = paired_sessions();
    a.start_session_client(None)?;
    b.start_session_server(None)?;
    let mut gen_a = ToneGen::new();
    let mut gen_b = ToneGen::new();
    establish(&a, &b, &mut gen_a, &mut gen_b);
    drain_speaker(&b);

    a.feed_mic(&gen_a.frame())?;
    let mut wire = [0u8; 2048];
    let n = a.generate_outgoing(&mut wire);
    assert!(n > 0);
    assert_eq!(wire[0], 0x02, "expected a cipher frame");
    wire[10] ^= 0xFF;
    b.handle_incoming(&wire[..n])?;
    let mut out = [0i16; 1024];
    assert_eq!(b.pull_speaker(&mut out), 0, "tampered frame must not decode");

    // The receive counter advanced past the bad frame, so the next good
    // frame still authenticates.
    a.feed_mic(&gen_a.frame())?;
    let n = a.generate_outgoing(&mut wire);
    b.handle_incoming(&wire[..n])?;
    assert!(b.pull_speaker(&mut out) >= AUDIO_FRAME_SAMPLES);
    Ok(())
}

#[test]
fn hangup_is_delivered_and_latched_once() -> Result<()> {
    let (a, b) = paired_sessions();
    a.start_session_client(None)?;
    b.start_session_server(None)?;
    let mut gen_a = ToneGen::new();
    let mut gen_b = ToneGen::new();
    establish(&a, &b, &mut gen_a, &mut gen_b);

    a.send_hangup()?;
    pump(&a, &b);
    assert!(b.consume_remote_hangup());
    assert!(!b.consume_remote_hangup());
    Ok(())
}

#[test]
fn both_sides_plaintext_when_encryption_disabled() -> Result<()> {
    let (a, b) = paired_sessions();
    let plain = NadeConfig { encrypt: false, decrypt: false, fsk_enabled: false };
    a.set_config(plain);
    b.set_config(plain);
    a.start_session_client(None)?;
    b.start_session_server(None)?;
    let mut gen = ToneGen::new();

    let mut wire = [0u8; 8192];
    for _ in 0..4 {
        a.feed_mic(&gen.frame())?;
        let n = a.generate_outgoing(&mut wire);
        if n > 0 {
            // After the leading handshake frame, audio goes out as 0x03.
            b.handle_incoming(&wire[..n])?;
        }
        let n = b.generate_outgoing(&mut wire);
        if n > 0 {
            a.handle_incoming(&wire[..n])?;
        }
    }
    let mut out = [0i16; 4096];
    assert!(b.pull_speaker(&mut out) >= AUDIO_FRAME_SAMPLES);
    // Nothing was ever sealed, so no frame could acknowledge the handshake.
    assert!(!a.is_established());
    Ok(())
}

#[test]
fn encryption_degrades_only_with_mutual_consent() -> Result<()> {
    let (a, b) = paired_sessions();
    // b refuses to accept ciphertext; a must fall back to plaintext while
    // b (which still encrypts and a still accepts) keeps sealing.
    b.set_config(NadeConfig { encrypt: true, decrypt: false, fsk_enabled: false });
    a.start_session_client(None)?;
    b.start_session_server(None)?;
    let mut gen_a = ToneGen::new();
    let mut gen_b = ToneGen::new();

    for _ in 0..6 {
        a.feed_mic(&gen_a.frame())?;
        b.feed_mic(&gen_b.frame())?;
        pump(&a, &b);
    }
    let mut out = [0i16; 8192];
    assert!(a.pull_speaker(&mut out) >= AUDIO_FRAME_SAMPLES, "cipher direction stalled");
    assert!(b.pull_speaker(&mut out) >= AUDIO_FRAME_SAMPLES, "plaintext direction stalled");
    // Only the side receiving sealed frames can observe an acknowledgement.
    assert!(a.is_established());
    assert!(!b.is_established());
    assert_eq!(a.encryption_state(), (false, true));
    assert_eq!(b.encryption_state(), (true, false));
    Ok(())
}

#[test]
fn pinning_mismatch_aborts_handshake() -> Result<()> {
    let (a, b) = paired_sessions();
    let stranger = NadeIdentity::from_seed([0x7E; 32]);
    a.start_session_client(Some(stranger.public_key()))?;
    b.start_session_server(None)?;

    let mut gen = ToneGen::new();
    for _ in 0..6 {
        a.feed_mic(&gen.frame())?;
        pump(&a, &b);
    }
    assert!(!a.is_established());
    assert!(!b.is_established());
    let mut out = [0i16; 1024];
    assert_eq!(a.pull_speaker(&mut out), 0);
    Ok(())
}

#[test]
fn session_restart_renegotiates() -> Result<()> {
    let (a, b) = paired_sessions();
    a.start_session_client(None)?;
    b.start_session_server(None)?;
    let mut gen_a = ToneGen::new();
    let mut gen_b = ToneGen::new();
    establish(&a, &b, &mut gen_a, &mut gen_b);

    a.stop_session();
    assert!(a.feed_mic(&gen_a.frame()).is_err());
    assert!(!a.is_established());

    a.start_session_client(None)?;
    b.start_session_server(None)?;
    establish(&a, &b, &mut gen_a, &mut gen_b);
    Ok(())
}

#[test]
fn entry_points_require_a_session() {
    let session = NadeSession::new(NadeIdentity::from_seed([0x11; 32]));
    assert!(session.feed_mic(&[0i16; 320]).is_err());
    assert!(session.handle_incoming(&[1, 2, 3]).is_err());
    assert!(session.send_hangup().is_err());
    assert!(!session.consume_remote_hangup());
    let mut out = [0i16; 16];
    assert_eq!(session.pull_speaker(&mut out), 0);
}

#[test]
fn fsk_single_byte_roundtrip() -> Result<()> {
    let session = NadeSession::new(NadeIdentity::from_seed([0x11; 32]));
    session.set_config(NadeConfig { fsk_enabled: true, ..NadeConfig::default() });
    let mut pcm = [0i16; 400];
    let produced = session.fsk_modulate(&[0x5A], &mut pcm);
    assert_eq!(produced, 320);
    session.fsk_feed_audio(&pcm[..produced])?;
    let mut bytes = [0u8; 16];
    assert_eq!(session.fsk_pull_demodulated(&mut bytes), 1);
    assert_eq!(bytes[0], 0x5A);
    Ok(())
}

#[test]
fn fsk_disabled_is_inert() {
    let session = NadeSession::new(NadeIdentity::from_seed([0x11; 32]));
    let mut pcm = [0i16; 400];
    assert_eq!(session.fsk_modulate(&[0x5A], &mut pcm), 0);
    assert!(session.fsk_feed_audio(&pcm[..320]).is_err());
}

#[test]
fn full_call_over_fsk_tones() -> Result<()> {
    let (a, b) = paired_sessions();
    let cfg = NadeConfig { fsk_enabled: true, ..NadeConfig::default() };
    a.set_config(cfg);
    b.set_config(cfg);
    a.start_session_client(None)?;
    b.start_session_server(None)?;
    let mut gen_a = ToneGen::new();
    let mut gen_b = ToneGen::new();

    let carry = |from: &NadeSession, to: &NadeSession| -> Result<()> {
        let mut wire = [0u8; 4096];
        let n = from.generate_outgoing(&mut wire);
        if n == 0 {
            return Ok(());
        }
        let mut pcm = vec![0i16; from.fsk_samples_for_bytes(n)];
        let produced = from.fsk_modulate(&wire[..n], &mut pcm);
        assert_eq!(produced, pcm.len());
        to.fsk_feed_audio(&pcm[..produced])?;
        let mut bytes = [0u8; 4096];
        let k = to.fsk_pull_demodulated(&mut bytes);
        assert_eq!(k, n, "modem dropped bytes");
        to.handle_incoming(&bytes[..k])?;
        Ok(())
    };

    for _ in 0..8 {
        if a.is_established() && b.is_established() {
            break;
        }
        a.feed_mic(&gen_a.frame())?;
        b.feed_mic(&gen_b.frame())?;
        carry(&a, &b)?;
        carry(&b, &a)?;
    }
    assert!(a.is_established() && b.is_established());

    drain_speaker(&b);
    a.feed_mic(&gen_a.frame())?;
    carry(&a, &b)?;
    let mut out = [0i16; 1024];
    assert!(b.pull_speaker(&mut out) >= AUDIO_FRAME_SAMPLES);
    Ok(())
}

#[test]
fn concurrent_feed_and_generate_keep_nonces_in_sync() -> Result<()> {
    let (a, b) = paired_sessions();
    a.start_session_client(None)?;
    b.start_session_server(None)?;
    let mut gen_a = ToneGen::new();
    let mut gen_b = ToneGen::new();
    establish(&a, &b, &mut gen_a, &mut gen_b);
    drain_speaker(&b);

    const FRAMES: usize = 50;
    let mut collected = Vec::new();
    std::thread::scope(|scope| {
        let a_ref = &a;
        scope.spawn(move || {
            let mut gen = ToneGen::new();
            for _ in 0..FRAMES {
                a_ref.feed_mic(&gen.frame()).unwrap();
            }
        });
        let mut wire = [0u8; 8192];
        for _ in 0..200 {
            let n = a.generate_outgoing(&mut wire);
            collected.extend_from_slice(&wire[..n]);
        }
    });
    // Drain whatever the racing generate calls left behind.
    let mut wire = [0u8; 8192];
    loop {
        let n = a.generate_outgoing(&mut wire);
        if n == 0 {
            break;
        }
        collected.extend_from_slice(&wire[..n]);
    }

    b.handle_incoming(&collected)?;
    let mut total = 0usize;
    let mut out = [0i16; 4096];
    loop {
        let n = b.pull_speaker(&mut out);
        if n == 0 {
            break;
        }
        total += n;
    }
    // Every sealed frame must authenticate on the peer: one lost or reused
    // nonce would shear the counters and drop the remainder of the stream.
    assert_eq!(total, FRAMES * AUDIO_FRAME_SAMPLES);
    Ok(())
}
