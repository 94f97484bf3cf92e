//! NADE core: peer-to-peer secure voice transport over a narrow audio channel.
//!
//! Two peers derive transport keys with a Noise-style X25519 handshake,
//! compress microphone PCM with IMA ADPCM, seal frames with
//! ChaCha20-Poly1305, and exchange the framed bytes either directly or as
//! 4-FSK tones inside a voice call. Reed-Solomon RS(255,223) is available
//! as a standalone primitive for hosts that burst-protect their own links.
//!
//! The host supplies audio capture/playback and the byte (or audio)
//! channel; this crate is the session engine in between:
//!
//! ```no_run
//! use nade_core::{NadeIdentity, NadeSession};
//!
//! let session = NadeSession::new(NadeIdentity::from_seed([0x42; 32]));
//! session.start_session_client(None)?;
//! session.feed_mic(&[0i16; 320])?;
//! let mut wire = [0u8; 1024];
//! let n = session.generate_outgoing(&mut wire);
//! // ship wire[..n] to the peer, feed received bytes to handle_incoming
//! # Ok::<(), nade_core::NadeError>(())
//! ```

pub mod codec;
pub mod config;
pub mod crypto;
pub mod error;
pub mod fec;
pub mod frame;
pub mod modem;
pub mod rings;
pub mod session;

pub use config::NadeConfig;
pub use crypto::NadeIdentity;
pub use error::{NadeError, Result};
pub use modem::FskConfig;
pub use session::{NadeSession, Role, AUDIO_FRAME_SAMPLES};
