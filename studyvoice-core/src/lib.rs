//! # studyvoice-core
//!
//! Real-time voice conversation engine for a document study assistant.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → AudioCapture → SPSC RingBuffer → CapturePipeline (thread)
//!                                                    │ resample → 4096-sample blocks
//!                                                    ▼
//!                                            encode_block (PCM16 base64)
//!                                                    │ try_send
//!                                                    ▼
//!                       Connector ◄──── LiveSessionController ────► SessionObserver
//!                           │                        ▲                (transcripts,
//!                           └── LiveMessage ─► SessionState::apply     turns, close)
//!                                                    │
//!                                                    ▼
//!                               AudioOutputService (live lane / utterance lane)
//!                                                    │
//!                                              Mixer → cpal output
//! ```
//!
//! The audio callbacks never allocate in steady state and never wait on the
//! session task; everything crosses threads through lock-free rings or
//! bounded channels.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod capture;
pub mod codec;
pub mod collab;
pub mod config;
pub mod error;
pub mod events;
pub mod playback;
pub mod session;
pub mod speech;

// Convenience re-exports for downstream crates
pub use buffering::chunk::AudioChunk;
pub use capture::{BlockSink, CapturePipeline, CpalMicrophone, MicrophoneSource, MicrophoneStream};
pub use codec::MediaBlob;
pub use collab::{GeminiRestClient, GenerationService};
pub use config::{CaptureConfig, LiveConfig, OutputConfig, RestConfig};
pub use error::{Result, VoiceError};
pub use events::{SessionPhase, SessionStatusEvent};
pub use playback::{AudioOutputService, ScheduledChunk};
pub use session::{
    protocol::{ClientFrame, LiveMessage, SetupMessage},
    transport::{Connector, GeminiConnector, LiveConnection},
    LiveSessionController, SessionHandle, SessionObserver, SessionSnapshot,
};
pub use speech::{SpeechPlayer, SpeechSynthesizer};
