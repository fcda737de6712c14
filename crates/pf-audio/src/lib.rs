//! pf-audio: The sound system
//!
//! Owns the set of audio-device ports and synchronizes their independent
//! real-time callbacks into one engine period per buffer:
//!
//! ```text
//! ┌────────────┐      ┌──────────────┐      ┌──────────────┐
//! │ SoundPort  │─────▶│ SoundSystem  │─────▶│ OrganEngine  │
//! │ (driver)   │ cb k │  rendezvous  │ last │ next_period  │
//! └────────────┘      └──────────────┘      └──────────────┘
//! ```
//!
//! Platform backends implement [`SoundPort`]; the engine never sees a
//! device directly. Tests drive the callbacks through [`PortHandle`].

mod error;
mod port;
mod system;

pub use error::*;
pub use port::*;
pub use system::*;
