//! Server lifecycle and resource management for a SuperCollider-backed
//! live audio studio.
//!
//! The [`Studio`] controller owns the engine connection and every piece of
//! engine-side state derived from it: the named buffer cache, the sample
//! and synthdef caches, per-bus recording sessions, the MIDI bridge
//! processes, and the reboot state machine that tears all of it down and
//! rebuilds it. The engine itself is reached only through the [`Server`]
//! capability trait; [`server::osc::OscServer`] is the scsynth/OSC
//! implementation and [`TestServer`] a recording fake for tests.

pub mod midi_bridge;
pub mod notify;
pub mod paths;
pub mod server;
pub mod single_flight;
pub mod studio;

pub use midi_bridge::MidiBridges;
pub use notify::Notifier;
pub use server::osc::OscServer;
pub use server::{
    AddAction, Arg, Buffer, EngineInfo, EngineStatus, Server, ServerError, TestServer,
};
pub use studio::{BufferCache, Connector, RecordingManager, SampleLibrary, Studio, Topology};

pub use beltane_types::{
    Level, Notification, SampleFormat, StudioConfig, StudioError, StudioPorts,
};
