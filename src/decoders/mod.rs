//! Device decoders: transforms that run inside a [`crate::worker::Worker`].

pub mod sensorbox;
