#[cfg(feature = "audio")]
pub mod audio;
pub mod config;
pub mod nes;
