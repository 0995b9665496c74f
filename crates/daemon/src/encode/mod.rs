//! Encoding modules for clipwatch

pub mod ffmpeg;

pub use ffmpeg::{
    build_ffmpeg_command, spawn_encoder, EncodeError, EncodeParams, EncoderEvent,
    EncoderProgress, ProgressParser,
};
