pub mod atomic;
pub mod config;
pub mod encoding;
pub mod error_codes;
pub mod ffmpeg;
pub mod http;
pub mod intro;
pub mod lines;
pub mod logging;
pub mod manifest;
pub mod merge;
pub mod narrate;
pub mod normalize;
pub mod presentation;
pub mod probe;
pub mod rename;
pub mod report;
pub mod slides;
pub mod transcribe;
pub mod transfer;
pub mod tts;
pub mod unzip;
pub mod walk;
