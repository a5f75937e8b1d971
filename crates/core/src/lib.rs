pub mod control;
pub mod error;
pub mod fmp4;
pub mod launcher;
pub mod pipeline;
pub mod registry;
pub mod source;
pub mod transcoder;
pub mod webm;
pub mod webrtc;

pub use error::{Result, StreamError};
pub use launcher::StreamMode;
pub use pipeline::{AudioSample, VideoSample};
pub use registry::{get_source, list_serials, new_source_registry, remove_source, start_source_with_mode, SourceRegistry};
pub use source::{ConnectionInfo, Source};
