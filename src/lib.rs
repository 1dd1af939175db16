// Library modules
pub mod constants;
pub mod dispatcher;
pub mod error;
pub mod frame;
pub mod game;
pub mod lifecycle;
pub mod policy;
pub mod registry;
pub mod session;

// Re-export commonly used types
pub use error::ErrorKind;
pub use frame::{Frame, FrameDecoder, FrameError, Segment, SegmentType};
pub use game::{FlgOutcome, Game, Phase};
pub use registry::Registry;
