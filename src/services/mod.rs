//! Services - zone logic and state management
//!
//! This module contains the core logic, free of IO:
//! - `geometry` - validated zone polygons and point containment
//! - `reference_point` - the point of a bounding box tested against zones
//! - `membership` - per track and zone state machine producing zone events
//! - `frame_processor` - async loop feeding frames into the engine

pub mod frame_processor;
pub mod geometry;
pub mod membership;
pub mod reference_point;

// Re-export commonly used types
pub use frame_processor::{FrameProcessor, ProcessorStats};
pub use geometry::GeometryIndex;
pub use membership::{EngineSettings, FrameError, MembershipEngine, MembershipStatus, MembershipView};
