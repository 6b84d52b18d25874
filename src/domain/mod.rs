//! Domain models - core data types
//!
//! This module contains the canonical data types used throughout the system:
//! - `types` - identifiers, image-plane geometry, timestamps
//! - `zone` - zone definitions and the static zone file
//! - `detection` - per-frame detector input and its validation
//! - `event` - zone events and the versioned wire format

pub mod detection;
pub mod event;
pub mod types;
pub mod zone;

// Re-export commonly used types at module level
pub use detection::{Detection, DetectionError, DetectionFrame, FrameMessage, RawDetection};
pub use event::{decode_event, EventPayload, ZoneEvent, ZoneEventType, SCHEMA_VERSION};
pub use types::{BoundingBox, FrameBounds, Point, ReferencePoint, TrackId, ZoneId};
pub use zone::{load_zone_file, parse_zones, Zone, ZoneError};
