//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `mqtt` - MQTT client for receiving detection frames
//! - `replay` - detection frames from a JSONL file
//! - `event_channel` - bounded queue between engine and publisher
//! - `mqtt_egress` - event transport and the publisher with degraded mode
//! - `diagnostics` - local record of undelivered events
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod diagnostics;
pub mod event_channel;
pub mod mqtt;
pub mod mqtt_egress;
pub mod prometheus;
pub mod replay;

// Re-export commonly used types
pub use diagnostics::DiagnosticSink;
pub use event_channel::{create_event_channel, EventSender, SendOutcome};
pub use mqtt_egress::{EventPublisher, EventTransport, MqttTransport, PublisherSettings, TransportError};
