//! Live presence for nearby-core: transports, per-client sessions and the
//! sensor-to-publish location pipeline.
//!
//! Everything async runs on tokio. Sessions and the engine are actors; the
//! handles you hold only send commands and read `watch` snapshots.

pub mod engine;
pub mod error;
pub mod hub;
pub mod sensor;
pub mod session;
pub mod sse;
pub mod transport;

pub use engine::{EngineOptions, EngineStatus, LocationEngine, NearbyView};
pub use error::{EngineError, LocationError, TransportError};
pub use hub::LocalHub;
pub use sensor::{Fix, LocationSource, PositionWatch, ScriptedLocation, Throttle};
pub use session::{
    Backoff, ConnectionState, PresenceSession, SessionConfig, SessionHandle, SessionSnapshot,
};
pub use sse::{PRESENCE_EVENT, SseTransport};
pub use transport::{Channel, ChannelEvent, Outbound, Transport};
