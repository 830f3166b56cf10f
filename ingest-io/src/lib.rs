//! Ingest I/O and platform abstraction
//!
//! Datagram transport behind the [`Connector`]/[`Link`] traits: UDP through
//! socket2 for real networks and an in-process simulated network with a
//! seeded loss model for deterministic tests. Also timing helpers shared by
//! the session and feeder workers.

pub mod link;
pub mod sim;
pub mod socket;
pub mod time;

pub use link::{Connector, Link, LinkError, UdpConnector, UdpLink};
pub use sim::{LinkConditions, SimConnector, SimLink, SimNetwork, SimStats};
pub use socket::{IngestSocket, SocketError};
pub use time::{MediaClock, RateLimiter, Timer};
