//! Port abstraction layer for serial communication.
//!
//! Provides the transport and enumerator traits consumed by connections, a
//! real implementation over `serialport`, and mocks for tests.

pub mod error;
pub mod mock;
pub mod sync_port;
pub mod traits;

pub use error::PortError;
pub use mock::{MockEnumerator, MockRead, MockTransport};
pub use sync_port::*;
pub use traits::*;
