//! Zenoh request/response bridge for Modbus.
//!
//! Callers publish request frames below an inbound endpoint; the bridge
//! correlates each one by transaction id, hands it to a transport, and
//! publishes exactly one response (or a rejection) below the outbound
//! endpoint.
//!
//! # Key Expressions
//!
//! ```text
//! modgate/modbus/request/<mode>     requests  (subscribed as request/**)
//! modgate/modbus/response/<mode>    responses
//! modgate/modbus/poll/<name>        scheduled poll results
//! modgate/modbus/@/status           bridge status
//! modgate/modbus/@/health           request counters
//! ```
//!
//! Where `<mode>` is `tcp`, `rtu` or `ascii`, and the payload is
//! `{"tid": <integer>, "data": <any>, "status": "ok" | "error"}`.

pub mod bridge;
pub mod bus;
pub mod config;
pub mod correlation;
pub mod frame;
pub mod poll;
pub mod stats;
pub mod transport;

pub use bridge::{Admission, Bridge, BridgeOptions};
pub use bus::{BusChannel, BusError, FrameSink, FrameSource};
pub use config::ModbusBridgeConfig;
pub use correlation::{CorrelationError, CorrelationTable};
pub use frame::{Frame, FrameCodec, FrameError, Mode, ModePolicy, Payload, RawFrame, Status, Tid};
pub use poll::{PollError, PollHistory, PollRecord, PollScheduler, PollTask};
pub use transport::{Transport, TransportError};
