//! Shared data model for the solar fleet monitor.
//!
//! Everything downstream of a plugin's dynamic read is described here: the
//! closed set of standard keys every device reports into, the raw value
//! shapes a plugin can produce, and the wrapped `{value, unit}` shape
//! consumers see once the processor has merged and filtered a cycle.
//!
//! Power and current sign convention, system-wide: battery power/current
//! positive means discharging, negative means charging. Plugins whose wire
//! protocol disagrees invert the sign before returning their packet.

pub mod keys;
pub mod value;

pub use keys::{StandardKey, DeviceCategory, FULLY_OPERATIONAL_STATUSES, WAITING_STATUSES};
pub use value::{Value, Wrapped, DataPacket, WrappedPacket};
