//! Event fan-out: in-process bus, durable course event log, and the
//! emitters that tool execution reports through.

mod bus;
mod course_log;
mod emitter;

pub use bus::{BusEvent, EventBus, EventType};
pub use course_log::CourseEventLog;
pub use emitter::{Emitter, EmitterIdentity};
