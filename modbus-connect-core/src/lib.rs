//! Modbus Connect polling engine.
//!
//! Polls a Modbus TCP gateway on behalf of many logical entities that
//! share one physical connection:
//!
//! - [`entity`] - Entity descriptors, control variants and mirror derivation
//! - [`value`] - Raw payloads and decoded values
//! - [`convert`] - The decode pipeline turning payloads into typed values
//! - [`plan`] - Read planning: coalescing entity reads into minimal transactions
//! - [`gateway`] - Connection management, the transaction lock and plan execution
//! - [`coordinator`] - Periodic poll cycles and the published value cache
//! - [`logging`] - Tracing bootstrap
//!
//! Entity descriptors go in, decoded values come out; everything between
//! (planning, chunking, partial-failure isolation, serialization of wire
//! access) is handled here.

pub mod convert;
pub mod coordinator;
pub mod entity;
pub mod gateway;
pub mod logging;
pub mod plan;
pub mod value;

// Re-export commonly used types at the crate root
pub use convert::{DecodeError, decode};
pub use coordinator::{
    CachedValue, DEFAULT_MAX_READ_SIZE, DEFAULT_REFRESH_INTERVAL, PollCoordinator,
};
pub use entity::{
    ControlKind, Conversion, EntityDescriptor, ModbusDataType, SlaveEntity, mirror_sensor,
};
pub use gateway::{
    Gateway, GatewayError, ModbusTransport, PollResult, ReadOutcome, TcpTransport, close_all,
    get_connection,
};
pub use logging::{InitTracingError, LogFormat, LoggingConfig, init_tracing};
pub use plan::{EntitySegment, PlanError, ReadOperation, ReadPlan, build_plan};
pub use value::{Payload, Value};
