//! Method dispatch for the MCP relay.
//!
//! Provides:
//! - `Handler` trait implemented by external collaborators
//! - `Registry` - immutable method table with schema validation and
//!   execution budgets
//! - Built-in methods (`echo`, `session/info`, `server/config`,
//!   `report/write`, `report/read`, `report/list`)

pub mod builtin;
pub mod handler;
pub mod registry;
pub mod schema;

pub use builtin::{BuiltinDeps, register_builtins};
pub use handler::{FnHandler, Handler, HandlerFailure, HandlerOutput, Invocation, handler_fn};
pub use registry::{
    Capability, CapabilityInfo, DispatchError, MethodOptions, Registry, RegistryBuilder,
    RegistryError,
};
pub use schema::{ParamSchema, SchemaError};
