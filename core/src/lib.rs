//! Call coordination for Envoy.
//!
//! Every model invocation goes through one [`Coordinator`]:
//!
//! - [`pool`] - one shared handle per model id
//! - [`gate`] - serializes calls to local backends, lets remote calls overlap
//! - [`executor`] - runs the call and records token usage in the background
//! - [`parser`] - pulls a validated JSON object out of free-form model text
//!
//! The coordinator ties them together and adds attribution defaults and the
//! per-request override hook ([`LlmCaller`]).

mod coordinator;
pub mod errors;
pub mod executor;
pub mod gate;
pub mod parser;
pub mod pool;
mod request;

pub use coordinator::Coordinator;
pub use errors::CoordinatorError;
pub use executor::CallExecutor;
pub use gate::{GatePermit, LocalModelMatcher, SerializationGate};
pub use parser::{CallOutcome, CallResult, extract_json_object, missing_fields, parse_and_validate};
pub use pool::ModelPool;
pub use request::{CallFut, CallOptions, CallRequest, LlmCaller, caller_fn};

pub use envoy_config::CallDefaults;
