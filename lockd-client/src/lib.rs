//! Client-side guard library for the lock coordinator (§4.5).

pub mod grpc_transport;
pub mod guard;
pub mod proto;
pub mod transport;

pub use grpc_transport::GrpcClientTransport;
pub use guard::{FailReason, LockGuard, LockOptions, LockOutcome, Mode};
pub use transport::{ClientTransport, Dispatcher, TagAllocator};
