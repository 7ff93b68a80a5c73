//! MirrorFS Mirror - Replicated-operation engine
//!
//! Executes operations against a target's local state and replays mutations
//! on the buddy group's secondary. The crate also defines the wire envelopes
//! exchanged between buddies and the transports that carry them.

pub mod engine;
pub mod hook;
pub mod message;
pub mod metrics;
pub mod op;
pub mod replies;
pub mod router;
pub mod tcp;
pub mod transport;

pub use engine::{EngineConfig, MirrorEngine};
pub use hook::ResyncHook;
pub use message::{ForwardId, ForwardOutcome, MirrorRequest, MirrorResponse, RequestFlags};
pub use metrics::EngineMetrics;
pub use op::{BuddyStateOp, ExecMode, MirroredOp, OpReply, Operation, TargetData};
pub use replies::ReplyCache;
pub use router::NodeRouter;
pub use tcp::{TcpTransport, serve};
pub use transport::{LocalTransport, RequestHandler, RetryPolicy, Transport, send_with_retry};
