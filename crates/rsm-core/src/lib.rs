//! Shared core for the RemoteShell dispatch fabric.
//!
//! Everything both sides of the wire must agree on lives here: the frame
//! protocol, the command/agent data model, the validation policy, and the
//! token table. The coordinator and the agent validate commands with the
//! exact same code path.

pub mod policy;
pub mod protocol;
pub mod tokens;
pub mod types;

pub use policy::{CommandPolicy, Rejection};
pub use protocol::{Frame, FrameError, PolicyEcho, MAX_FRAME_BYTES};
pub use tokens::TokenMap;
pub use types::{AgentRecord, AgentStatus, CommandRecord, CommandStatus};
