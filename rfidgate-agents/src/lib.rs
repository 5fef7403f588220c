//! RFIDGATE Agents - Remote Control of Edge Agents
//!
//! [`AgentQueue`] is a per-agent, lease-based RPC queue: the UI enqueues a
//! command, the agent polls and leases it, then posts a reply that is
//! correlated back by `request_id`. [`AgentRegistry`] tracks which agents
//! sent a heartbeat recently.

mod queue;
mod registry;

pub use queue::{
    normalize_args, AgentCommand, AgentQueue, AgentReply, CommandResult, EnqueueRequest, Enqueued,
    ReplyAck, ReplyRequest, ResultState, DEFAULT_POLL_ITEMS, MAX_COMMAND_LEN, MAX_POLL_ITEMS,
    TIMEOUT_ERROR,
};
pub use registry::{AgentRegistry, RegisterRequest, MAX_UI_URLS};
