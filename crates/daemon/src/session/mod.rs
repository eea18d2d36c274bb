//! Session management module.
//!
//! This module provides PTY spawning and session lifecycle management.
//! Sessions are created, fed input, streamed to any number of consumers,
//! resized and removed.

pub mod broadcaster;
pub mod gateway;
pub mod pty;
pub mod registry;

pub use broadcaster::{ConsumerId, ConsumerStats, OutputBroadcaster, QueueLimits, Subscription};
pub use gateway::InputGateway;
pub use pty::{ExitInfo, ProcessHandle, SessionError, SpawnParams, TerminalSize};
pub use registry::{RegistryConfig, Session, SessionRegistry, SessionStatus};
