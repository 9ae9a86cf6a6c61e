//! ABOUTME: Core types and infrastructure for lldbg
//! ABOUTME: Provides the error type, protocol model, command grammar and configuration

pub mod commands;
pub mod config;
pub mod error;
pub mod protocol;

// Re-export commonly used types
pub use commands::{BreakSpec, Command, PropsKind};
pub use config::DebugConfig;
pub use error::{DebugError, Result};
pub use protocol::{
    BreakType, BreakpointInfo, Frame, LengthField, MappedLocation, Message, ProtocolWriter,
    ThreadInfo, ValueInfo, Variable, FRAME_END, FRAME_START, PROTOCOL_TAG,
};
