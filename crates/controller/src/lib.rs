//! Lifecycle-managed YOLO detection node.
//!
//! [`YoloNode`] owns the lifecycle; [`FrameProcessor`] runs the per-image
//! pipeline while the node is active.

pub mod config;
pub mod node;
pub mod processor;
pub mod state_machine;

pub use config::{ConfigError, Configuration, NodeConfig};
pub use node::{LifecycleError, YoloNode};
pub use processor::{FrameError, FrameOutcome, FrameProcessor};
pub use state_machine::{InvalidTransition, LifecycleState, StateMachine, Transition};
