//! Stages that compute a result record instead of writing to a collaborator

pub mod bridge;
pub mod splitter;
pub mod task_launch;
pub mod transform;

pub use bridge::BridgeFunction;
pub use splitter::{SplitMode, Splitter, SplitterConfig, SplitterFunction};
pub use task_launch::{parse_key_value_pairs, TaskLaunchConfig, TaskLaunchRequestFunction};
pub use transform::{TransformConfig, TransformFunction};
