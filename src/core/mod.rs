//! Core functionality module
//!
//! Contains the tree model, filtering, token counting, the initial scan,
//! change watching and background maintenance

pub mod builder;
pub mod events;
pub mod filter;
pub mod maintenance;
pub mod shared;
pub mod tokens;
pub mod tree;
pub mod view;
pub mod watcher;

// Re-export main types
pub use builder::TreeBuilder;
pub use events::{BuildSummary, ChangeSignal, CycleSummary};
pub use filter::FileFilter;
pub use maintenance::Maintenance;
pub use shared::SharedTree;
pub use tokens::{EstimateTokenizer, TiktokenTokenizer, TokenCallback, TokenCountManager, Tokenizer};
pub use tree::{Node, NodeId, NodeKind, RemovedNode, Tree};
pub use view::{FlatEntry, NodeViewState, ViewState};
pub use watcher::FileWatcher;
