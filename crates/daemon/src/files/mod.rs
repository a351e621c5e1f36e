//! Workspace sandbox.
//!
//! Every shell runs inside a single workspace root, and every client-supplied
//! path is checked against that root before it reaches the filesystem.
//!
//! # Security
//!
//! Paths are normalized lexically first, then compared component-wise against
//! the canonical root. Existing paths (or their nearest existing ancestor) are
//! canonicalized as well so symlinks cannot point outside the root.

pub mod sandbox;

pub use sandbox::{SandboxError, WorkspaceRoot};
