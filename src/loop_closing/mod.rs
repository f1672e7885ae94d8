//! Loop closing: candidate search, verification and pose-graph correction.
//!
//! The pipeline consists of:
//! 1. **Detection** (`detector.rs`): spatially close, topologically distant keyframes
//! 2. **Verification** (`loop_closer.rs`): particle filter registration of each candidate
//! 3. **Solving** (`solver.rs`): the pose-graph optimizer boundary
//!
//! # Threading Model
//!
//! The LoopCloser runs in its own thread, receiving requests from the
//! pipeline via a channel:
//! - Phase 1 (COLLECT): Read lock to snapshot the keyframe graph
//! - Phase 2 (SOLVE): No lock, verification and pose-graph solve
//! - Phase 3 (APPLY): done by the pipeline under its write lock

pub mod detector;
pub mod loop_closer;
pub mod solver;

pub use detector::{find_candidates, LoopCandidate};
pub use loop_closer::{spawn_loop_closer, LoopCloser, LoopCloserStats};
pub use solver::{PoseGraphProblem, PoseGraphSolver, RigidRebaseSolver, SolverError};
