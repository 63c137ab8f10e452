//! Distributes per-pixel Mandelbrot iteration work across a pool of local
//! threads and/or remote worker nodes, and keeps producing correct images
//! even when a worker never answers.
//!
//! The moving parts, bottom up:
//!
//! - [`distributed`] — the framed wire protocol (task and result sheets) and
//!   the TCP plumbing on both ends of it
//! - [`scheduler`] — the shared priority work queue, the local worker pool,
//!   and the scheduler that tracks outstanding tasks, re-queues the ones
//!   whose worker went silent, and discards late or duplicate results
//! - [`render`] — the workload: viewport handling, decomposition of an image
//!   request into row-range sub-tasks, and the merge of sub-results into the
//!   finished buffer
//!
//! An embedding application constructs one [`render::RenderEngine`] and
//! drives it through [`render::RenderEngine::start_generation`] and friends;
//! finished images arrive via a registered completion callback.

pub mod distributed;
pub mod errors;
pub mod render;
pub mod scheduler;
