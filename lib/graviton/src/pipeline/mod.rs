//! The pipelines: a worker pool for local execution, a socket pipeline per
//! node for the cluster fabric, a deadline pipeline for timer kernels, a
//! Unix-domain pipeline for the local control surface and a process
//! pipeline for child applications.

pub mod child;
pub mod conn;
pub mod event;
pub mod local;
pub mod process;
pub mod remote;
pub mod timer;
pub mod unix;
