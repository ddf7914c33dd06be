//! Residual and Jacobian assembly.
//!
//! `local` holds element-local contexts, gather/scatter helpers and the
//! dense local buffers physics objects write into. `global` owns the worker
//! arena and the parallel passes that accumulate local contributions into
//! global vectors and matrices.
pub mod global;
pub mod local;
