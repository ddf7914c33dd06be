//! `skarn` is a plugin layer for multiphysics finite element simulations.
//!
//! Governing-equation contributions are expressed as small, independently
//! registered *physics objects* (kernels, boundary conditions, Dirac kernels,
//! DG kernels, scalar kernels, dampers and constraints). The
//! [`NonlinearSystem`](crate::system::NonlinearSystem) coordinator wires these
//! objects into global residual and Jacobian assembly and drives a nonlinear
//! solve through a pluggable solver boundary.
//!
//! The mesh, the sparse vector/matrix primitives and the solver numerics are
//! external collaborators: meshes are consumed through the narrow
//! [`MeshQuery`](crate::mesh::MeshQuery) interface, vectors and matrices are
//! `nalgebra`/`nalgebra-sparse` types, and nonlinear solvers drive the system
//! through the [`NonlinearProblem`](crate::solver::NonlinearProblem) callback
//! contract.
use nalgebra::RealField;
use num::{FromPrimitive, ToPrimitive};

pub mod assembly;
pub mod coupling;
pub mod error;
pub mod mesh;
pub mod metrics;
pub mod objects;
pub mod params;
pub mod registry;
pub mod solution;
pub mod solver;
pub mod system;
pub mod time;
pub mod warehouse;

pub extern crate nalgebra;
pub extern crate nalgebra_sparse;

/// The scalar type used throughout the crate.
///
/// Used as a trait alias for the traits frequently needed by generic
/// numerical routines.
pub trait Real: RealField + FromPrimitive + ToPrimitive + Copy + Send + Sync {}

impl<T> Real for T where T: RealField + FromPrimitive + ToPrimitive + Copy + Send + Sync {}
