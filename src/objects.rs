//! Physics object traits.
//!
//! Every governing-equation contribution is a small object implementing one
//! of the traits below. Objects are registered with the
//! [`NonlinearSystem`](crate::system::NonlinearSystem) through a factory and
//! stored in warehouses; assembly invokes them per element, per boundary
//! node, per face or per constraint pair.
//!
//! Cross-cutting capabilities (block restriction, boundary restriction) are
//! small value types resolved from parameters by the coordinator at
//! registration time rather than trait layers on the objects themselves.
use crate::assembly::local::{ElementContext, FaceContext};
use crate::error::{NumericalFault, SetupError};
use crate::mesh::{BoundaryId, MeshQuery, SubdomainId};
use crate::params::Parameters;
use crate::time::TimeState;
use crate::Real;
use nalgebra::{DMatrixViewMut, DVectorView, DVectorViewMut, Point3};
use serde::{Deserialize, Serialize};

/// Base capability shared by all physics objects.
pub trait PhysicsObject<T: Real>: Send + Sync {
    /// The instance name the object was registered under.
    fn name(&self) -> &str;

    /// Per-step setup hook, called once at the beginning of each time step.
    fn timestep_setup(&self, _time: &TimeState<T>) {}
}

/// Restriction of an object to a set of subdomains.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockRestriction {
    /// Active on every subdomain.
    #[default]
    All,
    Blocks(Vec<SubdomainId>),
}

impl BlockRestriction {
    /// Resolves the restriction from the conventional `blocks` parameter.
    pub fn from_parameters(params: &Parameters) -> Result<Self, SetupError> {
        Ok(match params.subdomains("blocks")? {
            Some(ids) => BlockRestriction::Blocks(ids.to_vec()),
            None => BlockRestriction::All,
        })
    }

    pub fn covers(&self, subdomain: SubdomainId) -> bool {
        match self {
            BlockRestriction::All => true,
            BlockRestriction::Blocks(ids) => ids.contains(&subdomain),
        }
    }
}

/// Restriction of an object to a set of boundaries. Boundary-bound objects
/// must name at least one boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundaryRestriction(pub Vec<BoundaryId>);

impl BoundaryRestriction {
    /// Resolves the restriction from the conventional `boundaries` parameter.
    pub fn from_parameters(params: &Parameters) -> Result<Self, SetupError> {
        let ids = params.boundaries("boundaries")?;
        if ids.is_empty() {
            return Err(SetupError::MalformedParameter {
                parameter: "boundaries".to_string(),
                expected: "non-empty Boundaries",
            });
        }
        Ok(Self(ids.to_vec()))
    }
}

/// Whether a kernel contributes to the time term or to the spatial term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelType {
    Time,
    NonTime,
}

/// A volumetric contribution, invoked once per element of the kernel's
/// active subdomains.
///
/// Residual and Jacobian routines accumulate into element-local dense
/// buffers; scatter into global storage is handled by assembly.
pub trait Kernel<T: Real>: PhysicsObject<T> {
    fn kernel_type(&self) -> KernelType {
        KernelType::NonTime
    }

    fn residual(
        &self,
        ctx: &ElementContext<'_, T>,
        output: DVectorViewMut<'_, T>,
    ) -> Result<(), NumericalFault>;

    fn jacobian(
        &self,
        ctx: &ElementContext<'_, T>,
        output: DMatrixViewMut<'_, T>,
    ) -> Result<(), NumericalFault>;
}

/// A nodal boundary condition.
///
/// The residual value *replaces* the accumulated residual at each node of
/// the active boundaries, and the corresponding Jacobian row is replaced by
/// the diagonal derivative.
pub trait BoundaryCondition<T: Real>: PhysicsObject<T> {
    /// Residual at a boundary node with solution value `u`.
    fn residual(
        &self,
        node: usize,
        coords: &Point3<T>,
        u: T,
        time: T,
    ) -> Result<T, NumericalFault>;

    /// Derivative of the nodal residual with respect to `u`.
    fn jacobian(
        &self,
        _node: usize,
        _coords: &Point3<T>,
        _u: T,
        _time: T,
    ) -> Result<T, NumericalFault> {
        Ok(T::one())
    }

    /// A value to write into the solution before the solve starts, if the
    /// condition prescribes one.
    fn preset_value(&self, _node: usize, _coords: &Point3<T>, _time: T) -> Option<T> {
        None
    }
}

/// A point source contribution.
///
/// The system locates the element containing each declared point and adds
/// the contribution to the node of that element nearest to the point.
pub trait DiracKernel<T: Real>: PhysicsObject<T> {
    fn points(&self) -> Vec<Point3<T>>;

    /// Solution component the point source applies to.
    fn component(&self) -> usize {
        0
    }

    /// Residual contribution of the point with the given index.
    fn residual_at(&self, point_index: usize, u: T, time: T) -> Result<T, NumericalFault>;

    /// Diagonal Jacobian contribution of the point with the given index.
    fn jacobian_at(&self, _point_index: usize, _u: T, _time: T) -> Result<T, NumericalFault> {
        Ok(T::zero())
    }
}

/// Jacobian sub-blocks of an interior-face contribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DgJacobianBlock {
    ElementElement,
    ElementNeighbor,
    NeighborElement,
    NeighborNeighbor,
}

/// A discontinuous-Galerkin interface contribution, invoked once per
/// interior face whose owning element lies in an active subdomain.
pub trait DgKernel<T: Real>: PhysicsObject<T> {
    /// Accumulates the face residual into the element-side and neighbor-side
    /// local vectors.
    fn residual(
        &self,
        face: &FaceContext<'_, T>,
        element_output: DVectorViewMut<'_, T>,
        neighbor_output: DVectorViewMut<'_, T>,
    ) -> Result<(), NumericalFault>;

    /// Accumulates one Jacobian sub-block of the face contribution.
    fn jacobian(
        &self,
        face: &FaceContext<'_, T>,
        block: DgJacobianBlock,
        output: DMatrixViewMut<'_, T>,
    ) -> Result<(), NumericalFault>;
}

/// A contribution on scalar (off-mesh) degrees of freedom.
pub trait ScalarKernel<T: Real>: PhysicsObject<T> {
    /// Number of scalar DOFs owned by this kernel.
    fn num_dofs(&self) -> usize;

    /// Residual on the kernel's scalar DOF block.
    fn residual(
        &self,
        u: DVectorView<'_, T>,
        time: &TimeState<T>,
        output: DVectorViewMut<'_, T>,
    ) -> Result<(), NumericalFault>;

    /// Jacobian on the kernel's scalar DOF block.
    fn jacobian(
        &self,
        u: DVectorView<'_, T>,
        time: &TimeState<T>,
        output: DMatrixViewMut<'_, T>,
    ) -> Result<(), NumericalFault>;
}

/// Proposes a damping factor for a nonlinear update.
///
/// The factor must lie in `(0, 1]`. Values at or below zero are reported as
/// numerical faults by the coordinator.
pub trait Damper<T: Real>: PhysicsObject<T> {
    fn compute_damping(
        &self,
        u: DVectorView<'_, T>,
        update: DVectorView<'_, T>,
    ) -> Result<T, NumericalFault>;
}

/// A slave/master node association produced by a constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstraintPair {
    pub slave: usize,
    pub master: usize,
}

/// Jacobian sub-blocks of a constraint contribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintBlock {
    SlaveSlave,
    SlaveMaster,
    MasterSlave,
    MasterMaster,
}

impl ConstraintBlock {
    pub const ALL: [ConstraintBlock; 4] = [
        ConstraintBlock::SlaveSlave,
        ConstraintBlock::SlaveMaster,
        ConstraintBlock::MasterSlave,
        ConstraintBlock::MasterMaster,
    ];
}

/// Residual corrections of a constraint pair. Both entries are additive;
/// an absent master entry leaves the master DOF untouched.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConstraintResidual<T> {
    pub slave: T,
    pub master: Option<T>,
}

/// A paired-DOF coupling condition.
///
/// Pairs may depend on geometric proximity and are re-resolved at every time
/// step, so constraints on a displaced mesh follow the motion. Each of the
/// four Jacobian sub-blocks is an independently optional contribution;
/// `None` means no correction in that coupling direction, and the matrix is
/// left untouched there.
pub trait Constraint<T: Real>: PhysicsObject<T> {
    /// Resolves the current slave/master pairs.
    fn pairs(
        &self,
        mesh: &dyn MeshQuery<T>,
        search: &dyn crate::coupling::ProximitySearch<T>,
    ) -> Vec<ConstraintPair>;

    /// Residual corrections for one pair.
    fn residual(
        &self,
        pair: &ConstraintPair,
        u_slave: T,
        u_master: T,
    ) -> Result<ConstraintResidual<T>, NumericalFault>;

    /// One Jacobian sub-block for one pair, or `None` when the block is
    /// undefined.
    fn jacobian(
        &self,
        pair: &ConstraintPair,
        block: ConstraintBlock,
        u_slave: T,
        u_master: T,
    ) -> Result<Option<T>, NumericalFault>;
}
