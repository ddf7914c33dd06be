//! The nonlinear system coordinator.
//!
//! [`NonlinearSystem`] owns the physics object warehouses, the solution and
//! time stepping state, the sparsity pattern and the worker arena. It
//! aggregates per-element, per-node, per-face and per-constraint
//! contributions into the global residual and Jacobian, and exposes itself
//! to external nonlinear solvers through the
//! [`NonlinearProblem`](crate::solver::NonlinearProblem) callbacks.
//!
//! Lifecycle: `Uninitialized → Initialized → TimestepReady →
//! (ResidualEval ⇄ JacobianEval) → Converged | Diverged`. `init` validates
//! kernel coverage and builds the sparsity pattern; `timestep_setup`
//! advances the time state; the solver then drives residual/Jacobian
//! evaluations until it reports convergence.
use crate::assembly::global::{
    build_sparsity_pattern, dg_jacobian_pass, dg_residual_pass, kernel_jacobian_pass,
    kernel_residual_pass, zero_csr_from_pattern, AssemblyInputs, WorkerArena,
};
use crate::assembly::local::{add_to_csr, set_csr_row_to_diagonal};
use crate::coupling::{augment_sparsity, find_implicit_coupling_entries, CouplingGraph, ProximitySearch};
use crate::error::{NumericalFault, SetupError, SolveError};
use crate::mesh::{BoundaryId, DofMap, MeshQuery, SubdomainId};
use crate::metrics::Metrics;
use crate::objects::{
    BlockRestriction, BoundaryRestriction, ConstraintBlock, ConstraintPair, KernelType,
};
use crate::params::Parameters;
use crate::registry::ObjectRegistry;
use crate::solution::SolutionState;
use crate::solver::{NonlinearProblem, NonlinearSolver, SolveReport};
use crate::time::{NonTimeBlend, TimeScheme, TimeState};
use crate::warehouse::WarehouseSet;
use crate::Real;
use eyre::WrapErr;
use itertools::izip;
use log::{info, warn};
use nalgebra::{DMatrix, DMatrixViewMut, DVector, DVectorView, DVectorViewMut, Point3};
use nalgebra_sparse::pattern::SparsityPattern;
use nalgebra_sparse::CsrMatrix;
use ordered_float::OrderedFloat;
use rustc_hash::FxHashSet;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

/// Lifecycle state of the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemState {
    Uninitialized,
    Initialized,
    TimestepReady,
    ResidualEval,
    JacobianEval,
    Converged,
    Diverged,
}

impl SystemState {
    fn name(&self) -> &'static str {
        match self {
            SystemState::Uninitialized => "Uninitialized",
            SystemState::Initialized => "Initialized",
            SystemState::TimestepReady => "TimestepReady",
            SystemState::ResidualEval => "ResidualEval",
            SystemState::JacobianEval => "JacobianEval",
            SystemState::Converged => "Converged",
            SystemState::Diverged => "Diverged",
        }
    }
}

/// The nonlinear system: object storage, assembly orchestration and solve
/// bookkeeping.
pub struct NonlinearSystem<T: Real> {
    mesh: Arc<dyn MeshQuery<T>>,
    search: Arc<dyn ProximitySearch<T>>,
    registry: ObjectRegistry<T>,
    warehouses: WarehouseSet<T>,
    dof_map: DofMap,
    solution: SolutionState<T>,
    time: TimeState<T>,
    arena: WorkerArena<T>,
    num_workers: usize,
    metrics: Metrics,
    state: SystemState,

    pattern: Option<SparsityPattern>,
    /// Couplings required by constraint pairs. Always part of the pattern.
    constraint_graph: CouplingGraph,
    /// Couplings found through geometric search. Part of the pattern only
    /// when enabled.
    geometric_graph: CouplingGraph,
    add_implicit_geometric_coupling: bool,
    use_fd_jacobian: bool,
    predictor_scale: Option<T>,

    /// Scalar DOF offsets, parallel to the scalar kernel list.
    scalar_offsets: Vec<usize>,
    /// Resolved (element, node) per Dirac point, parallel to the Dirac
    /// kernel list. `None` marks points that left the mesh.
    dirac_sites: Vec<Vec<Option<(usize, usize)>>>,
    /// Resolved pairs, parallel to the constraint list.
    constraint_pairs: Vec<Vec<ConstraintPair>>,
    /// Cached non-time residual at the old solution, for schemes that blend
    /// it in.
    nontime_residual_old: Option<DVector<T>>,
    /// DOFs to append to the ghost-exchange send list.
    send_list: Vec<usize>,
    warned: FxHashSet<String>,

    n_nonlinear_iterations: usize,
    n_linear_iterations: usize,
    final_residual_norm: Option<T>,
    converged: bool,
}

impl<T: Real> NonlinearSystem<T> {
    pub fn new(
        mesh: Arc<dyn MeshQuery<T>>,
        search: Arc<dyn ProximitySearch<T>>,
        solution_dim: usize,
        num_workers: usize,
        scheme: TimeScheme,
    ) -> Self {
        let dof_map = DofMap::new(mesh.num_nodes(), solution_dim);
        Self {
            mesh,
            search,
            registry: ObjectRegistry::new(),
            warehouses: WarehouseSet::default(),
            solution: SolutionState::zeros(dof_map.num_dofs()),
            dof_map,
            time: TimeState::new(scheme),
            arena: WorkerArena::new(num_workers, 0),
            num_workers,
            metrics: Metrics::new(),
            state: SystemState::Uninitialized,
            pattern: None,
            constraint_graph: CouplingGraph::new(),
            geometric_graph: CouplingGraph::new(),
            add_implicit_geometric_coupling: false,
            use_fd_jacobian: false,
            predictor_scale: None,
            scalar_offsets: Vec::new(),
            dirac_sites: Vec::new(),
            constraint_pairs: Vec::new(),
            nontime_residual_old: None,
            send_list: Vec::new(),
            warned: FxHashSet::default(),
            n_nonlinear_iterations: 0,
            n_linear_iterations: 0,
            final_residual_norm: None,
            converged: false,
        }
    }

    pub fn registry_mut(&mut self) -> &mut ObjectRegistry<T> {
        &mut self.registry
    }

    pub fn state(&self) -> SystemState {
        self.state
    }

    pub fn mesh(&self) -> &dyn MeshQuery<T> {
        &*self.mesh
    }

    pub fn dof_map(&self) -> &DofMap {
        &self.dof_map
    }

    pub fn time_state(&self) -> &TimeState<T> {
        &self.time
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn solution(&self) -> &SolutionState<T> {
        &self.solution
    }

    /// Overwrites the current solution vector.
    pub fn set_solution(&mut self, solution: &DVector<T>) {
        self.solution.set_current(solution);
    }

    pub fn serialized_solution(&self) -> &DVector<T> {
        self.solution.serialized()
    }

    pub fn residual_copy(&self) -> &DVector<T> {
        self.solution.residual_copy()
    }

    pub fn residual_ghosted(&self) -> &DVector<T> {
        self.solution.residual_ghosted()
    }

    pub fn sparsity_pattern(&self) -> Option<&SparsityPattern> {
        self.pattern.as_ref()
    }

    pub fn send_list(&self) -> &[usize] {
        &self.send_list
    }

    pub fn n_nonlinear_iterations(&self) -> usize {
        self.n_nonlinear_iterations
    }

    pub fn n_linear_iterations(&self) -> usize {
        self.n_linear_iterations
    }

    pub fn final_residual_norm(&self) -> Option<T> {
        self.final_residual_norm
    }

    /// The convergence state reported by the most recent solve.
    pub fn converged(&self) -> bool {
        self.converged
    }

    /// Enables the predictor, which extrapolates the initial iterate of each
    /// step from the previous two solutions, scaled by `scale`.
    pub fn set_predictor_scale(&mut self, scale: T) {
        self.predictor_scale = Some(scale);
    }

    /// Replaces the analytic Jacobian with a finite-differenced one.
    pub fn use_finite_differenced_jacobian(&mut self, enable: bool) {
        self.use_fd_jacobian = enable;
    }

    /// Adds geometric-search-derived couplings to the sparsity pattern.
    pub fn set_add_implicit_geometric_coupling(&mut self, enable: bool) {
        self.add_implicit_geometric_coupling = enable;
    }

    /// Installs time weights supplied by an external stepper.
    pub fn set_external_time_weights(&mut self, weights: Vec<T>) {
        self.time.set_external_weights(weights);
    }

    // Object registration ////

    pub fn add_kernel(
        &mut self,
        type_name: &str,
        name: &str,
        params: &Parameters,
    ) -> eyre::Result<()> {
        self.require_state(SystemState::Uninitialized, "add_kernel")?;
        let kernel = self
            .registry
            .create_kernel(type_name, name, params)
            .wrap_err_with(|| format!("while creating kernel '{}'", name))?;
        let restriction = BlockRestriction::from_parameters(params)?;
        let blocks = self.validated_blocks(name, &restriction)?;
        self.warehouses.kernels.add_object(&blocks, kernel);
        Ok(())
    }

    pub fn add_boundary_condition(
        &mut self,
        type_name: &str,
        name: &str,
        params: &Parameters,
    ) -> eyre::Result<()> {
        self.require_state(SystemState::Uninitialized, "add_boundary_condition")?;
        let bc = self
            .registry
            .create_boundary_condition(type_name, name, params)
            .wrap_err_with(|| format!("while creating boundary condition '{}'", name))?;
        let restriction = BoundaryRestriction::from_parameters(params)?;
        let mesh_boundaries = self.mesh.boundaries();
        for &boundary in &restriction.0 {
            if !mesh_boundaries.contains(&boundary) {
                return Err(SetupError::UnknownBoundary {
                    object: name.to_string(),
                    boundary,
                }
                .into());
            }
        }
        self.warehouses.bcs.add_object(&restriction.0, bc);
        Ok(())
    }

    pub fn add_dg_kernel(
        &mut self,
        type_name: &str,
        name: &str,
        params: &Parameters,
    ) -> eyre::Result<()> {
        self.require_state(SystemState::Uninitialized, "add_dg_kernel")?;
        let dg = self
            .registry
            .create_dg_kernel(type_name, name, params)
            .wrap_err_with(|| format!("while creating DG kernel '{}'", name))?;
        let restriction = BlockRestriction::from_parameters(params)?;
        let blocks = self.validated_blocks(name, &restriction)?;
        self.warehouses.dg_kernels.add_object(&blocks, dg);
        Ok(())
    }

    pub fn add_dirac_kernel(
        &mut self,
        type_name: &str,
        name: &str,
        params: &Parameters,
    ) -> eyre::Result<()> {
        self.require_state(SystemState::Uninitialized, "add_dirac_kernel")?;
        let dirac = self
            .registry
            .create_dirac_kernel(type_name, name, params)
            .wrap_err_with(|| format!("while creating Dirac kernel '{}'", name))?;
        self.warehouses.dirac_kernels.push(dirac);
        Ok(())
    }

    pub fn add_scalar_kernel(
        &mut self,
        type_name: &str,
        name: &str,
        params: &Parameters,
    ) -> eyre::Result<()> {
        self.require_state(SystemState::Uninitialized, "add_scalar_kernel")?;
        let scalar = self
            .registry
            .create_scalar_kernel(type_name, name, params)
            .wrap_err_with(|| format!("while creating scalar kernel '{}'", name))?;
        self.warehouses.scalar_kernels.push(scalar);
        Ok(())
    }

    pub fn add_damper(
        &mut self,
        type_name: &str,
        name: &str,
        params: &Parameters,
    ) -> eyre::Result<()> {
        self.require_state(SystemState::Uninitialized, "add_damper")?;
        let damper = self
            .registry
            .create_damper(type_name, name, params)
            .wrap_err_with(|| format!("while creating damper '{}'", name))?;
        self.warehouses.dampers.push(damper);
        Ok(())
    }

    pub fn add_constraint(
        &mut self,
        type_name: &str,
        name: &str,
        params: &Parameters,
    ) -> eyre::Result<()> {
        self.require_state(SystemState::Uninitialized, "add_constraint")?;
        let constraint = self
            .registry
            .create_constraint(type_name, name, params)
            .wrap_err_with(|| format!("while creating constraint '{}'", name))?;
        self.warehouses.constraints.push(constraint);
        Ok(())
    }

    // Setup ////

    /// Allocates vectors and the worker arena, validates the configuration
    /// and builds the Jacobian sparsity pattern.
    pub fn init(&mut self) -> eyre::Result<()> {
        self.require_state(SystemState::Uninitialized, "init")?;

        self.scalar_offsets = self
            .warehouses
            .scalar_kernels
            .iter()
            .map(|kernel| self.dof_map.allocate_scalar_dofs(kernel.num_dofs()))
            .collect();

        let num_dofs = self.dof_map.num_dofs();
        self.solution = SolutionState::zeros(num_dofs);
        self.arena = WorkerArena::new(self.num_workers, num_dofs);

        self.check_kernel_coverage(&self.mesh.subdomains())?;

        self.resolve_dirac_sites(true)?;
        self.resolve_constraint_pairs();
        self.rebuild_sparsity();
        self.apply_preset_bcs();

        self.state = SystemState::Initialized;
        info!(
            "initialized nonlinear system: {} DOFs, {} kernels, {} BCs, {} constraints",
            num_dofs,
            self.warehouses.kernels.len(),
            self.warehouses.bcs.len(),
            self.warehouses.constraints.len()
        );
        Ok(())
    }

    /// Verifies that every mesh subdomain has at least one active kernel.
    pub fn check_kernel_coverage(
        &self,
        mesh_subdomains: &BTreeSet<SubdomainId>,
    ) -> Result<(), SetupError> {
        let uncovered: Vec<_> = mesh_subdomains
            .iter()
            .copied()
            .filter(|&subdomain| !self.warehouses.kernels.has_objects_for_region(subdomain))
            .collect();
        if uncovered.is_empty() {
            Ok(())
        } else {
            Err(SetupError::MissingKernelCoverage {
                subdomains: uncovered,
            })
        }
    }

    /// Whether any registered kernel contributes to the time term.
    pub fn contains_time_kernel(&self) -> bool {
        self.warehouses
            .kernels
            .objects()
            .iter()
            .any(|kernel| kernel.kernel_type() == KernelType::Time)
    }

    /// Begins a new time step: rotates the solution history, advances the
    /// time state, re-resolves geometric associations, applies the predictor
    /// and preset boundary values and notifies all objects.
    pub fn timestep_setup(&mut self, dt: T) -> Result<(), SolveError> {
        match self.state {
            SystemState::Uninitialized => {
                return Err(SetupError::InvalidState {
                    operation: "timestep_setup",
                    state: self.state.name(),
                }
                .into())
            }
            _ => {}
        }
        if !self.contains_time_kernel() {
            return Err(SetupError::MissingTimeKernel.into());
        }

        self.solution.shift();
        self.time.advance(dt)?;
        self.nontime_residual_old = None;

        // Geometric associations may have moved with the mesh.
        self.resolve_dirac_sites(false)?;
        self.resolve_constraint_pairs();
        self.rebuild_sparsity();

        if let Some(scale) = self.predictor_scale {
            if self.time.step() >= 2 {
                let coeff = scale * self.time.dt() / self.time.dt_old();
                self.solution.apply_predictor(coeff);
            }
        }
        self.apply_preset_bcs();
        self.warehouses.timestep_setup(&self.time);

        if self.time.needs_old_nontime_residual() && self.time.step() >= 1 {
            self.time.compute_time_derivative(&mut self.solution);
            let mut old_residual = DVector::zeros(self.dof_map.num_dofs());
            self.assemble_nontime_residual(true, &mut old_residual)?;
            self.nontime_residual_old = Some(old_residual);
        }

        self.state = SystemState::TimestepReady;
        Ok(())
    }

    // Sparsity ////

    /// Records geometrically related node pairs found by an external search,
    /// extending the implicit coupling graph and the send list.
    pub fn add_geometric_coupling_pairs(&mut self, node_pairs: &[(usize, usize)]) {
        let graph = find_implicit_coupling_entries(node_pairs, &self.dof_map);
        self.geometric_graph.merge(&graph);
        for &(a, b) in node_pairs {
            self.augment_send_list_for_node(a);
            self.augment_send_list_for_node(b);
        }
    }

    /// Rebuilds the sparsity pattern from the mesh topology, the constraint
    /// couplings and (when enabled) the geometric coupling graph.
    ///
    /// Couplings only ever accumulate, so repeated calls with unchanged
    /// search data yield an identical pattern.
    pub fn rebuild_sparsity(&mut self) {
        let scalar_blocks: Vec<_> = self
            .scalar_offsets
            .iter()
            .zip(&self.warehouses.scalar_kernels)
            .map(|(&offset, kernel)| (offset, kernel.num_dofs()))
            .collect();
        let include_faces = !self.warehouses.dg_kernels.is_empty();
        let mut pattern =
            build_sparsity_pattern(&*self.mesh, &self.dof_map, include_faces, &scalar_blocks);
        pattern = augment_sparsity(&pattern, &self.constraint_graph);
        if self.add_implicit_geometric_coupling {
            pattern = augment_sparsity(&pattern, &self.geometric_graph);
        }
        self.pattern = Some(pattern);
    }

    /// A zero Jacobian matrix over the current sparsity pattern.
    pub fn create_jacobian(&self) -> CsrMatrix<T> {
        let pattern = self
            .pattern
            .as_ref()
            .expect("init() must be called before creating Jacobian matrices");
        zero_csr_from_pattern(pattern)
    }

    // Residual and Jacobian evaluation ////

    /// Assembles the full residual at the current solution into `out`.
    ///
    /// On a recoverable fault the output is zeroed so a retry starts from a
    /// clean slate.
    pub fn compute_residual(&mut self, out: &mut DVector<T>) -> Result<(), SolveError> {
        let prior = self.eval_state("compute_residual")?;
        self.state = SystemState::ResidualEval;
        let start = Instant::now();
        let result = self.compute_residual_inner(out);
        self.metrics.record_residual_evaluation(start.elapsed());
        self.state = prior;
        if result.is_err() {
            out.fill(T::zero());
        }
        result
    }

    /// Assembles the full Jacobian at the current solution into `out`,
    /// which must have been created by [`create_jacobian`](Self::create_jacobian).
    pub fn compute_jacobian(&mut self, out: &mut CsrMatrix<T>) -> Result<(), SolveError> {
        let prior = self.eval_state("compute_jacobian")?;
        self.state = SystemState::JacobianEval;
        let start = Instant::now();
        let result = if self.use_fd_jacobian {
            self.compute_fd_jacobian(out)
        } else {
            self.compute_jacobian_inner(out)
        };
        self.metrics.record_jacobian_evaluation(start.elapsed());
        self.state = prior;
        if result.is_err() {
            out.values_mut().fill(T::zero());
        }
        result
    }

    /// The minimum damping factor over all registered dampers, `1` when none
    /// are registered. Factors at or below zero are numerical faults.
    pub fn compute_damping(&mut self, update: &DVector<T>) -> Result<T, NumericalFault> {
        let mut factor = T::one();
        for damper in &self.warehouses.dampers {
            let proposed = damper.compute_damping(
                DVectorView::from(self.solution.current()),
                DVectorView::from(update),
            )?;
            if proposed <= T::zero() {
                return Err(NumericalFault::new(
                    damper.name(),
                    format!("damping factor must lie in (0, 1], got {:?}", proposed),
                ));
            }
            if proposed < factor {
                factor = proposed;
            }
        }
        Ok(factor)
    }

    /// Runs the given solver on this system and records its reported
    /// iteration counts and convergence state.
    pub fn solve(
        &mut self,
        solver: &mut dyn NonlinearSolver<T>,
    ) -> Result<SolveReport<T>, SolveError> {
        match self.state {
            SystemState::Initialized | SystemState::TimestepReady => {}
            _ => {
                return Err(SetupError::InvalidState {
                    operation: "solve",
                    state: self.state.name(),
                }
                .into())
            }
        }

        let mut u = self.solution.current().clone_owned();
        let result = solver.solve(self, &mut u);
        match result {
            Ok(report) => {
                self.solution.set_current(&u);
                self.solution.serialize_solution();
                self.n_nonlinear_iterations = report.iterations;
                self.n_linear_iterations = report.linear_iterations;
                self.final_residual_norm = Some(report.final_residual_norm);
                self.converged = report.converged;
                self.state = if report.converged {
                    SystemState::Converged
                } else {
                    SystemState::Diverged
                };
                info!(
                    "nonlinear solve finished: converged = {}, {} iterations, |r| = {:?}",
                    report.converged, report.iterations, report.final_residual_norm
                );
                Ok(report)
            }
            Err(err) => {
                // Leave the pre-solve solution in place for a retry.
                self.solution.restore();
                self.converged = false;
                self.state = SystemState::Diverged;
                Err(err)
            }
        }
    }

    // Diagnostics ////

    /// The `n` largest-magnitude residual entries, in descending order.
    /// Each entry is logged together with its owning node.
    pub fn print_top_residuals(&self, residual: &DVector<T>, n: usize) -> Vec<(usize, T)> {
        let mut entries: Vec<(usize, T)> = residual.iter().copied().enumerate().collect();
        entries.sort_by_key(|&(_, value)| {
            std::cmp::Reverse(OrderedFloat(value.abs().to_f64().unwrap_or(f64::NAN)))
        });
        entries.truncate(n);
        for &(dof, value) in &entries {
            match self.dof_map.dof_node(dof) {
                Some((node, component)) => {
                    info!(
                        "residual {:?} at node {} component {}",
                        value, node, component
                    );
                }
                None => info!("residual {:?} at scalar DOF {}", value, dof),
            }
        }
        entries
    }

    /// The residual norm of each solution component.
    pub fn variable_residual_norms(&self, residual: &DVector<T>) -> Vec<T> {
        let sdim = self.dof_map.solution_dim();
        let mut norms = vec![T::zero(); sdim];
        for node in 0..self.dof_map.num_nodes() {
            for comp in 0..sdim {
                let r = residual[self.dof_map.node_dof(node, comp)];
                norms[comp] += r * r;
            }
        }
        for norm in &mut norms {
            *norm = norm.sqrt();
        }
        norms
    }

    // Internals ////

    fn require_state(
        &self,
        expected: SystemState,
        operation: &'static str,
    ) -> Result<(), SetupError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(SetupError::InvalidState {
                operation,
                state: self.state.name(),
            })
        }
    }

    fn eval_state(&self, operation: &'static str) -> Result<SystemState, SetupError> {
        match self.state {
            SystemState::Uninitialized => Err(SetupError::InvalidState {
                operation,
                state: self.state.name(),
            }),
            state => Ok(state),
        }
    }

    fn validated_blocks(
        &self,
        name: &str,
        restriction: &BlockRestriction,
    ) -> Result<Vec<SubdomainId>, SetupError> {
        match restriction {
            BlockRestriction::All => Ok(Vec::new()),
            BlockRestriction::Blocks(blocks) => {
                let mesh_subdomains = self.mesh.subdomains();
                for &subdomain in blocks {
                    if !mesh_subdomains.contains(&subdomain) {
                        return Err(SetupError::UnknownSubdomain {
                            object: name.to_string(),
                            subdomain,
                        });
                    }
                }
                Ok(blocks.clone())
            }
        }
    }

    fn augment_send_list_for_node(&mut self, node: usize) {
        for comp in 0..self.dof_map.solution_dim() {
            let dof = self.dof_map.node_dof(node, comp);
            if !self.send_list.contains(&dof) {
                self.send_list.push(dof);
            }
        }
    }

    /// Locates each Dirac point's element and nearest element node. With
    /// `strict`, a point outside the mesh is a fatal error; otherwise it is
    /// skipped with a once-per-kernel warning.
    fn resolve_dirac_sites(&mut self, strict: bool) -> Result<(), SetupError> {
        let mut sites = Vec::with_capacity(self.warehouses.dirac_kernels.len());
        for kernel in &self.warehouses.dirac_kernels {
            let points = kernel.points();
            let mut kernel_sites = Vec::with_capacity(points.len());
            for (point_index, point) in points.iter().enumerate() {
                match self.mesh.element_containing(point) {
                    Some(element) => {
                        let node = nearest_element_node(&*self.mesh, element, point);
                        kernel_sites.push(Some((element, node)));
                    }
                    None if strict => {
                        return Err(SetupError::DiracPointOutsideMesh {
                            object: kernel.name().to_string(),
                            point_index,
                        });
                    }
                    None => {
                        warn_once(
                            &mut self.warned,
                            format!("dirac-outside:{}", kernel.name()),
                            format!(
                                "Dirac kernel '{}' has points outside the mesh; they are skipped",
                                kernel.name()
                            ),
                        );
                        kernel_sites.push(None);
                    }
                }
            }
            sites.push(kernel_sites);
        }
        self.dirac_sites = sites;
        Ok(())
    }

    fn resolve_constraint_pairs(&mut self) {
        let mut all_pairs = Vec::with_capacity(self.warehouses.constraints.len());
        for constraint in &self.warehouses.constraints {
            let pairs = constraint.pairs(&*self.mesh, &*self.search);
            all_pairs.push(pairs);
        }
        self.constraint_pairs = all_pairs;

        let node_pairs: Vec<_> = self
            .constraint_pairs
            .iter()
            .flatten()
            .map(|pair| (pair.slave, pair.master))
            .collect();
        let graph = find_implicit_coupling_entries(&node_pairs, &self.dof_map);
        self.constraint_graph.merge(&graph);
        for &(slave, master) in &node_pairs {
            self.augment_send_list_for_node(slave);
            self.augment_send_list_for_node(master);
        }
    }

    fn apply_preset_bcs(&mut self) {
        let time = self.time.time();
        let sdim = self.dof_map.solution_dim();
        let boundaries: Vec<BoundaryId> = self.warehouses.bcs.all_regions().into_iter().collect();
        let mut presets: Vec<(usize, T)> = Vec::new();
        for boundary in boundaries {
            for bc in self.warehouses.bcs.objects_for_region(boundary) {
                for &node in self.mesh.boundary_nodes(boundary) {
                    let coords = self.mesh.node_coords(node);
                    if let Some(value) = bc.preset_value(node, &coords, time) {
                        for comp in 0..sdim {
                            presets.push((self.dof_map.node_dof(node, comp), value));
                        }
                    }
                }
            }
        }
        let current = self.solution.current_mut();
        for (dof, value) in presets {
            current[dof] = value;
        }
    }

    /// Blend factors for the non-time term. Before the first step the
    /// residual is the plain spatial residual at the current solution.
    fn current_blend(&self) -> NonTimeBlend<T> {
        if self.time.step() == 0 {
            NonTimeBlend {
                current: T::one(),
                old: T::zero(),
            }
        } else {
            self.time.nontime_blend()
        }
    }

    /// Assembles the non-time residual (kernels, DG faces, Dirac points and
    /// scalar kernels) at either the current or the old solution.
    fn assemble_nontime_residual(
        &mut self,
        at_old: bool,
        out: &mut DVector<T>,
    ) -> Result<(), NumericalFault> {
        let eval_time = if at_old {
            self.time.time() - self.time.dt()
        } else {
            self.time.time()
        };
        let u_eval = if at_old {
            self.solution.old()
        } else {
            self.solution.current()
        };
        let inputs = AssemblyInputs {
            mesh: &*self.mesh,
            dof_map: &self.dof_map,
            u: u_eval,
            u_old: self.solution.old(),
            u_dot: self.solution.u_dot(),
            du_dot_du: self.time.du_dot_du(),
            time: eval_time,
        };

        kernel_residual_pass(
            &mut self.arena,
            inputs,
            &self.warehouses.kernels,
            KernelType::NonTime,
            T::one(),
            out,
            &self.metrics,
        )?;
        dg_residual_pass(
            &mut self.arena,
            inputs,
            &self.warehouses.dg_kernels,
            T::one(),
            out,
            &self.metrics,
        )?;

        // Point sources.
        let sdim = self.dof_map.solution_dim();
        for (kernel, sites) in izip!(&self.warehouses.dirac_kernels, &self.dirac_sites) {
            let comp = kernel.component().min(sdim - 1);
            for (point_index, site) in sites.iter().enumerate() {
                if let Some((_, node)) = site {
                    let dof = self.dof_map.node_dof(*node, comp);
                    let value = kernel
                        .residual_at(point_index, u_eval[dof], eval_time)
                        .map_err(|fault| fault.at_node(*node))?;
                    out[dof] += value;
                }
            }
        }

        // Scalar variables.
        for (kernel, &offset) in izip!(&self.warehouses.scalar_kernels, &self.scalar_offsets) {
            let len = kernel.num_dofs();
            let mut local = DVector::zeros(len);
            kernel.residual(
                u_eval.rows(offset, len),
                &self.time,
                DVectorViewMut::from(&mut local),
            )?;
            let mut block = out.rows_mut(offset, len);
            block += &local;
        }

        Ok(())
    }

    fn compute_residual_inner(&mut self, out: &mut DVector<T>) -> Result<(), SolveError> {
        assert_eq!(out.len(), self.dof_map.num_dofs());
        out.fill(T::zero());

        self.time.compute_time_derivative(&mut self.solution);
        let blend = self.current_blend();

        if blend.current != T::zero() {
            let mut nontime = DVector::zeros(out.len());
            self.assemble_nontime_residual(false, &mut nontime)?;
            out.axpy(blend.current, &nontime, T::one());
        }
        if blend.old != T::zero() {
            if self.nontime_residual_old.is_none() {
                let mut old_residual = DVector::zeros(out.len());
                self.assemble_nontime_residual(true, &mut old_residual)?;
                self.nontime_residual_old = Some(old_residual);
            }
            if let Some(old_residual) = &self.nontime_residual_old {
                out.axpy(blend.old, old_residual, T::one());
            }
        }

        // Time term: M(du/dt)-style contributions from time kernels.
        let inputs = AssemblyInputs {
            mesh: &*self.mesh,
            dof_map: &self.dof_map,
            u: self.solution.current(),
            u_old: self.solution.old(),
            u_dot: self.solution.u_dot(),
            du_dot_du: self.time.du_dot_du(),
            time: self.time.time(),
        };
        kernel_residual_pass(
            &mut self.arena,
            inputs,
            &self.warehouses.kernels,
            KernelType::Time,
            T::one(),
            out,
            &self.metrics,
        )?;

        self.apply_constraint_residuals(out)?;
        self.apply_bc_residuals(out)?;

        self.solution.store_residual(out);
        self.solution.serialize_solution();
        Ok(())
    }

    fn apply_constraint_residuals(&self, out: &mut DVector<T>) -> Result<(), NumericalFault> {
        let sdim = self.dof_map.solution_dim();
        let u = self.solution.current();
        for (constraint, pairs) in izip!(&self.warehouses.constraints, &self.constraint_pairs) {
            for pair in pairs {
                for comp in 0..sdim {
                    let slave_dof = self.dof_map.node_dof(pair.slave, comp);
                    let master_dof = self.dof_map.node_dof(pair.master, comp);
                    let correction = constraint
                        .residual(pair, u[slave_dof], u[master_dof])
                        .map_err(|fault| fault.at_node(pair.slave))?;
                    out[slave_dof] += correction.slave;
                    if let Some(master) = correction.master {
                        out[master_dof] += master;
                    }
                }
            }
        }
        Ok(())
    }

    /// Replaces the residual rows of boundary nodes by the nodal boundary
    /// condition values. Later registrations win on shared nodes.
    fn apply_bc_residuals(&self, out: &mut DVector<T>) -> Result<(), NumericalFault> {
        let time = self.time.time();
        let sdim = self.dof_map.solution_dim();
        let u = self.solution.current();
        for boundary in self.warehouses.bcs.all_regions() {
            for bc in self.warehouses.bcs.objects_for_region(boundary) {
                for &node in self.mesh.boundary_nodes(boundary) {
                    let coords = self.mesh.node_coords(node);
                    for comp in 0..sdim {
                        let dof = self.dof_map.node_dof(node, comp);
                        let value = bc
                            .residual(node, &coords, u[dof], time)
                            .map_err(|fault| fault.at_node(node))?;
                        out[dof] = value;
                    }
                }
            }
        }
        Ok(())
    }

    fn compute_jacobian_inner(&mut self, out: &mut CsrMatrix<T>) -> Result<(), SolveError> {
        out.values_mut().fill(T::zero());

        self.time.compute_time_derivative(&mut self.solution);
        let blend = self.current_blend();

        let inputs = AssemblyInputs {
            mesh: &*self.mesh,
            dof_map: &self.dof_map,
            u: self.solution.current(),
            u_old: self.solution.old(),
            u_dot: self.solution.u_dot(),
            du_dot_du: self.time.du_dot_du(),
            time: self.time.time(),
        };

        if blend.current != T::zero() {
            kernel_jacobian_pass(
                &mut self.arena,
                inputs,
                &self.warehouses.kernels,
                KernelType::NonTime,
                blend.current,
                out,
                &self.metrics,
            )?;
            dg_jacobian_pass(
                &mut self.arena,
                inputs,
                &self.warehouses.dg_kernels,
                blend.current,
                out,
                &self.metrics,
            )?;
        }
        kernel_jacobian_pass(
            &mut self.arena,
            inputs,
            &self.warehouses.kernels,
            KernelType::Time,
            T::one(),
            out,
            &self.metrics,
        )?;

        // Point source diagonals.
        if blend.current != T::zero() {
            let sdim = self.dof_map.solution_dim();
            let u = self.solution.current();
            for (kernel, sites) in izip!(&self.warehouses.dirac_kernels, &self.dirac_sites) {
                let comp = kernel.component().min(sdim - 1);
                for (point_index, site) in sites.iter().enumerate() {
                    if let Some((_, node)) = site {
                        let dof = self.dof_map.node_dof(*node, comp);
                        let value = kernel
                            .jacobian_at(point_index, u[dof], self.time.time())
                            .map_err(|fault| fault.at_node(*node))?;
                        if value != T::zero() {
                            add_to_csr(out, dof, dof, blend.current * value);
                        }
                    }
                }
            }

            // Scalar variable blocks.
            for (kernel, &offset) in izip!(&self.warehouses.scalar_kernels, &self.scalar_offsets) {
                let len = kernel.num_dofs();
                let mut local = DMatrix::zeros(len, len);
                kernel.jacobian(
                    self.solution.current().rows(offset, len),
                    &self.time,
                    DMatrixViewMut::from(&mut local),
                )?;
                for i in 0..len {
                    for j in 0..len {
                        let value = local[(i, j)];
                        if value != T::zero() {
                            add_to_csr(out, offset + i, offset + j, blend.current * value);
                        }
                    }
                }
            }
        }

        self.apply_constraint_jacobians(out)?;
        self.apply_bc_jacobians(out)?;
        Ok(())
    }

    /// Adds the four optional Jacobian sub-blocks of every constraint pair.
    /// Undefined blocks leave the matrix untouched.
    fn apply_constraint_jacobians(&self, out: &mut CsrMatrix<T>) -> Result<(), NumericalFault> {
        let sdim = self.dof_map.solution_dim();
        let u = self.solution.current();
        for (constraint, pairs) in izip!(&self.warehouses.constraints, &self.constraint_pairs) {
            for pair in pairs {
                for comp in 0..sdim {
                    let slave_dof = self.dof_map.node_dof(pair.slave, comp);
                    let master_dof = self.dof_map.node_dof(pair.master, comp);
                    for block in ConstraintBlock::ALL {
                        let value = constraint
                            .jacobian(pair, block, u[slave_dof], u[master_dof])
                            .map_err(|fault| fault.at_node(pair.slave))?;
                        if let Some(value) = value {
                            let (row, col) = match block {
                                ConstraintBlock::SlaveSlave => (slave_dof, slave_dof),
                                ConstraintBlock::SlaveMaster => (slave_dof, master_dof),
                                ConstraintBlock::MasterSlave => (master_dof, slave_dof),
                                ConstraintBlock::MasterMaster => (master_dof, master_dof),
                            };
                            add_to_csr(out, row, col, value);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Replaces the Jacobian rows of boundary nodes by their nodal
    /// derivative on the diagonal.
    fn apply_bc_jacobians(&self, out: &mut CsrMatrix<T>) -> Result<(), NumericalFault> {
        let time = self.time.time();
        let sdim = self.dof_map.solution_dim();
        let u = self.solution.current();
        for boundary in self.warehouses.bcs.all_regions() {
            for bc in self.warehouses.bcs.objects_for_region(boundary) {
                for &node in self.mesh.boundary_nodes(boundary) {
                    let coords = self.mesh.node_coords(node);
                    for comp in 0..sdim {
                        let dof = self.dof_map.node_dof(node, comp);
                        let derivative = bc
                            .jacobian(node, &coords, u[dof], time)
                            .map_err(|fault| fault.at_node(node))?;
                        set_csr_row_to_diagonal(out, dof, derivative);
                    }
                }
            }
        }
        Ok(())
    }

    /// Finite-differenced Jacobian over the sparsity pattern, using forward
    /// differences of the full residual.
    fn compute_fd_jacobian(&mut self, out: &mut CsrMatrix<T>) -> Result<(), SolveError> {
        let n = self.dof_map.num_dofs();
        let mut base_residual = DVector::zeros(n);
        self.compute_residual_inner(&mut base_residual)?;

        // Rows touching each column, from the pattern transpose.
        let mut column_rows: Vec<Vec<usize>> = vec![Vec::new(); n];
        {
            let pattern = out.pattern();
            for row in 0..n {
                for &col in pattern.lane(row) {
                    column_rows[col].push(row);
                }
            }
        }

        let sqrt_eps = T::from_f64(f64::EPSILON.sqrt()).unwrap();
        let u_saved = self.solution.current().clone_owned();
        let mut perturbed_residual = DVector::zeros(n);
        out.values_mut().fill(T::zero());

        for col in 0..n {
            let u_col = u_saved[col];
            let eps = sqrt_eps * (T::one() + u_col.abs());
            self.solution.current_mut()[col] = u_col + eps;

            let result = self.compute_residual_inner(&mut perturbed_residual);
            self.solution.current_mut()[col] = u_col;
            result?;

            for &row in &column_rows[col] {
                let derivative = (perturbed_residual[row] - base_residual[row]) / eps;
                if let Some(nalgebra_sparse::SparseEntryMut::NonZero(entry)) =
                    out.get_entry_mut(row, col)
                {
                    *entry = derivative;
                }
            }
        }

        // Re-establish the stored residual at the unperturbed solution.
        self.solution.set_current(&u_saved);
        self.solution.store_residual(&base_residual);
        Ok(())
    }
}

impl<T: Real> NonlinearProblem<T> for NonlinearSystem<T> {
    fn num_dofs(&self) -> usize {
        self.dof_map.num_dofs()
    }

    fn create_jacobian_matrix(&self) -> CsrMatrix<T> {
        self.create_jacobian()
    }

    fn residual(&mut self, u: &DVector<T>, out: &mut DVector<T>) -> Result<(), SolveError> {
        self.solution.set_current(u);
        self.compute_residual(out)
    }

    fn jacobian(&mut self, u: &DVector<T>, out: &mut CsrMatrix<T>) -> Result<(), SolveError> {
        self.solution.set_current(u);
        self.compute_jacobian(out)
    }

    fn damping(&mut self, u: &DVector<T>, update: &DVector<T>) -> Result<T, SolveError> {
        self.solution.set_current(u);
        Ok(self.compute_damping(update)?)
    }
}

/// The node of an element closest to a point.
fn nearest_element_node<T: Real>(
    mesh: &dyn MeshQuery<T>,
    element: usize,
    point: &Point3<T>,
) -> usize {
    let nodes = mesh.element_nodes(element);
    let mut best = nodes[0];
    let mut best_dist = (mesh.node_coords(best) - point).norm_squared();
    for &node in &nodes[1..] {
        let dist = (mesh.node_coords(node) - point).norm_squared();
        if dist < best_dist {
            best = node;
            best_dist = dist;
        }
    }
    best
}

/// Logs a warning at most once per key.
fn warn_once(warned: &mut FxHashSet<String>, key: String, message: String) {
    if warned.insert(key) {
        warn!("{}", message);
    }
}
