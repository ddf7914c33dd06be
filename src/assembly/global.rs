//! Parallel assembly passes.
//!
//! A fixed arena of per-worker contexts is built once at setup. Each pass
//! splits the element (or face) range into disjoint contiguous chunks, one
//! per worker; a worker accumulates into its own full-length vector or
//! triplet buffer and returns a result value. The coordinator merges the
//! buffers after the barrier, so accumulation into global storage is
//! single-writer and faults never leave partially-summed state behind.
use crate::assembly::local::{
    fault_at_element, gather_global_to_local, scatter_local_to_global, ElementContext, FaceContext,
};
use crate::error::NumericalFault;
use crate::mesh::{DofMap, InteriorFace, MeshQuery, SubdomainId};
use crate::metrics::Metrics;
use crate::objects::{DgJacobianBlock, DgKernel, Kernel, KernelType};
use crate::warehouse::Warehouse;
use crate::Real;
use nalgebra::{DMatrix, DMatrixViewMut, DVector, DVectorView, DVectorViewMut, Point3};
use nalgebra_sparse::pattern::SparsityPattern;
use nalgebra_sparse::CsrMatrix;
use rayon::iter::{
    IndexedParallelIterator, IntoParallelIterator, IntoParallelRefMutIterator, ParallelIterator,
};
use std::collections::BTreeSet;
use std::ops::Range;

/// Per-worker scratch buffers.
///
/// All members are reused across elements and passes to avoid per-element
/// allocation.
#[derive(Debug)]
pub struct WorkerContext<T: Real> {
    coords: Vec<Point3<T>>,
    neighbor_coords: Vec<Point3<T>>,
    u_local: DVector<T>,
    u_old_local: DVector<T>,
    u_dot_local: DVector<T>,
    u_neighbor_local: DVector<T>,
    local_vector: DVector<T>,
    neighbor_vector: DVector<T>,
    local_matrix: DMatrix<T>,
    /// Full-length accumulation vector, merged by the coordinator.
    accumulator: DVector<T>,
    /// Jacobian contributions as (row, col, value) triplets.
    triplets: Vec<(usize, usize, T)>,
    visited: u64,
}

impl<T: Real> WorkerContext<T> {
    fn new(num_dofs: usize) -> Self {
        Self {
            coords: Vec::new(),
            neighbor_coords: Vec::new(),
            u_local: DVector::zeros(0),
            u_old_local: DVector::zeros(0),
            u_dot_local: DVector::zeros(0),
            u_neighbor_local: DVector::zeros(0),
            local_vector: DVector::zeros(0),
            neighbor_vector: DVector::zeros(0),
            local_matrix: DMatrix::zeros(0, 0),
            accumulator: DVector::zeros(num_dofs),
            triplets: Vec::new(),
            visited: 0,
        }
    }

    fn reset(&mut self) {
        self.accumulator.fill(T::zero());
        self.triplets.clear();
        self.visited = 0;
    }
}

/// The arena of per-worker contexts. Constructed once at system
/// initialization and never resized during assembly.
#[derive(Debug)]
pub struct WorkerArena<T: Real> {
    workers: Vec<WorkerContext<T>>,
}

impl<T: Real> WorkerArena<T> {
    pub fn new(num_workers: usize, num_dofs: usize) -> Self {
        assert!(num_workers >= 1, "the arena needs at least one worker");
        Self {
            workers: (0..num_workers)
                .map(|_| WorkerContext::new(num_dofs))
                .collect(),
        }
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }
}

/// Read-only inputs shared by all workers during one pass.
#[derive(Copy, Clone)]
pub struct AssemblyInputs<'a, T: Real> {
    pub mesh: &'a dyn MeshQuery<T>,
    pub dof_map: &'a DofMap,
    /// Solution the pass evaluates at. Not necessarily the current solution:
    /// some time schemes evaluate the non-time term at the old one.
    pub u: &'a DVector<T>,
    pub u_old: &'a DVector<T>,
    pub u_dot: &'a DVector<T>,
    pub du_dot_du: T,
    pub time: T,
}

/// Splits `0..len` into `chunks` contiguous ranges of near-equal size.
fn split_range(len: usize, chunks: usize) -> Vec<Range<usize>> {
    let chunk_size = (len + chunks - 1) / chunks.max(1);
    (0..chunks)
        .map(|i| {
            let start = (i * chunk_size).min(len);
            let end = ((i + 1) * chunk_size).min(len);
            start..end
        })
        .collect()
}

/// Collects the outcome of all workers: the first fault in worker order, or
/// the per-worker buffers for merging.
fn first_fault(results: Vec<Result<(), NumericalFault>>) -> Result<(), NumericalFault> {
    for result in results {
        result?;
    }
    Ok(())
}

/// Runs a residual pass over all elements with the kernels of the given
/// kind, adding `scale` times the accumulated contribution into `out`.
///
/// On a fault, `out` is left untouched.
pub fn kernel_residual_pass<T: Real>(
    arena: &mut WorkerArena<T>,
    inputs: AssemblyInputs<'_, T>,
    kernels: &Warehouse<SubdomainId, dyn Kernel<T>>,
    kind: KernelType,
    scale: T,
    out: &mut DVector<T>,
    metrics: &Metrics,
) -> Result<(), NumericalFault> {
    if kernels.is_empty() {
        return Ok(());
    }
    let ranges = split_range(inputs.mesh.num_elements(), arena.num_workers());
    let results: Vec<_> = arena
        .workers
        .par_iter_mut()
        .zip(ranges.into_par_iter())
        .map(|(worker, range)| {
            worker.reset();
            for element in range {
                worker_element_residual(worker, &inputs, kernels, kind, element)?;
            }
            Ok(())
        })
        .collect();
    first_fault(results)?;
    merge_vectors(arena, scale, out);
    metrics.add_elements_visited(total_visited(arena));
    Ok(())
}

/// Runs a Jacobian pass over all elements with the kernels of the given
/// kind, adding `scale` times the accumulated contribution into `out`.
pub fn kernel_jacobian_pass<T: Real>(
    arena: &mut WorkerArena<T>,
    inputs: AssemblyInputs<'_, T>,
    kernels: &Warehouse<SubdomainId, dyn Kernel<T>>,
    kind: KernelType,
    scale: T,
    out: &mut CsrMatrix<T>,
    metrics: &Metrics,
) -> Result<(), NumericalFault> {
    if kernels.is_empty() {
        return Ok(());
    }
    let ranges = split_range(inputs.mesh.num_elements(), arena.num_workers());
    let results: Vec<_> = arena
        .workers
        .par_iter_mut()
        .zip(ranges.into_par_iter())
        .map(|(worker, range)| {
            worker.reset();
            for element in range {
                worker_element_jacobian(worker, &inputs, kernels, kind, element)?;
            }
            Ok(())
        })
        .collect();
    first_fault(results)?;
    merge_triplets(arena, scale, out);
    metrics.add_elements_visited(total_visited(arena));
    Ok(())
}

/// Runs a residual pass over all interior faces with the registered DG
/// kernels, adding `scale` times the accumulated contribution into `out`.
pub fn dg_residual_pass<T: Real>(
    arena: &mut WorkerArena<T>,
    inputs: AssemblyInputs<'_, T>,
    dg_kernels: &Warehouse<SubdomainId, dyn DgKernel<T>>,
    scale: T,
    out: &mut DVector<T>,
    metrics: &Metrics,
) -> Result<(), NumericalFault> {
    if dg_kernels.is_empty() {
        return Ok(());
    }
    let faces = inputs.mesh.interior_faces();
    let ranges = split_range(faces.len(), arena.num_workers());
    let results: Vec<_> = arena
        .workers
        .par_iter_mut()
        .zip(ranges.into_par_iter())
        .map(|(worker, range)| {
            worker.reset();
            for face in &faces[range] {
                worker_face_residual(worker, &inputs, dg_kernels, face)?;
            }
            Ok(())
        })
        .collect();
    first_fault(results)?;
    merge_vectors(arena, scale, out);
    metrics.add_faces_visited(total_visited(arena));
    Ok(())
}

/// Runs a Jacobian pass over all interior faces with the registered DG
/// kernels.
pub fn dg_jacobian_pass<T: Real>(
    arena: &mut WorkerArena<T>,
    inputs: AssemblyInputs<'_, T>,
    dg_kernels: &Warehouse<SubdomainId, dyn DgKernel<T>>,
    scale: T,
    out: &mut CsrMatrix<T>,
    metrics: &Metrics,
) -> Result<(), NumericalFault> {
    if dg_kernels.is_empty() {
        return Ok(());
    }
    let faces = inputs.mesh.interior_faces();
    let ranges = split_range(faces.len(), arena.num_workers());
    let results: Vec<_> = arena
        .workers
        .par_iter_mut()
        .zip(ranges.into_par_iter())
        .map(|(worker, range)| {
            worker.reset();
            for face in &faces[range] {
                worker_face_jacobian(worker, &inputs, dg_kernels, face)?;
            }
            Ok(())
        })
        .collect();
    first_fault(results)?;
    merge_triplets(arena, scale, out);
    metrics.add_faces_visited(total_visited(arena));
    Ok(())
}

fn merge_vectors<T: Real>(arena: &WorkerArena<T>, scale: T, out: &mut DVector<T>) {
    for worker in &arena.workers {
        out.axpy(scale, &worker.accumulator, T::one());
    }
}

fn merge_triplets<T: Real>(arena: &WorkerArena<T>, scale: T, out: &mut CsrMatrix<T>) {
    for worker in &arena.workers {
        for &(row, col, value) in &worker.triplets {
            crate::assembly::local::add_to_csr(out, row, col, scale * value);
        }
    }
}

fn total_visited<T: Real>(arena: &WorkerArena<T>) -> u64 {
    arena.workers.iter().map(|worker| worker.visited).sum()
}

fn worker_element_residual<T: Real>(
    worker: &mut WorkerContext<T>,
    inputs: &AssemblyInputs<'_, T>,
    kernels: &Warehouse<SubdomainId, dyn Kernel<T>>,
    kind: KernelType,
    element: usize,
) -> Result<(), NumericalFault> {
    let subdomain = inputs.mesh.element_subdomain(element);
    if !kernels.has_objects_for_region(subdomain) {
        return Ok(());
    }
    let nodes = inputs.mesh.element_nodes(element);
    let sdim = inputs.dof_map.solution_dim();
    let local_dim = sdim * nodes.len();

    gather_element_state(worker, inputs, nodes);
    worker
        .local_vector
        .resize_vertically_mut(local_dim, T::zero());
    worker.local_vector.fill(T::zero());

    let ctx = ElementContext {
        element,
        subdomain,
        nodes,
        coords: &worker.coords,
        u: DVectorView::from(&worker.u_local),
        u_old: DVectorView::from(&worker.u_old_local),
        u_dot: DVectorView::from(&worker.u_dot_local),
        du_dot_du: inputs.du_dot_du,
        time: inputs.time,
        measure: inputs.mesh.element_measure(element),
        solution_dim: sdim,
    };

    let mut any_active = false;
    for kernel in kernels.objects_for_region(subdomain) {
        if kernel.kernel_type() != kind {
            continue;
        }
        any_active = true;
        kernel
            .residual(&ctx, DVectorViewMut::from(&mut worker.local_vector))
            .map_err(|fault| fault_at_element(fault, element))?;
    }
    drop(ctx);

    if any_active {
        worker.visited += 1;
        scatter_local_to_global(
            &worker.local_vector,
            &mut worker.accumulator,
            nodes,
            inputs.dof_map,
            T::one(),
        );
    }
    Ok(())
}

fn worker_element_jacobian<T: Real>(
    worker: &mut WorkerContext<T>,
    inputs: &AssemblyInputs<'_, T>,
    kernels: &Warehouse<SubdomainId, dyn Kernel<T>>,
    kind: KernelType,
    element: usize,
) -> Result<(), NumericalFault> {
    let subdomain = inputs.mesh.element_subdomain(element);
    if !kernels.has_objects_for_region(subdomain) {
        return Ok(());
    }
    let nodes = inputs.mesh.element_nodes(element);
    let sdim = inputs.dof_map.solution_dim();
    let local_dim = sdim * nodes.len();

    gather_element_state(worker, inputs, nodes);
    worker
        .local_matrix
        .resize_mut(local_dim, local_dim, T::zero());
    worker.local_matrix.fill(T::zero());

    let ctx = ElementContext {
        element,
        subdomain,
        nodes,
        coords: &worker.coords,
        u: DVectorView::from(&worker.u_local),
        u_old: DVectorView::from(&worker.u_old_local),
        u_dot: DVectorView::from(&worker.u_dot_local),
        du_dot_du: inputs.du_dot_du,
        time: inputs.time,
        measure: inputs.mesh.element_measure(element),
        solution_dim: sdim,
    };

    let mut any_active = false;
    for kernel in kernels.objects_for_region(subdomain) {
        if kernel.kernel_type() != kind {
            continue;
        }
        any_active = true;
        kernel
            .jacobian(&ctx, DMatrixViewMut::from(&mut worker.local_matrix))
            .map_err(|fault| fault_at_element(fault, element))?;
    }
    drop(ctx);

    if any_active {
        worker.visited += 1;
        for (local_i, &node_i) in nodes.iter().enumerate() {
            for comp_i in 0..sdim {
                let row = inputs.dof_map.node_dof(node_i, comp_i);
                for (local_j, &node_j) in nodes.iter().enumerate() {
                    for comp_j in 0..sdim {
                        let col = inputs.dof_map.node_dof(node_j, comp_j);
                        let value =
                            worker.local_matrix[(sdim * local_i + comp_i, sdim * local_j + comp_j)];
                        if value != T::zero() {
                            worker.triplets.push((row, col, value));
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

fn worker_face_residual<T: Real>(
    worker: &mut WorkerContext<T>,
    inputs: &AssemblyInputs<'_, T>,
    dg_kernels: &Warehouse<SubdomainId, dyn DgKernel<T>>,
    face: &InteriorFace,
) -> Result<(), NumericalFault> {
    let subdomain = inputs.mesh.element_subdomain(face.element);
    if !dg_kernels.has_objects_for_region(subdomain) {
        return Ok(());
    }
    let sdim = inputs.dof_map.solution_dim();
    let (element_nodes, neighbor_nodes) = gather_face_state(worker, inputs, face);

    worker
        .local_vector
        .resize_vertically_mut(sdim * element_nodes.len(), T::zero());
    worker.local_vector.fill(T::zero());
    worker
        .neighbor_vector
        .resize_vertically_mut(sdim * neighbor_nodes.len(), T::zero());
    worker.neighbor_vector.fill(T::zero());

    let ctx = FaceContext {
        element: face.element,
        neighbor: face.neighbor,
        element_nodes,
        neighbor_nodes,
        element_coords: &worker.coords,
        neighbor_coords: &worker.neighbor_coords,
        u_element: DVectorView::from(&worker.u_local),
        u_neighbor: DVectorView::from(&worker.u_neighbor_local),
        element_measure: inputs.mesh.element_measure(face.element),
        neighbor_measure: inputs.mesh.element_measure(face.neighbor),
        time: inputs.time,
        solution_dim: sdim,
    };

    for dg in dg_kernels.objects_for_region(subdomain) {
        dg.residual(
            &ctx,
            DVectorViewMut::from(&mut worker.local_vector),
            DVectorViewMut::from(&mut worker.neighbor_vector),
        )
        .map_err(|fault| fault.at_face(face.element, face.neighbor))?;
    }
    drop(ctx);
    worker.visited += 1;

    scatter_local_to_global(
        &worker.local_vector,
        &mut worker.accumulator,
        element_nodes,
        inputs.dof_map,
        T::one(),
    );
    scatter_local_to_global(
        &worker.neighbor_vector,
        &mut worker.accumulator,
        neighbor_nodes,
        inputs.dof_map,
        T::one(),
    );
    Ok(())
}

fn worker_face_jacobian<T: Real>(
    worker: &mut WorkerContext<T>,
    inputs: &AssemblyInputs<'_, T>,
    dg_kernels: &Warehouse<SubdomainId, dyn DgKernel<T>>,
    face: &InteriorFace,
) -> Result<(), NumericalFault> {
    let subdomain = inputs.mesh.element_subdomain(face.element);
    if !dg_kernels.has_objects_for_region(subdomain) {
        return Ok(());
    }
    let sdim = inputs.dof_map.solution_dim();
    let (element_nodes, neighbor_nodes) = gather_face_state(worker, inputs, face);

    for block in [
        DgJacobianBlock::ElementElement,
        DgJacobianBlock::ElementNeighbor,
        DgJacobianBlock::NeighborElement,
        DgJacobianBlock::NeighborNeighbor,
    ] {
        let (row_nodes, col_nodes) = match block {
            DgJacobianBlock::ElementElement => (element_nodes, element_nodes),
            DgJacobianBlock::ElementNeighbor => (element_nodes, neighbor_nodes),
            DgJacobianBlock::NeighborElement => (neighbor_nodes, element_nodes),
            DgJacobianBlock::NeighborNeighbor => (neighbor_nodes, neighbor_nodes),
        };
        worker
            .local_matrix
            .resize_mut(sdim * row_nodes.len(), sdim * col_nodes.len(), T::zero());
        worker.local_matrix.fill(T::zero());

        let ctx = FaceContext {
            element: face.element,
            neighbor: face.neighbor,
            element_nodes,
            neighbor_nodes,
            element_coords: &worker.coords,
            neighbor_coords: &worker.neighbor_coords,
            u_element: DVectorView::from(&worker.u_local),
            u_neighbor: DVectorView::from(&worker.u_neighbor_local),
            element_measure: inputs.mesh.element_measure(face.element),
            neighbor_measure: inputs.mesh.element_measure(face.neighbor),
            time: inputs.time,
            solution_dim: sdim,
        };

        for dg in dg_kernels.objects_for_region(subdomain) {
            dg.jacobian(&ctx, block, DMatrixViewMut::from(&mut worker.local_matrix))
                .map_err(|fault| fault.at_face(face.element, face.neighbor))?;
        }
        drop(ctx);

        for (local_i, &node_i) in row_nodes.iter().enumerate() {
            for comp_i in 0..sdim {
                let row = inputs.dof_map.node_dof(node_i, comp_i);
                for (local_j, &node_j) in col_nodes.iter().enumerate() {
                    for comp_j in 0..sdim {
                        let col = inputs.dof_map.node_dof(node_j, comp_j);
                        let value =
                            worker.local_matrix[(sdim * local_i + comp_i, sdim * local_j + comp_j)];
                        if value != T::zero() {
                            worker.triplets.push((row, col, value));
                        }
                    }
                }
            }
        }
    }
    worker.visited += 1;
    Ok(())
}

fn gather_element_state<T: Real>(
    worker: &mut WorkerContext<T>,
    inputs: &AssemblyInputs<'_, T>,
    nodes: &[usize],
) {
    worker.coords.clear();
    worker
        .coords
        .extend(nodes.iter().map(|&node| inputs.mesh.node_coords(node)));
    gather_global_to_local(inputs.u, &mut worker.u_local, nodes, inputs.dof_map);
    gather_global_to_local(inputs.u_old, &mut worker.u_old_local, nodes, inputs.dof_map);
    gather_global_to_local(inputs.u_dot, &mut worker.u_dot_local, nodes, inputs.dof_map);
}

fn gather_face_state<'a, T: Real>(
    worker: &mut WorkerContext<T>,
    inputs: &AssemblyInputs<'a, T>,
    face: &InteriorFace,
) -> (&'a [usize], &'a [usize]) {
    let element_nodes = inputs.mesh.element_nodes(face.element);
    let neighbor_nodes = inputs.mesh.element_nodes(face.neighbor);
    worker.coords.clear();
    worker
        .coords
        .extend(element_nodes.iter().map(|&node| inputs.mesh.node_coords(node)));
    worker.neighbor_coords.clear();
    worker.neighbor_coords.extend(
        neighbor_nodes
            .iter()
            .map(|&node| inputs.mesh.node_coords(node)),
    );
    gather_global_to_local(inputs.u, &mut worker.u_local, element_nodes, inputs.dof_map);
    gather_global_to_local(
        inputs.u,
        &mut worker.u_neighbor_local,
        neighbor_nodes,
        inputs.dof_map,
    );
    (element_nodes, neighbor_nodes)
}

/// Builds the topological sparsity pattern of the Jacobian.
///
/// Entries couple all DOFs sharing an element, all DOFs sharing an interior
/// face when DG kernels are active, the dense diagonal blocks of scalar
/// variables and the full diagonal. Memory is optimized over speed by
/// collecting into a `BTreeSet`, which stores each entry exactly once.
pub fn build_sparsity_pattern<T: Real>(
    mesh: &dyn MeshQuery<T>,
    dof_map: &DofMap,
    include_faces: bool,
    scalar_blocks: &[(usize, usize)],
) -> SparsityPattern {
    let sdim = dof_map.solution_dim();
    let mut entries = BTreeSet::new();

    let mut couple_nodes = |entries: &mut BTreeSet<(usize, usize)>, a: &[usize], b: &[usize]| {
        for &node_i in a {
            for &node_j in b {
                for comp_i in 0..sdim {
                    for comp_j in 0..sdim {
                        entries.insert((
                            dof_map.node_dof(node_i, comp_i),
                            dof_map.node_dof(node_j, comp_j),
                        ));
                    }
                }
            }
        }
    };

    for element in 0..mesh.num_elements() {
        let nodes = mesh.element_nodes(element);
        couple_nodes(&mut entries, nodes, nodes);
    }

    if include_faces {
        for face in mesh.interior_faces() {
            let element_nodes = mesh.element_nodes(face.element);
            let neighbor_nodes = mesh.element_nodes(face.neighbor);
            couple_nodes(&mut entries, element_nodes, neighbor_nodes);
            couple_nodes(&mut entries, neighbor_nodes, element_nodes);
        }
    }

    for &(offset, len) in scalar_blocks {
        for i in offset..offset + len {
            for j in offset..offset + len {
                entries.insert((i, j));
            }
        }
    }

    // Boundary condition and constraint rows always need their diagonal.
    for dof in 0..dof_map.num_dofs() {
        entries.insert((dof, dof));
    }

    let num_rows = dof_map.num_dofs();
    let mut offsets = Vec::with_capacity(num_rows + 1);
    let mut column_indices = Vec::with_capacity(entries.len());
    offsets.push(0);
    let mut current_row = 0;
    for (i, j) in entries {
        while i > current_row {
            offsets.push(column_indices.len());
            current_row += 1;
        }
        column_indices.push(j);
    }
    while offsets.len() < num_rows + 1 {
        offsets.push(column_indices.len());
    }

    SparsityPattern::try_from_offsets_and_indices(num_rows, num_rows, offsets, column_indices)
        .expect("Internal error: element connectivity entries must form a valid pattern")
}

/// Creates a zero CSR matrix over the given pattern.
pub fn zero_csr_from_pattern<T: Real>(pattern: &SparsityPattern) -> CsrMatrix<T> {
    CsrMatrix::try_from_pattern_and_values(pattern.clone(), vec![T::zero(); pattern.nnz()])
        .expect("Internal error: pattern and zero values must form a valid matrix")
}
