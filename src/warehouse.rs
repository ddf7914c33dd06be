//! Region-keyed storage of physics objects.
//!
//! A warehouse maps a geometric region id (subdomain or boundary) to the
//! ordered list of objects active there. Insertion order is preserved and is
//! semantically meaningful: residual contributions accumulate in
//! registration order, which keeps floating-point summation deterministic.
//! There is no removal API; the object set is fixed once setup completes.
use crate::objects::{
    BoundaryCondition, Constraint, Damper, DgKernel, DiracKernel, Kernel, ScalarKernel,
};
use crate::mesh::{BoundaryId, SubdomainId};
use crate::Real;
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;
use std::hash::Hash;
use std::sync::Arc;

/// Ordered, region-keyed object storage.
///
/// Objects registered without a restriction are active on every region and
/// precede region-restricted objects in iteration order, mirroring their
/// registration order within each group.
#[derive(Debug)]
pub struct Warehouse<R, O: ?Sized> {
    all_objects: Vec<Arc<O>>,
    unrestricted: Vec<Arc<O>>,
    restricted: FxHashMap<R, Vec<Arc<O>>>,
}

impl<R, O: ?Sized> Default for Warehouse<R, O> {
    fn default() -> Self {
        Self {
            all_objects: Vec::new(),
            unrestricted: Vec::new(),
            restricted: FxHashMap::default(),
        }
    }
}

impl<R, O: ?Sized> Warehouse<R, O>
where
    R: Copy + Eq + Ord + Hash,
{
    /// Adds an object active on the given regions, or on every region when
    /// the restriction is empty.
    pub fn add_object(&mut self, restriction: &[R], object: Arc<O>) {
        self.all_objects.push(Arc::clone(&object));
        if restriction.is_empty() {
            self.unrestricted.push(object);
        } else {
            for &region in restriction {
                self.restricted
                    .entry(region)
                    .or_default()
                    .push(Arc::clone(&object));
            }
        }
    }

    /// Objects active on the given region, unrestricted objects first, each
    /// group in registration order.
    pub fn objects_for_region(&self, region: R) -> impl Iterator<Item = &Arc<O>> {
        let restricted = self
            .restricted
            .get(&region)
            .map(|objects| objects.as_slice())
            .unwrap_or(&[]);
        self.unrestricted.iter().chain(restricted)
    }

    pub fn has_objects_for_region(&self, region: R) -> bool {
        !self.unrestricted.is_empty()
            || self
                .restricted
                .get(&region)
                .map(|objects| !objects.is_empty())
                .unwrap_or(false)
    }

    /// The set of regions with explicitly restricted objects.
    pub fn all_regions(&self) -> BTreeSet<R> {
        self.restricted.keys().copied().collect()
    }

    /// Every registered object, in registration order, each exactly once.
    pub fn objects(&self) -> &[Arc<O>] {
        &self.all_objects
    }

    pub fn is_empty(&self) -> bool {
        self.all_objects.is_empty()
    }

    pub fn len(&self) -> usize {
        self.all_objects.len()
    }
}

/// The full set of object collections owned by the nonlinear system, one per
/// object class.
///
/// Classes without a natural region key (Dirac kernels, scalar kernels,
/// dampers, constraints) are plain ordered lists.
pub struct WarehouseSet<T: Real> {
    pub kernels: Warehouse<SubdomainId, dyn Kernel<T>>,
    pub bcs: Warehouse<BoundaryId, dyn BoundaryCondition<T>>,
    pub dg_kernels: Warehouse<SubdomainId, dyn DgKernel<T>>,
    pub dirac_kernels: Vec<Arc<dyn DiracKernel<T>>>,
    pub scalar_kernels: Vec<Arc<dyn ScalarKernel<T>>>,
    pub dampers: Vec<Arc<dyn Damper<T>>>,
    pub constraints: Vec<Arc<dyn Constraint<T>>>,
}

impl<T: Real> Default for WarehouseSet<T> {
    fn default() -> Self {
        Self {
            kernels: Warehouse::default(),
            bcs: Warehouse::default(),
            dg_kernels: Warehouse::default(),
            dirac_kernels: Vec::new(),
            scalar_kernels: Vec::new(),
            dampers: Vec::new(),
            constraints: Vec::new(),
        }
    }
}

impl<T: Real> WarehouseSet<T> {
    /// Calls the per-step setup hook on every registered object.
    pub fn timestep_setup(&self, time: &crate::time::TimeState<T>) {
        for kernel in self.kernels.objects() {
            kernel.timestep_setup(time);
        }
        for bc in self.bcs.objects() {
            bc.timestep_setup(time);
        }
        for dg in self.dg_kernels.objects() {
            dg.timestep_setup(time);
        }
        for dirac in &self.dirac_kernels {
            dirac.timestep_setup(time);
        }
        for scalar in &self.scalar_kernels {
            scalar.timestep_setup(time);
        }
        for damper in &self.dampers {
            damper.timestep_setup(time);
        }
        for constraint in &self.constraints {
            constraint.timestep_setup(time);
        }
    }
}
