//! Name-driven object factory.
//!
//! Object types are registered under string names; the coordinator creates
//! instances from already-parsed parameter records. Constructors receive the
//! instance name and the parameters and return the finished object.
use crate::error::SetupError;
use crate::objects::{
    BoundaryCondition, Constraint, Damper, DgKernel, DiracKernel, Kernel, ScalarKernel,
};
use crate::params::Parameters;
use crate::Real;
use rustc_hash::FxHashMap;
use std::sync::Arc;

type Ctor<O: ?Sized> =
    Box<dyn Fn(&str, &Parameters) -> Result<Arc<O>, SetupError> + Send + Sync>;

/// Registry of object constructors, one namespace per object class.
pub struct ObjectRegistry<T: Real> {
    kernels: FxHashMap<String, Ctor<dyn Kernel<T>>>,
    bcs: FxHashMap<String, Ctor<dyn BoundaryCondition<T>>>,
    dirac_kernels: FxHashMap<String, Ctor<dyn DiracKernel<T>>>,
    dg_kernels: FxHashMap<String, Ctor<dyn DgKernel<T>>>,
    scalar_kernels: FxHashMap<String, Ctor<dyn ScalarKernel<T>>>,
    dampers: FxHashMap<String, Ctor<dyn Damper<T>>>,
    constraints: FxHashMap<String, Ctor<dyn Constraint<T>>>,
}

impl<T: Real> Default for ObjectRegistry<T> {
    fn default() -> Self {
        Self {
            kernels: FxHashMap::default(),
            bcs: FxHashMap::default(),
            dirac_kernels: FxHashMap::default(),
            dg_kernels: FxHashMap::default(),
            scalar_kernels: FxHashMap::default(),
            dampers: FxHashMap::default(),
            constraints: FxHashMap::default(),
        }
    }
}

macro_rules! registry_class {
    ($register:ident, $create:ident, $field:ident, $trait_object:ty, $class:literal) => {
        pub fn $register<F>(&mut self, type_name: impl Into<String>, ctor: F)
        where
            F: Fn(&str, &Parameters) -> Result<Arc<$trait_object>, SetupError>
                + Send
                + Sync
                + 'static,
        {
            self.$field.insert(type_name.into(), Box::new(ctor));
        }

        pub fn $create(
            &self,
            type_name: &str,
            name: &str,
            params: &Parameters,
        ) -> Result<Arc<$trait_object>, SetupError> {
            let ctor = self
                .$field
                .get(type_name)
                .ok_or_else(|| SetupError::UnknownObjectType {
                    class: $class,
                    type_name: type_name.to_string(),
                })?;
            ctor(name, params)
        }
    };
}

impl<T: Real> ObjectRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    registry_class!(register_kernel, create_kernel, kernels, dyn Kernel<T>, "kernel");
    registry_class!(
        register_boundary_condition,
        create_boundary_condition,
        bcs,
        dyn BoundaryCondition<T>,
        "boundary condition"
    );
    registry_class!(
        register_dirac_kernel,
        create_dirac_kernel,
        dirac_kernels,
        dyn DiracKernel<T>,
        "Dirac kernel"
    );
    registry_class!(
        register_dg_kernel,
        create_dg_kernel,
        dg_kernels,
        dyn DgKernel<T>,
        "DG kernel"
    );
    registry_class!(
        register_scalar_kernel,
        create_scalar_kernel,
        scalar_kernels,
        dyn ScalarKernel<T>,
        "scalar kernel"
    );
    registry_class!(register_damper, create_damper, dampers, dyn Damper<T>, "damper");
    registry_class!(
        register_constraint,
        create_constraint,
        constraints,
        dyn Constraint<T>,
        "constraint"
    );
}
