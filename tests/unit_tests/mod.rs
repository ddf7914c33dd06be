pub use test_objects::*;

mod constraints;
mod coupling;
mod damping;
mod jacobian;
mod residual;
mod warehouse;
