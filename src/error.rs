//! Error taxonomy for system setup and solve evaluation.
//!
//! Two kinds of failure are distinguished. [`SetupError`] covers invalid
//! problem configuration (missing kernel coverage, unknown object types,
//! malformed parameters). These terminate the run. [`NumericalFault`] covers
//! recoverable numerical failures raised by physics object computations; the
//! coordinator abandons the current residual/Jacobian evaluation and the
//! calling solve driver may retry with a different iterate or step size.
use crate::mesh::{BoundaryId, SubdomainId};
use std::error::Error;
use std::fmt;
use std::fmt::Display;

/// A fatal configuration error detected during setup or initialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupError {
    /// One or more active mesh subdomains have no kernel assigned to them.
    MissingKernelCoverage { subdomains: Vec<SubdomainId> },
    /// A transient time discretization is active but no time kernel was added.
    MissingTimeKernel,
    /// An object references a boundary id that does not exist in the mesh.
    UnknownBoundary { object: String, boundary: BoundaryId },
    /// An object references a subdomain id that does not exist in the mesh.
    UnknownSubdomain { object: String, subdomain: SubdomainId },
    /// The factory has no constructor registered under this type name.
    UnknownObjectType { class: &'static str, type_name: String },
    /// A parameter is absent or has the wrong type.
    MalformedParameter { parameter: String, expected: &'static str },
    /// A Dirac kernel declared a point that lies outside the mesh.
    DiracPointOutsideMesh { object: String, point_index: usize },
    /// An operation was requested in a lifecycle state that does not allow it.
    InvalidState { operation: &'static str, state: &'static str },
}

impl Display for SetupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetupError::MissingKernelCoverage { subdomains } => {
                write!(f, "no kernel is active on subdomain(s): ")?;
                let mut first = true;
                for s in subdomains {
                    if !first {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", s)?;
                    first = false;
                }
                Ok(())
            }
            SetupError::MissingTimeKernel => {
                write!(f, "transient time discretization requires at least one time kernel")
            }
            SetupError::UnknownBoundary { object, boundary } => {
                write!(f, "object '{}' references unknown boundary {}", object, boundary)
            }
            SetupError::UnknownSubdomain { object, subdomain } => {
                write!(f, "object '{}' references unknown subdomain {}", object, subdomain)
            }
            SetupError::UnknownObjectType { class, type_name } => {
                write!(f, "no {} type named '{}' is registered", class, type_name)
            }
            SetupError::MalformedParameter { parameter, expected } => {
                write!(f, "parameter '{}' is missing or is not of type {}", parameter, expected)
            }
            SetupError::DiracPointOutsideMesh { object, point_index } => {
                write!(
                    f,
                    "point {} of Dirac kernel '{}' lies outside the mesh",
                    point_index, object
                )
            }
            SetupError::InvalidState { operation, state } => {
                write!(f, "operation '{}' is not allowed in state {}", operation, state)
            }
        }
    }
}

impl Error for SetupError {}

/// A recoverable numerical fault raised by a physics object computation.
///
/// Faults abort the residual/Jacobian evaluation in flight. Global vectors
/// and matrices are left zeroed rather than partially summed, so a retry
/// starts from a clean slate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumericalFault {
    /// Name of the object that raised the fault.
    pub object: String,
    /// Where the fault occurred, if known.
    pub site: FaultSite,
    pub message: String,
}

/// Location of a numerical fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultSite {
    Element(usize),
    Node(usize),
    Face { element: usize, neighbor: usize },
    Unknown,
}

impl NumericalFault {
    pub fn new(object: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            object: object.into(),
            site: FaultSite::Unknown,
            message: message.into(),
        }
    }

    pub fn at_element(mut self, element: usize) -> Self {
        self.site = FaultSite::Element(element);
        self
    }

    pub fn at_node(mut self, node: usize) -> Self {
        self.site = FaultSite::Node(node);
        self
    }

    pub fn at_face(mut self, element: usize, neighbor: usize) -> Self {
        self.site = FaultSite::Face { element, neighbor };
        self
    }
}

impl Display for NumericalFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "numerical fault in '{}'", self.object)?;
        match self.site {
            FaultSite::Element(e) => write!(f, " at element {}", e)?,
            FaultSite::Node(n) => write!(f, " at node {}", n)?,
            FaultSite::Face { element, neighbor } => {
                write!(f, " at face between elements {} and {}", element, neighbor)?
            }
            FaultSite::Unknown => {}
        }
        write!(f, ": {}", self.message)
    }
}

impl Error for NumericalFault {}

/// Failure of a nonlinear solve evaluation.
///
/// Non-convergence within the iteration budget is reported through
/// [`SolveReport`](crate::solver::SolveReport) rather than through this type.
/// Step-cutback and retry policy belongs to the caller.
#[derive(Debug)]
pub enum SolveError {
    /// A physics object raised a recoverable fault; the evaluation was abandoned.
    Fault(NumericalFault),
    /// The linear solve of the Jacobian system failed.
    LinearSolveFailure(Box<dyn Error + Send + Sync>),
    /// The system was not in a state that allows solving.
    Setup(SetupError),
}

impl Display for SolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SolveError::Fault(fault) => write!(f, "solve aborted: {}", fault),
            SolveError::LinearSolveFailure(err) => {
                write!(f, "failed to solve Jacobian system: {}", err)
            }
            SolveError::Setup(err) => write!(f, "{}", err),
        }
    }
}

impl Error for SolveError {}

impl From<NumericalFault> for SolveError {
    fn from(fault: NumericalFault) -> Self {
        SolveError::Fault(fault)
    }
}

impl From<SetupError> for SolveError {
    fn from(err: SetupError) -> Self {
        SolveError::Setup(err)
    }
}
