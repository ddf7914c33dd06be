//! Already-parsed parameter records handed to object constructors.
//!
//! Input file parsing happens upstream; the coordinator only consumes
//! name/value records. Lookup failures and type mismatches are fatal
//! configuration errors carrying the parameter name.
use crate::error::SetupError;
use crate::mesh::{BoundaryId, SubdomainId};
use serde::{Deserialize, Serialize};

/// A single parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterValue {
    Real(f64),
    Int(i64),
    Bool(bool),
    Str(String),
    RealVec(Vec<f64>),
    Subdomains(Vec<SubdomainId>),
    Boundaries(Vec<BoundaryId>),
}

/// An ordered name/value parameter record.
///
/// Insertion order is preserved so that diagnostics print parameters the way
/// the problem description listed them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
    values: Vec<(String, ParameterValue)>,
}

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a parameter, replacing any previous value under the same name.
    pub fn set(mut self, name: impl Into<String>, value: ParameterValue) -> Self {
        let name = name.into();
        if let Some(entry) = self.values.iter_mut().find(|(n, _)| *n == name) {
            entry.1 = value;
        } else {
            self.values.push((name, value));
        }
        self
    }

    pub fn with_real(self, name: impl Into<String>, value: f64) -> Self {
        self.set(name, ParameterValue::Real(value))
    }

    pub fn with_subdomains(self, name: impl Into<String>, ids: Vec<SubdomainId>) -> Self {
        self.set(name, ParameterValue::Subdomains(ids))
    }

    pub fn with_boundaries(self, name: impl Into<String>, ids: Vec<BoundaryId>) -> Self {
        self.set(name, ParameterValue::Boundaries(ids))
    }

    pub fn get(&self, name: &str) -> Option<&ParameterValue> {
        self.values
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn real(&self, name: &str) -> Result<f64, SetupError> {
        match self.get(name) {
            Some(ParameterValue::Real(v)) => Ok(*v),
            _ => Err(malformed(name, "Real")),
        }
    }

    pub fn real_or(&self, name: &str, default: f64) -> Result<f64, SetupError> {
        match self.get(name) {
            Some(ParameterValue::Real(v)) => Ok(*v),
            None => Ok(default),
            _ => Err(malformed(name, "Real")),
        }
    }

    pub fn int(&self, name: &str) -> Result<i64, SetupError> {
        match self.get(name) {
            Some(ParameterValue::Int(v)) => Ok(*v),
            _ => Err(malformed(name, "Int")),
        }
    }

    pub fn bool_or(&self, name: &str, default: bool) -> Result<bool, SetupError> {
        match self.get(name) {
            Some(ParameterValue::Bool(v)) => Ok(*v),
            None => Ok(default),
            _ => Err(malformed(name, "Bool")),
        }
    }

    pub fn str(&self, name: &str) -> Result<&str, SetupError> {
        match self.get(name) {
            Some(ParameterValue::Str(v)) => Ok(v),
            _ => Err(malformed(name, "Str")),
        }
    }

    pub fn real_vec(&self, name: &str) -> Result<&[f64], SetupError> {
        match self.get(name) {
            Some(ParameterValue::RealVec(v)) => Ok(v),
            _ => Err(malformed(name, "RealVec")),
        }
    }

    /// Subdomain restriction, or `None` when the parameter is absent.
    pub fn subdomains(&self, name: &str) -> Result<Option<&[SubdomainId]>, SetupError> {
        match self.get(name) {
            Some(ParameterValue::Subdomains(v)) => Ok(Some(v)),
            None => Ok(None),
            _ => Err(malformed(name, "Subdomains")),
        }
    }

    /// Boundary restriction. Objects that require one call this with the
    /// convention that an absent parameter is malformed.
    pub fn boundaries(&self, name: &str) -> Result<&[BoundaryId], SetupError> {
        match self.get(name) {
            Some(ParameterValue::Boundaries(v)) => Ok(v),
            _ => Err(malformed(name, "Boundaries")),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParameterValue)> {
        self.values.iter().map(|(n, v)| (n.as_str(), v))
    }
}

fn malformed(name: &str, expected: &'static str) -> SetupError {
    SetupError::MalformedParameter {
        parameter: name.to_string(),
        expected,
    }
}
