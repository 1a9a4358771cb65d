use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::time_function::TimeFunction;

/// A parameter definition with its value and optional description
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub id: String,
    pub value: ParameterValue,
    pub description: Option<String>,
}

/// Value of a named parameter: a constant or a function of time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Constant(f64),
    TimeVarying(TimeFunction),
}

impl ParameterValue {
    pub fn at(&self, t: f64) -> f64 {
        match self {
            Self::Constant(value) => *value,
            Self::TimeVarying(function) => function.evaluate(t),
        }
    }
}

impl From<f64> for ParameterValue {
    fn from(value: f64) -> Self {
        Self::Constant(value)
    }
}

impl From<TimeFunction> for ParameterValue {
    fn from(function: TimeFunction) -> Self {
        Self::TimeVarying(function)
    }
}

/// Read-only parameter source consulted by compiled rates at evaluation time.
pub trait ParameterLookup {
    /// Value of `name` at time `t`, or `None` if the name is unknown.
    fn lookup(&self, name: &str, t: f64) -> Option<f64>;
}

impl ParameterLookup for HashMap<String, f64> {
    fn lookup(&self, name: &str, _t: f64) -> Option<f64> {
        self.get(name).copied()
    }
}

impl ParameterLookup for BTreeMap<String, f64> {
    fn lookup(&self, name: &str, _t: f64) -> Option<f64> {
        self.get(name).copied()
    }
}

/// Adapts a closure `(name, t) -> Option<f64>` into a [`ParameterLookup`].
pub struct LookupFn<F>(pub F);

impl<F> ParameterLookup for LookupFn<F>
where
    F: Fn(&str, f64) -> Option<f64>,
{
    fn lookup(&self, name: &str, t: f64) -> Option<f64> {
        (self.0)(name, t)
    }
}

/// An owned, ordered parameter set.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Parameters {
    values: BTreeMap<String, ParameterValue>,
}

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a parameter, replacing any previous value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<ParameterValue>) -> &mut Self {
        self.values.insert(name.into(), value.into());
        self
    }

    /// Builder-style variant of [`Parameters::set`].
    pub fn with(mut self, name: impl Into<String>, value: impl Into<ParameterValue>) -> Self {
        self.set(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParameterValue> {
        self.values.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<ParameterValue> {
        self.values.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}

impl ParameterLookup for Parameters {
    fn lookup(&self, name: &str, t: f64) -> Option<f64> {
        self.values.get(name).map(|v| v.at(t))
    }
}

impl From<Vec<Parameter>> for Parameters {
    fn from(parameters: Vec<Parameter>) -> Self {
        Self {
            values: parameters.into_iter().map(|p| (p.id, p.value)).collect(),
        }
    }
}

impl<S: Into<String>> FromIterator<(S, f64)> for Parameters {
    fn from_iter<I: IntoIterator<Item = (S, f64)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(name, value)| (name.into(), ParameterValue::Constant(value)))
                .collect(),
        }
    }
}
