//! JSON model declarations.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::compiler::OutputConnection;
use crate::error::{ModelError, ModelResult};
use crate::model::{BirthApproach, ModelBuilder, ModelOptions};
use crate::rate::RateSpec;
use crate::types::{Condition, Endpoint, FlowKind, NewFlow, Parameter, Parameters, Stratification};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompartmentConfig {
    pub name: String,
    #[serde(default)]
    pub population: f64,
}

/// A flow endpoint: a compartment name, optionally weighted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EndpointConfig {
    Name(String),
    Weighted { compartment: String, weight: f64 },
}

fn conserving() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowConfig {
    Transfer {
        #[serde(default)]
        name: Option<String>,
        from: Vec<EndpointConfig>,
        to: Vec<EndpointConfig>,
        rate: RateSpec,
        #[serde(default)]
        restriction: Option<Condition>,
        #[serde(default = "conserving")]
        conserving: bool,
    },
    Entry {
        #[serde(default)]
        name: Option<String>,
        to: Vec<EndpointConfig>,
        rate: RateSpec,
        #[serde(default)]
        restriction: Option<Condition>,
    },
    Exit {
        #[serde(default)]
        name: Option<String>,
        from: Vec<EndpointConfig>,
        rate: RateSpec,
        #[serde(default)]
        restriction: Option<Condition>,
    },
    Standard {
        #[serde(default)]
        name: Option<String>,
        parameter: String,
        from: String,
        to: String,
    },
    InfectionDensity {
        #[serde(default)]
        name: Option<String>,
        parameter: String,
        from: String,
        to: String,
    },
    InfectionFrequency {
        #[serde(default)]
        name: Option<String>,
        parameter: String,
        from: String,
        to: String,
    },
    Death {
        #[serde(default)]
        name: Option<String>,
        parameter: String,
        from: String,
    },
}

/// A complete model as written in a JSON file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelDeclaration {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub compartments: Vec<CompartmentConfig>,
    #[serde(default)]
    pub flows: Vec<FlowConfig>,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub stratifications: Vec<Stratification>,
    #[serde(default)]
    pub outputs: Vec<OutputConnection>,
    #[serde(default)]
    pub options: ModelOptions,
}

impl ModelDeclaration {
    pub fn from_json(json: &str) -> ModelResult<Self> {
        serde_json::from_str(json).map_err(|e| ModelError::Config(e.to_string()))
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> ModelResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| ModelError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json(&json)
    }

    pub fn to_json(&self) -> ModelResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| ModelError::Config(e.to_string()))
    }

    pub fn parameters(&self) -> Parameters {
        Parameters::from(self.parameters.clone())
    }

    /// Replay the declaration on a fresh builder.
    ///
    /// Order: compartments, starting population, flows, universal death,
    /// births, stratifications, tracked outputs.
    pub fn to_builder(&self) -> ModelResult<ModelBuilder> {
        let mut builder = ModelBuilder::with_options(self.name.clone(), self.options.clone());
        for compartment in &self.compartments {
            builder.add_compartment(&compartment.name, compartment.population)?;
        }
        if let Some(total) = self.options.starting_population {
            builder.fill_to_total(total)?;
        }
        for flow in &self.flows {
            let new_flow = flow.to_new_flow(&builder)?;
            builder.add_flow(new_flow)?;
        }
        if let Some(parameter) = &self.options.universal_death_rate {
            builder.add_universal_death(parameter)?;
        }
        if self.options.birth_approach != BirthApproach::NoBirths {
            builder.set_birth_approach(self.options.birth_approach.clone())?;
        }
        for stratification in &self.stratifications {
            builder.stratify(stratification.clone())?;
        }
        for output in &self.outputs {
            builder.track_flow_output(output.clone());
        }
        Ok(builder)
    }
}

impl FlowConfig {
    fn to_new_flow(&self, builder: &ModelBuilder) -> ModelResult<NewFlow> {
        let endpoints = |configs: &[EndpointConfig]| -> ModelResult<Vec<Endpoint>> {
            configs
                .iter()
                .map(|config| match config {
                    EndpointConfig::Name(name) => Ok(Endpoint::new(builder.compartment(name)?)),
                    EndpointConfig::Weighted { compartment, weight } => {
                        Ok(Endpoint::weighted(builder.compartment(compartment)?, *weight))
                    }
                })
                .collect()
        };

        let (flow, name) = match self {
            FlowConfig::Transfer {
                name,
                from,
                to,
                rate,
                restriction,
                conserving,
            } => {
                let mut flow = NewFlow::new(FlowKind::Transfer, endpoints(from)?, endpoints(to)?, rate.clone());
                flow.restriction = restriction.clone();
                flow.conserving = *conserving;
                (flow, name)
            }
            FlowConfig::Entry {
                name,
                to,
                rate,
                restriction,
            } => {
                let mut flow = NewFlow::new(FlowKind::Entry, Vec::new(), endpoints(to)?, rate.clone());
                flow.restriction = restriction.clone();
                (flow, name)
            }
            FlowConfig::Exit {
                name,
                from,
                rate,
                restriction,
            } => {
                let mut flow = NewFlow::new(FlowKind::Exit, endpoints(from)?, Vec::new(), rate.clone());
                flow.restriction = restriction.clone();
                (flow, name)
            }
            FlowConfig::Standard {
                name,
                parameter,
                from,
                to,
            } => (builder.standard_flow(parameter, from, to)?, name),
            FlowConfig::InfectionDensity {
                name,
                parameter,
                from,
                to,
            } => (builder.infection_flow(parameter, from, to, false)?, name),
            FlowConfig::InfectionFrequency {
                name,
                parameter,
                from,
                to,
            } => (builder.infection_flow(parameter, from, to, true)?, name),
            FlowConfig::Death { name, parameter, from } => (builder.death_flow(parameter, from)?, name),
        };
        Ok(match name {
            Some(name) => flow.named(name.clone()),
            None => flow,
        })
    }
}
