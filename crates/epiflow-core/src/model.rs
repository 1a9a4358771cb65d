//! The model builder: owns the registry and catalog while a model is declared
//! and stratified, then compiles it.

use log::debug;
use serde::{Deserialize, Serialize};

use crate::catalog::FlowCatalog;
use crate::compiler::{self, CompiledModel, OutputConnection};
use crate::error::{ModelError, ModelResult};
use crate::graph::GraphView;
use crate::index::CompartmentIndex;
use crate::rate::{Rate, RateSpec};
use crate::registry::CompartmentRegistry;
use crate::stratify::{self, StratificationReport};
use crate::types::{CompartmentId, FlowId, NewFlow, Stratification};

/// How new population enters the model.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "parameter", rename_all = "snake_case")]
pub enum BirthApproach {
    #[default]
    NoBirths,
    /// Births at `parameter * N`.
    AddCrudeBirthRate(String),
    /// Births equal to all exits at the same evaluation.
    ReplaceDeaths,
}

fn default_entry_compartment() -> String {
    "susceptible".to_string()
}

fn default_infectious_compartment() -> String {
    "infectious".to_string()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelOptions {
    #[serde(default)]
    pub birth_approach: BirthApproach,
    /// Compartment receiving births.
    #[serde(default = "default_entry_compartment")]
    pub entry_compartment: String,
    /// Compartment read by the infection flow helpers.
    #[serde(default = "default_infectious_compartment")]
    pub infectious_compartment: String,
    /// Compartment receiving the remainder in [`ModelBuilder::fill_to_total`];
    /// defaults to the entry compartment.
    #[serde(default)]
    pub default_starting_compartment: Option<String>,
    /// Parameter of a death flow applied to every compartment.
    #[serde(default)]
    pub universal_death_rate: Option<String>,
    /// Total population to reach with [`ModelBuilder::fill_to_total`].
    #[serde(default)]
    pub starting_population: Option<f64>,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            birth_approach: BirthApproach::NoBirths,
            entry_compartment: default_entry_compartment(),
            infectious_compartment: default_infectious_compartment(),
            default_starting_compartment: None,
            universal_death_rate: None,
            starting_population: None,
        }
    }
}

/// Incremental model declaration.
///
/// ```
/// use epiflow_core::{ModelBuilder, Parameters};
///
/// let mut builder = ModelBuilder::new("sir");
/// builder.add_compartment("S", 990.0).unwrap();
/// builder.add_compartment("I", 10.0).unwrap();
/// builder.add_compartment("R", 0.0).unwrap();
/// builder.add_transfer("S", "I", "beta * I").unwrap();
/// builder.add_standard_flow("gamma", "I", "R").unwrap();
///
/// let model = builder.compile().unwrap();
/// let params = Parameters::new().with("beta", 0.0003).with("gamma", 0.1);
/// let derivative = model.evaluate(0.0, model.initial_state(), &params).unwrap();
/// assert!(derivative.iter().sum::<f64>().abs() < 1e-12);
/// ```
#[derive(Clone, Debug)]
pub struct ModelBuilder {
    name: String,
    registry: CompartmentRegistry,
    catalog: FlowCatalog,
    options: ModelOptions,
    stratifications: Vec<Stratification>,
    outputs: Vec<OutputConnection>,
    birth_flow: Option<FlowId>,
}

impl ModelBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_options(name, ModelOptions::default())
    }

    /// Builder with explicit options. The birth approach is not applied
    /// until [`set_birth_approach`](Self::set_birth_approach) is called.
    pub fn with_options(name: impl Into<String>, options: ModelOptions) -> Self {
        Self {
            name: name.into(),
            registry: CompartmentRegistry::new(),
            catalog: FlowCatalog::new(),
            options,
            stratifications: Vec::new(),
            outputs: Vec::new(),
            birth_flow: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &ModelOptions {
        &self.options
    }

    pub fn registry(&self) -> &CompartmentRegistry {
        &self.registry
    }

    pub fn catalog(&self) -> &FlowCatalog {
        &self.catalog
    }

    /// Stratifications applied so far, in order.
    pub fn stratifications(&self) -> &[Stratification] {
        &self.stratifications
    }

    pub fn outputs(&self) -> &[OutputConnection] {
        &self.outputs
    }

    // ===== Compartments =====

    pub fn add_compartment(&mut self, name: &str, initial_population: f64) -> ModelResult<CompartmentId> {
        self.registry.add_compartment(name, initial_population)
    }

    pub fn add_compartments<'a>(
        &mut self,
        compartments: impl IntoIterator<Item = (&'a str, f64)>,
    ) -> ModelResult<Vec<CompartmentId>> {
        compartments
            .into_iter()
            .map(|(name, population)| self.add_compartment(name, population))
            .collect()
    }

    /// Active compartment by display name.
    pub fn compartment(&self, name: &str) -> ModelResult<CompartmentId> {
        self.registry.find(name)
    }

    pub fn set_initial_population(&mut self, name: &str, population: f64) -> ModelResult<()> {
        let id = self.registry.find(name)?;
        self.registry.set_population(id, population)
    }

    /// Put `total` minus the declared population into the starting compartment.
    pub fn fill_to_total(&mut self, total: f64) -> ModelResult<()> {
        let declared = self.registry.total_population();
        let remainder = total - declared;
        if !total.is_finite() || remainder < 0.0 {
            return Err(ModelError::PopulationOverflow { total, declared });
        }
        let target = self
            .options
            .default_starting_compartment
            .clone()
            .unwrap_or_else(|| self.options.entry_compartment.clone());
        let id = self.registry.find(&target)?;
        let current = self.registry.population(id)?;
        self.registry.set_population(id, current + remainder)
    }

    // ===== Flows =====

    pub fn add_flow(&mut self, flow: NewFlow) -> ModelResult<FlowId> {
        self.catalog.add_flow(flow, &self.registry)
    }

    /// Transfer between two compartments named by display name, at a rate written as text.
    pub fn add_transfer(&mut self, from: &str, to: &str, rate: &str) -> ModelResult<FlowId> {
        let flow = NewFlow::transfer(self.compartment(from)?, self.compartment(to)?, RateSpec::parse(rate)?);
        self.add_flow(flow)
    }

    pub(crate) fn standard_flow(&self, parameter: &str, from: &str, to: &str) -> ModelResult<NewFlow> {
        Ok(NewFlow::transfer(
            self.compartment(from)?,
            self.compartment(to)?,
            RateSpec::parse(parameter)?,
        ))
    }

    pub(crate) fn infection_flow(&self, parameter: &str, from: &str, to: &str, frequency: bool) -> ModelResult<NewFlow> {
        let infectious = &self.options.infectious_compartment;
        if self.registry.find_by_base(infectious).is_empty() {
            return Err(ModelError::UnknownCompartment(infectious.clone()));
        }
        let formula = if frequency {
            format!("({}) * {} / N", parameter, infectious)
        } else {
            format!("({}) * {}", parameter, infectious)
        };
        Ok(NewFlow::transfer(
            self.compartment(from)?,
            self.compartment(to)?,
            RateSpec::parse(&formula)?,
        ))
    }

    pub(crate) fn death_flow(&self, parameter: &str, from: &str) -> ModelResult<NewFlow> {
        Ok(NewFlow::exit(self.compartment(from)?, RateSpec::parse(parameter)?))
    }

    /// Per-capita transfer at `parameter`.
    pub fn add_standard_flow(&mut self, parameter: &str, from: &str, to: &str) -> ModelResult<FlowId> {
        let flow = self.standard_flow(parameter, from, to)?;
        self.add_flow(flow)
    }

    /// Infection with density-dependent transmission: `parameter * infectious`.
    pub fn add_infection_density_flow(&mut self, parameter: &str, from: &str, to: &str) -> ModelResult<FlowId> {
        let flow = self.infection_flow(parameter, from, to, false)?;
        self.add_flow(flow)
    }

    /// Infection with frequency-dependent transmission: `parameter * infectious / N`.
    pub fn add_infection_frequency_flow(&mut self, parameter: &str, from: &str, to: &str) -> ModelResult<FlowId> {
        let flow = self.infection_flow(parameter, from, to, true)?;
        self.add_flow(flow)
    }

    pub fn add_death_flow(&mut self, parameter: &str, from: &str) -> ModelResult<FlowId> {
        let flow = self.death_flow(parameter, from)?;
        self.add_flow(flow)
    }

    /// One exit flow named `universal_death` from every active compartment.
    pub fn add_universal_death(&mut self, parameter: &str) -> ModelResult<Vec<FlowId>> {
        let rate = Rate::new(RateSpec::parse(parameter)?);
        let flows: Vec<NewFlow> = self
            .registry
            .active_ids()
            .into_iter()
            .map(|id| NewFlow::exit(id, rate.clone()).named("universal_death"))
            .collect();
        // Validate everything before adding anything.
        let mut catalog = self.catalog.clone();
        let ids = flows
            .into_iter()
            .map(|flow| catalog.add_flow(flow, &self.registry))
            .collect::<ModelResult<Vec<_>>>()?;
        self.catalog = catalog;
        Ok(ids)
    }

    /// Add the entry flow for `approach` into the entry compartment.
    ///
    /// Call before stratifying the entry compartment; births are then split
    /// across its strata by proportion.
    pub fn set_birth_approach(&mut self, approach: BirthApproach) -> ModelResult<Option<FlowId>> {
        if self.birth_flow.is_some() {
            return Err(ModelError::BirthApproachAlreadySet);
        }
        let entry = self.options.entry_compartment.clone();
        let flow = match &approach {
            BirthApproach::NoBirths => None,
            BirthApproach::AddCrudeBirthRate(parameter) => {
                let rate = RateSpec::parse(&format!("({}) * N", parameter))?;
                Some(NewFlow::entry(self.compartment(&entry)?, rate).named("crude_birth"))
            }
            BirthApproach::ReplaceDeaths => {
                Some(NewFlow::entry(self.compartment(&entry)?, RateSpec::ReplacedDeaths).named("replace_deaths"))
            }
        };
        let id = flow.map(|f| self.add_flow(f)).transpose()?;
        self.birth_flow = id;
        self.options.birth_approach = approach;
        Ok(id)
    }

    pub fn track_flow_output(&mut self, output: OutputConnection) {
        self.outputs.push(output);
    }

    // ===== Stratification =====

    /// Apply a stratification. On error the builder is unchanged.
    pub fn stratify(&mut self, stratification: Stratification) -> ModelResult<StratificationReport> {
        let (registry, catalog, report) = stratify::stratify(&self.registry, &self.catalog, &stratification)?;
        self.registry = registry;
        self.catalog = catalog;
        self.stratifications.push(stratification);
        Ok(report)
    }

    // ===== Output =====

    pub fn index(&self) -> CompartmentIndex {
        CompartmentIndex::from_registry(&self.registry)
    }

    pub fn graph(&self) -> GraphView {
        GraphView::new(&self.registry, &self.catalog)
    }

    pub fn compile(&self) -> ModelResult<CompiledModel> {
        debug!("compiling model '{}'", self.name);
        compiler::compile(&self.registry, &self.catalog, &self.outputs)
    }
}
