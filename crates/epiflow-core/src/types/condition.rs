use serde::{Deserialize, Serialize};

use super::compartment::Compartment;

/// How the rules of a [`Condition`] are combined.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogicOperator {
    #[serde(rename = "and")]
    And,
    #[serde(rename = "or")]
    Or,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StratumOperator {
    #[serde(rename = "eq")]
    Eq,
    #[serde(rename = "neq")]
    Neq,
}

/// A single test on a compartment's stratum, e.g. `age == old`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub stratification: String,
    pub operator: StratumOperator,
    pub stratum: String,
}

impl Rule {
    pub fn eq(stratification: impl Into<String>, stratum: impl Into<String>) -> Self {
        Self {
            stratification: stratification.into(),
            operator: StratumOperator::Eq,
            stratum: stratum.into(),
        }
    }

    pub fn neq(stratification: impl Into<String>, stratum: impl Into<String>) -> Self {
        Self {
            stratification: stratification.into(),
            operator: StratumOperator::Neq,
            stratum: stratum.into(),
        }
    }

    /// `None` while the stratification has not been applied yet.
    fn evaluate(&self, stratum_of: &dyn Fn(&str) -> Option<String>) -> Option<bool> {
        let actual = stratum_of(&self.stratification)?;
        Some(match self.operator {
            StratumOperator::Eq => actual == self.stratum,
            StratumOperator::Neq => actual != self.stratum,
        })
    }
}

/// Stratum-restriction predicate attached to a flow.
///
/// Evaluation is three-valued: a rule on a stratification that has not
/// been applied yet is undetermined, and the flow stays materialised until
/// a later pass can decide.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub logic: LogicOperator,
    pub rules: Vec<Rule>,
}

impl Condition {
    pub fn all(rules: Vec<Rule>) -> Self {
        Self {
            logic: LogicOperator::And,
            rules,
        }
    }

    pub fn any(rules: Vec<Rule>) -> Self {
        Self {
            logic: LogicOperator::Or,
            rules,
        }
    }

    pub fn only(stratification: impl Into<String>, stratum: impl Into<String>) -> Self {
        Self::all(vec![Rule::eq(stratification, stratum)])
    }

    /// Evaluate against the strata of a flow's endpoints.
    ///
    /// Sources are consulted first, then destinations, so a transition
    /// between strata (`young -> old`) is judged by the stratum it leaves.
    pub fn evaluate(&self, sources: &[&Compartment], destinations: &[&Compartment]) -> Option<bool> {
        let stratum_of = |strat: &str| -> Option<String> {
            sources
                .iter()
                .chain(destinations.iter())
                .find_map(|c| c.stratum(strat).map(str::to_string))
        };

        let mut undetermined = false;
        for rule in &self.rules {
            match (self.logic, rule.evaluate(&stratum_of)) {
                (LogicOperator::And, Some(false)) => return Some(false),
                (LogicOperator::Or, Some(true)) => return Some(true),
                (_, None) => undetermined = true,
                _ => {}
            }
        }

        if undetermined {
            None
        } else {
            Some(matches!(self.logic, LogicOperator::And))
        }
    }

    pub fn references(&self, stratification: &str) -> impl Iterator<Item = &Rule> {
        let stratification = stratification.to_string();
        self.rules
            .iter()
            .filter(move |r| r.stratification == stratification)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_three_valued_evaluation() {
        let old = Compartment::new("S").with_stratum("age", "old");
        let young = Compartment::new("S").with_stratum("age", "young");
        let plain = Compartment::new("S");

        let condition = Condition::only("age", "old");
        assert_eq!(condition.evaluate(&[&old], &[]), Some(true));
        assert_eq!(condition.evaluate(&[&young], &[]), Some(false));
        assert_eq!(condition.evaluate(&[&plain], &[]), None);

        let either = Condition::any(vec![Rule::eq("age", "old"), Rule::eq("vaccine", "yes")]);
        assert_eq!(either.evaluate(&[&old], &[]), Some(true));
        assert_eq!(either.evaluate(&[&young], &[]), None);

        let not_young = Condition::all(vec![Rule::neq("age", "young")]);
        assert_eq!(not_young.evaluate(&[], &[&old]), Some(true));
    }
}
