//! Time-varying scalar functions used by rates and parameters.

use serde::{Deserialize, Serialize};

/// A deterministic function of simulation time.
///
/// Breakpoint lists must be sorted by time; values before the first and
/// after the last breakpoint are held constant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", try_from = "RawTimeFunction")]
pub enum TimeFunction {
    /// Linear interpolation between `(time, value)` breakpoints.
    Linear { points: Vec<(f64, f64)> },
    /// Piecewise constant: each value holds from its time until the next breakpoint.
    Step { points: Vec<(f64, f64)> },
    /// Smooth logistic scale-up from `start_value` to `end_value` centred on
    /// the midpoint of `[start_time, end_time]`.
    Sigmoid {
        start_time: f64,
        end_time: f64,
        start_value: f64,
        end_value: f64,
    },
}

/// Unchecked wire form; every deserialized function goes through `validate`.
#[derive(Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum RawTimeFunction {
    Linear { points: Vec<(f64, f64)> },
    Step { points: Vec<(f64, f64)> },
    Sigmoid {
        start_time: f64,
        end_time: f64,
        start_value: f64,
        end_value: f64,
    },
}

impl TryFrom<RawTimeFunction> for TimeFunction {
    type Error = String;

    fn try_from(raw: RawTimeFunction) -> Result<Self, String> {
        match raw {
            RawTimeFunction::Linear { points } => Self::linear(points),
            RawTimeFunction::Step { points } => Self::step(points),
            RawTimeFunction::Sigmoid {
                start_time,
                end_time,
                start_value,
                end_value,
            } => Self::sigmoid(start_time, end_time, start_value, end_value),
        }
    }
}

impl TimeFunction {
    pub fn linear(points: Vec<(f64, f64)>) -> Result<Self, String> {
        validate_points(&points)?;
        Ok(Self::Linear { points })
    }

    pub fn step(points: Vec<(f64, f64)>) -> Result<Self, String> {
        validate_points(&points)?;
        Ok(Self::Step { points })
    }

    pub fn sigmoid(start_time: f64, end_time: f64, start_value: f64, end_value: f64) -> Result<Self, String> {
        if !(end_time > start_time) {
            return Err(format!(
                "sigmoid end time {} must be after start time {}",
                end_time, start_time
            ));
        }
        Ok(Self::Sigmoid {
            start_time,
            end_time,
            start_value,
            end_value,
        })
    }

    /// Check breakpoints of a deserialized function.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Linear { points } | Self::Step { points } => validate_points(points),
            Self::Sigmoid {
                start_time,
                end_time,
                ..
            } => {
                if end_time > start_time {
                    Ok(())
                } else {
                    Err("sigmoid end time must be after start time".to_string())
                }
            }
        }
    }

    /// Value at `t`. A function built without breakpoints yields NaN, which
    /// evaluation reports as a non-finite rate.
    pub fn evaluate(&self, t: f64) -> f64 {
        match self {
            Self::Linear { points } => {
                let (Some(&first), Some(&last)) = (points.first(), points.last()) else {
                    return f64::NAN;
                };
                if t <= first.0 {
                    return first.1;
                }
                if t >= last.0 {
                    return last.1;
                }
                // First breakpoint strictly after t; t is inside (prev, next].
                let next = points.partition_point(|p| p.0 <= t);
                let (t0, v0) = points[next - 1];
                let (t1, v1) = points[next];
                v0 + (v1 - v0) * (t - t0) / (t1 - t0)
            }
            Self::Step { points } => {
                let next = points.partition_point(|p| p.0 <= t);
                points.get(next.saturating_sub(1)).map_or(f64::NAN, |p| p.1)
            }
            Self::Sigmoid {
                start_time,
                end_time,
                start_value,
                end_value,
            } => {
                let midpoint = 0.5 * (start_time + end_time);
                // Reaches ~99.3% of the change at end_time.
                let steepness = 10.0 / (end_time - start_time);
                let progress = 1.0 / (1.0 + (-steepness * (t - midpoint)).exp());
                start_value + (end_value - start_value) * progress
            }
        }
    }
}

fn validate_points(points: &[(f64, f64)]) -> Result<(), String> {
    if points.is_empty() {
        return Err("time function needs at least one breakpoint".to_string());
    }
    if points.iter().any(|(t, v)| !t.is_finite() || !v.is_finite()) {
        return Err("time function breakpoints must be finite".to_string());
    }
    if points.windows(2).any(|w| w[1].0 <= w[0].0) {
        return Err("time function breakpoints must be strictly increasing in time".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_interpolation() {
        let f = TimeFunction::linear(vec![(0.0, 1.0), (10.0, 3.0), (20.0, 3.0)]).unwrap();
        assert_eq!(f.evaluate(-5.0), 1.0);
        assert!((f.evaluate(5.0) - 2.0).abs() < 1e-12);
        assert_eq!(f.evaluate(10.0), 3.0);
        assert_eq!(f.evaluate(50.0), 3.0);
    }

    #[test]
    fn test_step_holds_value() {
        let f = TimeFunction::step(vec![(0.0, 1.0), (5.0, 0.5)]).unwrap();
        assert_eq!(f.evaluate(-1.0), 1.0);
        assert_eq!(f.evaluate(4.999), 1.0);
        assert_eq!(f.evaluate(5.0), 0.5);
    }

    #[test]
    fn test_sigmoid_is_centred() {
        let f = TimeFunction::sigmoid(0.0, 10.0, 0.0, 1.0).unwrap();
        assert!((f.evaluate(5.0) - 0.5).abs() < 1e-12);
        assert!(f.evaluate(10.0) > 0.99);
        assert!(f.evaluate(0.0) < 0.01);
    }

    #[test]
    fn test_rejects_unsorted_points() {
        assert!(TimeFunction::linear(vec![(1.0, 0.0), (0.0, 1.0)]).is_err());
        assert!(TimeFunction::step(vec![]).is_err());
    }

    #[test]
    fn test_deserialization_validates() {
        let ok: TimeFunction = serde_json::from_str(r#"{"kind": "step", "points": [[0.0, 1.0]]}"#).unwrap();
        assert_eq!(ok.evaluate(3.0), 1.0);
        assert!(serde_json::from_str::<TimeFunction>(r#"{"kind": "linear", "points": []}"#).is_err());
        assert!(serde_json::from_str::<TimeFunction>(r#"{"kind": "step", "points": [[2.0, 1.0], [1.0, 0.0]]}"#).is_err());
        assert!(serde_json::from_str::<TimeFunction>(
            r#"{"kind": "sigmoid", "start_time": 5.0, "end_time": 1.0, "start_value": 0.0, "end_value": 1.0}"#
        )
        .is_err());
    }

    #[test]
    fn test_empty_breakpoints_evaluate_to_nan() {
        assert!(TimeFunction::Linear { points: vec![] }.evaluate(0.0).is_nan());
        assert!(TimeFunction::Step { points: vec![] }.evaluate(0.0).is_nan());
    }
}
