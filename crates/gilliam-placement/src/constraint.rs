//! Constraint predicates.
//!
//! A work unit's [`Constraint`] list is compiled once per placement into a
//! [`ConstraintSet`] (label patterns become [`Regex`]es) and then evaluated
//! uniformly against every candidate node.

use regex::Regex;
use thiserror::Error;

use gilliam_state::{Constraint, Resources};

use crate::scorer::NodeView;

#[derive(Debug, Error)]
pub enum ConstraintError {
    #[error("invalid label pattern {pattern:?} for key {key:?}: {source}")]
    InvalidPattern {
        key: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("utilization cap must be between 1 and 100, got {0}")]
    InvalidUtilization(u8),
}

#[derive(Debug, Clone)]
enum Predicate {
    LabelEquals { key: String, value: String },
    LabelMatches { key: String, regex: Regex },
    LabelAbsent { key: String },
    AntiAffinity { group: String },
    MaxUtilization { percent: u8 },
}

/// Compiled, ready-to-evaluate constraints for one work unit.
#[derive(Debug, Clone, Default)]
pub struct ConstraintSet {
    predicates: Vec<Predicate>,
}

impl ConstraintSet {
    pub fn compile(constraints: &[Constraint]) -> Result<Self, ConstraintError> {
        let predicates = constraints
            .iter()
            .map(|c| match c {
                Constraint::LabelEquals { key, value } => Ok(Predicate::LabelEquals {
                    key: key.clone(),
                    value: value.clone(),
                }),
                Constraint::LabelMatches { key, pattern } => {
                    // Anchor so "gpu-.*" does not match "nogpu-x".
                    let regex = Regex::new(&format!("^(?:{pattern})$")).map_err(|source| {
                        ConstraintError::InvalidPattern {
                            key: key.clone(),
                            pattern: pattern.clone(),
                            source,
                        }
                    })?;
                    Ok(Predicate::LabelMatches {
                        key: key.clone(),
                        regex,
                    })
                }
                Constraint::LabelAbsent { key } => Ok(Predicate::LabelAbsent { key: key.clone() }),
                Constraint::AntiAffinity { group } => Ok(Predicate::AntiAffinity {
                    group: group.clone(),
                }),
                Constraint::MaxUtilization { percent } => {
                    if *percent == 0 || *percent > 100 {
                        return Err(ConstraintError::InvalidUtilization(*percent));
                    }
                    Ok(Predicate::MaxUtilization { percent: *percent })
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { predicates })
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    /// True when every predicate holds for placing `demand` on `view`.
    pub fn admits(&self, view: &NodeView, demand: &Resources) -> bool {
        self.predicates.iter().all(|p| p.holds(view, demand))
    }
}

impl Predicate {
    fn holds(&self, view: &NodeView, demand: &Resources) -> bool {
        let labels = &view.node.labels;
        match self {
            Predicate::LabelEquals { key, value } => labels.get(key).is_some_and(|v| v == value),
            Predicate::LabelMatches { key, regex } => {
                labels.get(key).is_some_and(|v| regex.is_match(v))
            }
            Predicate::LabelAbsent { key } => !labels.contains_key(key),
            Predicate::AntiAffinity { group } => !view.groups.contains(group),
            Predicate::MaxUtilization { percent } => {
                let projected = view.node.allocated.saturating_add(demand);
                projected
                    .dimensions(&view.node.capacity)
                    .iter()
                    .filter(|(_, cap)| *cap > 0)
                    .all(|(used, cap)| {
                        u128::from(*used) * 100 <= u128::from(*percent) * u128::from(*cap)
                    })
            }
        }
    }
}
