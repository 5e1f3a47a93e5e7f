//! Derived values computed from several registers.
//!
//! A variable is an expression over `R<address>` references, evaluated
//! after every poll cycle with the latest engineering value of each
//! referenced register.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

use crate::expr::{Expression, ExpressionError};
use crate::regs::RegisterMap;
use crate::sample::Sample;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum VariableError {
    #[error("variable name must not be empty")]
    EmptyName,
    #[error("variable {0} is defined twice")]
    Duplicate(String),
    #[error("variable {name}: {source}")]
    Expression {
        name: String,
        source: ExpressionError,
    },
    #[error("variable {name} references R{address}, which is not in the register map")]
    UnknownRegister { name: String, address: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VariableFormat {
    #[serde(rename = "decimal")]
    Decimal,
    #[serde(rename = "fixed_2")]
    Fixed2,
    #[serde(rename = "fixed_4")]
    Fixed4,
    #[serde(rename = "scientific")]
    Scientific,
    #[serde(rename = "percentage")]
    Percentage,
}

impl Default for VariableFormat {
    fn default() -> Self {
        VariableFormat::Decimal
    }
}

impl VariableFormat {
    /// Renders `value`, or `---` when there is none.
    pub fn render(&self, value: Option<f64>) -> String {
        let value = match value {
            Some(value) => value,
            None => return "---".to_string(),
        };

        match self {
            VariableFormat::Fixed2 => format!("{:.2}", value),
            VariableFormat::Fixed4 => format!("{:.4}", value),
            VariableFormat::Scientific => format!("{:.4e}", value),
            VariableFormat::Percentage => format!("{:.2}%", value),
            VariableFormat::Decimal if value.fract().abs() > 1e-4 => format!("{:.4}", value),
            VariableFormat::Decimal => format!("{}", value.trunc() as i64),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDefinition {
    pub name: String,
    #[serde(default)]
    pub label: String,
    pub expression: String,
    #[serde(default)]
    pub format: VariableFormat,
}

impl VariableDefinition {
    pub fn new(name: &str, expression: &str) -> Self {
        VariableDefinition {
            name: name.to_string(),
            label: String::new(),
            expression: expression.to_string(),
            format: VariableFormat::default(),
        }
    }

    pub fn label(mut self, label: &str) -> Self {
        self.label = label.to_string();
        self
    }

    pub fn format(mut self, format: VariableFormat) -> Self {
        self.format = format;
        self
    }
}

/// The register address named by `R<address>`.
pub fn register_reference(name: &str) -> Option<u16> {
    name.strip_prefix('R')
        .filter(|digits| digits.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|digits| digits.parse().ok())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariableValue {
    pub cycle: u64,
    pub name: String,
    pub value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Variable {
    definition: VariableDefinition,
    expression: Expression,
    references: Vec<(String, u16)>,
}

impl Variable {
    fn new(definition: VariableDefinition) -> Result<Self, VariableError> {
        if definition.name.trim().is_empty() {
            return Err(VariableError::EmptyName);
        }

        let fault = |source| VariableError::Expression {
            name: definition.name.clone(),
            source,
        };
        if definition.expression.trim().is_empty() {
            return Err(fault(ExpressionError::Syntax("empty expression".into())));
        }
        let expression =
            Expression::parse_with(&definition.expression, |name| register_reference(name).is_some())
                .map_err(fault)?;
        let references = expression
            .variables()
            .iter()
            .filter_map(|name| register_reference(name).map(|address| (name.clone(), address)))
            .collect();

        Ok(Variable {
            definition,
            expression,
            references,
        })
    }

    fn evaluate(&self, values: &HashMap<u16, f64>) -> Result<f64, String> {
        let bindings = self
            .references
            .iter()
            .map(|(name, address)| {
                values
                    .get(address)
                    .map(|value| (name.as_str(), *value))
                    .ok_or_else(|| format!("R{} has no value", address))
            })
            .collect::<Result<Vec<_>, _>>()?;

        self.expression
            .eval_with(bindings)
            .map_err(|e| e.to_string())
    }
}

/// Compiled variables, in definition order.
#[derive(Debug, Clone, Default)]
pub struct VariableSet {
    variables: Vec<Variable>,
}

impl VariableSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_definitions(definitions: Vec<VariableDefinition>) -> Result<Self, VariableError> {
        let mut names = HashSet::new();
        let mut variables = Vec::with_capacity(definitions.len());

        for definition in definitions {
            if !names.insert(definition.name.clone()) {
                return Err(VariableError::Duplicate(definition.name));
            }
            variables.push(Variable::new(definition)?);
        }
        Ok(VariableSet { variables })
    }

    /// Checks that every referenced register is in `registers`.
    pub fn check(&self, registers: &RegisterMap) -> Result<(), VariableError> {
        for variable in &self.variables {
            for (_, address) in &variable.references {
                if registers.find_by_address(*address).is_none() {
                    return Err(VariableError::UnknownRegister {
                        name: variable.definition.name.clone(),
                        address: *address,
                    });
                }
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    pub fn definitions(&self) -> Vec<VariableDefinition> {
        self.variables
            .iter()
            .map(|v| v.definition.clone())
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<&VariableDefinition> {
        self.variables
            .iter()
            .map(|v| &v.definition)
            .find(|d| d.name == name)
    }

    /// Evaluates every variable against the good values in `samples`. A
    /// variable whose registers have no value yields an error entry.
    pub fn evaluate(&self, cycle: u64, samples: &[Sample]) -> Vec<VariableValue> {
        let mut values = HashMap::new();
        for sample in samples.iter().filter(|s| s.is_ok()) {
            if let Some(value) = sample.value {
                values.entry(sample.address).or_insert(value);
            }
        }

        let timestamp = Utc::now();
        self.variables
            .iter()
            .map(|variable| {
                let (value, error) = match variable.evaluate(&values) {
                    Ok(value) => (Some(value), None),
                    Err(e) => (None, Some(e)),
                };
                VariableValue {
                    cycle,
                    name: variable.definition.name.clone(),
                    value,
                    error,
                    timestamp,
                }
            })
            .collect()
    }
}
