use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DraftflowError, Result};

/// Longest accepted free-text field, in characters.
pub const MAX_FIELD_CHARS: usize = 20_000;

/// Pipeline type of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    DemandLetter,
    CeaseAndDesist,
    GeneralLetter,
}

impl WorkflowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DemandLetter => "demand_letter",
            Self::CeaseAndDesist => "cease_and_desist",
            Self::GeneralLetter => "general_letter",
        }
    }
}

impl fmt::Display for WorkflowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowKind {
    type Err = DraftflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "demand_letter" => Ok(Self::DemandLetter),
            "cease_and_desist" => Ok(Self::CeaseAndDesist),
            "general_letter" => Ok(Self::GeneralLetter),
            other => Err(DraftflowError::Serialization(format!(
                "unknown workflow kind '{}'",
                other
            ))),
        }
    }
}

/// Generation request, one variant per letter type.
///
/// Validated with [`WorkflowInput::validate`] before the engine persists
/// anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkflowInput {
    DemandLetter {
        recipient: String,
        facts: String,
        amount_cents: u64,
        #[serde(default)]
        deadline_days: Option<u32>,
    },
    CeaseAndDesist {
        recipient: String,
        facts: String,
        demanded_action: String,
    },
    GeneralLetter {
        recipient: String,
        topic: String,
        instructions: String,
    },
}

impl WorkflowInput {
    pub fn kind(&self) -> WorkflowKind {
        match self {
            Self::DemandLetter { .. } => WorkflowKind::DemandLetter,
            Self::CeaseAndDesist { .. } => WorkflowKind::CeaseAndDesist,
            Self::GeneralLetter { .. } => WorkflowKind::GeneralLetter,
        }
    }

    pub fn recipient(&self) -> &str {
        match self {
            Self::DemandLetter { recipient, .. }
            | Self::CeaseAndDesist { recipient, .. }
            | Self::GeneralLetter { recipient, .. } => recipient,
        }
    }

    /// Check required fields and size limits.
    pub fn validate(&self) -> Result<()> {
        require("recipient", self.recipient())?;
        match self {
            Self::DemandLetter {
                facts,
                amount_cents,
                deadline_days,
                ..
            } => {
                require("facts", facts)?;
                if *amount_cents == 0 {
                    return Err(DraftflowError::Validation(
                        "amount_cents must be greater than zero".into(),
                    ));
                }
                if matches!(deadline_days, Some(0)) {
                    return Err(DraftflowError::Validation(
                        "deadline_days must be greater than zero".into(),
                    ));
                }
            }
            Self::CeaseAndDesist {
                facts,
                demanded_action,
                ..
            } => {
                require("facts", facts)?;
                require("demanded_action", demanded_action)?;
            }
            Self::GeneralLetter {
                topic,
                instructions,
                ..
            } => {
                require("topic", topic)?;
                require("instructions", instructions)?;
            }
        }
        Ok(())
    }

    /// Serialize into the opaque payload stored on the instance.
    pub fn to_payload(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Restore from a stored payload.
    pub fn from_payload(payload: &serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(payload.clone())?)
    }
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(DraftflowError::Validation(format!("{} is required", field)));
    }
    if value.chars().count() > MAX_FIELD_CHARS {
        return Err(DraftflowError::Validation(format!(
            "{} exceeds {} characters",
            field, MAX_FIELD_CHARS
        )));
    }
    Ok(())
}
