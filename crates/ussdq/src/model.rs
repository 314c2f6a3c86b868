//! Operation records and their lifecycle.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Longest USSD string a GSM network accepts.
const MAX_CODE_LEN: usize = 182;

/// Status of an operation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Executing,
    Completed,
    Failed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Executing => "executing",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
        }
    }

    /// Completed and failed operations never move again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationStatus::Completed | OperationStatus::Failed)
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(&self, next: OperationStatus) -> bool {
        matches!(
            (self, next),
            (OperationStatus::Pending, OperationStatus::Executing)
                | (OperationStatus::Executing, OperationStatus::Completed)
                | (OperationStatus::Executing, OperationStatus::Failed)
        )
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationStatus::Pending => write!(f, "Pending"),
            OperationStatus::Executing => write!(f, "Executing"),
            OperationStatus::Completed => write!(f, "Completed"),
            OperationStatus::Failed => write!(f, "Failed"),
        }
    }
}

impl FromStr for OperationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OperationStatus::Pending),
            "executing" => Ok(OperationStatus::Executing),
            "completed" => Ok(OperationStatus::Completed),
            "failed" => Ok(OperationStatus::Failed),
            other => Err(format!("unknown operation status '{}'", other)),
        }
    }
}

/// A queued request to dial a code on a SIM slot, with its outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Operation {
    /// Store-assigned identifier (UUID).
    pub id: String,
    /// The code to dial.
    pub ussd_code: String,
    /// Target SIM slot.
    pub sim_slot: u32,
    /// Current status.
    pub status: OperationStatus,
    /// Response text, set on completion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Failure description, set on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Insertion time; the queue order.
    pub created_at: DateTime<Utc>,
    /// When execution started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<DateTime<Utc>>,
}

impl Operation {
    /// The text shown for this operation's outcome, if any.
    ///
    /// Empty strings count as absent.
    pub fn outcome(&self) -> Option<&str> {
        fn present(text: &Option<String>) -> Option<&str> {
            text.as_deref().filter(|t| !t.is_empty())
        }
        present(&self.error_message).or_else(|| present(&self.result))
    }

    /// Applies a transition to the in-memory record.
    ///
    /// Returns `false` and leaves the record untouched when the transition
    /// is not a legal successor of the current status.
    pub fn apply(&mut self, transition: &Transition) -> bool {
        if !self.status.can_transition_to(transition.status()) {
            return false;
        }
        match transition {
            Transition::Executing { executed_at } => {
                self.executed_at.get_or_insert(*executed_at);
            }
            Transition::Completed { result } => {
                self.result = Some(result.clone());
                self.error_message = None;
            }
            Transition::Failed { error_message } => {
                self.error_message = Some(error_message.clone());
                self.result = None;
            }
        }
        self.status = transition.status();
        true
    }
}

/// A validated request for a new pending operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOperation {
    pub ussd_code: String,
    pub sim_slot: u32,
}

impl NewOperation {
    pub fn new(code: &str, sim_slot: u32) -> Result<Self, ValidationError> {
        let code = code.trim();
        if code.is_empty() {
            return Err(ValidationError::EmptyCode);
        }
        let len = code.chars().count();
        if len > MAX_CODE_LEN {
            return Err(ValidationError::CodeTooLong(len));
        }
        if let Some(c) = code
            .chars()
            .find(|c| !(c.is_ascii_digit() || matches!(c, '*' | '#' | '+')))
        {
            return Err(ValidationError::InvalidCharacter(c));
        }

        Ok(Self {
            ussd_code: code.to_string(),
            sim_slot,
        })
    }
}

/// A write the executor performs on an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Executing { executed_at: DateTime<Utc> },
    Completed { result: String },
    Failed { error_message: String },
}

impl Transition {
    /// The status this transition moves to.
    pub fn status(&self) -> OperationStatus {
        match self {
            Transition::Executing { .. } => OperationStatus::Executing,
            Transition::Completed { .. } => OperationStatus::Completed,
            Transition::Failed { .. } => OperationStatus::Failed,
        }
    }
}
