//! Run lifecycle states.

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::error::{AppError, Result};

/// ```text
/// Uninitialized -> Initializing -> Active <-> Checkpointing
///                       |            |
///                       v            v
///                     Failed     Finalizing -> Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Uninitialized,
    Initializing,
    Active,
    Checkpointing,
    Finalizing,
    Closed,
    /// Startup could not load or rebuild the filter. Terminal.
    Failed,
}

impl EngineState {
    /// States in which items may be queried and marked.
    pub fn accepts_items(self) -> bool {
        matches!(self, Self::Active | Self::Checkpointing)
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Active => "active",
            Self::Checkpointing => "checkpointing",
            Self::Finalizing => "finalizing",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Shared, logged state cell. Cloning shares the cell.
#[derive(Debug, Clone)]
pub(crate) struct StateCell {
    label: Arc<Mutex<String>>,
    state: Arc<Mutex<EngineState>>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        Self {
            label: Arc::new(Mutex::new(String::new())),
            state: Arc::new(Mutex::new(EngineState::Uninitialized)),
        }
    }

    pub(crate) fn set_label(&self, label: &str) {
        let mut current = self.label.lock().unwrap_or_else(|p| p.into_inner());
        *current = label.to_string();
    }

    pub(crate) fn get(&self) -> EngineState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Unconditional transition.
    pub(crate) fn set(&self, to: EngineState) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if *state != to {
            let label = self.label.lock().unwrap_or_else(|p| p.into_inner());
            log::debug!("[{}] {} -> {}", label, *state, to);
            *state = to;
        }
    }

    /// Transition only from one of `from`; otherwise `InvalidState`.
    pub(crate) fn advance(&self, from: &[EngineState], to: EngineState) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if !from.contains(&state) {
            let expected = from
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(" or ");
            return Err(AppError::invalid_state(*state, expected));
        }
        let label = self.label.lock().unwrap_or_else(|p| p.into_inner());
        log::debug!("[{}] {} -> {}", label, *state, to);
        *state = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guarded_transitions() {
        let cell = StateCell::new();
        assert!(cell.advance(&[EngineState::Active], EngineState::Checkpointing).is_err());
        cell.advance(&[EngineState::Uninitialized], EngineState::Initializing)
            .unwrap();
        cell.set(EngineState::Active);

        let shared = cell.clone();
        shared
            .advance(&[EngineState::Active], EngineState::Checkpointing)
            .unwrap();
        assert_eq!(cell.get(), EngineState::Checkpointing);
        assert!(cell.get().accepts_items());
    }

    #[test]
    fn test_invalid_state_message() {
        let cell = StateCell::new();
        cell.set(EngineState::Closed);
        let err = cell
            .advance(&[EngineState::Active, EngineState::Checkpointing], EngineState::Finalizing)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Run is closed, operation requires active or checkpointing"
        );
    }
}
