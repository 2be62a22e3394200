use super::config::SystemConfig;

/// Configuration state of the control plane.
///
/// `Unconfigured -> Configured` is one-way. `Conflict` is terminal: the
/// process refuses to serve until an operator removes one of the sources.
#[derive(Debug, Clone, Default)]
pub enum ControlState {
    #[default]
    Unconfigured,
    Configured(SystemConfig),
    Conflict(String),
}

impl ControlState {
    pub fn is_configured(&self) -> bool {
        matches!(self, ControlState::Configured(_))
    }

    pub fn config(&self) -> Option<&SystemConfig> {
        match self {
            ControlState::Configured(config) => Some(config),
            _ => None,
        }
    }

    pub fn conflict(&self) -> Option<&str> {
        match self {
            ControlState::Conflict(reason) => Some(reason),
            _ => None,
        }
    }
}
