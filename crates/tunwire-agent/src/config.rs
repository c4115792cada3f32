use serde::{Deserialize, Serialize};
use tunwire_proto::{AddressFamily, DEFAULT_MAX_MESSAGE_SIZE, MESSAGE_HEADER_SIZE};

use crate::AgentError;

/// Tunables for the tunnel manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Largest chunk read from a transport in one go; each chunk becomes one data message
    pub read_chunk_size: usize,

    /// Largest control-channel message accepted or produced
    pub max_message_size: usize,

    /// Family used when a request leaves the choice open
    pub preferred_family: AddressFamily,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            read_chunk_size: 16 * 1024,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            preferred_family: AddressFamily::Any,
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.read_chunk_size == 0 {
            return Err(AgentError::InvalidConfig(
                "read_chunk_size must be greater than zero".to_string(),
            ));
        }

        if self.read_chunk_size + MESSAGE_HEADER_SIZE > self.max_message_size {
            return Err(AgentError::InvalidConfig(format!(
                "read_chunk_size ({}) does not fit in max_message_size ({})",
                self.read_chunk_size, self.max_message_size
            )));
        }

        if self.max_message_size > u32::MAX as usize {
            return Err(AgentError::InvalidConfig(format!(
                "max_message_size ({}) exceeds the frame length field",
                self.max_message_size
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(AgentConfig::default().validate().is_ok());
    }

    #[test]
    fn test_chunk_must_fit_in_message() {
        let config = AgentConfig {
            read_chunk_size: 1024,
            max_message_size: 1025,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = AgentConfig {
            read_chunk_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
