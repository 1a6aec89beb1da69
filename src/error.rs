//! Error types for the Kairos provider

use thiserror::Error;

/// Main error type for bootstrap operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Malformed or missing configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Neither systemd nor openrc could be detected on the host
    #[error("could not detect OS: no supported init system found")]
    InitSystemUndetected,

    /// The k3s binary is not installed on the host
    #[error("no k3s binary found (searched: {0})")]
    BinaryNotFound(String),

    /// Writing a service environment file failed
    #[error("failed to write environment file {path}: {message}")]
    EnvFile {
        /// Environment file path
        path: String,
        /// Error message
        message: String,
    },

    /// Overriding the launch command of a service failed
    #[error("failed to override command of service {service}: {message}")]
    ServiceOverride {
        /// Service name
        service: String,
        /// Error message
        message: String,
    },

    /// Starting a service failed
    #[error("failed to start service {service}: {message}")]
    ServiceStart {
        /// Service name
        service: String,
        /// Error message
        message: String,
    },

    /// Enabling a service for automatic start failed
    #[error("failed to enable service {service}: {message}")]
    ServiceEnable {
        /// Service name
        service: String,
        /// Error message
        message: String,
    },

    /// Overlay network or coordination API error
    #[error("overlay error: {0}")]
    Overlay(String),

    /// Sentinel marker could not be persisted
    #[error("sentinel error: {0}")]
    Sentinel(String),

    /// Formation node failed to start or run
    #[error("node error: {0}")]
    Node(String),

    /// The formation node returned although it must run forever
    #[error("shouldn't return here")]
    NodeReturned,

    /// Container registry access error
    #[error("registry error: {0}")]
    Registry(String),

    /// Pre-bootstrap stage or hook script failed
    #[error("hook error: {0}")]
    Hook(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a binary-missing error listing the searched paths
    pub fn binary_not_found(searched: impl Into<String>) -> Self {
        Self::BinaryNotFound(searched.into())
    }

    /// Create an environment file error
    pub fn env_file(path: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::EnvFile {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Create a command override error for the given service
    pub fn service_override(service: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ServiceOverride {
            service: service.into(),
            message: msg.into(),
        }
    }

    /// Create a service start error for the given service
    pub fn service_start(service: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ServiceStart {
            service: service.into(),
            message: msg.into(),
        }
    }

    /// Create a service enable error for the given service
    pub fn service_enable(service: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ServiceEnable {
            service: service.into(),
            message: msg.into(),
        }
    }

    /// Create an overlay error with the given message
    pub fn overlay(msg: impl Into<String>) -> Self {
        Self::Overlay(msg.into())
    }

    /// Create a sentinel error with the given message
    pub fn sentinel(msg: impl Into<String>) -> Self {
        Self::Sentinel(msg.into())
    }

    /// Create a node error with the given message
    pub fn node(msg: impl Into<String>) -> Self {
        Self::Node(msg.into())
    }

    /// Create a registry error with the given message
    pub fn registry(msg: impl Into<String>) -> Self {
        Self::Registry(msg.into())
    }

    /// Create a hook error with the given message
    pub fn hook(msg: impl Into<String>) -> Self {
        Self::Hook(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Returns true for errors that stop the bootstrap before any service call
    pub fn is_environment_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::InitSystemUndetected | Self::BinaryNotFound(_)
        )
    }
}
