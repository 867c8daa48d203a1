// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Security
//!
//! TLS settings for `amqps` connections. The CA chain given here is the trust
//! store used to verify the broker; without one the platform roots are used.

use crate::errors::AmqpError;
use lapin::tcp::OwnedTLSConfig;
use serde::Deserialize;
use std::{fs, path::PathBuf};
use tracing::{debug, error};

/// TLS settings for a broker connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM file holding the CA certificate(s) that signed the broker's certificate.
    pub ca_cert_path: Option<PathBuf>,
}

impl TlsConfig {
    pub fn with_ca_cert(path: impl Into<PathBuf>) -> Self {
        TlsConfig {
            ca_cert_path: Some(path.into()),
        }
    }

    /// Builds the connector configuration handed to lapin.
    pub fn connector_config(&self) -> Result<OwnedTLSConfig, AmqpError> {
        let cert_chain = match &self.ca_cert_path {
            Some(path) => {
                debug!(path = %path.display(), "loading ca certificate chain");
                let pem = fs::read_to_string(path).map_err(|err| {
                    error!(error = err.to_string(), path = %path.display(), "failure to read ca certificate");
                    AmqpError::TlsConfigError(path.display().to_string())
                })?;

                if !pem.contains("-----BEGIN CERTIFICATE-----") {
                    error!(path = %path.display(), "ca file holds no pem certificate");
                    return Err(AmqpError::TlsConfigError(path.display().to_string()));
                }

                Some(pem)
            }
            None => None,
        };

        Ok(OwnedTLSConfig {
            cert_chain,
            ..Default::default()
        })
    }
}
