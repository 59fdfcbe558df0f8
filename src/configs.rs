// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Configuration
//!
//! Broker connection settings used by the lapin transport and the topology
//! settings used by the manager.

use serde::Deserialize;
use std::env;

pub const AMQP_HOST_ENV_KEY: &str = "AMQP_HOST";
pub const AMQP_PORT_ENV_KEY: &str = "AMQP_PORT";
pub const AMQP_USER_ENV_KEY: &str = "AMQP_USER";
pub const AMQP_PASSWORD_ENV_KEY: &str = "AMQP_PASSWORD";
pub const AMQP_VHOST_ENV_KEY: &str = "AMQP_VHOST";
pub const APP_NAME_ENV_KEY: &str = "APP_NAME";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RabbitMQConfigs {
    ///Default: localhost
    pub host: String,
    ///Default: 5672
    pub port: u64,
    ///Default: guest
    pub user: String,
    ///Default: guest
    pub password: String,
    pub vhost: String,
    ///Default: rabbitmq-topology
    pub connection_name: String,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: Default::default(),
            connection_name: "rabbitmq-topology".to_owned(),
        }
    }
}

impl RabbitMQConfigs {
    /// Reads the connection settings from the environment, falling back to the
    /// defaults for every variable that is missing or malformed.
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            host: env::var(AMQP_HOST_ENV_KEY).unwrap_or(default.host),
            port: env::var(AMQP_PORT_ENV_KEY)
                .ok()
                .and_then(|port| port.parse().ok())
                .unwrap_or(default.port),
            user: env::var(AMQP_USER_ENV_KEY).unwrap_or(default.user),
            password: env::var(AMQP_PASSWORD_ENV_KEY).unwrap_or(default.password),
            vhost: env::var(AMQP_VHOST_ENV_KEY).unwrap_or(default.vhost),
            connection_name: env::var(APP_NAME_ENV_KEY).unwrap_or(default.connection_name),
        }
    }

    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.vhost
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TopologyConfigs {
    /// Check exchanges and named queues for existence instead of declaring
    /// them. Used against pre-provisioned brokers.
    ///
    /// Default: false
    pub passive: bool,
}
