//! Upstream source and destination adapters
//!
//! Each supported relation turns the connection parameters published by the
//! remote application into the template context of one plugin fragment.
//! Nothing here talks to the network; the parameters are opaque strings that
//! only get substituted into templates.

use crate::error::RenderError;
use crate::store::PluginDirection;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;

/// Relation types the steward knows how to render
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    /// InfluxDB as a metrics destination
    InfluxdbOutput,
    /// MongoDB as a metrics source
    MongodbInput,
    /// MySQL as a metrics source
    MysqlInput,
}

impl SourceKind {
    pub const ALL: [SourceKind; 3] = [
        SourceKind::InfluxdbOutput,
        SourceKind::MongodbInput,
        SourceKind::MysqlInput,
    ];

    /// Relation name, also the CLI spelling
    pub fn relation(&self) -> &'static str {
        match self {
            SourceKind::InfluxdbOutput => "influxdb-output",
            SourceKind::MongodbInput => "mongodb-input",
            SourceKind::MysqlInput => "mysql-input",
        }
    }

    /// Registry key used when the event does not name the source
    pub fn default_name(&self) -> &'static str {
        match self {
            SourceKind::InfluxdbOutput => "influxdb",
            SourceKind::MongodbInput => "mongodb",
            SourceKind::MysqlInput => "mysql",
        }
    }

    pub fn direction(&self) -> PluginDirection {
        match self {
            SourceKind::InfluxdbOutput => PluginDirection::Output,
            SourceKind::MongodbInput | SourceKind::MysqlInput => PluginDirection::Input,
        }
    }

    /// Fragment template rendered for this relation
    pub fn template(&self) -> &'static str {
        match self {
            SourceKind::InfluxdbOutput => "output-influxdb.conf",
            SourceKind::MongodbInput => "input-mongodb.conf",
            SourceKind::MysqlInput => "input-mysql.conf",
        }
    }

    /// Build the template context from the relation's connection parameters
    pub fn context(&self, params: &SourceParams) -> Result<Value, RenderError> {
        let address = params.address();

        match self {
            SourceKind::InfluxdbOutput => Ok(json!({
                "urls": [format!("http://{}", address)],
                "user": params.user.clone().unwrap_or_default(),
                "password": params.password.clone().unwrap_or_default(),
            })),
            SourceKind::MongodbInput => Ok(json!({
                "servers": [format!("mongodb://{}", address)],
            })),
            SourceKind::MysqlInput => {
                let user = params.require_user(*self)?;
                let password = params.require_password(*self)?;
                Ok(json!({
                    "servers": [format!("{}:{}@tcp({})/?tls=false", user, password, address)],
                }))
            }
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.relation())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SourceKind::ALL
            .into_iter()
            .find(|kind| kind.relation() == s)
            .ok_or_else(|| {
                let known: Vec<_> = SourceKind::ALL.iter().map(|k| k.relation()).collect();
                format!("unknown source kind {:?}, expected one of {}", s, known.join(", "))
            })
    }
}

/// Connection parameters published by the remote side of a relation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceParams {
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl SourceParams {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            user: None,
            password: None,
        }
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    /// `host:port`, bracketing IPv6 literals
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    fn require_user(&self, kind: SourceKind) -> Result<&str, RenderError> {
        self.user
            .as_deref()
            .ok_or_else(|| RenderError::MissingParameter {
                kind: kind.to_string(),
                parameter: "user",
            })
    }

    fn require_password(&self, kind: SourceKind) -> Result<&str, RenderError> {
        self.password
            .as_deref()
            .ok_or_else(|| RenderError::MissingParameter {
                kind: kind.to_string(),
                parameter: "password",
            })
    }
}
