//! Managed service kinds. Adding a kind means adding a variant; every match
//! below then points at what the new kind has to define.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ManagedKind {
    Postgres,
    #[serde(rename = "mysql")]
    MySql,
    Redis,
    #[serde(rename = "mongodb")]
    MongoDb,
    #[serde(rename = "rabbitmq")]
    RabbitMq,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Tcp,
}

/// A logical port a workload exposes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Endpoint {
    pub name: String,
    pub port: u16,
    pub protocol: Protocol,
    /// The primary endpoint's objects keep the bare resource name.
    pub primary: bool,
}

impl Endpoint {
    pub fn new(name: &str, port: u16, protocol: Protocol, primary: bool) -> Self {
        Self { name: name.to_string(), port, protocol, primary }
    }
}

impl ManagedKind {
    pub const ALL: [ManagedKind; 5] =
        [ManagedKind::Postgres, ManagedKind::MySql, ManagedKind::Redis, ManagedKind::MongoDb, ManagedKind::RabbitMq];

    pub fn as_str(&self) -> &'static str {
        match self {
            ManagedKind::Postgres => "postgres",
            ManagedKind::MySql => "mysql",
            ManagedKind::Redis => "redis",
            ManagedKind::MongoDb => "mongodb",
            ManagedKind::RabbitMq => "rabbitmq",
        }
    }

    fn repository(&self) -> &'static str {
        match self {
            ManagedKind::Postgres => "postgres",
            ManagedKind::MySql => "mysql",
            ManagedKind::Redis => "redis",
            ManagedKind::MongoDb => "mongo",
            ManagedKind::RabbitMq => "rabbitmq",
        }
    }

    /// Upstream image for a version; `rabbitmq` always uses the management flavour.
    pub fn image(&self, version: &str) -> String {
        let version = if version.trim().is_empty() { "latest" } else { version.trim() };
        match self {
            ManagedKind::RabbitMq if version == "latest" => "rabbitmq:management".to_string(),
            ManagedKind::RabbitMq => format!("rabbitmq:{}-management", version),
            _ => format!("{}:{}", self.repository(), version),
        }
    }

    pub fn data_path(&self) -> &'static str {
        match self {
            ManagedKind::Postgres => "/var/lib/postgresql/data",
            ManagedKind::MySql => "/var/lib/mysql",
            ManagedKind::Redis => "/data",
            ManagedKind::MongoDb => "/data/db",
            ManagedKind::RabbitMq => "/var/lib/rabbitmq",
        }
    }

    pub fn command(&self) -> Option<Vec<String>> {
        match self {
            ManagedKind::Redis => Some(vec!["redis-server".to_string()]),
            _ => None,
        }
    }

    /// Container args; redis only persists when it has somewhere to persist to.
    pub fn args(&self, persistent: bool) -> Option<Vec<String>> {
        match self {
            ManagedKind::Redis if persistent => Some(
                ["--appendonly", "yes", "--dir", self.data_path()].iter().map(|s| s.to_string()).collect(),
            ),
            ManagedKind::Redis => Some(vec!["--save".to_string(), "".to_string()]),
            _ => None,
        }
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        match self {
            ManagedKind::Postgres => vec![Endpoint::new("postgres", 5432, Protocol::Tcp, true)],
            ManagedKind::MySql => vec![Endpoint::new("mysql", 3306, Protocol::Tcp, true)],
            ManagedKind::Redis => vec![Endpoint::new("redis", 6379, Protocol::Tcp, true)],
            ManagedKind::MongoDb => vec![Endpoint::new("mongodb", 27017, Protocol::Tcp, true)],
            ManagedKind::RabbitMq => vec![
                Endpoint::new("amqp", 5672, Protocol::Tcp, true),
                Endpoint::new("management", 15672, Protocol::Http, false),
            ],
        }
    }

    pub fn primary_endpoint(&self) -> Endpoint {
        self.endpoints()
            .into_iter()
            .find(|e| e.primary)
            .unwrap_or_else(|| Endpoint::new(self.as_str(), 0, Protocol::Tcp, true))
    }

    pub fn required_env(&self) -> &'static [&'static str] {
        match self {
            ManagedKind::Postgres => &["POSTGRES_PASSWORD"],
            ManagedKind::MySql => &["MYSQL_ROOT_PASSWORD"],
            ManagedKind::MongoDb => &["MONGO_INITDB_ROOT_USERNAME", "MONGO_INITDB_ROOT_PASSWORD"],
            ManagedKind::Redis | ManagedKind::RabbitMq => &[],
        }
    }

    /// Env the kind needs regardless of what the user declared.
    pub fn default_env(&self) -> Vec<(&'static str, String)> {
        match self {
            // The volume root holds lost+found; initdb wants an empty directory.
            ManagedKind::Postgres => vec![("PGDATA", format!("{}/pgdata", self.data_path()))],
            _ => Vec::new(),
        }
    }

    pub fn default_storage(&self) -> &'static str {
        match self {
            ManagedKind::Redis => "1Gi",
            ManagedKind::RabbitMq => "2Gi",
            _ => "5Gi",
        }
    }

    /// Whether the kind always needs a volume. Redis only gets one when storage is declared.
    pub fn requires_storage(&self) -> bool {
        !matches!(self, ManagedKind::Redis)
    }
}

impl std::fmt::Display for ManagedKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
