use std::collections::HashMap;

use crate::error::DbError;

/// Scheme token of embedded connection URLs.
pub const URL_SCHEME: &str = "basalt:";

/// How the database is reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Mem,
    Embedded,
}

/// A parsed connection URL:
///
/// ```text
/// <url> ::= "basalt:" ("tcp://" host ":" port | "mem:" | "embed:") "/" dbname ("?" kv ("&" kv)*)?
/// kv    ::= key "=" value
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    url: String,
    endpoint: Endpoint,
    database: String,
    params: HashMap<String, String>,
}

impl ConnectionInfo {
    pub fn parse(url: &str) -> Result<ConnectionInfo, DbError> {
        let rest = url
            .strip_prefix(URL_SCHEME)
            .ok_or_else(|| DbError::InvalidValue(format!("url scheme: {url}")))?;

        let (endpoint, rest) = if let Some(rest) = rest.strip_prefix("tcp://") {
            let slash = rest
                .find('/')
                .ok_or_else(|| DbError::InvalidValue(format!("missing database name: {url}")))?;
            let authority = &rest[..slash];
            let (host, port) = authority
                .rsplit_once(':')
                .ok_or_else(|| DbError::InvalidValue(format!("missing port: {url}")))?;
            let port = port
                .parse::<u16>()
                .map_err(|_| DbError::InvalidValue(format!("port: {port}")))?;
            if host.is_empty() {
                return Err(DbError::InvalidValue(format!("missing host: {url}")));
            }
            (
                Endpoint::Tcp {
                    host: host.to_string(),
                    port,
                },
                &rest[slash..],
            )
        } else if let Some(rest) = rest.strip_prefix("mem:") {
            (Endpoint::Mem, rest)
        } else if let Some(rest) = rest.strip_prefix("embed:") {
            (Endpoint::Embedded, rest)
        } else {
            return Err(DbError::InvalidValue(format!("url endpoint: {url}")));
        };

        let rest = rest
            .strip_prefix('/')
            .ok_or_else(|| DbError::InvalidValue(format!("missing database name: {url}")))?;
        let (database, query) = match rest.split_once('?') {
            Some((db, query)) => (db, Some(query)),
            None => (rest, None),
        };
        if database.is_empty() {
            return Err(DbError::InvalidValue(format!("missing database name: {url}")));
        }

        let mut params = HashMap::new();
        if let Some(query) = query {
            for kv in query.split('&') {
                let (key, value) = kv
                    .split_once('=')
                    .ok_or_else(|| DbError::InvalidValue(format!("url parameter: {kv}")))?;
                params.insert(key.to_string(), value.to_string());
            }
        }

        Ok(ConnectionInfo {
            url: url.to_string(),
            endpoint,
            database: database.to_string(),
            params,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn database_name(&self) -> &str {
        &self.database
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// `host:port` of a TCP endpoint, the form peer lists use.
    pub fn peer_address(&self) -> Option<String> {
        match &self.endpoint {
            Endpoint::Tcp { host, port } => Some(format!("{host}:{port}")),
            _ => None,
        }
    }
}

/// A recognized session setting name. Values are applied by
/// `Session::set_setting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSetting {
    LockTimeout,
    QueryTimeout,
    Schema,
    SchemaSearchPath,
    Throttle,
    TransactionIsolationLevel,
    ValueVectorFactoryName,
    ExpressionCompileThreshold,
    OlapOperatorFactoryName,
    OlapThreshold,
}

impl SessionSetting {
    pub fn parse(name: &str) -> Option<SessionSetting> {
        match name.trim().to_ascii_uppercase().as_str() {
            "LOCK_TIMEOUT" => Some(SessionSetting::LockTimeout),
            "QUERY_TIMEOUT" => Some(SessionSetting::QueryTimeout),
            "SCHEMA" => Some(SessionSetting::Schema),
            "SCHEMA_SEARCH_PATH" => Some(SessionSetting::SchemaSearchPath),
            "THROTTLE" => Some(SessionSetting::Throttle),
            "TRANSACTION_ISOLATION_LEVEL" => Some(SessionSetting::TransactionIsolationLevel),
            "VALUE_VECTOR_FACTORY_NAME" => Some(SessionSetting::ValueVectorFactoryName),
            "EXPRESSION_COMPILE_THRESHOLD" => Some(SessionSetting::ExpressionCompileThreshold),
            "OLAP_OPERATOR_FACTORY_NAME" => Some(SessionSetting::OlapOperatorFactoryName),
            "OLAP_THRESHOLD" => Some(SessionSetting::OlapThreshold),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SessionSetting::LockTimeout => "LOCK_TIMEOUT",
            SessionSetting::QueryTimeout => "QUERY_TIMEOUT",
            SessionSetting::Schema => "SCHEMA",
            SessionSetting::SchemaSearchPath => "SCHEMA_SEARCH_PATH",
            SessionSetting::Throttle => "THROTTLE",
            SessionSetting::TransactionIsolationLevel => "TRANSACTION_ISOLATION_LEVEL",
            SessionSetting::ValueVectorFactoryName => "VALUE_VECTOR_FACTORY_NAME",
            SessionSetting::ExpressionCompileThreshold => "EXPRESSION_COMPILE_THRESHOLD",
            SessionSetting::OlapOperatorFactoryName => "OLAP_OPERATOR_FACTORY_NAME",
            SessionSetting::OlapThreshold => "OLAP_THRESHOLD",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_url_with_params() {
        let info = ConnectionInfo::parse("basalt:tcp://127.0.0.1:9210/test?user=sa&x=1").unwrap();
        assert_eq!(
            info.endpoint(),
            &Endpoint::Tcp {
                host: "127.0.0.1".to_string(),
                port: 9210
            }
        );
        assert_eq!(info.database_name(), "test");
        assert_eq!(info.param("user"), Some("sa"));
        assert_eq!(info.param("x"), Some("1"));
        assert_eq!(info.peer_address().as_deref(), Some("127.0.0.1:9210"));
    }

    #[test]
    fn parses_mem_and_embedded_urls() {
        let mem = ConnectionInfo::parse("basalt:mem:/scratch").unwrap();
        assert_eq!(mem.endpoint(), &Endpoint::Mem);
        assert_eq!(mem.database_name(), "scratch");
        assert_eq!(mem.peer_address(), None);

        let embedded = ConnectionInfo::parse("basalt:embed:/data").unwrap();
        assert_eq!(embedded.endpoint(), &Endpoint::Embedded);
        assert_eq!(embedded.database_name(), "data");
    }

    #[test]
    fn rejects_malformed_urls() {
        for url in [
            "jdbc:tcp://h:1/db",
            "basalt:tcp://h/db",
            "basalt:tcp://h:x/db",
            "basalt:mem:",
            "basalt:mem:/",
            "basalt:udp://h:1/db",
            "basalt:mem:/db?novalue",
        ] {
            let err = ConnectionInfo::parse(url).unwrap_err();
            assert_eq!(err.kind(), crate::error::ErrorKind::InvalidValue, "{url}");
        }
    }

    #[test]
    fn setting_names_roundtrip() {
        for setting in [
            SessionSetting::LockTimeout,
            SessionSetting::QueryTimeout,
            SessionSetting::Schema,
            SessionSetting::SchemaSearchPath,
            SessionSetting::Throttle,
            SessionSetting::TransactionIsolationLevel,
            SessionSetting::ValueVectorFactoryName,
            SessionSetting::ExpressionCompileThreshold,
            SessionSetting::OlapOperatorFactoryName,
            SessionSetting::OlapThreshold,
        ] {
            assert_eq!(SessionSetting::parse(setting.name()), Some(setting));
        }
        assert_eq!(SessionSetting::parse("NO_SUCH_SETTING"), None);
    }
}
