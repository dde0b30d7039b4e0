//! Postgres configuration.
use std::{borrow::Cow, env::var, fmt, sync::Arc};

use crate::{
    common::ByteStr,
    net::{SslMode, TlsConnect},
    phase::StartupConfig,
};

const DEFAULT_PORT: u16 = 5432;

/// Postgres connection config.
#[derive(Clone)]
pub struct Config {
    pub(crate) user: ByteStr,
    pub(crate) pass: Option<ByteStr>,
    pub(crate) socket: Option<ByteStr>,
    pub(crate) host: ByteStr,
    pub(crate) port: u16,
    pub(crate) dbname: Option<ByteStr>,
    pub(crate) ssl: SslMode,
    pub(crate) application_name: Option<ByteStr>,
    pub(crate) tls: Option<Arc<dyn TlsConnect>>,
}

impl Config {
    /// Create config with given user, connecting to `localhost:5432`.
    pub fn new(user: impl Into<ByteStr>) -> Config {
        Self {
            user: user.into(),
            pass: None,
            socket: None,
            host: ByteStr::from_static("localhost"),
            port: DEFAULT_PORT,
            dbname: None,
            ssl: SslMode::Disable,
            application_name: None,
            tls: None,
        }
    }

    /// Retrieve configuration from environment variable.
    ///
    /// It reads:
    /// - `PGUSER`
    /// - `PGPASSWORD` or `PGPASS`
    /// - `PGHOST`
    /// - `PGPORT`
    /// - `PGDATABASE`
    /// - `PGSSLMODE`
    ///
    /// Additionally, it also read `DATABASE_URL` to provide missing value from
    /// previous variables before fallback to default value.
    pub fn from_env() -> Config {
        let url = var("DATABASE_URL").ok().and_then(|e|Config::parse_inner(e.into()).ok());

        macro_rules! env {
            ($name:expr,$or:ident) => {
                match ($name.ok(),url.as_ref()) {
                    (Some(ok),_) => Some(ByteStr::from(ok)),
                    (None,Some(e)) => e.$or.clone(),
                    (None,None) => None,
                }
            };
        }

        let user = match (var("PGUSER"),url.as_ref()) {
            (Ok(ok),_) => ok.into(),
            (Err(_),Some(e)) => e.user.clone(),
            (Err(_),None) => ByteStr::from_static("postgres"),
        };
        let pass = env!(var("PGPASSWORD").or_else(|_|var("PGPASS")),pass);
        let dbname = env!(var("PGDATABASE"),dbname);
        let application_name = url.as_ref().and_then(|e|e.application_name.clone());

        let (host,socket) = match (var("PGHOST"),url.as_ref()) {
            (Ok(host),_) if host.starts_with('/') => (ByteStr::from_static("localhost"), Some(host.into())),
            (Ok(host),_) => (host.into(), None),
            (Err(_),Some(e)) => (e.host.clone(), e.socket.clone()),
            (Err(_),None) => (ByteStr::from_static("localhost"), None),
        };

        let port = match (var("PGPORT"),url.as_ref()) {
            (Ok(ok),_) => ok.parse().unwrap_or(DEFAULT_PORT),
            (Err(_),Some(e)) => e.port,
            (Err(_),None) => DEFAULT_PORT,
        };

        let ssl = match (var("PGSSLMODE"),url.as_ref()) {
            (Ok(ok),_) => ok.parse().unwrap_or_default(),
            (Err(_),Some(e)) => e.ssl,
            (Err(_),None) => SslMode::Disable,
        };

        Self { user, pass, socket, host, port, dbname, ssl, application_name, tls: None }
    }

    /// Parse config from url.
    ///
    /// `postgres://user[:password]@[host][:port][/dbname][?param=value&..]`
    ///
    /// Recognized params are `sslmode`, `application_name`, `host`, `port`,
    /// `user`, `password` and `dbname`. A `host` which starts with `/` is
    /// a unix socket directory.
    pub fn parse(url: &str) -> Result<Config, ParseError> {
        Self::parse_inner(ByteStr::copy_from_str(url))
    }

    /// Parse config from static string url.
    ///
    /// This is for micro optimization, see [`Bytes::from_static`][1].
    ///
    /// [1]: bytes::Bytes::from_static
    pub fn parse_static(url: &'static str) -> Result<Config, ParseError> {
        Self::parse_inner(ByteStr::from_static(url))
    }

    fn parse_inner(url: ByteStr) -> Result<Self, ParseError> {
        let read = url.as_str();

        let Some((scheme, read)) = read.split_once("://") else {
            return Err(ParseError::new("scheme missing"));
        };
        if !matches!(scheme, "postgres" | "postgresql") {
            return Err(ParseError::new("invalid scheme"));
        }

        let (read, query) = match read.split_once('?') {
            Some((read, query)) => (read, Some(query)),
            None => (read, None),
        };

        let (authority, dbname) = match read.split_once('/') {
            Some((authority, dbname)) => (authority, Some(dbname).filter(|e|!e.is_empty())),
            None => (read, None),
        };

        let Some((userinfo, hostport)) = authority.rsplit_once('@') else {
            return Err(ParseError::new("user missing"));
        };

        let (user, pass) = match userinfo.split_once(':') {
            Some((user, pass)) => (user, Some(pass)),
            None => (userinfo, None),
        };

        let (host, port) = match hostport.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (hostport, None),
        };

        let mut me = Config::new(url.slice_ref(user));
        me.pass = pass.map(|e|url.slice_ref(e));
        me.dbname = dbname.map(|e|url.slice_ref(e));

        if !host.is_empty() {
            me.host = url.slice_ref(host);
        }

        if let Some(port) = port {
            me.port = parse_port(port)?;
        }

        for pair in query.into_iter().flat_map(|e|e.split('&')) {
            let Some((key, value)) = pair.split_once('=') else {
                return Err(ParseError::new("invalid query param"));
            };
            let value = url.slice_ref(value);
            match key {
                "sslmode" => {
                    me.ssl = value.parse().map_err(|_|ParseError::new("invalid sslmode"))?;
                },
                "application_name" => me.application_name = Some(value),
                "host" if value.starts_with('/') => me.socket = Some(value),
                "host" => me.host = value,
                "port" => me.port = parse_port(&value)?,
                "user" => me.user = value,
                "password" => me.pass = Some(value),
                "dbname" => me.dbname = Some(value),
                _ => { },
            }
        }

        if me.user.is_empty() {
            return Err(ParseError::new("user missing"));
        }

        Ok(me)
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn dbname(&self) -> Option<&str> {
        self.dbname.as_deref()
    }

    pub fn ssl(&self) -> SslMode {
        self.ssl
    }

    pub fn application_name(&self) -> Option<&str> {
        self.application_name.as_deref()
    }

    pub fn set_user(mut self, user: impl Into<ByteStr>) -> Self {
        self.user = user.into();
        self
    }

    pub fn set_password(mut self, pass: impl Into<ByteStr>) -> Self {
        self.pass = Some(pass.into());
        self
    }

    pub fn set_host(mut self, host: impl Into<ByteStr>) -> Self {
        self.host = host.into();
        self
    }

    pub fn set_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn set_dbname(mut self, dbname: impl Into<ByteStr>) -> Self {
        self.dbname = Some(dbname.into());
        self
    }

    /// Connect through unix socket, `path` is either the socket directory or the socket file.
    pub fn set_socket(mut self, path: impl Into<ByteStr>) -> Self {
        self.socket = Some(path.into());
        self
    }

    pub fn set_ssl(mut self, ssl: SslMode) -> Self {
        self.ssl = ssl;
        self
    }

    pub fn set_application_name(mut self, name: impl Into<ByteStr>) -> Self {
        self.application_name = Some(name.into());
        self
    }

    /// Set the TLS connector used when the server accept `SSLRequest`.
    ///
    /// When no [`SslMode`] is set, this also set it to [`SslMode::Prefer`].
    pub fn set_tls(mut self, tls: impl TlsConnect) -> Self {
        self.tls = Some(Arc::new(tls));
        if self.ssl == SslMode::Disable {
            self.ssl = SslMode::Prefer;
        }
        self
    }

    /// Unix socket file path, if configured.
    pub(crate) fn socket_path(&self) -> Option<String> {
        let path = self.socket.as_deref()?;
        if path.contains(".s.PGSQL.") {
            Some(path.to_owned())
        } else {
            Some(format!("{}/.s.PGSQL.{}", path.trim_end_matches('/'), self.port))
        }
    }
}

fn parse_port(port: &str) -> Result<u16, ParseError> {
    port.parse().map_err(|_|ParseError::new("invalid port"))
}

impl<'a> From<&'a Config> for StartupConfig<'a> {
    fn from(me: &'a Config) -> StartupConfig<'a> {
        let mut config = StartupConfig::new(me.user.as_str());
        if let Some(dbname) = me.dbname() {
            config = config.set_database(dbname);
        }
        if let Some(pass) = me.pass.as_deref() {
            config = config.set_password(pass);
        }
        if let Some(name) = me.application_name() {
            config = config.set_param("application_name", name);
        }
        config
    }
}

impl std::str::FromStr for Config {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("user", &self.user)
            .field("pass", &self.pass.as_ref().map(|_|"***"))
            .field("socket", &self.socket)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("dbname", &self.dbname)
            .field("ssl", &self.ssl)
            .field("application_name", &self.application_name)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

/// Error when parsing url.
pub struct ParseError {
    pub(crate) reason: Cow<'static,str>,
}

impl ParseError {
    fn new(reason: &'static str) -> Self {
        Self { reason: reason.into() }
    }
}

impl std::error::Error for ParseError { }

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            return f.write_str(&self.reason)
        }
        write!(f, "failed to parse url: {}", self.reason)
    }
}

impl fmt::Debug for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
