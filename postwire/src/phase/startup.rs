use md5::{Digest, Md5};
use std::borrow::Cow;

use super::{
    AuthError,
    sasl::{SCRAM_SHA_256, ScramSha256},
};
use crate::{
    Result,
    common::verbose,
    postgres::{
        BackendMessage, ReadyState, UnexpectedMessage,
        backend::{Authentication, BackendKeyData, ReadyForQuery},
        frontend::{PasswordMessage, SaslInitialResponse, SaslResponse, Startup},
    },
    transport::{PgTransport, PgTransportExt},
};

/// A config for postgres startup phase.
///
/// <https://www.postgresql.org/docs/current/protocol-flow.html#PROTOCOL-FLOW-START-UP>
#[derive(Debug, Clone)]
pub struct StartupConfig<'a> {
    user: Cow<'a,str>,
    database: Option<Cow<'a,str>>,
    password: Option<Cow<'a,str>>,
    params: Vec<(Cow<'a,str>, Cow<'a,str>)>,
}

impl<'a> StartupConfig<'a> {
    /// Create new config, the database user name is required.
    pub fn new(user: impl Into<Cow<'a, str>>) -> Self {
        Self { user: user.into(), database: None, password: None, params: vec![] }
    }

    /// The database user name to connect as.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// The database to connect to. Defaults to the user name.
    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    /// The database to connect to. Defaults to the user name.
    pub fn set_database(mut self, database: impl Into<Cow<'a,str>>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Authentication password, the default is empty string.
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// Authentication password, the default is empty string.
    pub fn set_password(mut self, password: impl Into<Cow<'a,str>>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Additional run-time parameter, e.g. `application_name`.
    pub fn set_param(mut self, name: impl Into<Cow<'a,str>>, value: impl Into<Cow<'a,str>>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }
}

/// Session data received in startup phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartupResponse {
    /// The process ID of this backend.
    pub process_id: u32,
    /// The secret key of this backend, required for cancellation.
    pub secret_key: u32,
    /// Transaction state when the backend is ready for query.
    pub ready: ReadyState,
}

/// Perform startup and authentication.
///
/// `ParameterStatus` is handled by the transport.
pub async fn startup<IO: PgTransport>(config: &StartupConfig<'_>, io: IO) -> Result<StartupResponse> {
    handshake(config, io, ScramSha256::new).await
}

async fn handshake<IO, F>(config: &StartupConfig<'_>, mut io: IO, scram: F) -> Result<StartupResponse>
where
    IO: PgTransport,
    F: FnOnce(&str) -> ScramSha256,
{
    let params = config
        .params
        .iter()
        .map(|(k, v)| (k.as_ref(), v.as_ref()))
        .collect::<Vec<_>>();

    io.send(Startup {
        user: config.user(),
        database: config.database(),
        params: &params,
    }.into())?;
    io.flush().await?;

    authenticate(config, &mut io, scram).await?;

    // Backend now send `ParameterStatus`, `BackendKeyData`, and finally `ReadyForQuery`
    let mut key_data = None;

    loop {
        match io.message().await? {
            BackendMessage::BackendKeyData(key) => key_data = Some(key),
            BackendMessage::NegotiateProtocolVersion(_) => { },
            BackendMessage::ReadyForQuery(ReadyForQuery { state }) => {
                let BackendKeyData { process_id, secret_key } = key_data.unwrap_or(BackendKeyData {
                    process_id: 0,
                    secret_key: 0,
                });
                return Ok(StartupResponse { process_id, secret_key, ready: state });
            },
            BackendMessage::ErrorResponse(err) => return Err(err.error.into()),
            message => {
                const EXPECTED: &[u8] = &[BackendKeyData::MSGTYPE, ReadyForQuery::MSGTYPE];
                return Err(UnexpectedMessage::new(message.msgtype(), EXPECTED).into());
            },
        }
    }
}

async fn recv_auth<IO: PgTransport>(io: &mut IO) -> Result<Authentication> {
    loop {
        match io.message().await? {
            BackendMessage::Authentication(auth) => return Ok(auth),
            BackendMessage::NegotiateProtocolVersion(_v) => {
                #[cfg(feature = "log")]
                log::debug!("server negotiate protocol minor version {}", _v.minor);
            },
            message => return crate::transport::expect(message),
        }
    }
}

async fn authenticate<IO, F>(config: &StartupConfig<'_>, io: &mut IO, scram: F) -> Result<()>
where
    IO: PgTransport,
    F: FnOnce(&str) -> ScramSha256,
{
    let password = config.password().unwrap_or_default();

    let auth = recv_auth(io).await?;
    verbose!(method = auth.name(), "authentication requested");

    match auth {
        Authentication::Ok => return Ok(()),
        Authentication::CleartextPassword => {
            io.send(PasswordMessage { password }.into())?;
        },
        Authentication::MD5Password { salt } => {
            let password = md5_password(config.user(), password, salt);
            io.send(PasswordMessage { password: &password }.into())?;
        },
        Authentication::SASL { mechanisms } => {
            if !mechanisms.iter().any(|e| e == SCRAM_SHA_256) {
                let mechanisms = mechanisms.iter().map(|e| e.as_str()).collect::<Vec<_>>().join(", ");
                return Err(AuthError::Unsupported(format!("SASL {mechanisms}").into()).into());
            }
            return sasl(io, scram(password)).await;
        },
        auth => return Err(AuthError::Unsupported(auth.name().into()).into()),
    }

    #[cfg(feature = "log")]
    log::debug!("password authentication");

    io.flush().await?;
    expect_auth(io, 0).await?;
    Ok(())
}

async fn sasl<IO: PgTransport>(io: &mut IO, mut scram: ScramSha256) -> Result<()> {
    #[cfg(feature = "log")]
    log::debug!("SCRAM-SHA-256 authentication");

    io.send(SaslInitialResponse { mechanism: SCRAM_SHA_256, data: &scram.message() }.into())?;
    io.flush().await?;

    let Authentication::SASLContinue { data } = expect_auth(io, 11).await? else {
        unreachable!()
    };
    let client_final = scram.update(&data).map_err(AuthError::from)?;

    io.send(SaslResponse { data: &client_final }.into())?;
    io.flush().await?;

    let Authentication::SASLFinal { data } = expect_auth(io, 12).await? else {
        unreachable!()
    };
    scram.finish(&data).map_err(AuthError::from)?;

    expect_auth(io, 0).await?;
    Ok(())
}

/// Receive authentication request with code `expected`.
async fn expect_auth<IO: PgTransport>(io: &mut IO, expected: u32) -> Result<Authentication> {
    let auth = recv_auth(io).await?;
    if auth.code() != expected {
        return Err(AuthError::UnexpectedAuthCode { expected, found: auth.code() }.into());
    }
    Ok(auth)
}

/// `"md5" + hex(md5(hex(md5(password + user)) + salt))`
fn md5_password(user: &str, password: &str, salt: [u8; 4]) -> String {
    let inner = Md5::new()
        .chain_update(password)
        .chain_update(user)
        .finalize();
    let outer = Md5::new()
        .chain_update(format!("{inner:x}"))
        .chain_update(salt)
        .finalize();
    format!("md5{outer:x}")
}

#[cfg(test)]
mod test {
    use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
    use bytes::{Buf, Bytes};
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    use super::*;
    use crate::{
        ErrorKind,
        postgres::{
            DatabaseError,
            backend::{ErrorResponse, ParameterStatus},
        },
        transport::mock::Script,
    };

    fn ready() -> BackendMessage {
        ReadyForQuery { state: ReadyState::Idle }.into()
    }

    fn key_data() -> BackendMessage {
        BackendKeyData { process_id: 42, secret_key: 7 }.into()
    }

    /// Skip the untagged startup message, returns its body.
    fn split_startup(script: &mut Script) -> Bytes {
        let mut sent = script.sent.split().freeze();
        let len = sent.get_u32() as usize;
        let startup = sent.split_to(len - 4);
        script.sent.extend_from_slice(&sent);
        startup
    }

    #[tokio::test]
    async fn trust() {
        let mut script = Script::new([
            Authentication::Ok.into(),
            ParameterStatus { name: "server_version".into(), value: "17".into() }.into(),
            key_data(),
            ready(),
        ]);

        let config = StartupConfig::new("alice").set_database("app").set_param("application_name", "test");
        let res = startup(&config, &mut script).await.unwrap();
        assert_eq!(res, StartupResponse { process_id: 42, secret_key: 7, ready: ReadyState::Idle });

        let body = split_startup(&mut script);
        assert_eq!(&body[..], b"\0\x03\0\0user\0alice\0database\0app\0application_name\0test\0\0");
        assert!(script.sent.is_empty());
    }

    #[tokio::test]
    async fn cleartext() {
        let mut script = Script::new([Authentication::CleartextPassword.into(), Authentication::Ok.into(), key_data(), ready()]);
        let config = StartupConfig::new("alice").set_password("secret");
        startup(&config, &mut script).await.unwrap();

        split_startup(&mut script);
        assert_eq!(&script.sent[..], b"p\0\0\0\x0bsecret\0");
    }

    #[tokio::test]
    async fn md5() {
        let salt = [1, 2, 3, 4];
        let mut script = Script::new([Authentication::MD5Password { salt }.into(), Authentication::Ok.into(), key_data(), ready()]);
        let config = StartupConfig::new("alice").set_password("secret");
        startup(&config, &mut script).await.unwrap();

        split_startup(&mut script);
        let expected = md5_password("alice", "secret", salt);
        assert_eq!(&script.sent[5..script.sent.len() - 1], expected.as_bytes());
    }

    #[test]
    fn md5_layout() {
        let password = md5_password("alice", "secret", [1, 2, 3, 4]);
        assert_eq!(password.len(), 35);
        assert!(password.starts_with("md5"));
        assert!(password[3..].bytes().all(|e| e.is_ascii_hexdigit() && !e.is_ascii_uppercase()));
        assert_ne!(password, md5_password("alice", "secret", [1, 2, 3, 5]));
        assert_ne!(password, md5_password("bob", "secret", [1, 2, 3, 4]));
    }

    fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
        let mut mac = Hmac::<Sha256>::new_from_slice(key).unwrap();
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }

    /// Scripted SCRAM server for fixed client nonce.
    fn scram_script(password: &str, signature: Option<Vec<u8>>) -> (Script, String) {
        const NONCE: &str = "rOprNGfwEbeRWgbNEkqO";
        let salt = b"saltsaltsalt";
        let server_first = format!("r={NONCE}%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s={},i=4096", BASE64.encode(salt));

        let salted = pbkdf2::pbkdf2_hmac_array::<Sha256, 32>(password.as_bytes(), salt, 4096);
        let server_key = hmac(&salted, b"Server Key");
        let auth_message = format!(
            "n=*,r={NONCE},{server_first},c=biws,r={NONCE}%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0"
        );
        let signature = signature.unwrap_or_else(|| hmac(&server_key, auth_message.as_bytes()));

        let script = Script::new([
            Authentication::SASL { mechanisms: vec!["SCRAM-SHA-256-PLUS".into(), "SCRAM-SHA-256".into()] }.into(),
            Authentication::SASLContinue { data: server_first.into() }.into(),
            Authentication::SASLFinal { data: format!("v={}", BASE64.encode(signature)).into() }.into(),
            Authentication::Ok.into(),
            key_data(),
            ready(),
        ]);
        (script, NONCE.into())
    }

    #[tokio::test]
    async fn scram() {
        let (mut script, nonce) = scram_script("pencil", None);
        let config = StartupConfig::new("user").set_password("pencil");
        let res = handshake(&config, &mut script, |pass| ScramSha256::with_nonce(pass, nonce)).await.unwrap();
        assert_eq!(res.process_id, 42);

        split_startup(&mut script);
        assert_eq!(script.sent_types(), b"pp");
        let initial = b"SCRAM-SHA-256\0\0\0\0\x1dn,,n=*,r=rOprNGfwEbeRWgbNEkqO";
        assert_eq!(&script.sent[5..5 + initial.len()], initial);
    }

    #[tokio::test]
    async fn scram_bad_signature() {
        let (mut script, nonce) = scram_script("pencil", Some(vec![0; 32]));
        let config = StartupConfig::new("user").set_password("pencil");
        let err = handshake(&config, &mut script, |pass| ScramSha256::with_nonce(pass, nonce)).await.unwrap_err();
        let ErrorKind::Auth(AuthError::Sasl(sasl)) = err.kind() else {
            panic!("expected sasl error, found {err}");
        };
        assert_eq!(sasl.reason(), "mismatch server signature");
    }

    #[tokio::test]
    async fn scram_unexpected_code() {
        let mut script = Script::new([
            Authentication::SASL { mechanisms: vec!["SCRAM-SHA-256".into()] }.into(),
            Authentication::Ok.into(),
        ]);
        let config = StartupConfig::new("user").set_password("pencil");
        let err = startup(&config, &mut script).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Auth(AuthError::UnexpectedAuthCode { expected: 11, found: 0 })));
    }

    #[tokio::test]
    async fn unsupported() {
        let mut script = Script::new([Authentication::SASL { mechanisms: vec!["SCRAM-SHA-256-PLUS".into()] }.into()]);
        let err = startup(&StartupConfig::new("user"), &mut script).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Auth(AuthError::Unsupported(_))));

        let mut script = Script::new([Authentication::GSS.into()]);
        let err = startup(&StartupConfig::new("user"), &mut script).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Auth(AuthError::Unsupported(_))));
    }

    #[tokio::test]
    async fn database_error() {
        let mut script = Script::new([
            ErrorResponse { error: DatabaseError::new("FATAL", "28P01", "password authentication failed") }.into(),
        ]);
        let err = startup(&StartupConfig::new("user"), &mut script).await.unwrap_err();
        assert_eq!(err.as_database().unwrap().code(), "28P01");
    }
}
