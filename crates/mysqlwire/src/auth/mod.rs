//! MySQL authentication plugins.
//!
//! Every plugin turns "challenge + password" into response bytes, and may
//! answer further AuthMoreData packets from the server:
//! - `mysql_native_password`: SHA1-based (legacy, MySQL < 8.0 default)
//! - `mysql_clear_password`: the password itself, only over TLS or a socket
//! - `sha256_password`: cleartext over TLS, RSA-OAEP otherwise
//! - `caching_sha2_password`: SHA256 scramble with a full-auth fallback
//!   (MySQL 8.0+ default)
//! - `authentication_ldap_sasl_client`: SCRAM-SHA-1/SCRAM-SHA-256, see [`scram`]
//! - any other name (Kerberos, GSSAPI) is delegated to an [`ExternalAuth`]
//!   strategy supplied by the application
//!
//! # mysql_native_password
//!
//! ```text
//! SHA1(password) XOR SHA1(seed + SHA1(SHA1(password)))
//! ```
//!
//! # caching_sha2_password
//!
//! Fast auth (if cached on server):
//! ```text
//! XOR(SHA256(password), SHA256(SHA256(SHA256(password)) + seed))
//! ```
//!
//! Full auth requires a secure channel or RSA public key encryption.

pub mod authenticator;
pub mod scram;

use std::fmt;
use std::sync::Arc;

use rand::rngs::OsRng;
use rsa::RsaPublicKey;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use mysqlwire_core::error::AuthErrorKind;
use mysqlwire_core::{Error, Result};

pub use authenticator::{AuthOutcome, AuthSettings, Authenticator};
pub use scram::ScramClient;

/// Well-known authentication plugin names.
pub mod plugins {
    pub const MYSQL_NATIVE_PASSWORD: &str = "mysql_native_password";
    pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";
    pub const SHA256_PASSWORD: &str = "sha256_password";
    pub const MYSQL_CLEAR_PASSWORD: &str = "mysql_clear_password";
    pub const LDAP_SASL_CLIENT: &str = "authentication_ldap_sasl_client";
    pub const KERBEROS_CLIENT: &str = "authentication_kerberos_client";
}

/// Markers exchanged inside AuthMoreData by the SHA256 plugins.
pub mod caching_sha2 {
    /// Client asks for the server's RSA public key (caching_sha2_password)
    pub const REQUEST_PUBLIC_KEY: u8 = 0x02;
    /// The scramble matched the server cache
    pub const FAST_AUTH_SUCCESS: u8 = 0x03;
    /// Send the password over a secure channel or RSA-encrypted
    pub const PERFORM_FULL_AUTH: u8 = 0x04;
}

/// Public key request byte of sha256_password.
const SHA256_REQUEST_PUBLIC_KEY: u8 = 0x01;

/// What a plugin sees of the session while producing responses.
#[derive(Debug, Clone, Copy)]
pub struct AuthContext<'a> {
    pub user: &'a str,
    /// Password for the factor being authenticated
    pub password: &'a [u8],
    /// Challenge from the handshake or the latest auth switch
    pub seed: &'a [u8],
    /// TLS is active or the transport is a local socket
    pub secure: bool,
    /// PEM key configured by the application, saves a round trip
    pub server_public_key: Option<&'a [u8]>,
}

/// A plugin's answer to an AuthMoreData packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthReply {
    /// Send these bytes as the next auth packet
    Send(Vec<u8>),
    /// Nothing to send; the server speaks next
    Wait,
}

/// Common interface of all authentication mechanisms.
pub trait AuthPlugin: Send {
    fn name(&self) -> &str;

    /// Bytes for the handshake response or the auth-switch answer.
    fn initial_response(&mut self, ctx: &AuthContext<'_>) -> Result<Vec<u8>>;

    /// React to an AuthMoreData packet (its payload without the 0x01 marker).
    fn continue_auth(&mut self, data: &[u8], ctx: &AuthContext<'_>) -> Result<AuthReply>;
}

/// Strategy for mechanisms that need a system library (Kerberos, GSSAPI).
///
/// The engine drives the packet exchange and enforces sequence numbers; the
/// strategy only produces tokens.
pub trait ExternalAuth: Send + Sync {
    /// Whether this strategy implements `plugin` (or, for the SASL plugin,
    /// the SASL mechanism name sent by the server).
    fn supports(&self, plugin: &str) -> bool;

    /// Start a fresh exchange for `plugin`.
    fn start(&self, plugin: &str) -> Result<Box<dyn AuthPlugin>>;
}

impl fmt::Debug for dyn ExternalAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ExternalAuth")
    }
}

fn unsupported(plugin: &str) -> Error {
    Error::authentication(
        AuthErrorKind::UnsupportedPlugin,
        format!("Authentication plugin '{plugin}' is not supported"),
    )
}

pub(crate) fn insecure(plugin: &str) -> Error {
    Error::authentication(
        AuthErrorKind::InsecureChannel,
        format!("{plugin} requires SSL"),
    )
}

/// Compute the mysql_native_password scramble.
///
/// Returns an empty response for an empty password.
pub fn scramble_native_password(password: &[u8], seed: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return vec![];
    }
    let seed = &seed[..seed.len().min(20)];

    let stage1: [u8; 20] = Sha1::digest(password).into();
    let stage2: [u8; 20] = Sha1::digest(stage1).into();
    let mut hasher = Sha1::new();
    hasher.update(seed);
    hasher.update(stage2);
    let stage3: [u8; 20] = hasher.finalize().into();

    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

/// Compute the caching_sha2_password fast-auth scramble.
///
/// Returns an empty response for an empty password.
pub fn scramble_caching_sha2(password: &[u8], seed: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return vec![];
    }
    let password_hash: [u8; 32] = Sha256::digest(password).into();
    let password_hash_hash: [u8; 32] = Sha256::digest(password_hash).into();
    let mut hasher = Sha256::new();
    hasher.update(password_hash_hash);
    hasher.update(seed);
    let scramble: [u8; 32] = hasher.finalize().into();

    password_hash
        .iter()
        .zip(scramble.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// Encrypt `password + NUL`, XORed with the rotating seed, under the server's
/// RSA public key (PEM, SPKI or PKCS#1) with OAEP padding.
pub fn encrypt_password_rsa(password: &[u8], seed: &[u8], public_key_pem: &[u8]) -> Result<Vec<u8>> {
    if seed.is_empty() {
        return Err(Error::protocol("missing authentication data (seed)"));
    }
    let mut pw = password.to_vec();
    pw.push(0);
    for (i, b) in pw.iter_mut().enumerate() {
        *b ^= seed[i % seed.len()];
    }

    let pem = std::str::from_utf8(public_key_pem)
        .map_err(|e| Error::protocol(format!("server public key is not valid PEM: {e}")))?;
    let pem = pem.trim_end_matches('\0');
    let key = RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| Error::protocol(format!("failed to parse RSA public key: {e}")))?;

    key.encrypt(&mut OsRng, rsa::Oaep::new::<Sha1>(), &pw)
        .map_err(|e| {
            Error::authentication(
                AuthErrorKind::Rejected,
                format!("RSA encryption of the password failed: {e}"),
            )
        })
}

fn with_nul(password: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(password.len() + 1);
    out.extend_from_slice(password);
    out.push(0);
    out
}

#[derive(Debug, Default)]
pub struct NativePassword;

impl AuthPlugin for NativePassword {
    fn name(&self) -> &str {
        plugins::MYSQL_NATIVE_PASSWORD
    }

    fn initial_response(&mut self, ctx: &AuthContext<'_>) -> Result<Vec<u8>> {
        if ctx.seed.is_empty() && !ctx.password.is_empty() {
            return Err(Error::protocol("missing authentication data (seed)"));
        }
        Ok(scramble_native_password(ctx.password, ctx.seed))
    }

    fn continue_auth(&mut self, data: &[u8], _ctx: &AuthContext<'_>) -> Result<AuthReply> {
        Err(Error::protocol(format!(
            "unexpected auth data ({} bytes) for mysql_native_password",
            data.len()
        )))
    }
}

#[derive(Debug, Default)]
pub struct ClearPassword;

impl AuthPlugin for ClearPassword {
    fn name(&self) -> &str {
        plugins::MYSQL_CLEAR_PASSWORD
    }

    fn initial_response(&mut self, ctx: &AuthContext<'_>) -> Result<Vec<u8>> {
        if !ctx.secure {
            return Err(insecure(self.name()));
        }
        Ok(with_nul(ctx.password))
    }

    fn continue_auth(&mut self, data: &[u8], _ctx: &AuthContext<'_>) -> Result<AuthReply> {
        Err(Error::protocol(format!(
            "unexpected auth data ({} bytes) for mysql_clear_password",
            data.len()
        )))
    }
}

/// sha256_password: cleartext over a secure channel, otherwise RSA with a key
/// that is configured or requested from the server.
#[derive(Debug, Default)]
pub struct Sha256Password {
    key_requested: bool,
}

impl AuthPlugin for Sha256Password {
    fn name(&self) -> &str {
        plugins::SHA256_PASSWORD
    }

    fn initial_response(&mut self, ctx: &AuthContext<'_>) -> Result<Vec<u8>> {
        if ctx.secure || ctx.password.is_empty() {
            return Ok(with_nul(ctx.password));
        }
        if let Some(key) = ctx.server_public_key {
            return encrypt_password_rsa(ctx.password, ctx.seed, key);
        }
        self.key_requested = true;
        Ok(vec![SHA256_REQUEST_PUBLIC_KEY])
    }

    fn continue_auth(&mut self, data: &[u8], ctx: &AuthContext<'_>) -> Result<AuthReply> {
        if !self.key_requested {
            return Err(Error::protocol("unexpected auth data for sha256_password"));
        }
        self.key_requested = false;
        encrypt_password_rsa(ctx.password, ctx.seed, data).map(AuthReply::Send)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sha2State {
    Scrambled,
    AwaitingKey,
    Sent,
}

/// caching_sha2_password: fast path scramble, full authentication on demand.
#[derive(Debug)]
pub struct CachingSha2Password {
    state: Sha2State,
}

impl Default for CachingSha2Password {
    fn default() -> Self {
        Self {
            state: Sha2State::Scrambled,
        }
    }
}

impl CachingSha2Password {
    fn full_auth(&mut self, ctx: &AuthContext<'_>) -> Result<AuthReply> {
        if ctx.secure {
            self.state = Sha2State::Sent;
            return Ok(AuthReply::Send(with_nul(ctx.password)));
        }
        if let Some(key) = ctx.server_public_key {
            self.state = Sha2State::Sent;
            return encrypt_password_rsa(ctx.password, ctx.seed, key).map(AuthReply::Send);
        }
        self.state = Sha2State::AwaitingKey;
        Ok(AuthReply::Send(vec![caching_sha2::REQUEST_PUBLIC_KEY]))
    }
}

impl AuthPlugin for CachingSha2Password {
    fn name(&self) -> &str {
        plugins::CACHING_SHA2_PASSWORD
    }

    fn initial_response(&mut self, ctx: &AuthContext<'_>) -> Result<Vec<u8>> {
        self.state = Sha2State::Scrambled;
        Ok(scramble_caching_sha2(ctx.password, ctx.seed))
    }

    fn continue_auth(&mut self, data: &[u8], ctx: &AuthContext<'_>) -> Result<AuthReply> {
        match (self.state, data) {
            (Sha2State::Scrambled, [caching_sha2::FAST_AUTH_SUCCESS]) => Ok(AuthReply::Wait),
            (Sha2State::Scrambled, [caching_sha2::PERFORM_FULL_AUTH]) => self.full_auth(ctx),
            (Sha2State::AwaitingKey, key) => {
                self.state = Sha2State::Sent;
                encrypt_password_rsa(ctx.password, ctx.seed, key).map(AuthReply::Send)
            }
            _ => Err(Error::protocol(format!(
                "unexpected caching_sha2_password data (first byte 0x{:02X})",
                data.first().copied().unwrap_or(0)
            ))),
        }
    }
}

/// The closed set of mechanisms this client can run.
pub enum AuthMethod {
    Native(NativePassword),
    Clear(ClearPassword),
    Sha256(Sha256Password),
    CachingSha2(CachingSha2Password),
    Sasl(SaslPlugin),
    External(Box<dyn AuthPlugin>),
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AuthMethod").field(&self.as_plugin().name()).finish()
    }
}

impl AuthMethod {
    fn as_plugin(&self) -> &dyn AuthPlugin {
        match self {
            AuthMethod::Native(p) => p,
            AuthMethod::Clear(p) => p,
            AuthMethod::Sha256(p) => p,
            AuthMethod::CachingSha2(p) => p,
            AuthMethod::Sasl(p) => p,
            AuthMethod::External(p) => p.as_ref(),
        }
    }

    fn as_plugin_mut(&mut self) -> &mut dyn AuthPlugin {
        match self {
            AuthMethod::Native(p) => p,
            AuthMethod::Clear(p) => p,
            AuthMethod::Sha256(p) => p,
            AuthMethod::CachingSha2(p) => p,
            AuthMethod::Sasl(p) => p,
            AuthMethod::External(p) => p.as_mut(),
        }
    }
}

impl AuthPlugin for AuthMethod {
    fn name(&self) -> &str {
        self.as_plugin().name()
    }

    fn initial_response(&mut self, ctx: &AuthContext<'_>) -> Result<Vec<u8>> {
        self.as_plugin_mut().initial_response(ctx)
    }

    fn continue_auth(&mut self, data: &[u8], ctx: &AuthContext<'_>) -> Result<AuthReply> {
        self.as_plugin_mut().continue_auth(data, ctx)
    }
}

/// authentication_ldap_sasl_client: the server names the SASL mechanism in
/// the challenge. SCRAM runs in-process, GSSAPI goes to the external strategy.
pub struct SaslPlugin {
    external: Option<Arc<dyn ExternalAuth>>,
    inner: Option<Box<dyn AuthPlugin>>,
}

impl SaslPlugin {
    pub fn new(external: Option<Arc<dyn ExternalAuth>>) -> Self {
        Self {
            external,
            inner: None,
        }
    }
}

impl fmt::Debug for SaslPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaslPlugin")
            .field("mechanism", &self.inner.as_ref().map(|p| p.name().to_string()))
            .finish()
    }
}

impl AuthPlugin for SaslPlugin {
    fn name(&self) -> &str {
        plugins::LDAP_SASL_CLIENT
    }

    fn initial_response(&mut self, ctx: &AuthContext<'_>) -> Result<Vec<u8>> {
        let mechanism = String::from_utf8_lossy(ctx.seed);
        let mechanism = mechanism.trim_end_matches('\0');
        let mut inner: Box<dyn AuthPlugin> = match scram::ScramDigest::from_mechanism(mechanism) {
            Some(digest) => Box::new(ScramClient::new(digest)),
            None => match &self.external {
                Some(ext) if ext.supports(mechanism) => ext.start(mechanism)?,
                _ => {
                    return Err(Error::authentication(
                        AuthErrorKind::UnsupportedPlugin,
                        format!("The SASL authentication method '{mechanism}' is not supported"),
                    ));
                }
            },
        };
        let first = inner.initial_response(ctx)?;
        self.inner = Some(inner);
        Ok(first)
    }

    fn continue_auth(&mut self, data: &[u8], ctx: &AuthContext<'_>) -> Result<AuthReply> {
        match self.inner.as_mut() {
            Some(inner) => inner.continue_auth(data, ctx),
            None => Err(Error::protocol("SASL data received before the exchange started")),
        }
    }
}

/// Pick the mechanism for a plugin name announced by the server.
pub fn select_plugin(name: &str, external: Option<&Arc<dyn ExternalAuth>>) -> Result<AuthMethod> {
    match name {
        plugins::MYSQL_NATIVE_PASSWORD => Ok(AuthMethod::Native(NativePassword)),
        plugins::MYSQL_CLEAR_PASSWORD => Ok(AuthMethod::Clear(ClearPassword)),
        plugins::SHA256_PASSWORD => Ok(AuthMethod::Sha256(Sha256Password::default())),
        plugins::CACHING_SHA2_PASSWORD => {
            Ok(AuthMethod::CachingSha2(CachingSha2Password::default()))
        }
        plugins::LDAP_SASL_CLIENT => Ok(AuthMethod::Sasl(SaslPlugin::new(external.cloned()))),
        other => match external {
            Some(ext) if ext.supports(other) => Ok(AuthMethod::External(ext.start(other)?)),
            _ => Err(unsupported(other)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED: [u8; 20] = [
        0x3b, 0x55, 0x78, 0x7d, 0x2c, 0x5f, 0x7c, 0x72, 0x49, 0x52, 0x3f, 0x28, 0x47, 0x6f, 0x77,
        0x28, 0x5f, 0x28, 0x46, 0x69,
    ];

    fn ctx<'a>(password: &'a [u8], secure: bool) -> AuthContext<'a> {
        AuthContext {
            user: "ham",
            password,
            seed: &SEED,
            secure,
            server_public_key: None,
        }
    }

    #[test]
    fn test_native_password_vector() {
        assert_eq!(
            scramble_native_password(b"spam", &SEED),
            vec![
                0x3a, 0x07, 0x66, 0xba, 0xba, 0x01, 0xce, 0xbe, 0x55, 0xe6, 0x29, 0x88, 0xaa,
                0xae, 0xdb, 0x00, 0xb3, 0x4d, 0x91, 0x5b,
            ]
        );
        assert!(scramble_native_password(b"", &SEED).is_empty());

        let mut plugin = NativePassword;
        assert!(plugin.initial_response(&ctx(b"", false)).unwrap().is_empty());
        let no_seed = AuthContext {
            seed: &[],
            ..ctx(b"spam", false)
        };
        assert!(plugin.initial_response(&no_seed).is_err());
    }

    #[test]
    fn test_caching_sha2_scramble() {
        let result = scramble_caching_sha2(b"spam", &SEED);
        assert_eq!(result.len(), 32);
        assert_eq!(result, scramble_caching_sha2(b"spam", &SEED));
        assert_ne!(result, scramble_caching_sha2(b"eggs", &SEED));
        assert!(scramble_caching_sha2(b"", &SEED).is_empty());
    }

    #[test]
    fn test_clear_password_refused_when_insecure() {
        let mut plugin = ClearPassword;
        let err = plugin.initial_response(&ctx(b"spam", false)).unwrap_err();
        assert!(matches!(
            err,
            Error::Authentication(ref e) if e.kind == AuthErrorKind::InsecureChannel
        ));
        assert_eq!(plugin.initial_response(&ctx(b"spam", true)).unwrap(), b"spam\0");
        assert_eq!(plugin.initial_response(&ctx(b"", true)).unwrap(), b"\0");
    }

    #[test]
    fn test_sha256_password_paths() {
        let mut plugin = Sha256Password::default();
        assert_eq!(plugin.initial_response(&ctx(b"spam", true)).unwrap(), b"spam\0");
        assert_eq!(plugin.initial_response(&ctx(b"", false)).unwrap(), b"\0");

        let mut plugin = Sha256Password::default();
        assert_eq!(plugin.initial_response(&ctx(b"spam", false)).unwrap(), vec![0x01]);
        // not a PEM key
        assert!(plugin.continue_auth(b"garbage", &ctx(b"spam", false)).is_err());
    }

    #[test]
    fn test_caching_sha2_fast_and_full_paths() {
        let mut plugin = CachingSha2Password::default();
        let first = plugin.initial_response(&ctx(b"spam", false)).unwrap();
        assert_eq!(first.len(), 32);
        assert_eq!(plugin.continue_auth(&[0x03], &ctx(b"spam", false)).unwrap(), AuthReply::Wait);

        let mut plugin = CachingSha2Password::default();
        plugin.initial_response(&ctx(b"spam", true)).unwrap();
        assert_eq!(
            plugin.continue_auth(&[0x04], &ctx(b"spam", true)).unwrap(),
            AuthReply::Send(b"spam\0".to_vec())
        );

        let mut plugin = CachingSha2Password::default();
        plugin.initial_response(&ctx(b"spam", false)).unwrap();
        assert_eq!(
            plugin.continue_auth(&[0x04], &ctx(b"spam", false)).unwrap(),
            AuthReply::Send(vec![0x02])
        );
        assert!(plugin.continue_auth(b"not a key", &ctx(b"spam", false)).is_err());

        let mut plugin = CachingSha2Password::default();
        plugin.initial_response(&ctx(b"spam", false)).unwrap();
        assert!(plugin.continue_auth(&[0x07], &ctx(b"spam", false)).is_err());
    }

    #[test]
    fn test_rsa_encryption_with_generated_key() {
        use rsa::pkcs8::EncodePublicKey;
        use rsa::{Oaep, RsaPrivateKey};

        let private = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let pem = private
            .to_public_key()
            .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
            .unwrap();
        let encrypted = encrypt_password_rsa(b"spam", &SEED, pem.as_bytes()).unwrap();
        let decrypted = private.decrypt(Oaep::new::<Sha1>(), &encrypted).unwrap();
        let plain: Vec<u8> = decrypted
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ SEED[i % SEED.len()])
            .collect();
        assert_eq!(plain, b"spam\0");
    }

    #[test]
    fn test_select_plugin() {
        assert_eq!(select_plugin("mysql_native_password", None).unwrap().name(), "mysql_native_password");
        assert_eq!(select_plugin("caching_sha2_password", None).unwrap().name(), "caching_sha2_password");
        assert_eq!(
            select_plugin("authentication_ldap_sasl_client", None).unwrap().name(),
            "authentication_ldap_sasl_client"
        );
        let err = select_plugin("authentication_kerberos_client", None).unwrap_err();
        assert!(matches!(
            err,
            Error::Authentication(ref e) if e.kind == AuthErrorKind::UnsupportedPlugin
        ));
    }

    struct FixedToken;

    impl AuthPlugin for FixedToken {
        fn name(&self) -> &str {
            "authentication_kerberos_client"
        }

        fn initial_response(&mut self, _ctx: &AuthContext<'_>) -> Result<Vec<u8>> {
            Ok(b"token-1".to_vec())
        }

        fn continue_auth(&mut self, data: &[u8], _ctx: &AuthContext<'_>) -> Result<AuthReply> {
            Ok(if data == b"more" {
                AuthReply::Send(b"token-2".to_vec())
            } else {
                AuthReply::Wait
            })
        }
    }

    struct Kerberos;

    impl ExternalAuth for Kerberos {
        fn supports(&self, plugin: &str) -> bool {
            plugin == "authentication_kerberos_client" || plugin == "GSSAPI"
        }

        fn start(&self, _plugin: &str) -> Result<Box<dyn AuthPlugin>> {
            Ok(Box::new(FixedToken))
        }
    }

    #[test]
    fn test_external_strategy() {
        let ext: Arc<dyn ExternalAuth> = Arc::new(Kerberos);
        let mut method = select_plugin("authentication_kerberos_client", Some(&ext)).unwrap();
        assert_eq!(method.initial_response(&ctx(b"", false)).unwrap(), b"token-1");
        assert_eq!(
            method.continue_auth(b"more", &ctx(b"", false)).unwrap(),
            AuthReply::Send(b"token-2".to_vec())
        );

        let mut sasl = select_plugin("authentication_ldap_sasl_client", Some(&ext)).unwrap();
        let gssapi = AuthContext {
            seed: b"GSSAPI",
            ..ctx(b"", false)
        };
        assert_eq!(sasl.initial_response(&gssapi).unwrap(), b"token-1");

        let mut unknown = SaslPlugin::new(None);
        let other = AuthContext {
            seed: b"DIGEST-MD5",
            ..ctx(b"", false)
        };
        assert!(unknown.initial_response(&other).is_err());
    }
}
