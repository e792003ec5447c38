//! SCRAM for `authentication_ldap_sasl_client`.
//!
//! The server opens the exchange with the mechanism name as auth-switch data.
//! Messages then travel as AuthMoreData:
//!
//! 1. client-first: `n,a=<user>,n=<user>,r=<client nonce>`
//! 2. server-first: `r=<nonce>,s=<base64 salt>,i=<iterations>`
//! 3. client-final: `c=<base64 gs2 header>,r=<nonce>,p=<base64 proof>`
//! 4. server-final: `v=<base64 server signature>`, then OK

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use rand::Rng;
use rand::distributions::Alphanumeric;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use super::{AuthContext, AuthPlugin, AuthReply};
use mysqlwire_core::{AuthErrorKind, Error, Result};

const NONCE_LEN: usize = 32;

/// Hash function of the SCRAM variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScramDigest {
    Sha1,
    Sha256,
}

impl ScramDigest {
    /// Map a SASL mechanism name to a SCRAM variant.
    pub fn from_mechanism(mechanism: &str) -> Option<Self> {
        match mechanism {
            "SCRAM-SHA-1" => Some(ScramDigest::Sha1),
            "SCRAM-SHA-256" => Some(ScramDigest::Sha256),
            _ => None,
        }
    }

    pub const fn mechanism(self) -> &'static str {
        match self {
            ScramDigest::Sha1 => "SCRAM-SHA-1",
            ScramDigest::Sha256 => "SCRAM-SHA-256",
        }
    }

    fn hash(self, data: &[u8]) -> Vec<u8> {
        match self {
            ScramDigest::Sha1 => Sha1::digest(data).to_vec(),
            ScramDigest::Sha256 => Sha256::digest(data).to_vec(),
        }
    }

    fn hmac(self, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        fn run<M: Mac + hmac::digest::KeyInit>(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
            let mut mac = <M as Mac>::new_from_slice(key)
                .map_err(|e| Error::protocol(format!("HMAC init failed: {e}")))?;
            mac.update(data);
            Ok(mac.finalize().into_bytes().to_vec())
        }
        match self {
            ScramDigest::Sha1 => run::<Hmac<Sha1>>(key, data),
            ScramDigest::Sha256 => run::<Hmac<Sha256>>(key, data),
        }
    }

    fn salted_password(self, password: &[u8], salt: &[u8], iterations: u32) -> Result<Vec<u8>> {
        let result = match self {
            ScramDigest::Sha1 => {
                let mut out = [0u8; 20];
                pbkdf2::pbkdf2::<Hmac<Sha1>>(password, salt, iterations, &mut out)
                    .map(|()| out.to_vec())
            }
            ScramDigest::Sha256 => {
                let mut out = [0u8; 32];
                pbkdf2::pbkdf2::<Hmac<Sha256>>(password, salt, iterations, &mut out)
                    .map(|()| out.to_vec())
            }
        };
        result.map_err(|e| Error::protocol(format!("PBKDF2 failed: {e}")))
    }
}

#[derive(Debug)]
enum ScramState {
    Initial,
    SentFirst,
    SentFinal { server_signature: Vec<u8> },
    Verified,
}

/// Client side of a SCRAM exchange.
#[derive(Debug)]
pub struct ScramClient {
    digest: ScramDigest,
    client_nonce: String,
    user: String,
    state: ScramState,
}

impl ScramClient {
    pub fn new(digest: ScramDigest) -> Self {
        let nonce: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(NONCE_LEN)
            .map(char::from)
            .collect();
        Self::with_nonce(digest, nonce)
    }

    /// Use a fixed client nonce instead of a random one.
    pub fn with_nonce(digest: ScramDigest, nonce: impl Into<String>) -> Self {
        Self {
            digest,
            client_nonce: nonce.into(),
            user: String::new(),
            state: ScramState::Initial,
        }
    }

    fn gs2_header(&self) -> String {
        format!("n,a={},", self.user)
    }

    fn client_first(&self) -> String {
        format!("{}n={},r={}", self.gs2_header(), self.user, self.client_nonce)
    }

    fn client_final(&mut self, server_first: &[u8], password: &[u8]) -> Result<Vec<u8>> {
        let server_first = std::str::from_utf8(server_first)
            .map_err(|_| rejected("server-first message is not valid UTF-8"))?;

        let parts: Vec<&str> = server_first.split(',').collect();
        let (server_nonce, salt, iterations) = match parts.as_slice() {
            [r, s, i] => match (r.strip_prefix("r="), s.strip_prefix("s="), i.strip_prefix("i=")) {
                (Some(r), Some(s), Some(i)) => (r, s, i),
                _ => return Err(rejected("incomplete server-first message")),
            },
            _ => return Err(rejected("incomplete server-first message")),
        };
        if !server_nonce.contains(&self.client_nonce) {
            return Err(rejected("unable to authenticate, the server nonce does not match"));
        }
        let salt = BASE64
            .decode(salt)
            .map_err(|e| rejected(format!("invalid salt: {e}")))?;
        let iterations: u32 = iterations
            .parse()
            .map_err(|_| rejected(format!("invalid iteration count '{iterations}'")))?;

        let digest = self.digest;
        let salted = digest.salted_password(password, &salt, iterations)?;
        let client_key = digest.hmac(&salted, b"Client Key")?;
        let stored_key = digest.hash(&client_key);

        let channel_binding = BASE64.encode(self.gs2_header());
        let auth_message = format!(
            "n={},r={},{},c={},r={}",
            self.user, self.client_nonce, server_first, channel_binding, server_nonce
        );
        let client_signature = digest.hmac(&stored_key, auth_message.as_bytes())?;
        let proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(a, b)| a ^ b)
            .collect();

        let server_key = digest.hmac(&salted, b"Server Key")?;
        let server_signature = digest.hmac(&server_key, auth_message.as_bytes())?;
        self.state = ScramState::SentFinal { server_signature };

        Ok(format!(
            "c={},r={},p={}",
            channel_binding,
            server_nonce,
            BASE64.encode(proof)
        )
        .into_bytes())
    }
}

fn rejected(message: impl Into<String>) -> Error {
    Error::authentication(AuthErrorKind::Rejected, message)
}

impl AuthPlugin for ScramClient {
    fn name(&self) -> &str {
        self.digest.mechanism()
    }

    fn initial_response(&mut self, ctx: &AuthContext<'_>) -> Result<Vec<u8>> {
        self.user = ctx.user.to_string();
        self.state = ScramState::SentFirst;
        Ok(self.client_first().into_bytes())
    }

    fn continue_auth(&mut self, data: &[u8], ctx: &AuthContext<'_>) -> Result<AuthReply> {
        match std::mem::replace(&mut self.state, ScramState::Verified) {
            ScramState::SentFirst => self.client_final(data, ctx.password).map(AuthReply::Send),
            ScramState::SentFinal { server_signature } => {
                let verifier = std::str::from_utf8(data)
                    .ok()
                    .and_then(|s| s.strip_prefix("v="))
                    .and_then(|v| BASE64.decode(v.trim_end_matches('\0')).ok());
                if verifier.as_deref() == Some(server_signature.as_slice()) {
                    Ok(AuthReply::Wait)
                } else {
                    Err(rejected("unable to verify the server signature"))
                }
            }
            ScramState::Initial | ScramState::Verified => {
                Err(Error::protocol("unexpected SCRAM message"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(password: &[u8]) -> AuthContext<'_> {
        AuthContext {
            user: "user",
            password,
            seed: b"SCRAM-SHA-1",
            secure: false,
            server_public_key: None,
        }
    }

    /// Server half of the exchange, computed from the stored credentials.
    fn server_signature(
        digest: ScramDigest,
        password: &[u8],
        salt: &[u8],
        iterations: u32,
        auth_message: &str,
    ) -> (Vec<u8>, Vec<u8>) {
        let salted = digest.salted_password(password, salt, iterations).unwrap();
        let client_key = digest.hmac(&salted, b"Client Key").unwrap();
        let stored_key = digest.hash(&client_key);
        let server_key = digest.hmac(&salted, b"Server Key").unwrap();
        (
            stored_key,
            digest.hmac(&server_key, auth_message.as_bytes()).unwrap(),
        )
    }

    #[test]
    fn test_mechanism_names() {
        assert_eq!(ScramDigest::from_mechanism("SCRAM-SHA-1"), Some(ScramDigest::Sha1));
        assert_eq!(ScramDigest::from_mechanism("SCRAM-SHA-256"), Some(ScramDigest::Sha256));
        assert_eq!(ScramDigest::from_mechanism("GSSAPI"), None);
    }

    #[test]
    fn test_client_first_message() {
        let mut client = ScramClient::with_nonce(ScramDigest::Sha1, "fyko+d2lbbFgONRv9qkxdawL");
        let first = client.initial_response(&ctx(b"pencil")).unwrap();
        assert_eq!(first, b"n,a=user,n=user,r=fyko+d2lbbFgONRv9qkxdawL");
    }

    #[test]
    fn test_random_nonce() {
        let a = ScramClient::new(ScramDigest::Sha256);
        let b = ScramClient::new(ScramDigest::Sha256);
        assert_eq!(a.client_nonce.len(), NONCE_LEN);
        assert_ne!(a.client_nonce, b.client_nonce);
    }

    #[test]
    fn test_full_exchange() {
        for digest in [ScramDigest::Sha1, ScramDigest::Sha256] {
            let mut client = ScramClient::with_nonce(digest, "clientnonce");
            client.initial_response(&ctx(b"pencil")).unwrap();

            let salt = b"saltsalt";
            let server_first = format!("r=clientnonceSERVER,s={},i=4096", BASE64.encode(salt));
            let AuthReply::Send(final_msg) =
                client.continue_auth(server_first.as_bytes(), &ctx(b"pencil")).unwrap()
            else {
                panic!("expected client-final message");
            };
            let final_msg = String::from_utf8(final_msg).unwrap();
            let binding = BASE64.encode("n,a=user,");
            let prefix = format!("c={binding},r=clientnonceSERVER,p=");
            assert!(final_msg.starts_with(&prefix), "{final_msg}");

            let auth_message =
                format!("n=user,r=clientnonce,{server_first},c={binding},r=clientnonceSERVER");
            let (stored_key, signature) =
                server_signature(digest, b"pencil", salt, 4096, &auth_message);

            // server-side proof check: H(proof XOR HMAC(stored, msg)) == stored
            let proof = BASE64.decode(&final_msg[prefix.len()..]).unwrap();
            let client_signature = digest.hmac(&stored_key, auth_message.as_bytes()).unwrap();
            let client_key: Vec<u8> = proof
                .iter()
                .zip(client_signature.iter())
                .map(|(a, b)| a ^ b)
                .collect();
            assert_eq!(digest.hash(&client_key), stored_key);

            let verifier = format!("v={}", BASE64.encode(signature));
            assert_eq!(
                client.continue_auth(verifier.as_bytes(), &ctx(b"pencil")).unwrap(),
                AuthReply::Wait
            );
        }
    }

    #[test]
    fn test_bad_server_signature() {
        let mut client = ScramClient::with_nonce(ScramDigest::Sha1, "abc");
        client.initial_response(&ctx(b"pencil")).unwrap();
        let server_first = format!("r=abcdef,s={},i=16", BASE64.encode(b"salt"));
        client.continue_auth(server_first.as_bytes(), &ctx(b"pencil")).unwrap();
        let err = client.continue_auth(b"v=AAAA", &ctx(b"pencil")).unwrap_err();
        assert!(matches!(
            err,
            Error::Authentication(ref e) if e.kind == AuthErrorKind::Rejected
        ));
    }

    #[test]
    fn test_malformed_server_first() {
        for msg in [
            "r=abcdef,s=c2FsdA==".to_string(),
            "x=abcdef,s=c2FsdA==,i=16".to_string(),
            "r=zzz,s=c2FsdA==,i=16".to_string(),
            "r=abcdef,s=***,i=16".to_string(),
            "r=abcdef,s=c2FsdA==,i=many".to_string(),
        ] {
            let mut client = ScramClient::with_nonce(ScramDigest::Sha1, "abc");
            client.initial_response(&ctx(b"pencil")).unwrap();
            assert!(client.continue_auth(msg.as_bytes(), &ctx(b"pencil")).is_err(), "{msg}");
        }
    }
}
