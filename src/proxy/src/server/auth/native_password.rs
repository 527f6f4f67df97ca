use crate::protocol::mariadb::constants::AuthPluginName::AuthNativePassword;
use crate::protocol::mariadb::error_codes::ErrorKind;
use crate::server::auth::{
    sha1_1, sha1_2, xor, AuthResult, BackendAuthPlugin, BackendExchange, ClientAuthPlugin,
    ClientExchange, Credentials,
};

/// `mysql_native_password`, client side: the proxy plays the server role.
/// The client's token is `SHA1(password) XOR SHA1(salt + SHA1(SHA1(password)))`;
/// the proxy verifies it against the stored double-SHA1.
#[derive(Debug, Default)]
pub struct NativePasswordClient {
    token: Vec<u8>,
}

impl ClientAuthPlugin for NativePasswordClient {
    fn name(&self) -> &'static str {
        AuthNativePassword.as_ref()
    }

    fn exchange(&mut self, packet: &[u8]) -> ClientExchange {
        // single-round plugin: the first packet is the scramble response
        self.token = packet.to_vec();
        ClientExchange::Done
    }

    fn authenticate(&self, salt: &[u8], credentials: &Credentials) -> AuthResult {
        let denied = || AuthResult::Fail {
            code: ErrorKind::ER_ACCESS_DENIED_ERROR as u16,
            sqlstate: ErrorKind::ER_ACCESS_DENIED_ERROR.sqlstate(),
            message: format!("Access denied for user '{}'", credentials.user),
        };
        if credentials.password.is_empty() {
            return if self.token.is_empty() {
                AuthResult::Ok
            } else {
                denied()
            };
        }
        if self.token.len() != 20 {
            return denied();
        }
        let stage1 = sha1_1(credentials.password.as_bytes());
        let stored = sha1_1(stage1);
        let expected = xor(stage1, sha1_2(salt, stored));
        if expected[..] == self.token[..] {
            AuthResult::Ok
        } else {
            denied()
        }
    }
}

/// `mysql_native_password`, backend side: the proxy plays the client role
/// and answers the server scramble (including AuthSwitchRequest rounds).
#[derive(Debug)]
pub struct NativePasswordBackend {
    password: String,
}

impl NativePasswordBackend {
    pub fn new(password: String) -> Self {
        Self { password }
    }

    pub fn scramble_token(&self, salt: &[u8]) -> Vec<u8> {
        if self.password.is_empty() {
            return Vec::new();
        }
        let salt = &salt[..salt.len().min(20)];
        let stage1 = sha1_1(self.password.as_bytes());
        let stored = sha1_1(stage1);
        xor(stage1, sha1_2(salt, stored)).to_vec()
    }
}

impl BackendAuthPlugin for NativePasswordBackend {
    fn name(&self) -> &'static str {
        AuthNativePassword.as_ref()
    }

    fn exchange(&mut self, packet: &[u8]) -> BackendExchange {
        // AuthSwitchRequest carries "\xfe<plugin>\0<salt>"; a bare scramble
        // arrives as the raw salt bytes
        let salt = if packet.first() == Some(&0xfe) {
            match packet[1..].iter().position(|b| *b == 0) {
                Some(nul) => &packet[1 + nul + 1..],
                None => return BackendExchange::Fail,
            }
        } else {
            packet
        };
        let salt = salt.strip_suffix(&[0]).unwrap_or(salt);
        BackendExchange::Send(self.scramble_token(salt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::auth::default_salt;

    fn creds(password: &str) -> Credentials {
        Credentials {
            user: "app".to_string(),
            password: password.to_string(),
        }
    }

    #[test]
    fn backend_token_verifies_against_client_check() {
        // the backend-side token generator and the client-side verifier
        // implement the same math, so they must agree
        let salt = default_salt();
        let backend = NativePasswordBackend::new("secret".to_string());
        let token = backend.scramble_token(&salt);

        let mut client = NativePasswordClient::default();
        assert_eq!(client.exchange(&token), ClientExchange::Done);
        assert_eq!(client.authenticate(&salt, &creds("secret")), AuthResult::Ok);
        assert!(matches!(
            client.authenticate(&salt, &creds("wrong")),
            AuthResult::Fail { code: 1045, .. }
        ));
    }

    #[test]
    fn empty_password_requires_empty_token() {
        let salt = default_salt();
        let mut client = NativePasswordClient::default();
        client.exchange(&[]);
        assert_eq!(client.authenticate(&salt, &creds("")), AuthResult::Ok);

        let mut client = NativePasswordClient::default();
        client.exchange(&[1, 2, 3]);
        assert!(matches!(
            client.authenticate(&salt, &creds("")),
            AuthResult::Fail { .. }
        ));
    }

    #[test]
    fn auth_switch_request_is_answered() {
        let salt = default_salt();
        let mut pkt = vec![0xfe];
        pkt.extend(b"mysql_native_password\0");
        pkt.extend(salt);
        pkt.push(0);
        let mut backend = NativePasswordBackend::new("secret".to_string());
        match backend.exchange(&pkt) {
            BackendExchange::Send(token) => {
                assert_eq!(token, backend.scramble_token(&salt));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
