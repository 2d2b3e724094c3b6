//! forelay/src/auth.rs
//! Credentials for the upstream proxy: Basic from stored credentials,
//! Negotiate (Kerberos) from the OS ticket cache.

use crate::error::{ProxyError, Result};
use crate::protocol::ResponseHead;
use crate::types::Credentials;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::warn;

/// One `Proxy-Authenticate` challenge: scheme plus whatever followed it
/// (a continuation token for Negotiate, parameters for Basic).
#[derive(Debug, Clone)]
pub struct Challenge {
    pub scheme: String,
    pub detail: Option<String>,
}

/// Extracts all Proxy-Authenticate challenges from a 407 response.
pub fn parse_challenges(resp: &ResponseHead) -> Vec<Challenge> {
    resp.headers
        .iter()
        .filter(|h| h.name.eq_ignore_ascii_case("proxy-authenticate"))
        .map(|h| {
            let v = h.value.trim();
            match v.split_once(char::is_whitespace) {
                Some((scheme, rest)) => Challenge {
                    scheme: scheme.to_string(),
                    detail: Some(rest.trim().to_string()).filter(|s| !s.is_empty()),
                },
                None => Challenge {
                    scheme: v.to_string(),
                    detail: None,
                },
            }
        })
        .collect()
}

/// Per-session credential provider. Holds nothing but the configured
/// credentials; Negotiate contexts are created per exchange and die with
/// the session's requests.
pub struct Authenticator {
    creds: Credentials,
}

impl Authenticator {
    pub fn new(creds: Credentials) -> Self {
        Authenticator { creds }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.creds
    }

    fn basic_value(&self) -> Option<String> {
        self.creds
            .basic_pair()
            .map(|(user, pass)| format!("Basic {}", BASE64.encode(format!("{user}:{pass}"))))
    }

    /// Header value to send before any challenge was seen. Basic costs a
    /// round trip to withhold, Negotiate must wait for the challenge.
    pub fn preemptive(&self) -> Option<String> {
        if self.creds.use_kerberos {
            return None;
        }
        self.basic_value()
    }

    /// Starts a challenge-response exchange for a 407, picking the
    /// strongest mutually supported scheme. `None` means we have nothing
    /// to offer and the 407 is final.
    pub fn begin(&self, challenges: &[Challenge], proxy_host: &str) -> Option<AuthExchange> {
        let offered =
            |scheme: &str| challenges.iter().any(|c| c.scheme.eq_ignore_ascii_case(scheme));

        if self.creds.use_kerberos && offered("Negotiate") {
            #[cfg(all(unix, feature = "gssapi"))]
            match negotiate::NegotiateExchange::new(proxy_host) {
                Ok(n) => return Some(AuthExchange::Negotiate(n)),
                Err(e) => warn!("cannot initialize Negotiate context: {e}"),
            }
            #[cfg(not(all(unix, feature = "gssapi")))]
            {
                let _ = proxy_host;
                warn!("upstream offers Negotiate but this build has no gssapi support");
            }
        }
        if offered("Basic") {
            if let Some(value) = self.basic_value() {
                return Some(AuthExchange::Basic { value, sent: false });
            }
        }
        None
    }
}

/// An in-flight challenge-response exchange. Multi-leg schemes keep their
/// state here; the caller re-sends the request on the same upstream
/// connection with each produced header value.
pub enum AuthExchange {
    Basic {
        value: String,
        sent: bool,
    },
    #[cfg(all(unix, feature = "gssapi"))]
    Negotiate(negotiate::NegotiateExchange),
}

impl AuthExchange {
    /// Scheme name as it appears in the Proxy-Authenticate challenge.
    pub fn scheme(&self) -> &'static str {
        match self {
            AuthExchange::Basic { .. } => "Basic",
            #[cfg(all(unix, feature = "gssapi"))]
            AuthExchange::Negotiate(_) => "Negotiate",
        }
    }

    /// Produces the next `Proxy-Authorization` value, given the server's
    /// continuation token from the latest 407. `None` means the exchange
    /// is exhausted and the 407 stands.
    pub fn respond(&mut self, challenge_token: Option<&str>) -> Result<Option<String>> {
        match self {
            AuthExchange::Basic { value, sent } => {
                // Basic is single-leg: a second 407 means the credentials
                // are simply wrong.
                if *sent {
                    return Ok(None);
                }
                *sent = true;
                let _ = challenge_token;
                Ok(Some(value.clone()))
            }
            #[cfg(all(unix, feature = "gssapi"))]
            AuthExchange::Negotiate(n) => {
                let input = match challenge_token {
                    Some(t) => Some(BASE64.decode(t.trim().as_bytes()).map_err(|e| {
                        ProxyError::Internal(format!("bad Negotiate challenge token: {e}"))
                    })?),
                    None => None,
                };
                match n.step(input.as_deref())? {
                    Some(token) => Ok(Some(format!("Negotiate {}", BASE64.encode(token)))),
                    None => Ok(None),
                }
            }
        }
    }
}

#[cfg(all(unix, feature = "gssapi"))]
pub mod negotiate {
    //! Kerberos context against `HTTP@<proxy-host>`, fed from the OS
    //! ticket cache. No password is ever prompted for.

    use crate::error::{ProxyError, Result};
    use libgssapi::context::{ClientCtx, CtxFlags};
    use libgssapi::name::Name;
    use libgssapi::oid::{GSS_MECH_KRB5, GSS_NT_HOSTBASED_SERVICE};

    pub struct NegotiateExchange {
        ctx: ClientCtx,
        done: bool,
    }

    impl NegotiateExchange {
        pub fn new(proxy_host: &str) -> Result<Self> {
            let service = format!("HTTP@{proxy_host}");
            let name = Name::new(service.as_bytes(), Some(&GSS_NT_HOSTBASED_SERVICE))
                .map_err(|e| ProxyError::Internal(format!("gssapi name {service}: {e}")))?;
            let ctx = ClientCtx::new(
                None,
                name,
                CtxFlags::GSS_C_MUTUAL_FLAG,
                Some(&GSS_MECH_KRB5),
            );
            Ok(NegotiateExchange { ctx, done: false })
        }

        pub fn step(&mut self, server_token: Option<&[u8]>) -> Result<Option<Vec<u8>>> {
            if self.done {
                return Ok(None);
            }
            match self.ctx.step(server_token, None) {
                Ok(Some(token)) => Ok(Some(token.to_vec())),
                Ok(None) => {
                    self.done = true;
                    Ok(None)
                }
                Err(e) => Err(ProxyError::Internal(format!("gssapi step: {e}"))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::parse_response_head;

    fn creds(user: &str, pass: &str) -> Credentials {
        Credentials {
            username: Some(user.into()),
            password: Some(pass.into()),
            use_kerberos: false,
        }
    }

    #[test]
    fn basic_value_is_rfc7617_encoded() {
        let auth = Authenticator::new(creds("Aladdin", "open sesame"));
        assert_eq!(
            auth.preemptive().as_deref(),
            Some("Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ==")
        );
    }

    #[test]
    fn kerberos_flag_suppresses_preemptive_basic() {
        let mut c = creds("bob", "pw");
        c.use_kerberos = true;
        assert!(Authenticator::new(c).preemptive().is_none());
    }

    #[test]
    fn challenge_parsing_splits_scheme_and_detail() {
        let resp = parse_response_head(
            b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Negotiate\r\nProxy-Authenticate: Basic realm=\"corp\"\r\n\r\n",
        )
        .unwrap();
        let challenges = parse_challenges(&resp);
        assert_eq!(challenges.len(), 2);
        assert_eq!(challenges[0].scheme, "Negotiate");
        assert_eq!(challenges[0].detail, None);
        assert_eq!(challenges[1].scheme, "Basic");
        assert_eq!(challenges[1].detail.as_deref(), Some("realm=\"corp\""));
    }

    #[test]
    fn basic_exchange_is_single_leg() {
        let auth = Authenticator::new(creds("bob", "pw"));
        let challenges = vec![Challenge {
            scheme: "Basic".into(),
            detail: None,
        }];
        let mut ex = auth.begin(&challenges, "gw.corp").unwrap();
        let first = ex.respond(None).unwrap();
        assert!(first.unwrap().starts_with("Basic "));
        // The upstream challenged again: give up rather than loop.
        assert!(ex.respond(None).unwrap().is_none());
    }

    #[test]
    fn no_usable_scheme_means_no_exchange() {
        let auth = Authenticator::new(Credentials::default());
        let challenges = vec![Challenge {
            scheme: "Basic".into(),
            detail: None,
        }];
        assert!(auth.begin(&challenges, "gw").is_none());

        let auth = Authenticator::new(creds("bob", "pw"));
        let challenges = vec![Challenge {
            scheme: "Bearer".into(),
            detail: None,
        }];
        assert!(auth.begin(&challenges, "gw").is_none());
    }
}
