//! Predicates that decide which rule claims a connection.
//!
//! A matcher looks at the bytes sniffed so far and either claims the
//! connection, rejects it, or asks for more bytes. Matchers never consume
//! anything: the same prefix is replayed to whoever accepts the connection.

/// Decision of a [`Matcher`] over the bytes seen so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchResult {
    /// The connection belongs to this rule.
    Matched,
    /// The connection can never belong to this rule.
    NoMatch,
    /// More bytes are needed to decide.
    Incomplete,
}

/// A predicate over the leading bytes of a connection.
pub trait Matcher: Send + Sync + 'static {
    fn matches(&self, prefix: &[u8]) -> MatchResult;
}

impl<F> Matcher for F
where
    F: Fn(&[u8]) -> MatchResult + Send + Sync + 'static,
{
    fn matches(&self, prefix: &[u8]) -> MatchResult {
        self(prefix)
    }
}

/// Method tokens recognised by [`http1_fast`].
const HTTP_METHODS: &[&[u8]] = &[
    b"OPTIONS", b"GET", b"HEAD", b"POST", b"PUT", b"DELETE", b"TRACE", b"CONNECT", b"PATCH",
];

const HTTP2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// TLS record content type for handshake messages.
const TLS_HANDSHAKE: u8 = 0x16;
/// Handshake message type of a ClientHello.
const TLS_CLIENT_HELLO: u8 = 0x01;

/// Matches every connection, including one that sent nothing yet.
///
/// Register it last: it acts as the default rule.
#[derive(Debug, Clone, Copy, Default)]
pub struct Any;

impl Matcher for Any {
    fn matches(&self, _prefix: &[u8]) -> MatchResult {
        MatchResult::Matched
    }
}

pub fn any() -> Any {
    Any
}

/// Matches when the connection starts with a known HTTP method followed by
/// a space. Decides after at most eight bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Http1Fast;

impl Matcher for Http1Fast {
    fn matches(&self, prefix: &[u8]) -> MatchResult {
        let mut pending = false;
        for method in HTTP_METHODS {
            let n = method.len();
            if prefix.len() > n {
                if prefix.starts_with(method) && prefix[n] == b' ' {
                    return MatchResult::Matched;
                }
            } else if method.starts_with(prefix) {
                pending = true;
            }
        }

        if pending {
            MatchResult::Incomplete
        } else {
            MatchResult::NoMatch
        }
    }
}

pub fn http1_fast() -> Http1Fast {
    Http1Fast
}

/// Matches a structurally valid HTTP/1.x request line
/// (`METHOD SP request-target SP HTTP/1.x`). Slower than [`Http1Fast`] but
/// also accepts extension methods.
#[derive(Debug, Clone, Copy, Default)]
pub struct Http1;

impl Matcher for Http1 {
    fn matches(&self, prefix: &[u8]) -> MatchResult {
        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut req = httparse::Request::new(&mut headers);

        match req.parse(prefix) {
            Ok(httparse::Status::Complete(_)) => MatchResult::Matched,
            // The request line is parsed before any header, so a version
            // means it was valid even if the headers are still arriving.
            Ok(httparse::Status::Partial) if req.version.is_some() => MatchResult::Matched,
            Ok(httparse::Status::Partial) => MatchResult::Incomplete,
            Err(httparse::Error::TooManyHeaders) => MatchResult::Matched,
            Err(_) => MatchResult::NoMatch,
        }
    }
}

pub fn http1() -> Http1 {
    Http1
}

/// Matches connections that start with an exact byte sequence.
#[derive(Debug, Clone)]
pub struct Prefix(Vec<u8>);

impl Matcher for Prefix {
    fn matches(&self, prefix: &[u8]) -> MatchResult {
        let expected = self.0.as_slice();
        if prefix.len() >= expected.len() {
            if prefix.starts_with(expected) {
                MatchResult::Matched
            } else {
                MatchResult::NoMatch
            }
        } else if expected.starts_with(prefix) {
            MatchResult::Incomplete
        } else {
            MatchResult::NoMatch
        }
    }
}

pub fn prefix(bytes: impl Into<Vec<u8>>) -> Prefix {
    Prefix(bytes.into())
}

/// Matches the HTTP/2 client connection preface (prior knowledge, h2c).
pub fn http2() -> Prefix {
    prefix(HTTP2_PREFACE)
}

/// Matches a TLS handshake record carrying a ClientHello.
///
/// Checks the record header (`0x16`, version `0x03 0x00..=0x04`) and the
/// handshake type, so it decides after six bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tls;

impl Matcher for Tls {
    fn matches(&self, prefix: &[u8]) -> MatchResult {
        match prefix {
            [] => MatchResult::Incomplete,
            [content_type, ..] if *content_type != TLS_HANDSHAKE => MatchResult::NoMatch,
            [_, major, ..] if *major != 0x03 => MatchResult::NoMatch,
            [_, _, minor, ..] if *minor > 0x04 => MatchResult::NoMatch,
            [_, _, _, _, _, handshake, ..] if *handshake != TLS_CLIENT_HELLO => {
                MatchResult::NoMatch
            }
            [_, _, _, _, _, _, ..] => MatchResult::Matched,
            _ => MatchResult::Incomplete,
        }
    }
}

pub fn tls() -> Tls {
    Tls
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLIENT_HELLO_START: &[u8] = &[0x16, 0x03, 0x01, 0x02, 0x00, 0x01, 0x00, 0x01, 0xfc];

    #[test]
    fn test_any_matches_everything() {
        assert_eq!(any().matches(b""), MatchResult::Matched);
        assert_eq!(any().matches(CLIENT_HELLO_START), MatchResult::Matched);
    }

    #[test]
    fn test_http1_fast() {
        let m = http1_fast();
        assert_eq!(m.matches(b"GET / HTTP/1.1\r\n"), MatchResult::Matched);
        assert_eq!(m.matches(b"OPTIONS * HTTP/1.1\r\n"), MatchResult::Matched);
        assert_eq!(m.matches(b"POST "), MatchResult::Matched);
        assert_eq!(m.matches(b"PATCH /x"), MatchResult::Matched);

        // Still a possible method.
        assert_eq!(m.matches(b""), MatchResult::Incomplete);
        assert_eq!(m.matches(b"P"), MatchResult::Incomplete);
        assert_eq!(m.matches(b"DELE"), MatchResult::Incomplete);
        assert_eq!(m.matches(b"GET"), MatchResult::Incomplete);

        assert_eq!(m.matches(b"GETX / HTTP/1.1"), MatchResult::NoMatch);
        assert_eq!(m.matches(b"get / HTTP/1.1"), MatchResult::NoMatch);
        assert_eq!(m.matches(CLIENT_HELLO_START), MatchResult::NoMatch);
        assert_eq!(m.matches(HTTP2_PREFACE), MatchResult::NoMatch);
    }

    #[test]
    fn test_http1_request_line() {
        let m = http1();
        assert_eq!(m.matches(b"GET / HTTP/1.1\r\n"), MatchResult::Matched);
        assert_eq!(
            m.matches(b"GET /ping HTTP/1.1\r\nHost: foobar.com\r\n\r\n"),
            MatchResult::Matched
        );
        assert_eq!(m.matches(b"PROPFIND /dav HTTP/1.1\r\n"), MatchResult::Matched);

        assert_eq!(m.matches(b""), MatchResult::Incomplete);
        assert_eq!(m.matches(b"GET /pi"), MatchResult::Incomplete);

        assert_eq!(m.matches(HTTP2_PREFACE), MatchResult::NoMatch);
        assert_eq!(m.matches(CLIENT_HELLO_START), MatchResult::NoMatch);
    }

    #[test]
    fn test_http2_preface() {
        let m = http2();
        assert_eq!(m.matches(HTTP2_PREFACE), MatchResult::Matched);
        assert_eq!(m.matches(b"PRI * HT"), MatchResult::Incomplete);
        assert_eq!(m.matches(b"GET / HTTP/1.1\r\n"), MatchResult::NoMatch);
    }

    #[test]
    fn test_tls_client_hello() {
        let m = tls();
        assert_eq!(m.matches(CLIENT_HELLO_START), MatchResult::Matched);
        assert_eq!(m.matches(&CLIENT_HELLO_START[..3]), MatchResult::Incomplete);
        assert_eq!(m.matches(b""), MatchResult::Incomplete);

        assert_eq!(m.matches(b"GET / HTTP/1.1\r\n"), MatchResult::NoMatch);
        // Alert record, not a handshake.
        assert_eq!(m.matches(&[0x15, 0x03, 0x03, 0x00, 0x02, 0x02]), MatchResult::NoMatch);
        // Handshake record but a ServerHello.
        assert_eq!(m.matches(&[0x16, 0x03, 0x03, 0x00, 0x40, 0x02]), MatchResult::NoMatch);
        assert_eq!(m.matches(&[0x16, 0x03, 0x09]), MatchResult::NoMatch);
    }

    #[test]
    fn test_closure_matcher() {
        let m = |prefix: &[u8]| {
            if prefix.first() == Some(&b'X') {
                MatchResult::Matched
            } else {
                MatchResult::NoMatch
            }
        };
        assert_eq!(Matcher::matches(&m, b"XYZ"), MatchResult::Matched);
        assert_eq!(Matcher::matches(&m, b"ABC"), MatchResult::NoMatch);
    }
}
