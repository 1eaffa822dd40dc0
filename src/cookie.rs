use bytes::{BufMut, Bytes, BytesMut};
use tracing::warn;

/// An HTTP cookie as used in `Set-Cookie` response headers.
///
/// All textual fields are opaque byte strings. `max_age` is in seconds,
/// 0 meaning a session cookie. `version` defaults to 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    name: Bytes,
    value: Bytes,
    comment: Bytes,
    domain: Bytes,
    path: Bytes,
    same_site: Bytes,
    max_age: i64,
    secure: bool,
    http_only: bool,
    version: i32,
}

impl Cookie {
    pub fn new(name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            comment: Bytes::new(),
            domain: Bytes::new(),
            path: Bytes::new(),
            same_site: Bytes::new(),
            max_age: 0,
            secure: false,
            http_only: false,
            version: 1,
        }
    }

    /// Decode one cookie from a header line. Never fails: unknown attributes
    /// after the (name, value) pair are discarded with a warning.
    pub fn parse(source: &[u8]) -> Self {
        let mut cookie = Self::new(Bytes::new(), Bytes::new());
        for part in split_csv(source) {
            let (name, value) = split_pair(&part);
            match name {
                b"Comment" => cookie.comment = Bytes::copy_from_slice(value),
                b"Domain" => cookie.domain = Bytes::copy_from_slice(value),
                b"Max-Age" => cookie.max_age = parse_int(value),
                b"Path" => cookie.path = Bytes::copy_from_slice(value),
                b"Secure" => cookie.secure = true,
                b"HttpOnly" => cookie.http_only = true,
                b"SameSite" => cookie.same_site = Bytes::copy_from_slice(value),
                b"Version" => cookie.version = parse_int(value) as i32,
                _ => {
                    if cookie.name.is_empty() {
                        cookie.name = Bytes::copy_from_slice(name);
                        cookie.value = Bytes::copy_from_slice(value);
                    } else {
                        warn!(
                            name = %String::from_utf8_lossy(name),
                            "ignoring unknown cookie attribute"
                        );
                    }
                }
            }
        }
        cookie
    }

    /// Encode for a `Set-Cookie` header: `name=value`, the non-empty and
    /// non-default attributes, and always a terminating `; Version=N`.
    pub fn encode(&self) -> Bytes {
        let mut buffer = BytesMut::with_capacity(self.name.len() + self.value.len() + 32);
        buffer.put_slice(&self.name);
        buffer.put_u8(b'=');
        buffer.put_slice(&self.value);
        if !self.comment.is_empty() {
            buffer.put_slice(b"; Comment=");
            buffer.put_slice(&self.comment);
        }
        if !self.domain.is_empty() {
            buffer.put_slice(b"; Domain=");
            buffer.put_slice(&self.domain);
        }
        if self.max_age != 0 {
            buffer.put_slice(b"; Max-Age=");
            buffer.put_slice(self.max_age.to_string().as_bytes());
        }
        if !self.path.is_empty() {
            buffer.put_slice(b"; Path=");
            buffer.put_slice(&self.path);
        }
        if self.secure {
            buffer.put_slice(b"; Secure");
        }
        if self.http_only {
            buffer.put_slice(b"; HttpOnly");
        }
        if !self.same_site.is_empty() {
            buffer.put_slice(b"; SameSite=");
            buffer.put_slice(&self.same_site);
        }
        buffer.put_slice(b"; Version=");
        buffer.put_slice(self.version.to_string().as_bytes());
        buffer.freeze()
    }

    pub fn name(&self) -> &Bytes {
        &self.name
    }

    pub fn value(&self) -> &Bytes {
        &self.value
    }

    pub fn comment(&self) -> &Bytes {
        &self.comment
    }

    pub fn domain(&self) -> &Bytes {
        &self.domain
    }

    pub fn path(&self) -> &Bytes {
        &self.path
    }

    pub fn same_site(&self) -> &Bytes {
        &self.same_site
    }

    pub fn max_age(&self) -> i64 {
        self.max_age
    }

    pub fn secure(&self) -> bool {
        self.secure
    }

    pub fn http_only(&self) -> bool {
        self.http_only
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn set_name(&mut self, name: impl Into<Bytes>) {
        self.name = name.into();
    }

    pub fn set_value(&mut self, value: impl Into<Bytes>) {
        self.value = value.into();
    }

    pub fn set_comment(&mut self, comment: impl Into<Bytes>) {
        self.comment = comment.into();
    }

    pub fn set_domain(&mut self, domain: impl Into<Bytes>) {
        self.domain = domain.into();
    }

    pub fn set_path(&mut self, path: impl Into<Bytes>) {
        self.path = path.into();
    }

    pub fn set_same_site(&mut self, same_site: impl Into<Bytes>) {
        self.same_site = same_site.into();
    }

    pub fn set_max_age(&mut self, max_age: i64) {
        self.max_age = max_age;
    }

    pub fn set_secure(&mut self, secure: bool) {
        self.secure = secure;
    }

    pub fn set_http_only(&mut self, http_only: bool) {
        self.http_only = http_only;
    }
}

/// Split a cookie header line on `;`, treating `;` inside double-quoted
/// regions as literal. Quotes are removed, pieces are trimmed, empty pieces
/// are dropped.
pub(crate) fn split_csv(source: &[u8]) -> Vec<Vec<u8>> {
    let mut list = Vec::new();
    let mut buffer = Vec::new();
    let mut in_string = false;
    for &c in source {
        if in_string {
            if c == b'"' {
                in_string = false;
            } else {
                buffer.push(c);
            }
        } else if c == b'"' {
            in_string = true;
        } else if c == b';' {
            let trimmed = buffer.trim_ascii();
            if !trimmed.is_empty() {
                list.push(trimmed.to_vec());
            }
            buffer.clear();
        } else {
            buffer.push(c);
        }
    }
    let trimmed = buffer.trim_ascii();
    if !trimmed.is_empty() {
        list.push(trimmed.to_vec());
    }
    list
}

/// Split `name=value` at the first `=`; a part without `=` yields an empty
/// value. Both sides are trimmed.
pub(crate) fn split_pair(part: &[u8]) -> (&[u8], &[u8]) {
    match part.iter().position(|&c| c == b'=') {
        Some(posi) => (part[..posi].trim_ascii(), part[posi + 1..].trim_ascii()),
        None => (part.trim_ascii(), &b""[..]),
    }
}

fn parse_int(value: &[u8]) -> i64 {
    std::str::from_utf8(value)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_minimal() {
        let cookie = Cookie::new(&b"sessionid"[..], &b"abc"[..]);
        assert_eq!(&cookie.encode()[..], b"sessionid=abc; Version=1");
    }

    #[test]
    fn encode_all_attributes() {
        let mut cookie = Cookie::new(&b"name"[..], &b"value"[..]);
        cookie.set_comment(&b"a comment"[..]);
        cookie.set_domain(&b"example.com"[..]);
        cookie.set_max_age(3600);
        cookie.set_path(&b"/app"[..]);
        cookie.set_secure(true);
        cookie.set_http_only(true);
        cookie.set_same_site(&b"Lax"[..]);
        assert_eq!(
            &cookie.encode()[..],
            &b"name=value; Comment=a comment; Domain=example.com; Max-Age=3600; \
               Path=/app; Secure; HttpOnly; SameSite=Lax; Version=1"[..]
        );
    }

    #[test]
    fn parse_round_trips() {
        let mut cookie = Cookie::new(&b"name"[..], &b"value"[..]);
        cookie.set_domain(&b"example.com"[..]);
        cookie.set_max_age(120);
        cookie.set_path(&b"/"[..]);
        cookie.set_same_site(&b"Lax"[..]);
        let parsed = Cookie::parse(&cookie.encode());
        assert_eq!(parsed, cookie);
    }

    #[test]
    fn parse_valueless_flags() {
        let cookie = Cookie::parse(b"id=1; Secure; HttpOnly");
        assert_eq!(&cookie.name()[..], b"id");
        assert_eq!(&cookie.value()[..], b"1");
        assert!(cookie.secure());
        assert!(cookie.http_only());
    }

    #[test]
    fn parse_discards_unknown_attributes() {
        let cookie = Cookie::parse(b"id=1; Bogus=2; AlsoBogus");
        assert_eq!(&cookie.name()[..], b"id");
        assert_eq!(&cookie.value()[..], b"1");
    }

    #[test]
    fn split_csv_respects_quotes() {
        let parts = split_csv(b"a=\"x;y\"; b=2 ;; c");
        assert_eq!(parts, vec![b"a=x;y".to_vec(), b"b=2".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn split_pair_without_equals() {
        assert_eq!(split_pair(b" Secure "), (&b"Secure"[..], &b""[..]));
        assert_eq!(split_pair(b"a = b "), (&b"a"[..], &b"b"[..]));
    }
}
