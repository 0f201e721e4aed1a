// SPDX-License-Identifier: MIT
//
// SceyeFi: Eye-Fi Card Upload Server

//! Tokenizer for `token; key=value; key="quoted value"` header values
//!
//! Used for `Content-Type` (boundary, charset) and `Content-Disposition`
//! (part name). Parameter names are case-insensitive and stored lowercased.
//! Any malformed parameter list yields an empty map: checking for required
//! parameters is left to the caller.

use std::collections::HashMap;

/// A parsed header value: main token plus parameters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderValue {
    /// Leading token, e.g. `multipart/form-data` or `form-data`
    pub token: String,
    /// Parameters keyed by lowercased name
    pub params: HashMap<String, String>,
}

impl HeaderValue {
    /// Parse a header value. Never fails.
    pub fn parse(value: &str) -> Self {
        let (token, rest) = match value.find(';') {
            Some(idx) => (&value[..idx], Some(&value[idx + 1..])),
            None => (value, None),
        };
        let params = rest.and_then(parse_params).unwrap_or_default();
        Self {
            token: token.trim().to_string(),
            params,
        }
    }

    /// Look up a parameter by name, ignoring case
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Case-insensitive comparison of the main token
    pub fn is(&self, token: &str) -> bool {
        self.token.eq_ignore_ascii_case(token)
    }
}

/// Parse the parameter list following the main token. `None` if malformed.
fn parse_params(input: &str) -> Option<HashMap<String, String>> {
    let mut params = HashMap::new();
    let mut chars = input.chars().peekable();

    loop {
        while chars.peek().map_or(false, |c| c.is_whitespace()) {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        loop {
            match chars.next() {
                Some('=') => break,
                Some(';') | None => return None,
                Some(c) => key.push(c),
            }
        }
        let key = key.trim().to_ascii_lowercase();
        if key.is_empty() {
            return None;
        }

        while chars.peek().map_or(false, |c| c.is_whitespace()) {
            chars.next();
        }

        let value = if chars.peek() == Some(&'"') {
            chars.next();
            let mut value = String::new();
            loop {
                match chars.next() {
                    Some('"') => break,
                    Some('\\') => value.push(chars.next()?),
                    Some(c) => value.push(c),
                    None => return None,
                }
            }
            while chars.peek().map_or(false, |c| c.is_whitespace()) {
                chars.next();
            }
            match chars.next() {
                Some(';') | None => {}
                Some(_) => return None,
            }
            value
        } else {
            let mut value = String::new();
            for c in chars.by_ref() {
                if c == ';' {
                    break;
                }
                value.push(c);
            }
            let value = value.trim();
            if value.contains('"') {
                return None;
            }
            value.to_string()
        };

        params.insert(key, value);
    }

    Some(params)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type() {
        let v = HeaderValue::parse("multipart/form-data; boundary=---------------------------02468ace13579bdfcafebabef00d");
        assert!(v.is("Multipart/Form-Data"));
        assert_eq!(
            v.param("BOUNDARY"),
            Some("---------------------------02468ace13579bdfcafebabef00d")
        );
        assert_eq!(v.param("charset"), None);
    }

    #[test]
    fn test_quoted_and_escaped() {
        let v = HeaderValue::parse(r#"form-data; name="FILENAME"; filename="a \"b\" c.tar""#);
        assert_eq!(v.token, "form-data");
        assert_eq!(v.param("name"), Some("FILENAME"));
        assert_eq!(v.param("filename"), Some(r#"a "b" c.tar"#));
    }

    #[test]
    fn test_semicolon_inside_quotes() {
        let v = HeaderValue::parse(r#"form-data; name="a;b"; x=1"#);
        assert_eq!(v.param("name"), Some("a;b"));
        assert_eq!(v.param("x"), Some("1"));
    }

    #[test]
    fn test_token_only() {
        let v = HeaderValue::parse("  text/xml  ");
        assert_eq!(v.token, "text/xml");
        assert!(v.params.is_empty());
    }

    #[test]
    fn test_malformed_params_yield_empty_map() {
        assert!(HeaderValue::parse("form-data; name").params.is_empty());
        assert!(HeaderValue::parse(r#"form-data; name="unterminated"#).params.is_empty());
        assert!(HeaderValue::parse("form-data; =value").params.is_empty());
        assert!(HeaderValue::parse(r#"form-data; name="a"junk"#).params.is_empty());

        let v = HeaderValue::parse("form-data; name");
        assert_eq!(v.token, "form-data");
    }

    #[test]
    fn test_trailing_semicolon() {
        let v = HeaderValue::parse("text/plain; charset=ISO-8859-1;");
        assert_eq!(v.param("charset"), Some("ISO-8859-1"));
    }
}
