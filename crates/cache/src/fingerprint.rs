use rangedb_engine::Value;
use std::fmt;

/// Identity of a logical query: BLAKE3 of its canonical SQL text and its
/// bound parameters.
///
/// Canonicalisation collapses runs of whitespace outside of quoted strings and
/// identifiers and drops a trailing semicolon, so that formatting differences
/// don't split the cache. Case is preserved; `SELECT` and `select` are
/// different queries as far as the cache is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(blake3::Hash);

impl Fingerprint {
    pub fn of(sql: &str, params: &[Value]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(canonicalize(sql).as_bytes());
        for param in params {
            // Type tags keep `1` (integer) and `'1'` (text) apart.
            hasher.update(&[0]);
            match param {
                Value::Null => hasher.update(b"n"),
                Value::Integer(value) => hasher.update(b"i").update(&value.to_le_bytes()),
                Value::Real(value) => hasher.update(b"r").update(&value.to_bits().to_le_bytes()),
                Value::Text(value) => {
                    hasher.update(b"t").update(&(value.len() as u64).to_le_bytes()).update(value.as_bytes())
                },
                Value::Blob(value) => hasher.update(b"b").update(&(value.len() as u64).to_le_bytes()).update(value),
            };
        }
        Self(hasher.finalize())
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        blake3::Hash::from_hex(hex).ok().map(Self)
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex().to_string()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.to_hex())
    }
}

fn canonicalize(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut quote: Option<char> = None;
    let mut pending_space = false;
    for c in sql.trim().chars() {
        match quote {
            Some(open) => {
                out.push(c);
                if c == open {
                    quote = None;
                }
            },
            None if c.is_whitespace() => pending_space = true,
            None => {
                if pending_space && !out.is_empty() {
                    out.push(' ');
                }
                pending_space = false;
                if matches!(c, '\'' | '"' | '`') {
                    quote = Some(c);
                }
                out.push(c);
            },
        }
    }
    while out.ends_with(';') {
        out.pop();
        out.truncate(out.trim_end().len());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("SELECT 1", "SELECT 1")]
    #[case("  SELECT\n\t *  FROM   t ;", "SELECT * FROM t")]
    #[case("SELECT 'a   b' FROM t;;", "SELECT 'a   b' FROM t")]
    #[case("SELECT \"odd  name\"\nFROM t", "SELECT \"odd  name\" FROM t")]
    #[case("SELECT 'it''s  here'  ", "SELECT 'it''s  here'")]
    fn test_canonicalize(#[case] sql: &str, #[case] expected: &str) {
        assert_eq!(canonicalize(sql), expected);
    }

    #[test]
    fn test_formatting_does_not_change_identity() {
        let a = Fingerprint::of("SELECT * FROM t WHERE x = ?1", &[Value::Integer(1)]);
        let b = Fingerprint::of("SELECT *\n  FROM t\n WHERE x = ?1;", &[Value::Integer(1)]);
        assert_eq!(a, b);
    }

    #[rstest]
    #[case(&[Value::Integer(1)], &[Value::Integer(2)])]
    #[case(&[Value::Integer(1)], &[Value::Text("1".into())])]
    #[case(&[Value::Text("ab".into()), Value::Text("c".into())], &[Value::Text("a".into()), Value::Text("bc".into())])]
    #[case(&[], &[Value::Null])]
    fn test_parameters_change_identity(#[case] left: &[Value], #[case] right: &[Value]) {
        let sql = "SELECT * FROM t WHERE x = ?1";
        assert_ne!(Fingerprint::of(sql, left), Fingerprint::of(sql, right));
    }

    #[test]
    fn test_hex_round_trip() {
        let fingerprint = Fingerprint::of("SELECT 1", &[]);
        assert_eq!(Fingerprint::from_hex(&fingerprint.to_hex()), Some(fingerprint));
        assert_eq!(Fingerprint::from_hex("nope"), None);
    }
}
