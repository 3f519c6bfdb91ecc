use blake3::Hasher;

/// Number of hex characters kept from the digest (64 bits).
pub const FINGERPRINT_LEN: usize = 16;

/// Content fingerprint of a source span.
///
/// The span is dedented and stripped before hashing, so moving a definition
/// into or out of a block, or adding blank lines around it, does not change
/// the fingerprint. Internal whitespace is kept: reformatting a body does.
///
/// The value is only ever compared for equality; it is not reversible.
pub fn fingerprint(span: &str) -> String {
    let normalized = normalize_span(span);
    let mut hasher = Hasher::new();
    hasher.update(normalized.as_bytes());
    let hash = hasher.finalize();
    hash.to_hex()[..FINGERPRINT_LEN].to_string()
}

/// Full blake3 hex digest of raw bytes, used for whole files.
pub fn hash_bytes(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

pub fn normalize_span(span: &str) -> String {
    dedent(span).trim().to_string()
}

/// Remove the longest leading-whitespace prefix shared by all non-blank
/// lines. Whitespace-only lines are emptied and do not take part.
pub fn dedent(text: &str) -> String {
    let mut margin: Option<&str> = None;
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let indent_len = line.len() - line.trim_start_matches([' ', '\t']).len();
        let indent = &line[..indent_len];
        margin = Some(match margin {
            None => indent,
            Some(current) => common_prefix(current, indent),
        });
    }
    let margin_len = margin.map(str::len).unwrap_or(0);

    let mut out = String::with_capacity(text.len());
    for (idx, line) in text.split('\n').enumerate() {
        if idx > 0 {
            out.push('\n');
        }
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.trim().is_empty() {
            continue;
        }
        out.push_str(&line[margin_len..]);
    }
    out
}

fn common_prefix<'a>(a: &'a str, b: &str) -> &'a str {
    let len = a
        .bytes()
        .zip(b.bytes())
        .take_while(|(x, y)| x == y)
        .count();
    &a[..len]
}
