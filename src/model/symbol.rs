use serde::{Deserialize, Serialize};

/// A normalized asset code, stripped of quote-currency and perp suffixes
/// and upper-cased. Two `Symbol`s compare equal iff their normalizations
/// match (`PartialEq`/`Eq`/`Hash` all operate on the normalized form).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Symbol(String);

impl Symbol {
    /// Suffixes stripped during normalization, longest-first so
    /// `"-PERP"` doesn't shadow a hypothetical `"USDT-PERP"` case before
    /// the quote-currency suffix is removed.
    const SUFFIXES: &'static [&'static str] = &["USDT", "USDC", "-PERP", "PERP", "-USD", "USD"];

    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(Self::normalize(raw.as_ref()))
    }

    fn normalize(raw: &str) -> String {
        let upper = raw.trim().to_uppercase();
        for suffix in Self::SUFFIXES {
            if let Some(stripped) = upper.strip_suffix(suffix) {
                if !stripped.is_empty() {
                    return Self::normalize(stripped);
                }
            }
        }
        upper
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// A symbol is flagged as divergent if, after normalization, it still
    /// carries a suffix this keeper doesn't understand (e.g. `-SPOT`).
    /// Per the authoritative §3 rule, such symbols are rejected at the
    /// adapter boundary rather than silently traded.
    pub fn is_divergent(&self) -> bool {
        self.0.contains('-') || self.0.contains('_')
    }
}

impl PartialEq for Symbol {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl Eq for Symbol {}

impl std::hash::Hash for Symbol {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Symbol::new(s)
    }
}
impl From<String> for Symbol {
    fn from(s: String) -> Self {
        Symbol::new(s)
    }
}
