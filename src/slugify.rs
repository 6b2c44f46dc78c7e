use std::sync::LazyLock;

use regex::Regex;

static TAGS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]*>").expect("valid tag pattern"));
static SPECIAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[^a-z0-9_\s-]").expect("valid special-char pattern")
});
static SEPARATORS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[-\s]+").expect("valid separator pattern"));

/// Turn arbitrary text into a URL-safe identifier.
///
/// Transliterates to ASCII, strips HTML tags, lowercases, drops everything
/// but word characters, whitespace and dashes, then collapses runs of
/// whitespace and dashes into a single `-`. Leading and trailing separators
/// are trimmed, so `" hello"` and `"hello"` share a slug.
pub fn slugify(text: &str) -> String {
    let ascii = deunicode::deunicode(text);
    let stripped = TAGS.replace_all(&ascii, "");
    let lower = stripped.to_lowercase();
    let cleaned = SPECIAL.replace_all(&lower, "");
    let collapsed = SEPARATORS.replace_all(&cleaned, "-");
    collapsed.trim_matches('-').to_string()
}
