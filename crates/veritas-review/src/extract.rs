//! Turn review text into atomic, checkable claims.
//!
//! An item is a Markdown bullet (`-`, `*`, `+`, `1.`, `1)`) plus its indented
//! continuation lines. Bullets inside fenced code blocks are ignored. Each
//! item becomes one [`Claim`]; the same text always yields the same claims.

use std::str::FromStr;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use veritas_core::{Claim, ClaimKind, LineRange, Verdict};

/// Extensions recognised when a finding names a file without backticks.
const SOURCE_EXTENSIONS: &[&str] = &[
    "py", "pyi", "rs", "js", "jsx", "mjs", "cjs", "ts", "tsx", "go", "java", "kt", "kts", "rb",
    "php", "c", "h", "cc", "cpp", "hpp", "cs", "swift", "scala", "dart", "lua", "ex", "exs", "erl",
    "clj", "sh", "bash", "sql", "vue", "svelte", "html", "css", "scss", "json", "toml", "yaml",
    "yml", "xml", "ini", "cfg", "md", "gradle", "proto", "tf",
];

static BULLET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\s*)(?:[-*+]|\d{1,3}[.)])\s+(\S.*)$").expect("invalid bullet pattern")
});

static TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[([A-Za-z][A-Za-z _-]*)\]\s*").expect("invalid tag pattern")
});

static LEADING_LOCATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^`([^`\s]+)`\s*(?:[-:–—]\s*)?").expect("invalid location pattern")
});

static LOCATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<path>[^\s:#`]+?)(?::(?P<a>\d+)(?:-(?P<b>\d+))?|#L(?P<c>\d+)(?:-L?(?P<d>\d+))?)?$",
    )
    .expect("invalid location body pattern")
});

static BACKTICKED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"`([^`]+)`").expect("invalid backtick pattern"));

static BARE_PATH: LazyLock<Regex> = LazyLock::new(|| {
    let exts = SOURCE_EXTENSIONS.join("|");
    Regex::new(&format!(
        r#"(?:^|[\s(\["'])(?P<path>(?:[\w.-]+/)*[\w-][\w.-]*\.(?:{exts}))\b(?::(?P<a>\d+)(?:-(?P<b>\d+))?)?"#
    ))
    .expect("invalid bare path pattern")
});

static IMPORT_BACKTICKED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bimport(?:s|ed)?\s+(?:of\s+|for\s+)?`([^`]+)`")
        .expect("invalid import pattern")
});

static IMPORT_BARE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bimport\s+(?:of\s+|for\s+)?([A-Za-z_][\w.]*)").expect("invalid import pattern")
});

static IMPORT_STATEMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:from\s+[\w.]+\s+)?import\s+([A-Za-z_][\w.]*)")
        .expect("invalid import statement pattern")
});

static IMPORT_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bimport(?:s|ed|ing)?\b").expect("invalid import word pattern"));

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z_][\w.:]*)(?:\(\))?$").expect("invalid identifier pattern")
});

static MISSING_DEFINITION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\bmissing\s+(?:function|method|class|struct|enum|trait|variable|constant|field|type|module|definition|declaration|export|attribute|symbol)s?\s+(?:definition\s+|for\s+)?`?([A-Za-z_][\w.:]*)`?",
    )
    .expect("invalid missing definition pattern")
});

static MISSING_BACKTICKED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bmissing\s+`([^`]+)`").expect("invalid missing symbol pattern")
});

static UNDEFINED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)`?([A-Za-z_][\w.:]*)(?:\(\))?`?\s+(?:is|are)\s+(?:(?:called|used|referenced)\s+but\s+)?(?:undefined|undeclared|(?:not|never)\s+(?:defined|declared|imported))\b",
    )
    .expect("invalid undefined pattern")
});

static LINE_MENTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\blines?\s+(\d+)(?:\s*(?:-|to)\s*(\d+))?").expect("invalid line mention pattern")
});

/// Keyword rules in precedence order; the first kind with a hit wins.
static KIND_RULES: LazyLock<Vec<(ClaimKind, Regex)>> = LazyLock::new(|| {
    [
        (
            ClaimKind::Security,
            r"(?i)\b(?:security|injection|secret|credential|xss|csrf|vulnerab|password|token leak)",
        ),
        (
            ClaimKind::IncompleteFile,
            r"(?i)\b(?:incomplete|truncated|cut off|unfinished|ends abruptly)",
        ),
        (
            ClaimKind::Syntax,
            r"(?i)\b(?:syntax|parse error|unbalanced|(?:unmatched|unclosed) (?:bracket|brace|paren))",
        ),
        (
            ClaimKind::MissingCode,
            r"(?i)\b(?:missing|import(?:s|ed)?\b|undefined|not defined|not imported|undeclared)",
        ),
        (
            ClaimKind::Bug,
            r"(?i)\b(?:bug|crash|panic|null|off-by-one|race|leak|overflow|deadlock|exception|error handling)",
        ),
        (
            ClaimKind::Style,
            r"(?i)\b(?:style|naming|format|readability|convention|typo|whitespace)",
        ),
    ]
    .into_iter()
    .map(|(kind, pattern)| (kind, Regex::new(pattern).expect("invalid kind pattern")))
    .collect()
});

const IMPORT_STOPWORDS: &[&str] = &[
    "statement", "statements", "is", "was", "the", "a", "an", "for", "of", "in", "from", "at",
    "on", "path", "error", "order",
];

/// One bullet item: its line span in the source text and its joined text.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Item {
    first_line: usize,
    end_line: usize,
    text: String,
}

/// Extract claims from review text, in order of appearance.
///
/// Claims are numbered `1..n`. A finding with no file reference is marked
/// [`Verdict::Unverifiable`] immediately; everything else is pending.
///
/// # Examples
///
/// ```
/// use veritas_core::{ClaimKind, Verdict};
/// use veritas_review::extract::extract_claims;
///
/// let review = "Summary.\n\n### Findings\n\
///               - [missing_code] `app/utils.py:3` missing import `os`\n\
///               - The tests look thin\n";
/// let claims = extract_claims(review);
/// assert_eq!(claims.len(), 2);
/// assert_eq!(claims[0].kind, ClaimKind::MissingCode);
/// assert_eq!(claims[0].file_path.as_deref(), Some("app/utils.py"));
/// assert_eq!(claims[0].subject.as_ref().unwrap().symbol, "os");
/// assert_eq!(claims[1].verdict, Verdict::Unverifiable);
/// ```
pub fn extract_claims(text: &str) -> Vec<Claim> {
    let lines: Vec<&str> = text.lines().collect();
    find_items(&lines)
        .iter()
        .enumerate()
        .map(|(i, item)| parse_item(i as u32 + 1, &item.text))
        .collect()
}

/// Remove every item whose parsed claim satisfies `predicate`.
///
/// Bullet lines and their continuation lines are removed; all other text,
/// including line order and a trailing newline, is kept as is.
///
/// # Examples
///
/// ```
/// use veritas_review::extract::strip_items;
///
/// let text = "Intro\n- `a.py:1` bad thing\n  more detail\n- `b.py:2` good thing\n";
/// let out = strip_items(text, |c| c.file_path.as_deref() == Some("a.py"));
/// assert_eq!(out, "Intro\n- `b.py:2` good thing\n");
/// ```
pub fn strip_items<F>(text: &str, predicate: F) -> String
where
    F: Fn(&Claim) -> bool,
{
    let lines: Vec<&str> = text.lines().collect();
    let mut removed = vec![false; lines.len()];
    for (i, item) in find_items(&lines).iter().enumerate() {
        if predicate(&parse_item(i as u32 + 1, &item.text)) {
            removed[item.first_line..item.end_line].fill(true);
        }
    }
    let mut out = lines
        .iter()
        .zip(&removed)
        .filter(|(_, gone)| !**gone)
        .map(|(line, _)| *line)
        .collect::<Vec<_>>()
        .join("\n");
    if text.ends_with('\n') && !out.is_empty() {
        out.push('\n');
    }
    out
}

fn is_fence(line: &str) -> bool {
    let t = line.trim_start();
    t.starts_with("```") || t.starts_with("~~~")
}

fn find_items(lines: &[&str]) -> Vec<Item> {
    let mut items: Vec<Item> = Vec::new();
    let mut open: Option<Item> = None;
    let mut in_fence = false;

    for (idx, line) in lines.iter().enumerate() {
        if is_fence(line) {
            items.extend(open.take());
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        if let Some(caps) = BULLET.captures(line) {
            items.extend(open.take());
            open = Some(Item {
                first_line: idx,
                end_line: idx + 1,
                text: caps[2].trim().to_string(),
            });
            continue;
        }
        let continues = !line.trim().is_empty() && line.starts_with([' ', '\t']);
        match open.as_mut() {
            Some(item) if continues => {
                item.text.push(' ');
                item.text.push_str(line.trim());
                item.end_line = idx + 1;
            }
            _ => items.extend(open.take()),
        }
    }
    items.extend(open);
    items
}

struct Location {
    path: String,
    lines: Option<LineRange>,
}

fn parse_location(raw: &str) -> Option<Location> {
    let caps = LOCATION.captures(raw.trim())?;
    let path = caps["path"].trim_start_matches("./").to_string();
    if !looks_like_path(&path) {
        return None;
    }
    let num = |name: &str| caps.name(name).and_then(|m| m.as_str().parse::<u32>().ok());
    let lines = match (num("a").or(num("c")), num("b").or(num("d"))) {
        (Some(start), Some(end)) => Some(LineRange::new(start, end)),
        (Some(start), None) => Some(LineRange::single(start)),
        _ => None,
    };
    Some(Location { path, lines })
}

fn looks_like_path(candidate: &str) -> bool {
    has_known_extension(candidate)
        || (candidate.contains('/')
            && !candidate.starts_with("http")
            && candidate.chars().any(|c| c.is_alphabetic()))
}

fn has_known_extension(candidate: &str) -> bool {
    candidate
        .rsplit_once('.')
        .is_some_and(|(stem, ext)| !stem.is_empty() && SOURCE_EXTENSIONS.contains(&ext))
}

fn bare_location(caps: &Captures<'_>) -> Location {
    let num = |name: &str| caps.name(name).and_then(|m| m.as_str().parse::<u32>().ok());
    let lines = match (num("a"), num("b")) {
        (Some(start), Some(end)) => Some(LineRange::new(start, end)),
        (Some(start), None) => Some(LineRange::single(start)),
        _ => None,
    };
    Location {
        path: caps["path"].trim_start_matches("./").to_string(),
        lines,
    }
}

fn parse_item(id: u32, text: &str) -> Claim {
    let mut rest = text.trim();

    let mut tagged_kind = None;
    if let Some(caps) = TAG.captures(rest) {
        tagged_kind = ClaimKind::from_str(&caps[1]).ok();
        rest = rest[caps[0].len()..].trim_start();
    }

    let mut location = None;
    if let Some(caps) = LEADING_LOCATION.captures(rest) {
        if let Some(loc) = parse_location(&caps[1]) {
            location = Some(loc);
            rest = rest[caps[0].len()..].trim_start();
        }
    }
    let assertion = rest.trim().to_string();

    if location.is_none() {
        location = BACKTICKED
            .captures_iter(&assertion)
            .find_map(|c| parse_location(&c[1]))
            .or_else(|| BARE_PATH.captures(&assertion).map(|c| bare_location(&c)));
    }

    let kind = tagged_kind.unwrap_or_else(|| infer_kind(&assertion));
    let mut claim = Claim::new(id, assertion, kind);

    match location {
        Some(loc) => {
            claim.file_path = Some(loc.path);
            claim.lines = loc.lines.or_else(|| mentioned_lines(&claim.assertion));
        }
        None => claim.decide(Verdict::Unverifiable, Some("no file reference".into())),
    }

    if kind.names_symbol() {
        if let Some((symbol, import)) = find_subject(&claim.assertion, claim.file_path.as_deref()) {
            claim = claim.with_subject(symbol, import);
        }
    }
    claim
}

fn infer_kind(text: &str) -> ClaimKind {
    KIND_RULES
        .iter()
        .find(|(_, re)| re.is_match(text))
        .map(|(kind, _)| *kind)
        .unwrap_or(ClaimKind::Other)
}

/// Lines named in prose, as in "syntax error on line 12".
fn mentioned_lines(text: &str) -> Option<LineRange> {
    let caps = LINE_MENTION.captures(text)?;
    let start = caps[1].parse::<u32>().ok()?;
    match caps.get(2).and_then(|m| m.as_str().parse::<u32>().ok()) {
        Some(end) => Some(LineRange::new(start, end)),
        None => Some(LineRange::single(start)),
    }
}

/// The symbol a missing-code claim says is absent, with an import flag.
///
/// Only phrasings that name the absent thing count. A symbol that is merely
/// mentioned ("`cwd()` is missing error handling") is no subject, and the
/// claim goes to the model instead.
fn find_subject(text: &str, path: Option<&str>) -> Option<(String, bool)> {
    if let Some(caps) = IMPORT_BACKTICKED.captures(text) {
        if let Some(symbol) = identifier_in(&caps[1]) {
            return Some((symbol, true));
        }
    }
    if let Some(caps) = IMPORT_BARE.captures(text) {
        let word = &caps[1];
        if !IMPORT_STOPWORDS.contains(&word.to_lowercase().as_str()) {
            return Some((word.to_string(), true));
        }
    }

    let import = IMPORT_WORD.is_match(text);
    if let Some(caps) = MISSING_DEFINITION.captures(text) {
        return Some((caps[1].to_string(), import));
    }
    let after_missing = MISSING_BACKTICKED.captures_iter(text).find_map(|c| {
        let raw = c[1].trim();
        if Some(raw) == path || looks_like_path(raw) || parse_location(raw).is_some() {
            return None;
        }
        identifier_in(raw)
    });
    if let Some(symbol) = after_missing {
        return Some((symbol, import));
    }
    UNDEFINED
        .captures(text)
        .map(|caps| (caps[1].to_string(), import))
}

/// An identifier, or the imported name of an import statement.
fn identifier_in(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if let Some(caps) = IMPORT_STATEMENT.captures(raw) {
        return Some(caps[1].to_string());
    }
    IDENTIFIER.captures(raw).map(|caps| caps[1].to_string())
}
