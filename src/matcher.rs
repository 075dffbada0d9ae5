//! Autohide list matching.
//!
//! An entry without a path separator is an executable name compared
//! case-insensitively with the file name. An entry with a separator is a
//! path fragment: both sides are normalized and the fragment must equal the
//! full path or be a suffix of it.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutohideEntry {
    Name(String),
    Path(String),
}

impl AutohideEntry {
    pub fn parse(entry: &str) -> Self {
        if entry.contains(['\\', '/']) {
            AutohideEntry::Path(normalize_path(entry))
        } else {
            AutohideEntry::Name(entry.to_lowercase())
        }
    }

    pub fn matches(&self, file_name: &str, normalized_path: &str) -> bool {
        match self {
            AutohideEntry::Name(name) => file_name.to_lowercase() == *name,
            AutohideEntry::Path(fragment) => {
                !fragment.is_empty()
                    && (normalized_path == fragment || normalized_path.ends_with(fragment.as_str()))
            }
        }
    }
}

/// Lexically cleans `path`: backslashes become slashes, repeated separators
/// collapse, `.` segments drop, `..` removes the previous segment where
/// there is one. The result is lower-case with no trailing slash.
pub fn normalize_path(path: &str) -> String {
    if path.is_empty() {
        return String::new();
    }
    let unified = path.replace('\\', "/");
    let absolute = unified.starts_with('/');

    let mut parts: Vec<&str> = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => {}
            ".." => match parts.last() {
                Some(&last) if last != ".." => {
                    parts.pop();
                }
                _ if absolute => {}
                _ => parts.push(".."),
            },
            other => parts.push(other),
        }
    }

    let joined = parts.join("/");
    let cleaned = match (absolute, joined.is_empty()) {
        (true, _) => format!("/{}", joined),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    };
    let mut lower = cleaned.to_lowercase();
    if lower.len() > 1 && lower.ends_with('/') {
        lower.pop();
    }
    lower
}

/// File-name part of a Windows or POSIX path.
pub fn file_name(path: &str) -> &str {
    path.rsplit(['\\', '/']).next().unwrap_or(path)
}

pub fn should_hide(executable_path: &str, list: &[String]) -> bool {
    if executable_path.is_empty() {
        return false;
    }
    let name = file_name(executable_path);
    let normalized = normalize_path(executable_path);
    list.iter()
        .filter(|e| !e.trim().is_empty())
        .map(|e| AutohideEntry::parse(e.trim()))
        .any(|entry| entry.matches(name, &normalized))
}
